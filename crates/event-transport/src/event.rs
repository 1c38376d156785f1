//! Event, breadcrumb and scope types consumed by the transport.
//!
//! Events are built elsewhere in the SDK. The transport only merges the
//! caller's [`Scope`] into them, bounds their breadcrumb trail and hands them
//! to the hook pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Unique event identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    /// Generate a fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Event severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Debug,
    Info,
    Warning,
    #[default]
    Error,
    Fatal,
}

/// A single breadcrumb trail entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Breadcrumb {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub level: Severity,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub data: Map<String, Value>,
}

impl Breadcrumb {
    pub fn new(category: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            category: Some(category.into()),
            message: Some(message.into()),
            level: Severity::Info,
            data: Map::new(),
        }
    }
}

/// A diagnostic event ready for transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    /// Opaque payload produced by the event builder (exception, message, ...).
    pub payload: Value,
    #[serde(default)]
    pub breadcrumbs: Vec<Breadcrumb>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

impl Event {
    /// Create an event with a fresh id and the current timestamp.
    pub fn new(severity: Severity, payload: Value) -> Self {
        Self {
            id: EventId::new(),
            timestamp: Utc::now(),
            severity,
            payload,
            breadcrumbs: Vec::new(),
            tags: BTreeMap::new(),
            user: None,
            extra: Map::new(),
        }
    }

    /// Convenience constructor for a plain message event.
    pub fn message(severity: Severity, message: impl Into<String>) -> Self {
        Self::new(severity, serde_json::json!({ "message": message.into() }))
    }

    pub fn with_breadcrumbs(mut self, breadcrumbs: Vec<Breadcrumb>) -> Self {
        self.breadcrumbs = breadcrumbs;
        self
    }

    /// Drop the oldest breadcrumbs until at most `max` remain.
    ///
    /// Returns the number of breadcrumbs removed.
    pub fn trim_breadcrumbs(&mut self, max: usize) -> usize {
        let excess = self.breadcrumbs.len().saturating_sub(max);
        if excess > 0 {
            self.breadcrumbs.drain(..excess);
        }
        excess
    }
}

/// Contextual metadata merged into an event at send time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Scope {
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub user: Option<Value>,
    #[serde(default)]
    pub extra: Map<String, Value>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_user(mut self, user: Value) -> Self {
        self.user = Some(user);
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// Merge this scope into `event`. Values already on the event win.
    pub fn apply_to(&self, event: &mut Event) {
        for (key, value) in &self.tags {
            event
                .tags
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        for (key, value) in &self.extra {
            if !event.extra.contains_key(key) {
                event.extra.insert(key.clone(), value.clone());
            }
        }
        if event.user.is_none() {
            event.user = self.user.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn crumbs(count: usize) -> Vec<Breadcrumb> {
        (0..count)
            .map(|i| Breadcrumb::new("nav", format!("crumb-{i}")))
            .collect()
    }

    #[test]
    fn trim_breadcrumbs_keeps_most_recent() {
        let mut event = Event::message(Severity::Error, "boom").with_breadcrumbs(crumbs(5));

        let removed = event.trim_breadcrumbs(2);

        assert_eq!(removed, 3);
        let messages: Vec<_> = event
            .breadcrumbs
            .iter()
            .filter_map(|b| b.message.as_deref())
            .collect();
        assert_eq!(messages, vec!["crumb-3", "crumb-4"]);
    }

    #[test]
    fn trim_breadcrumbs_noop_under_limit() {
        let mut event = Event::message(Severity::Error, "boom").with_breadcrumbs(crumbs(2));
        assert_eq!(event.trim_breadcrumbs(10), 0);
        assert_eq!(event.breadcrumbs.len(), 2);
    }

    #[test]
    fn trim_breadcrumbs_to_zero() {
        let mut event = Event::message(Severity::Error, "boom").with_breadcrumbs(crumbs(3));
        event.trim_breadcrumbs(0);
        assert!(event.breadcrumbs.is_empty());
    }

    #[test]
    fn scope_does_not_override_event_values() {
        let mut event = Event::message(Severity::Warning, "hello");
        event.tags.insert("release".to_string(), "1.0".to_string());
        event.user = Some(json!({ "id": "event-user" }));

        let scope = Scope::new()
            .with_tag("release", "2.0")
            .with_tag("os", "linux")
            .with_user(json!({ "id": "scope-user" }))
            .with_extra("build", json!(42));

        scope.apply_to(&mut event);

        assert_eq!(event.tags.get("release").map(String::as_str), Some("1.0"));
        assert_eq!(event.tags.get("os").map(String::as_str), Some("linux"));
        assert_eq!(event.user, Some(json!({ "id": "event-user" })));
        assert_eq!(event.extra.get("build"), Some(&json!(42)));
    }

    #[test]
    fn scope_fills_missing_user() {
        let mut event = Event::message(Severity::Info, "hi");
        Scope::new()
            .with_user(json!({ "id": "u1" }))
            .apply_to(&mut event);
        assert_eq!(event.user, Some(json!({ "id": "u1" })));
    }

    #[test]
    fn event_serde_roundtrip_preserves_breadcrumb_order() {
        let event = Event::message(Severity::Fatal, "crash").with_breadcrumbs(crumbs(3));
        let json = serde_json::to_string(&event).unwrap();
        let decoded: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, event);
    }
}
