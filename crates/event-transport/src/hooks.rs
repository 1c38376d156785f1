//! User-supplied hooks and the pipeline that runs them.
//!
//! Four slots, evaluated in a fixed order for every fresh event:
//!
//! ```text
//! before_serialize ──▶ should_send ──▶ (serialize) ──▶ before_send_request
//!                                                          │
//!                                       network attempt ◀──┘
//!                                             │ retryable failure
//!                                             ▼
//!                                        should_queue
//! ```
//!
//! Each slot can be swapped from any thread at any time. A reader takes a
//! clone of the `Arc` under a short read lock, so it always runs a complete
//! hook, either the old one or the new one.
//!
//! Hooks are synchronous user code. They run on the blocking pool under
//! `hook_timeout`; a hook that times out or panics is abandoned and the stage
//! uses its no-hook default (mutators change nothing, `should_send` accepts,
//! `should_queue` queues).

use crate::sender::{OutboundRequest, RetryableFailure};
use crate::{Event, EventId};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Mutates an event before serialization. `None` leaves it unchanged.
pub type BeforeSerializeHook = dyn Fn(&Event) -> Option<Event> + Send + Sync;

/// Mutates the outbound request (headers, body) before the attempt.
/// `None` leaves it unchanged.
pub type BeforeSendRequestHook = dyn Fn(&OutboundRequest) -> Option<OutboundRequest> + Send + Sync;

/// Returns false to veto sending an event.
pub type ShouldSendHook = dyn Fn(&Event) -> bool + Send + Sync;

/// Consulted after a retryable failure. Returns false to drop instead of
/// storing the event for a later drain.
pub type ShouldQueueHook = dyn Fn(&Event, &RetryableFailure) -> bool + Send + Sync;

/// An atomically swappable hook handle.
pub struct HookSlot<T: ?Sized> {
    inner: RwLock<Option<Arc<T>>>,
}

impl<T: ?Sized> HookSlot<T> {
    pub fn empty() -> Self {
        Self {
            inner: RwLock::new(None),
        }
    }

    /// Replace the hook. Last write wins.
    pub fn set(&self, hook: Option<Arc<T>>) {
        *self.inner.write() = hook;
    }

    pub fn get(&self) -> Option<Arc<T>> {
        self.inner.read().clone()
    }
}

impl<T: ?Sized> Default for HookSlot<T> {
    fn default() -> Self {
        Self::empty()
    }
}

/// The four hook slots plus the timeout they run under.
pub struct CallbackPipeline {
    before_serialize: HookSlot<BeforeSerializeHook>,
    before_send_request: HookSlot<BeforeSendRequestHook>,
    should_send: HookSlot<ShouldSendHook>,
    should_queue: HookSlot<ShouldQueueHook>,
    hook_timeout: Duration,
}

impl CallbackPipeline {
    pub fn new(hook_timeout: Duration) -> Self {
        Self {
            before_serialize: HookSlot::empty(),
            before_send_request: HookSlot::empty(),
            should_send: HookSlot::empty(),
            should_queue: HookSlot::empty(),
            hook_timeout,
        }
    }

    pub fn set_before_serialize(&self, hook: Option<Arc<BeforeSerializeHook>>) {
        self.before_serialize.set(hook);
    }

    pub fn set_before_send_request(&self, hook: Option<Arc<BeforeSendRequestHook>>) {
        self.before_send_request.set(hook);
    }

    pub fn set_should_send(&self, hook: Option<Arc<ShouldSendHook>>) {
        self.should_send.set(hook);
    }

    pub fn set_should_queue(&self, hook: Option<Arc<ShouldQueueHook>>) {
        self.should_queue.set(hook);
    }

    /// Stage 1: pre-serialize mutation.
    pub async fn before_serialize(&self, event: Event) -> Event {
        let Some(hook) = self.before_serialize.get() else {
            return event;
        };
        let candidate = event.clone();
        match run_hook(self.hook_timeout, "before_serialize", event.id, move || {
            hook(&candidate)
        })
        .await
        {
            Some(Some(mutated)) => mutated,
            _ => event,
        }
    }

    /// Stage 2: send veto. Returns true when the event may be sent.
    pub async fn should_send(&self, event: &Event) -> bool {
        let Some(hook) = self.should_send.get() else {
            return true;
        };
        let candidate = event.clone();
        run_hook(self.hook_timeout, "should_send", event.id, move || {
            hook(&candidate)
        })
        .await
        .unwrap_or(true)
    }

    /// Stage 3: pre-send request mutation.
    pub async fn before_send_request(&self, request: OutboundRequest) -> OutboundRequest {
        let Some(hook) = self.before_send_request.get() else {
            return request;
        };
        let candidate = request.clone();
        match run_hook(
            self.hook_timeout,
            "before_send_request",
            request.event_id,
            move || hook(&candidate),
        )
        .await
        {
            Some(Some(mutated)) => mutated,
            _ => request,
        }
    }

    /// Stage 4: queue veto after a retryable failure. Returns true to store.
    pub async fn should_queue(&self, event: &Event, failure: &RetryableFailure) -> bool {
        let Some(hook) = self.should_queue.get() else {
            return true;
        };
        let candidate = event.clone();
        let failure = failure.clone();
        run_hook(self.hook_timeout, "should_queue", event.id, move || {
            hook(&candidate, &failure)
        })
        .await
        .unwrap_or(true)
    }
}

/// Run one hook on the blocking pool, bounded by `timeout`.
///
/// Returns `None` when the hook panicked or did not finish in time. A timed
/// out hook keeps running on its blocking thread; its result is discarded.
async fn run_hook<R, F>(timeout: Duration, hook: &'static str, event_id: EventId, call: F) -> Option<R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    match tokio::time::timeout(timeout, tokio::task::spawn_blocking(call)).await {
        Ok(Ok(result)) => Some(result),
        Ok(Err(e)) => {
            warn!(hook, event_id = %event_id, error = %e, "Hook panicked, using default");
            None
        }
        Err(_) => {
            warn!(
                hook,
                event_id = %event_id,
                timeout_ms = timeout.as_millis() as u64,
                "Hook timed out, using default"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::FailureClass;
    use crate::Severity;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pipeline() -> CallbackPipeline {
        CallbackPipeline::new(Duration::from_millis(200))
    }

    fn failure() -> RetryableFailure {
        RetryableFailure {
            class: FailureClass::NetworkFailure,
            reason: "connection reset".to_string(),
            retry_after: None,
        }
    }

    #[tokio::test]
    async fn empty_pipeline_uses_defaults() {
        let pipeline = pipeline();
        let event = Event::message(Severity::Error, "boom");

        assert_eq!(pipeline.before_serialize(event.clone()).await, event);
        assert!(pipeline.should_send(&event).await);
        assert!(pipeline.should_queue(&event, &failure()).await);
    }

    #[tokio::test]
    async fn before_serialize_applies_mutation() {
        let pipeline = pipeline();
        pipeline.set_before_serialize(Some(Arc::new(|event: &Event| {
            let mut event = event.clone();
            event.tags.insert("scrubbed".to_string(), "yes".to_string());
            Some(event)
        })));

        let event = pipeline
            .before_serialize(Event::message(Severity::Error, "boom"))
            .await;
        assert_eq!(event.tags.get("scrubbed").map(String::as_str), Some("yes"));
    }

    #[tokio::test]
    async fn before_serialize_none_leaves_event_untouched() {
        let pipeline = pipeline();
        pipeline.set_before_serialize(Some(Arc::new(|_: &Event| None)));

        let event = Event::message(Severity::Error, "boom");
        assert_eq!(pipeline.before_serialize(event.clone()).await, event);
    }

    #[tokio::test]
    async fn before_send_request_rewrites_headers() {
        let pipeline = pipeline();
        pipeline.set_before_send_request(Some(Arc::new(|request: &OutboundRequest| {
            let mut request = request.clone();
            request
                .headers
                .insert("x-client".to_string(), "tests".to_string());
            Some(request)
        })));

        let event = Event::message(Severity::Error, "boom");
        let request = OutboundRequest::json(event.id, b"{}".to_vec());
        let request = pipeline.before_send_request(request).await;
        assert_eq!(
            request.headers.get("x-client").map(String::as_str),
            Some("tests")
        );
    }

    #[tokio::test]
    async fn should_send_last_write_wins() {
        let pipeline = pipeline();
        let event = Event::message(Severity::Error, "boom");

        pipeline.set_should_send(Some(Arc::new(|_: &Event| false)));
        assert!(!pipeline.should_send(&event).await);

        pipeline.set_should_send(Some(Arc::new(|_: &Event| true)));
        assert!(pipeline.should_send(&event).await);

        pipeline.set_should_send(None);
        assert!(pipeline.should_send(&event).await);
    }

    #[tokio::test]
    async fn should_queue_sees_failure() {
        let pipeline = pipeline();
        pipeline.set_should_queue(Some(Arc::new(|_: &Event, failure: &RetryableFailure| {
            failure.class == FailureClass::RateLimited
        })));

        let event = Event::message(Severity::Error, "boom");
        assert!(!pipeline.should_queue(&event, &failure()).await);

        let rate_limited = RetryableFailure {
            class: FailureClass::RateLimited,
            reason: "429".to_string(),
            retry_after: None,
        };
        assert!(pipeline.should_queue(&event, &rate_limited).await);
    }

    #[tokio::test]
    async fn slow_hook_times_out_to_default() {
        let pipeline = CallbackPipeline::new(Duration::from_millis(20));
        pipeline.set_should_send(Some(Arc::new(|_: &Event| {
            std::thread::sleep(Duration::from_millis(300));
            false
        })));

        let event = Event::message(Severity::Error, "boom");
        assert!(pipeline.should_send(&event).await);
    }

    #[tokio::test]
    async fn panicking_hook_falls_back() {
        let pipeline = pipeline();
        pipeline.set_should_queue(Some(Arc::new(|_: &Event, _: &RetryableFailure| {
            panic!("hook bug")
        })));

        let event = Event::message(Severity::Error, "boom");
        assert!(pipeline.should_queue(&event, &failure()).await);
    }

    #[tokio::test]
    async fn hooks_are_not_called_when_unset() {
        let calls = Arc::new(AtomicUsize::new(0));
        let pipeline = pipeline();
        let counter = calls.clone();
        pipeline.set_should_send(Some(Arc::new(move |_: &Event| {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        })));
        pipeline.set_should_send(None);

        pipeline
            .should_send(&Event::message(Severity::Error, "boom"))
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
