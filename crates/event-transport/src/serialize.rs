//! Event serialization seam.

use crate::sender::{OutboundRequest, JSON_CONTENT_TYPE};
use crate::{Event, TransportResult};

/// Turns an event into wire bytes.
pub trait EventSerializer: Send + Sync {
    fn content_type(&self) -> &str;

    fn serialize(&self, event: &Event) -> TransportResult<Vec<u8>>;

    /// Build the outbound request for `event`.
    fn to_request(&self, event: &Event) -> TransportResult<OutboundRequest> {
        Ok(OutboundRequest {
            event_id: event.id,
            content_type: self.content_type().to_string(),
            headers: Default::default(),
            body: self.serialize(event)?,
        })
    }
}

/// Default serializer: the event as a JSON document.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonEventSerializer;

impl EventSerializer for JsonEventSerializer {
    fn content_type(&self) -> &str {
        JSON_CONTENT_TYPE
    }

    fn serialize(&self, event: &Event) -> TransportResult<Vec<u8>> {
        Ok(serde_json::to_vec(event)?)
    }
}
