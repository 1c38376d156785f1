//! # event-transport
//!
//! Client-side transport for crash and error events: decides whether and when
//! an event goes to the collector, and keeps it on disk when the network or
//! the collector is not cooperating.
//!
//! ## Architecture
//!
//! ```text
//!  send / store (any thread)
//!          │
//!  ┌───────▼────────┐      ┌──────────────────┐      ┌─────────────────┐
//!  │ command channel│─────▶│      Worker      │─────▶│ job tasks (≤ N) │
//!  │   (bounded)    │      │ DiskStore owner  │◀─────│ hooks + attempt │
//!  └────────────────┘      │ RateLimiter      │      └────────┬────────┘
//!                          └────────┬─────────┘               │
//!                                   │                   NetworkSender
//!                          ┌────────▼─────────┐
//!                          │ completion thread│
//!                          └──────────────────┘
//! ```
//!
//! - **Fresh events** go through scope merge, the pre-serialize hook, the
//!   send veto (or sample filter), serialization, the pre-send hook and one
//!   network attempt.
//! - **Retryable failures** ask the queue veto; accepted events are stored.
//!   A stored event that fails again after a drain is dropped.
//! - **Drains** redeliver stored events oldest first, unless a cooldown from
//!   earlier failures is still running.
//!
//! Every event accepted by [`TransportCoordinator::send`] resolves its
//! [`Completion`] exactly once.

mod completion;
mod config;
mod coordinator;
mod error;
mod event;
mod hooks;
mod job;
mod rate_limit;
mod sampling;
mod sender;
mod serialize;
mod store;
mod worker;

pub use completion::{Completion, FailureReason, SendOutcome, SendStatus};
pub use config::{
    validate_max_events, validate_sample_rate, ConfigWarning, DrainPolicy, TransportConfig,
    TransportOptions, DEFAULT_CHANNEL_CAPACITY, DEFAULT_HOOK_TIMEOUT, DEFAULT_MAX_BREADCRUMBS,
    DEFAULT_MAX_CONCURRENT_ATTEMPTS, DEFAULT_MAX_EVENTS,
};
pub use coordinator::TransportCoordinator;
pub use error::{TransportError, TransportResult};
pub use event::{Breadcrumb, Event, EventId, Scope, Severity};
pub use hooks::{
    BeforeSendRequestHook, BeforeSerializeHook, CallbackPipeline, HookSlot, ShouldQueueHook,
    ShouldSendHook,
};
pub use rate_limit::{FailureClass, RateLimiter, RetryPolicy};
pub use sampling::SampleFilter;
pub use sender::{
    classify_status, parse_retry_after, AttemptResult, HttpSender, HttpSenderConfig,
    NetworkSender, OutboundRequest, PermanentFailure, RetryableFailure, JSON_CONTENT_TYPE,
};
pub use serialize::{EventSerializer, JsonEventSerializer};
pub use store::{DiskStore, PersistOutcome, QueueEntry, QueueEntryId};
