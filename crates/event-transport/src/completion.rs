//! Completion notifications.
//!
//! Every event accepted by `send` resolves exactly once. The worker never runs
//! user callbacks itself: it hands them to a dedicated dispatcher thread so a
//! slow callback cannot stall the store or the network pipeline.
//!
//! A [`PendingCompletion`] that is dropped without being resolved (worker
//! crashed, task aborted) still fires, with [`FailureReason::Abandoned`].

use crate::rate_limit::FailureClass;
use crate::{EventId, TransportResult};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::thread::JoinHandle;
use thiserror::Error;
use tracing::{debug, warn};

/// Terminal status of a submitted event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// Accepted by the collector.
    Sent,
    /// Discarded. The outcome carries the reason.
    Dropped,
    /// Rejected by the send-veto hook or the sample filter.
    Vetoed,
}

impl fmt::Display for SendStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Sent => "sent",
            Self::Dropped => "dropped",
            Self::Vetoed => "vetoed",
        };
        f.write_str(name)
    }
}

/// Why an event did not end up `Sent`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FailureReason {
    #[error("rejected by the send hook or sample filter")]
    VetoedBySendHook,

    #[error("queue hook declined to store after {0}")]
    QueueVetoed(FailureClass),

    #[error("permanent failure: {0}")]
    Permanent(String),

    #[error("redelivery failed ({0}), not retried again")]
    RetryExhausted(FailureClass),

    #[error("evicted from the full offline store")]
    Evicted,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("transport queue is full")]
    QueueFull,

    #[error("transport has shut down")]
    ShutDown,

    #[error("still stored when the transport shut down")]
    PersistedAtShutdown,

    #[error("completion was abandoned")]
    Abandoned,
}

/// Result passed to a completion callback.
#[derive(Debug, Clone, PartialEq)]
pub struct SendOutcome {
    pub event_id: EventId,
    pub status: SendStatus,
    pub reason: Option<FailureReason>,
}

impl SendOutcome {
    pub fn sent(event_id: EventId) -> Self {
        Self {
            event_id,
            status: SendStatus::Sent,
            reason: None,
        }
    }

    pub fn vetoed(event_id: EventId) -> Self {
        Self {
            event_id,
            status: SendStatus::Vetoed,
            reason: Some(FailureReason::VetoedBySendHook),
        }
    }

    pub fn dropped(event_id: EventId, reason: FailureReason) -> Self {
        Self {
            event_id,
            status: SendStatus::Dropped,
            reason: Some(reason),
        }
    }

    pub fn is_sent(&self) -> bool {
        self.status == SendStatus::Sent
    }
}

type CompletionFn = Box<dyn FnOnce(SendOutcome) + Send + 'static>;

/// Caller-supplied completion callback.
pub struct Completion {
    callback: Option<CompletionFn>,
}

impl Completion {
    pub fn new<F>(callback: F) -> Self
    where
        F: FnOnce(SendOutcome) + Send + 'static,
    {
        Self {
            callback: Some(Box::new(callback)),
        }
    }

    /// No callback. The event still goes through the full pipeline.
    pub fn none() -> Self {
        Self { callback: None }
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

/// A completion bound to an event and a dispatcher, waiting to resolve.
pub(crate) struct PendingCompletion {
    event_id: EventId,
    callback: Option<CompletionFn>,
    dispatch: DispatchHandle,
}

impl PendingCompletion {
    pub(crate) fn new(event_id: EventId, completion: Completion, dispatch: DispatchHandle) -> Self {
        Self {
            event_id,
            callback: completion.callback,
            dispatch,
        }
    }

    pub(crate) fn event_id(&self) -> EventId {
        self.event_id
    }

    pub(crate) fn resolve(mut self, outcome: SendOutcome) {
        debug!(
            event_id = %outcome.event_id,
            status = %outcome.status,
            reason = outcome.reason.as_ref().map(|r| r.to_string()),
            "Event resolved"
        );
        if let Some(callback) = self.callback.take() {
            self.dispatch.fire(callback, outcome);
        }
    }
}

impl Drop for PendingCompletion {
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            warn!(event_id = %self.event_id, "Completion dropped without resolving");
            self.dispatch.fire(
                callback,
                SendOutcome::dropped(self.event_id, FailureReason::Abandoned),
            );
        }
    }
}

enum DispatchJob {
    Fire(CompletionFn, SendOutcome),
    Stop,
}

/// Cloneable sender side of the dispatcher.
#[derive(Clone)]
pub(crate) struct DispatchHandle {
    tx: Sender<DispatchJob>,
}

impl DispatchHandle {
    /// Queue a callback. Runs it inline when the dispatcher thread is gone.
    fn fire(&self, callback: CompletionFn, outcome: SendOutcome) {
        if let Err(err) = self.tx.send(DispatchJob::Fire(callback, outcome)) {
            if let DispatchJob::Fire(callback, outcome) = err.0 {
                run_callback(callback, outcome);
            }
        }
    }
}

/// Runs completion callbacks on a named background thread, in the order the
/// worker resolved them.
pub(crate) struct CompletionDispatcher {
    handle: DispatchHandle,
    thread: Option<JoinHandle<()>>,
}

impl CompletionDispatcher {
    pub(crate) fn start() -> TransportResult<Self> {
        let (tx, rx) = channel();
        let thread = std::thread::Builder::new()
            .name("event-transport-completions".to_string())
            .spawn(move || run_dispatcher(rx))?;
        Ok(Self {
            handle: DispatchHandle { tx },
            thread: Some(thread),
        })
    }

    pub(crate) fn handle(&self) -> DispatchHandle {
        self.handle.clone()
    }

    /// Fire everything queued so far, then stop the thread.
    ///
    /// Callbacks resolved after this point run inline on the resolving thread.
    pub(crate) fn shutdown(&mut self) {
        let _ = self.handle.tx.send(DispatchJob::Stop);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Completion dispatcher thread panicked");
            }
        }
    }
}

impl Drop for CompletionDispatcher {
    fn drop(&mut self) {
        // Detach instead of joining: a drop may happen on a runtime thread.
        let _ = self.handle.tx.send(DispatchJob::Stop);
    }
}

fn run_dispatcher(rx: Receiver<DispatchJob>) {
    while let Ok(job) = rx.recv() {
        match job {
            DispatchJob::Fire(callback, outcome) => run_callback(callback, outcome),
            DispatchJob::Stop => break,
        }
    }
}

fn run_callback(callback: CompletionFn, outcome: SendOutcome) {
    let event_id = outcome.event_id;
    if catch_unwind(AssertUnwindSafe(move || callback(outcome))).is_err() {
        warn!(event_id = %event_id, "Completion callback panicked");
    }
}
