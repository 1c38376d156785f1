//! One unit of pipeline work, run as its own task.
//!
//! A job only decides. It runs hooks and at most one network attempt, then
//! returns a [`Verdict`]; every store mutation and completion happens back on
//! the worker.

use crate::completion::{FailureReason, PendingCompletion};
use crate::hooks::CallbackPipeline;
use crate::rate_limit::FailureClass;
use crate::sender::{AttemptResult, NetworkSender, OutboundRequest, RetryableFailure};
use crate::serialize::EventSerializer;
use crate::store::{QueueEntry, QueueEntryId};
use crate::{Event, EventId, Scope};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::debug;

pub(crate) enum Job {
    /// Fresh event from `send`.
    Submit {
        event: Event,
        scope: Scope,
        completion: PendingCompletion,
    },
    /// Fresh event from `store`.
    Store { event: Event, scope: Scope },
    /// Stored entry picked up by a drain.
    Redeliver(QueueEntry),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JobKind {
    Submit,
    Store,
    Redeliver(QueueEntryId),
}

impl Job {
    pub(crate) fn kind(&self) -> JobKind {
        match self {
            Self::Submit { .. } => JobKind::Submit,
            Self::Store { .. } => JobKind::Store,
            Self::Redeliver(entry) => JobKind::Redeliver(entry.id),
        }
    }

    pub(crate) async fn run(self, ctx: JobContext) -> JobResult {
        match self {
            Self::Submit {
                event,
                scope,
                completion,
            } => {
                let event_id = event.id;
                let (attempt, verdict) = ctx.submit(event, scope).await;
                JobResult {
                    event_id,
                    origin: Origin::Fresh(completion),
                    attempt,
                    verdict,
                }
            }
            Self::Store { event, scope } => {
                let event_id = event.id;
                let event = ctx.prepare(event, &scope).await;
                JobResult {
                    event_id,
                    origin: Origin::StoreCall,
                    attempt: None,
                    verdict: Verdict::Persist {
                        event,
                        attempt_count: 0,
                    },
                }
            }
            Self::Redeliver(entry) => {
                let event_id = entry.event.id;
                let entry_id = entry.id;
                let (attempt, verdict) = ctx.redeliver(entry).await;
                JobResult {
                    event_id,
                    origin: Origin::Stored(entry_id),
                    attempt,
                    verdict,
                }
            }
        }
    }
}

/// Everything a job needs, captured when it is spawned.
pub(crate) struct JobContext {
    pub pipeline: Arc<CallbackPipeline>,
    pub serializer: Arc<dyn EventSerializer>,
    pub sender: Arc<dyn NetworkSender>,
    pub max_breadcrumbs: usize,
    /// Cooldown active at spawn time. Fresh sends are not attempted under it.
    pub cooldown: Option<(FailureClass, DateTime<Utc>)>,
}

pub(crate) enum Origin {
    Fresh(PendingCompletion),
    Stored(QueueEntryId),
    StoreCall,
}

pub(crate) enum Verdict {
    Sent(Event),
    Vetoed,
    Drop(FailureReason),
    /// Write a new store entry.
    Persist { event: Event, attempt_count: u32 },
    /// Count a failed attempt on the existing entry and keep it queued.
    RecordFailure,
}

pub(crate) struct JobResult {
    pub event_id: EventId,
    pub origin: Origin,
    /// Result of the network attempt, if one was made.
    pub attempt: Option<AttemptResult>,
    pub verdict: Verdict,
}

impl JobContext {
    /// Scope merge, breadcrumb bound and the pre-serialize hook.
    async fn prepare(&self, mut event: Event, scope: &Scope) -> Event {
        scope.apply_to(&mut event);
        event.trim_breadcrumbs(self.max_breadcrumbs);
        let mut event = self.pipeline.before_serialize(event).await;
        event.trim_breadcrumbs(self.max_breadcrumbs);
        event
    }

    async fn submit(&self, event: Event, scope: Scope) -> (Option<AttemptResult>, Verdict) {
        let event = self.prepare(event, &scope).await;

        if !self.pipeline.should_send(&event).await {
            debug!(event_id = %event.id, "Event vetoed before sending");
            return (None, Verdict::Vetoed);
        }

        if let Some((class, until)) = self.cooldown {
            debug!(
                event_id = %event.id,
                class = %class,
                until = %until,
                "Cooldown active, not attempting event"
            );
            let failure = RetryableFailure {
                class,
                reason: format!("cooldown active until {}", until.to_rfc3339()),
                retry_after: None,
            };
            return (None, self.queue_fresh(event, &failure, 0).await);
        }

        let request = match self.serializer.to_request(&event) {
            Ok(request) => request,
            Err(e) => {
                return (
                    None,
                    Verdict::Drop(FailureReason::Serialization(e.to_string())),
                )
            }
        };

        let attempt = self.attempt(request).await;
        let verdict = match &attempt {
            AttemptResult::Success => Verdict::Sent(event),
            AttemptResult::Permanent(failure) => {
                Verdict::Drop(FailureReason::Permanent(failure.reason.clone()))
            }
            AttemptResult::Retryable(failure) => self.queue_fresh(event, failure, 1).await,
        };
        (Some(attempt), verdict)
    }

    async fn redeliver(&self, entry: QueueEntry) -> (Option<AttemptResult>, Verdict) {
        let request = match self.serializer.to_request(&entry.event) {
            Ok(request) => request,
            Err(e) => {
                return (
                    None,
                    Verdict::Drop(FailureReason::Serialization(e.to_string())),
                )
            }
        };

        let attempt = self.attempt(request).await;
        let verdict = match &attempt {
            AttemptResult::Success => Verdict::Sent(entry.event),
            AttemptResult::Permanent(failure) => {
                Verdict::Drop(FailureReason::Permanent(failure.reason.clone()))
            }
            // An entry that already spent an attempt gets exactly one more.
            AttemptResult::Retryable(failure) if entry.attempt_count >= 1 => {
                Verdict::Drop(FailureReason::RetryExhausted(failure.class))
            }
            AttemptResult::Retryable(failure) => {
                if self.pipeline.should_queue(&entry.event, failure).await {
                    Verdict::RecordFailure
                } else {
                    Verdict::Drop(FailureReason::QueueVetoed(failure.class))
                }
            }
        };
        (Some(attempt), verdict)
    }

    async fn attempt(&self, request: OutboundRequest) -> AttemptResult {
        let request = self.pipeline.before_send_request(request).await;
        self.sender.attempt(request).await
    }

    async fn queue_fresh(&self, event: Event, failure: &RetryableFailure, attempt_count: u32) -> Verdict {
        if self.pipeline.should_queue(&event, failure).await {
            Verdict::Persist {
                event,
                attempt_count,
            }
        } else {
            Verdict::Drop(FailureReason::QueueVetoed(failure.class))
        }
    }
}
