//! The transport worker: sole owner of the store and the rate limiter.
//!
//! Producers talk to it over a bounded command channel. Pipeline work runs in
//! job tasks capped at `max_concurrent_attempts`; their verdicts come back
//! here and are applied one at a time, which keeps the store, `last_event`
//! and the completion bookkeeping consistent without locks.

use crate::completion::{FailureReason, PendingCompletion, SendOutcome};
use crate::hooks::CallbackPipeline;
use crate::job::{Job, JobContext, JobKind, JobResult, Origin, Verdict};
use crate::rate_limit::RateLimiter;
use crate::sender::{AttemptResult, NetworkSender};
use crate::serialize::EventSerializer;
use crate::store::{DiskStore, QueueEntry, QueueEntryId};
use crate::{DrainPolicy, Event, Scope, TransportConfig};
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{self, JoinError, JoinSet};
use tokio::time::{Instant, Interval};
use tracing::{debug, info, warn};

pub(crate) type LastEvent = Arc<RwLock<Option<Arc<Event>>>>;

pub(crate) enum Command {
    Send {
        event: Event,
        scope: Scope,
        completion: PendingCompletion,
    },
    Store {
        event: Event,
        scope: Scope,
    },
    Drain,
    /// Wake the worker so it applies a changed `max_events`.
    Resize,
    Flush(oneshot::Sender<()>),
    Count(oneshot::Sender<usize>),
    Entries(oneshot::Sender<Vec<QueueEntry>>),
    Shutdown,
}

pub(crate) struct Worker {
    pub store: DiskStore,
    pub limiter: RateLimiter,
    pub pipeline: Arc<CallbackPipeline>,
    pub serializer: Arc<dyn EventSerializer>,
    pub sender: Arc<dyn NetworkSender>,
    pub settings: Arc<RwLock<TransportConfig>>,
    pub last_event: LastEvent,
    pub drain_policy: DrainPolicy,
    pub max_concurrent: usize,
    pub jobs: JoinSet<JobResult>,
    pub job_kinds: HashMap<task::Id, JobKind>,
    /// Jobs waiting for a concurrency slot.
    pub backlog: VecDeque<Job>,
    /// `store` calls, persisted one at a time in call order.
    pub store_lane: VecDeque<Job>,
    pub store_lane_busy: bool,
    /// Entries queued for or undergoing redelivery.
    pub in_flight: HashSet<QueueEntryId>,
    /// Completions of fresh events that ended up stored.
    pub waiting: HashMap<QueueEntryId, PendingCompletion>,
    /// Completions of entries evicted while their redelivery was running.
    /// Settled by that attempt's verdict.
    pub pending_evicted: HashMap<QueueEntryId, PendingCompletion>,
    pub idle_waiters: Vec<oneshot::Sender<()>>,
}

impl Worker {
    pub(crate) async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let mut ticker = self.drain_policy.interval.map(|period| {
            let period = period.max(Duration::from_millis(1));
            tokio::time::interval_at(Instant::now() + period, period)
        });

        info!(
            stored = self.store.count(),
            max_concurrent = self.max_concurrent,
            "Event transport worker started"
        );

        if self.drain_policy.on_start {
            self.start_drain("startup");
            self.pump();
        }

        loop {
            tokio::select! {
                command = commands.recv() => {
                    match command {
                        Some(Command::Shutdown) | None => break,
                        Some(command) => self.handle_command(command),
                    }
                }
                Some(joined) = self.jobs.join_next_with_id(), if !self.jobs.is_empty() => {
                    self.handle_joined(joined);
                }
                _ = next_tick(&mut ticker) => {
                    self.start_drain("interval");
                }
            }

            self.sync_capacity();
            self.pump();
            self.notify_idle();
        }

        self.stop(&mut commands).await;
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Send {
                event,
                scope,
                completion,
            } => self.backlog.push_back(Job::Submit {
                event,
                scope,
                completion,
            }),
            Command::Store { event, scope } => self.store_lane.push_back(Job::Store { event, scope }),
            Command::Drain => self.start_drain("explicit"),
            Command::Resize => {}
            Command::Flush(tx) => self.idle_waiters.push(tx),
            Command::Count(tx) => {
                let _ = tx.send(self.store.count());
            }
            Command::Entries(tx) => {
                let _ = tx.send(self.store.entries().cloned().collect());
            }
            Command::Shutdown => {}
        }
    }

    /// Queue every stored entry for redelivery, oldest first.
    fn start_drain(&mut self, trigger: &'static str) {
        if let Some((class, until)) = self.limiter.active_cooldown(Utc::now()) {
            debug!(
                trigger,
                class = %class,
                until = %until,
                stored = self.store.count(),
                "Drain skipped, cooldown active"
            );
            return;
        }

        let mut queued = 0usize;
        for entry in self.store.drain_batch(self.store.count()) {
            if self.in_flight.insert(entry.id) {
                self.backlog.push_back(Job::Redeliver(entry));
                queued += 1;
            }
        }
        debug!(trigger, queued, "Drain started");
    }

    /// Start backlog jobs while there is a free slot.
    fn pump(&mut self) {
        while self.jobs.len() < self.max_concurrent {
            let Some(job) = self.next_job() else {
                break;
            };
            let kind = job.kind();
            let cooldown = self.limiter.active_cooldown(Utc::now());

            if let JobKind::Redeliver(entry_id) = kind {
                // Entries left queued here are picked up by a later drain.
                if cooldown.is_some() || self.store.get(entry_id).is_none() {
                    self.in_flight.remove(&entry_id);
                    continue;
                }
            }
            if kind == JobKind::Store {
                self.store_lane_busy = true;
            }

            let ctx = JobContext {
                pipeline: self.pipeline.clone(),
                serializer: self.serializer.clone(),
                sender: self.sender.clone(),
                max_breadcrumbs: self.settings.read().max_breadcrumbs,
                cooldown,
            };
            let handle = self.jobs.spawn(job.run(ctx));
            self.job_kinds.insert(handle.id(), kind);
        }
    }

    fn next_job(&mut self) -> Option<Job> {
        if !self.store_lane_busy {
            if let Some(job) = self.store_lane.pop_front() {
                return Some(job);
            }
        }
        self.backlog.pop_front()
    }

    fn release(&mut self, kind: Option<JobKind>) {
        match kind {
            Some(JobKind::Redeliver(entry_id)) => {
                self.in_flight.remove(&entry_id);
                if let Some(completion) = self.pending_evicted.remove(&entry_id) {
                    let event_id = completion.event_id();
                    completion.resolve(SendOutcome::dropped(event_id, FailureReason::Evicted));
                }
            }
            Some(JobKind::Store) => self.store_lane_busy = false,
            Some(JobKind::Submit) | None => {}
        }
    }

    fn handle_joined(&mut self, joined: Result<(task::Id, JobResult), JoinError>) {
        match joined {
            Ok((id, result)) => {
                let kind = self.job_kinds.remove(&id);
                self.apply(result);
                self.release(kind);
            }
            Err(e) => {
                // A fresh event's completion fired as abandoned while unwinding.
                let kind = self.job_kinds.remove(&e.id());
                self.release(kind);
                warn!(error = %e, "Transport job failed");
            }
        }
    }

    fn apply(&mut self, result: JobResult) {
        let JobResult {
            event_id,
            origin,
            attempt,
            verdict,
        } = result;

        match &attempt {
            Some(AttemptResult::Success) => self.limiter.record_success(),
            Some(AttemptResult::Retryable(failure)) => {
                let until = self
                    .limiter
                    .record_failure(failure.class, failure.retry_after, Utc::now());
                warn!(
                    event_id = %event_id,
                    class = %failure.class,
                    reason = %failure.reason,
                    cooldown_until = %until,
                    "Event attempt failed"
                );
            }
            Some(AttemptResult::Permanent(failure)) => {
                warn!(
                    event_id = %event_id,
                    status = failure.status,
                    reason = %failure.reason,
                    "Event rejected permanently"
                );
            }
            None => {}
        }

        match verdict {
            Verdict::Sent(event) => {
                info!(event_id = %event_id, "Event sent");
                *self.last_event.write() = Some(Arc::new(event));
                let fresh = matches!(origin, Origin::Fresh(_));
                self.finish(origin, SendOutcome::sent(event_id));
                if fresh && self.drain_policy.after_success {
                    self.start_drain("after_success");
                }
            }
            Verdict::Vetoed => self.finish(origin, SendOutcome::vetoed(event_id)),
            Verdict::Drop(reason) => {
                warn!(event_id = %event_id, reason = %reason, "Event dropped");
                self.finish(origin, SendOutcome::dropped(event_id, reason));
            }
            Verdict::Persist {
                event,
                attempt_count,
            } => self.persist(origin, event, attempt_count),
            Verdict::RecordFailure => {
                if let Origin::Stored(entry_id) = origin {
                    self.record_failure(entry_id);
                }
            }
        }
    }

    /// Resolve a terminal outcome for whichever path produced it.
    fn finish(&mut self, origin: Origin, outcome: SendOutcome) {
        match origin {
            Origin::Fresh(completion) => completion.resolve(outcome),
            Origin::Stored(entry_id) => {
                if let Err(e) = self.store.remove(entry_id) {
                    warn!(entry_id = %entry_id, error = %e, "Failed to remove stored event");
                }
                if let Some(completion) = self.waiting.remove(&entry_id) {
                    completion.resolve(outcome);
                } else if let Some(completion) = self.pending_evicted.remove(&entry_id) {
                    let outcome = if outcome.is_sent() {
                        outcome
                    } else {
                        SendOutcome::dropped(outcome.event_id, FailureReason::Evicted)
                    };
                    completion.resolve(outcome);
                }
            }
            Origin::StoreCall => {}
        }
    }

    fn persist(&mut self, origin: Origin, event: Event, attempt_count: u32) {
        let event_id = event.id;
        match self.store.persist(event, attempt_count) {
            Ok(outcome) => {
                info!(
                    event_id = %event_id,
                    entry_id = %outcome.id,
                    attempt_count,
                    "Event stored for later delivery"
                );
                self.resolve_evicted(outcome.evicted);
                if let Origin::Fresh(completion) = origin {
                    self.waiting.insert(outcome.id, completion);
                }
            }
            Err(e) => {
                warn!(event_id = %event_id, error = %e, "Failed to store event, dropping");
                if let Origin::Fresh(completion) = origin {
                    completion.resolve(SendOutcome::dropped(
                        event_id,
                        FailureReason::Storage(e.to_string()),
                    ));
                }
            }
        }
    }

    fn record_failure(&mut self, entry_id: QueueEntryId) {
        match self.store.record_failed_attempt(entry_id) {
            Ok(Some(attempt_count)) => {
                debug!(entry_id = %entry_id, attempt_count, "Stored event kept for retry");
            }
            // Evicted while in flight; `release` settles its completion.
            Ok(None) => {}
            Err(e) => {
                warn!(entry_id = %entry_id, error = %e, "Failed to update stored event, dropping");
                let event_id = self.store.get(entry_id).map(|entry| entry.event.id);
                if let Err(e) = self.store.remove(entry_id) {
                    warn!(entry_id = %entry_id, error = %e, "Failed to remove stored event");
                }
                if let (Some(completion), Some(event_id)) = (self.waiting.remove(&entry_id), event_id)
                {
                    completion.resolve(SendOutcome::dropped(
                        event_id,
                        FailureReason::Storage(e.to_string()),
                    ));
                }
            }
        }
    }

    fn resolve_evicted(&mut self, evicted: Vec<QueueEntry>) {
        for entry in evicted {
            let Some(completion) = self.waiting.remove(&entry.id) else {
                continue;
            };
            if self.attempting(entry.id) {
                debug!(entry_id = %entry.id, "Evicted entry still being sent");
                self.pending_evicted.insert(entry.id, completion);
            } else {
                completion.resolve(SendOutcome::dropped(entry.event.id, FailureReason::Evicted));
            }
        }
    }

    /// Whether a spawned job is currently redelivering `entry_id`.
    fn attempting(&self, entry_id: QueueEntryId) -> bool {
        self.job_kinds
            .values()
            .any(|kind| *kind == JobKind::Redeliver(entry_id))
    }

    fn sync_capacity(&mut self) {
        let max_events = self.settings.read().max_events;
        if max_events != self.store.max_events() {
            let evicted = self.store.set_max_events(max_events);
            info!(max_events, evicted = evicted.len(), "Store capacity changed");
            self.resolve_evicted(evicted);
        }
    }

    fn notify_idle(&mut self) {
        if self.jobs.is_empty() && self.backlog.is_empty() && self.store_lane.is_empty() {
            for waiter in self.idle_waiters.drain(..) {
                let _ = waiter.send(());
            }
        }
    }

    async fn stop(mut self, commands: &mut mpsc::Receiver<Command>) {
        commands.close();
        while let Ok(command) = commands.try_recv() {
            self.reject(command);
        }

        self.jobs.shutdown().await;
        self.job_kinds.clear();
        let pending = std::mem::take(&mut self.backlog)
            .into_iter()
            .chain(std::mem::take(&mut self.store_lane));
        for job in pending {
            match job {
                Job::Submit {
                    event, completion, ..
                } => completion.resolve(SendOutcome::dropped(event.id, FailureReason::ShutDown)),
                Job::Store { event, .. } => {
                    warn!(event_id = %event.id, "Transport shutting down, event not stored");
                }
                Job::Redeliver(_) => {}
            }
        }

        for (_, completion) in self.pending_evicted.drain() {
            let event_id = completion.event_id();
            completion.resolve(SendOutcome::dropped(event_id, FailureReason::Evicted));
        }
        for (entry_id, completion) in self.waiting.drain() {
            let event_id = completion.event_id();
            debug!(entry_id = %entry_id, event_id = %event_id, "Event still stored at shutdown");
            completion.resolve(SendOutcome::dropped(
                event_id,
                FailureReason::PersistedAtShutdown,
            ));
        }
        for waiter in self.idle_waiters.drain(..) {
            let _ = waiter.send(());
        }

        info!(stored = self.store.count(), "Event transport worker stopped");
    }

    fn reject(&mut self, command: Command) {
        match command {
            Command::Send {
                event, completion, ..
            } => completion.resolve(SendOutcome::dropped(event.id, FailureReason::ShutDown)),
            Command::Store { event, .. } => {
                warn!(event_id = %event.id, "Transport shutting down, event not stored");
            }
            Command::Flush(tx) => {
                let _ = tx.send(());
            }
            Command::Count(tx) => {
                let _ = tx.send(self.store.count());
            }
            Command::Entries(tx) => {
                let _ = tx.send(self.store.entries().cloned().collect());
            }
            Command::Drain | Command::Resize | Command::Shutdown => {}
        }
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
