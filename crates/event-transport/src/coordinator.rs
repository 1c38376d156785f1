//! Public handle to a running transport.

use crate::completion::{
    Completion, CompletionDispatcher, DispatchHandle, FailureReason, PendingCompletion, SendOutcome,
};
use crate::config::{
    validate_max_events, validate_sample_rate, ConfigWarning, TransportConfig, TransportOptions,
};
use crate::hooks::{
    BeforeSendRequestHook, BeforeSerializeHook, CallbackPipeline, ShouldQueueHook, ShouldSendHook,
};
use crate::rate_limit::RateLimiter;
use crate::sampling::SampleFilter;
use crate::sender::NetworkSender;
use crate::serialize::{EventSerializer, JsonEventSerializer};
use crate::store::{DiskStore, QueueEntry};
use crate::worker::{Command, LastEvent, Worker};
use crate::{Event, EventId, Scope, TransportError, TransportResult};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// Handle to a running event transport.
///
/// Cheap to clone; every clone talks to the same worker. `send` and `store`
/// are synchronous and return as soon as the event is scheduled, so they can
/// be called from any thread, inside or outside the runtime.
#[derive(Clone)]
pub struct TransportCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    commands: mpsc::Sender<Command>,
    pipeline: Arc<CallbackPipeline>,
    settings: Arc<RwLock<TransportConfig>>,
    last_event: LastEvent,
    dispatch: DispatchHandle,
    dispatcher: Mutex<Option<CompletionDispatcher>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TransportCoordinator {
    /// Open the store at `store_dir` and start the worker, encoding events
    /// as JSON.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        options: TransportOptions,
        store_dir: impl Into<PathBuf>,
        sender: Arc<dyn NetworkSender>,
    ) -> TransportResult<Self> {
        Self::start_with_serializer(options, store_dir, sender, Arc::new(JsonEventSerializer))
    }

    pub fn start_with_serializer(
        options: TransportOptions,
        store_dir: impl Into<PathBuf>,
        sender: Arc<dyn NetworkSender>,
        serializer: Arc<dyn EventSerializer>,
    ) -> TransportResult<Self> {
        let (config, warnings) = TransportConfig::validated(
            options.config.sample_rate,
            options.config.max_events,
            options.config.max_breadcrumbs,
        );
        for warning in &warnings {
            warn!(warning = %warning, "Transport configuration adjusted");
        }

        if options.max_concurrent_attempts == 0 {
            return Err(TransportError::Config(
                "max_concurrent_attempts must be at least 1".to_string(),
            ));
        }
        if options.channel_capacity == 0 {
            return Err(TransportError::Config(
                "channel_capacity must be at least 1".to_string(),
            ));
        }

        let store = DiskStore::open(store_dir, config.max_events)?;
        let dispatcher = CompletionDispatcher::start()?;
        let dispatch = dispatcher.handle();

        let pipeline = Arc::new(CallbackPipeline::new(options.hook_timeout));
        if config.sample_rate < 1.0 {
            pipeline.set_should_send(Some(SampleFilter::new(config.sample_rate).into_send_hook()));
        }

        let settings = Arc::new(RwLock::new(config));
        let last_event: LastEvent = Arc::new(RwLock::new(None));
        let (commands, receiver) = mpsc::channel(options.channel_capacity);

        let worker = Worker {
            store,
            limiter: RateLimiter::new(options.retry.clone()),
            pipeline: pipeline.clone(),
            serializer,
            sender,
            settings: settings.clone(),
            last_event: last_event.clone(),
            drain_policy: options.drain.clone(),
            max_concurrent: options.max_concurrent_attempts,
            jobs: JoinSet::new(),
            job_kinds: HashMap::new(),
            backlog: VecDeque::new(),
            store_lane: VecDeque::new(),
            store_lane_busy: false,
            in_flight: HashSet::new(),
            waiting: HashMap::new(),
            pending_evicted: HashMap::new(),
            idle_waiters: Vec::new(),
        };
        let worker = tokio::spawn(worker.run(receiver));

        Ok(Self {
            inner: Arc::new(Inner {
                commands,
                pipeline,
                settings,
                last_event,
                dispatch,
                dispatcher: Mutex::new(Some(dispatcher)),
                worker: Mutex::new(Some(worker)),
            }),
        })
    }

    /// Schedule `event` through the full pipeline.
    ///
    /// `completion` fires exactly once with the terminal outcome, on the
    /// completion thread.
    pub fn send(&self, event: Event, scope: &Scope, completion: Completion) -> EventId {
        let event_id = event.id;
        let completion = PendingCompletion::new(event_id, completion, self.inner.dispatch.clone());
        let command = Command::Send {
            event,
            scope: scope.clone(),
            completion,
        };

        match self.inner.commands.try_send(command) {
            Ok(()) => debug!(event_id = %event_id, "Event scheduled"),
            Err(TrySendError::Full(command)) => {
                warn!(event_id = %event_id, "Transport queue full, dropping event");
                reject_send(command, FailureReason::QueueFull);
            }
            Err(TrySendError::Closed(command)) => {
                warn!(event_id = %event_id, "Transport shut down, dropping event");
                reject_send(command, FailureReason::ShutDown);
            }
        }
        event_id
    }

    /// Persist `event` for a later drain without attempting to send it.
    ///
    /// Skips the sample filter, the send veto and the network.
    pub fn store(&self, event: Event, scope: &Scope) -> EventId {
        let event_id = event.id;
        let command = Command::Store {
            event,
            scope: scope.clone(),
        };
        match self.inner.commands.try_send(command) {
            Ok(()) => debug!(event_id = %event_id, "Event scheduled for storage"),
            Err(e) => warn!(event_id = %event_id, error = %e, "Could not schedule event storage"),
        }
        event_id
    }

    /// Start a drain pass over every stored event. Fire-and-forget.
    pub fn send_all_stored_events(&self) {
        if let Err(e) = self.inner.commands.try_send(Command::Drain) {
            debug!(error = %e, "Drain request not scheduled");
        }
    }

    /// The most recently sent event.
    pub fn last_event(&self) -> Option<Arc<Event>> {
        self.inner.last_event.read().clone()
    }

    pub fn config(&self) -> TransportConfig {
        self.inner.settings.read().clone()
    }

    /// Replace the send veto with a sample filter at `rate`.
    pub fn set_sample_rate(&self, rate: f64) -> Option<ConfigWarning> {
        let (applied, warning) = validate_sample_rate(rate);
        if let Some(warning) = &warning {
            warn!(warning = %warning, "Transport configuration adjusted");
        }
        self.inner.settings.write().sample_rate = applied;
        self.inner
            .pipeline
            .set_should_send(Some(SampleFilter::new(applied).into_send_hook()));
        warning
    }

    /// Change the store capacity. Lowering it evicts the oldest entries.
    pub fn set_max_events(&self, max_events: usize) -> Option<ConfigWarning> {
        let (applied, warning) = validate_max_events(max_events);
        if let Some(warning) = &warning {
            warn!(warning = %warning, "Transport configuration adjusted");
        }
        self.inner.settings.write().max_events = applied;
        if let Err(e) = self.inner.commands.try_send(Command::Resize) {
            debug!(error = %e, "Resize request not scheduled, applied on the next worker pass");
        }
        warning
    }

    pub fn set_max_breadcrumbs(&self, max_breadcrumbs: usize) {
        self.inner.settings.write().max_breadcrumbs = max_breadcrumbs;
    }

    pub fn set_before_serialize(&self, hook: Option<Arc<BeforeSerializeHook>>) {
        self.inner.pipeline.set_before_serialize(hook);
    }

    pub fn set_before_send_request(&self, hook: Option<Arc<BeforeSendRequestHook>>) {
        self.inner.pipeline.set_before_send_request(hook);
    }

    /// Install a send veto. Replaces any sample filter set earlier.
    pub fn set_should_send(&self, hook: Option<Arc<ShouldSendHook>>) {
        self.inner.pipeline.set_should_send(hook);
    }

    pub fn set_should_queue(&self, hook: Option<Arc<ShouldQueueHook>>) {
        self.inner.pipeline.set_should_queue(hook);
    }

    /// Wait until every scheduled event and drain has finished.
    ///
    /// Returns false if `timeout` elapsed first.
    pub async fn flush(&self, timeout: Duration) -> bool {
        let (tx, rx) = oneshot::channel();
        let scheduled = async {
            self.inner
                .commands
                .send(Command::Flush(tx))
                .await
                .map_err(|_| TransportError::ShutDown)?;
            rx.await.map_err(|_| TransportError::ShutDown)
        };
        matches!(tokio::time::timeout(timeout, scheduled).await, Ok(Ok(())))
    }

    pub async fn stored_count(&self) -> TransportResult<usize> {
        self.request(Command::Count).await
    }

    /// Snapshot of the store, oldest first.
    pub async fn stored_entries(&self) -> TransportResult<Vec<QueueEntry>> {
        self.request(Command::Entries).await
    }

    /// Flush for up to `timeout`, then stop the worker.
    ///
    /// Attempts still running are abandoned. Stored events stay on disk for
    /// the next start; completions still waiting on them fire as dropped.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        let flushed = self.flush(timeout).await;

        let _ = tokio::time::timeout(timeout, self.inner.commands.send(Command::Shutdown)).await;
        let worker = self.inner.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!(error = %e, "Transport worker ended abnormally");
            }
        }

        let dispatcher = self.inner.dispatcher.lock().take();
        if let Some(mut dispatcher) = dispatcher {
            if let Err(e) = tokio::task::spawn_blocking(move || dispatcher.shutdown()).await {
                warn!(error = %e, "Completion dispatcher shutdown failed");
            }
        }

        info!(flushed, "Event transport shut down");
        flushed
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> TransportResult<T> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .commands
            .send(command(tx))
            .await
            .map_err(|_| TransportError::ShutDown)?;
        rx.await.map_err(|_| TransportError::ShutDown)
    }
}

fn reject_send(command: Command, reason: FailureReason) {
    if let Command::Send {
        event, completion, ..
    } = command
    {
        completion.resolve(SendOutcome::dropped(event.id, reason));
    }
}
