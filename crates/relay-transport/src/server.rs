use core::sync::atomic::{AtomicU64, Ordering};
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use relay_core::{
    BroadcastChannel, CompletionDiscipline, ControlSignal, Correlation, CorrelationId,
    CorrelationState, ErrorSink, PipelineBuilder, PipelineParts, RelayConfig, RelayError,
    Request, ResponseSink, ServiceRegistry, Task, Terminal, TerminalInput,
};
use tokio::runtime::{Handle, Runtime};
use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use tokio::task::{AbortHandle, JoinHandle};

use crate::dispatcher::{self, panic_message, Envelope};
use crate::reliability::{DeadlinePolicy, FixedDeadline, RelayStats, StatsSnapshot};

/// What happened to a published task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Delivered to this many stages (the terminal included).
    Delivered(usize),
    /// No predicate matched this generation.
    Unmatched,
    /// The correlation already has its reply; the task was dropped.
    Discarded,
}

/// State shared by the coordinator, its workers and its supervisor.
pub(crate) struct Shared {
    pub(crate) config: RelayConfig,
    pub(crate) channel: BroadcastChannel<Envelope>,
    pub(crate) terminal: Terminal,
    /// Only present under wait-for-all, where the terminal is not a channel subscriber.
    pub(crate) terminal_tx: Option<mpsc::UnboundedSender<Envelope>>,
    pub(crate) services: Arc<ServiceRegistry>,
    pub(crate) error_sink: Arc<dyn ErrorSink>,
    pub(crate) control_tx: mpsc::UnboundedSender<ControlSignal>,
    pub(crate) deadline: Arc<dyn DeadlinePolicy>,
    pub(crate) stats: RelayStats,
    /// Stage actions.
    pub(crate) permits: Arc<Semaphore>,
    /// Terminal deliveries and fallback escapes, never starved by stuck stages.
    pub(crate) reserve: Arc<Semaphore>,
    pub(crate) runtime: Handle,
    running: Mutex<HashMap<u64, (AbortHandle, Correlation)>>,
    next_task: AtomicU64,
    next_id: AtomicU64,
}

/// Removes a finished or aborted action from the running set.
struct Untrack {
    shared: Arc<Shared>,
    key: u64,
}

impl Drop for Untrack {
    fn drop(&mut self) {
        if let Ok(mut running) = self.shared.running.lock() {
            running.remove(&self.key);
        }
    }
}

impl Shared {
    pub(crate) fn publish(&self, task: Task) -> Result<PublishOutcome, RelayError> {
        let correlation = task.correlation().clone();
        if correlation.is_resolved() {
            self.stats.record_discard();
            tracing::debug!(
                "Publish: {} already {:?}, discarding tag `{}`",
                correlation.id(),
                correlation.state(),
                task.tag()
            );
            return Ok(PublishOutcome::Discarded);
        }
        if self.channel.is_closed() {
            return Err(RelayError::ChannelClosed);
        }
        if correlation.arm(&self.control_tx) {
            self.arm_deadline(&correlation);
        }

        let ticket = correlation.ticket();
        let task = Arc::new(task);
        let tag = task.tag().to_string();

        // Under wait-for-all every stage delivery carries a share of the
        // correlation's outstanding work, and a matching terminal delivery is
        // held until no share is left, whichever generation took it.
        let (work, held_terminal) = match (&self.terminal_tx, self.config.completion) {
            (Some(terminal_tx), CompletionDiscipline::WaitForAll) => {
                let work = correlation.work_ticket();
                let held = self.terminal.predicate().matches(&task);
                if held {
                    let release = Envelope::new(task.clone(), ticket.clone(), None);
                    let terminal_tx = terminal_tx.clone();
                    correlation.when_idle(move || {
                        tracing::debug!(
                            "Join: {} has no stage work left, releasing generation {} to the terminal",
                            release.task.id(),
                            release.task.generation()
                        );
                        // A failed send drops the ticket; the supervisor then
                        // resolves the correlation through the fallback path.
                        let _ = terminal_tx.send(release);
                    });
                }
                (Some(work), usize::from(held))
            }
            _ => (None, 0),
        };

        self.stats.record_publish();
        let delivered =
            self.channel.publish(Envelope::new(task, ticket.clone(), work))? + held_terminal;

        // The publisher's own ticket outlives the fan-out, so quiescence is
        // only signalled once the unmatched tag has been recorded.
        let outcome = if delivered == 0 {
            self.stats.record_unmatched();
            correlation.note_unmatched(&tag);
            tracing::debug!("Publish: tag `{}` of {} matched no stage", tag, correlation.id());
            PublishOutcome::Unmatched
        } else {
            PublishOutcome::Delivered(delivered)
        };
        drop(ticket);
        Ok(outcome)
    }

    fn arm_deadline(&self, correlation: &Correlation) {
        let deadline = self.deadline.deadline_for(correlation.request());
        let watched = correlation.clone();
        let timer = self.runtime.spawn(async move {
            tokio::time::sleep(deadline).await;
            if !watched.is_resolved() {
                watched.expire();
            }
        });
        correlation.set_deadline(timer.abort_handle());
    }

    /// Spawns an action working on `correlation`. The task can be aborted
    /// through the correlation when it expires, and through the relay when
    /// shutdown runs out of grace.
    pub(crate) fn spawn_action<F>(self: &Arc<Self>, correlation: &Correlation, action: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let key = self.next_task.fetch_add(1, Ordering::Relaxed);
        let untrack = Untrack {
            shared: self.clone(),
            key,
        };
        let (tracked_tx, tracked_rx) = oneshot::channel::<()>();
        let handle = self.runtime.spawn(async move {
            let _untrack = untrack;
            // Not before the entry below exists, or it would never be removed.
            if tracked_rx.await.is_ok() {
                action.await;
            }
        });
        if let Ok(mut running) = self.running.lock() {
            running.insert(key, (handle.abort_handle(), correlation.clone()));
        }
        let _ = tracked_tx.send(());
        correlation.track_task(handle.abort_handle());
        handle
    }

    /// Aborts every running action and writes the transport's fallback reply
    /// to each affected correlation that has none yet.
    pub(crate) fn abort_running(&self) -> usize {
        let running = match self.running.lock() {
            Ok(mut running) => std::mem::take(&mut *running),
            Err(_) => return 0,
        };
        let aborted = running.len();
        for (handle, _) in running.values() {
            handle.abort();
        }
        for (_, correlation) in running.into_values() {
            if correlation.has_replied() {
                continue;
            }
            let _ = correlation.try_resolve(CorrelationState::Errored);
            correlation.cancel_deadline();
            if correlation.reply_fallback(&RelayError::ChannelClosed).is_ok() {
                self.stats.record_fallback();
                self.stats.record_reply();
                tracing::warn!("Relay: {} aborted by shutdown, fallback written", correlation.id());
            }
        }
        aborted
    }

    /// Records a stage-local fault. Never propagates further.
    pub(crate) fn fault(&self, correlation: &Correlation, error: RelayError) {
        correlation.record_fault();
        self.stats.record_fault();
        self.error_sink.report(&error);
    }

    /// Runs the terminal action on `task` and writes its reply. If the
    /// action fails, the sink's fallback reply for `cause` (or for the
    /// action's own error) is written instead.
    pub(crate) async fn answer(
        &self,
        correlation: &Correlation,
        task: Task,
        cause: Option<RelayError>,
    ) {
        let input = TerminalInput {
            task,
            services: self.services.clone(),
        };
        let result = match AssertUnwindSafe((self.terminal.action())(input))
            .catch_unwind()
            .await
        {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(e)) => Err(e.to_string()),
            Err(panic) => Err(panic_message(panic)),
        };

        let written = match result {
            Ok(reply) => {
                let status = reply.status;
                let written = correlation.reply(reply);
                if written.is_ok() {
                    tracing::debug!("Terminal replied {} to {}", status, correlation.id());
                }
                written
            }
            Err(message) => {
                let error = RelayError::StageAction {
                    stage: self.terminal.name().to_string(),
                    correlation: correlation.id(),
                    message,
                };
                self.fault(correlation, error);
                let cause = cause.unwrap_or(RelayError::StageAction {
                    stage: self.terminal.name().to_string(),
                    correlation: correlation.id(),
                    message: "terminal action failed".into(),
                });
                self.stats.record_fallback();
                correlation.reply_fallback(&cause)
            }
        };

        match written {
            Ok(()) => self.stats.record_reply(),
            Err(e) => self.error_sink.report(&e),
        }
    }

    /// Escape hatch for correlations that cannot reach the terminal on their
    /// own: hands a synthesised fallback task straight to the terminal action.
    /// The caller has already claimed `Errored`.
    async fn escape(&self, correlation: Correlation, error: RelayError) {
        correlation.cancel_deadline();
        self.stats.record_fallback();
        self.error_sink.report(&error);

        let fallback = Task::fallback(correlation.clone(), &self.config.fallback_tag, &error)
            .scoped(self.terminal.name());
        self.answer(&correlation, fallback, Some(error)).await;
    }

    fn handle_control(self: &Arc<Self>, signal: ControlSignal) {
        let (correlation, error, expired) = match signal {
            ControlSignal::Quiesced(correlation) => {
                if correlation.is_resolved() || correlation.pending() > 0 {
                    return;
                }
                let error = if correlation.faults() > 0 {
                    RelayError::StageAction {
                        stage: "pipeline".into(),
                        correlation: correlation.id(),
                        message: format!(
                            "chain ended without a reply after {} stage fault(s)",
                            correlation.faults()
                        ),
                    }
                } else {
                    RelayError::NoMatchingStage {
                        correlation: correlation.id(),
                        tag: correlation.unmatched_tag().unwrap_or_default(),
                    }
                };
                (correlation, error, false)
            }
            ControlSignal::Expired(correlation) => {
                if correlation.is_resolved() {
                    return;
                }
                let error = RelayError::DeadlineExceeded {
                    correlation: correlation.id(),
                    deadline: self.deadline.deadline_for(correlation.request()),
                };
                (correlation, error, true)
            }
        };

        if !correlation.try_resolve(CorrelationState::Errored) {
            return;
        }
        if expired {
            let aborted = correlation.abort_running();
            if aborted > 0 {
                tracing::debug!("Supervisor: aborted {} stuck action(s) of {}", aborted, correlation.id());
            }
        }

        let reserve = self.reserve.clone();
        let escape = {
            let shared = self.clone();
            let correlation = correlation.clone();
            async move {
                let Ok(_permit) = reserve.acquire_owned().await else {
                    return;
                };
                shared.escape(correlation, error).await;
            }
        };
        self.spawn_action(&correlation, escape);
    }
}

/// Supervisor loop: resolves quiet and expired correlations.
async fn supervise(
    shared: Arc<Shared>,
    mut control_rx: mpsc::UnboundedReceiver<ControlSignal>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            Some(signal) = control_rx.recv() => shared.handle_control(signal),
            _ = shutdown.changed() => {
                while let Ok(signal) = control_rx.try_recv() {
                    shared.handle_control(signal);
                }
                break;
            }
        }
    }
    tracing::debug!("Supervisor stopped");
}

/// A configured but not yet running coordinator.
pub struct RelayServer {
    parts: PipelineParts,
    deadline: Option<Arc<dyn DeadlinePolicy>>,
}

impl RelayServer {
    pub fn from_builder(builder: PipelineBuilder) -> Result<Self, RelayError> {
        Ok(Self {
            parts: builder.into_parts()?,
            deadline: None,
        })
    }

    /// Replaces the fixed per-correlation deadline taken from the config.
    pub fn with_deadline_policy(mut self, policy: Arc<dyn DeadlinePolicy>) -> Self {
        self.deadline = Some(policy);
        self
    }

    pub fn config(&self) -> &RelayConfig {
        &self.parts.config
    }

    /// Seals the stage table and starts the workers.
    ///
    /// Uses the ambient tokio runtime when called from inside one, otherwise
    /// builds a dedicated runtime with `worker_threads` workers.
    pub fn start(self) -> Result<Relay, RelayError> {
        let PipelineParts {
            config,
            services,
            stages,
            terminal,
            error_sink,
        } = self.parts;

        let (runtime, handle) = match Handle::try_current() {
            Ok(handle) => (None, handle),
            Err(_) => {
                let runtime = tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(config.worker_threads)
                    .thread_name("relay-worker")
                    .enable_all()
                    .build()?;
                let handle = runtime.handle().clone();
                (Some(runtime), handle)
            }
        };

        let channel = BroadcastChannel::new();
        let mut subscriptions = Vec::with_capacity(stages.len());
        for stage in stages {
            let sub = channel.attach(stage.name(), stage.predicate().clone())?;
            subscriptions.push((stage, sub));
        }
        let (terminal_tx, terminal_rx) = match config.completion {
            CompletionDiscipline::FireAndForget => {
                let sub = channel.attach(terminal.name(), terminal.predicate().clone())?;
                (None, sub.rx)
            }
            CompletionDiscipline::WaitForAll => {
                let (tx, rx) = mpsc::unbounded_channel();
                (Some(tx), rx)
            }
        };
        channel.seal();

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let deadline: Arc<dyn DeadlinePolicy> = match self.deadline {
            Some(policy) => policy,
            None => Arc::new(FixedDeadline::new(config.deadline())),
        };

        tracing::info!(
            "Relay: starting {} stage(s) + terminal `{}` ({:?}, deadline {:?}, {} in-flight permits per pool)",
            subscriptions.len(),
            terminal.name(),
            config.completion,
            config.deadline(),
            config.max_in_flight
        );

        let shared = Arc::new(Shared {
            permits: Arc::new(Semaphore::new(config.max_in_flight)),
            reserve: Arc::new(Semaphore::new(config.max_in_flight)),
            running: Mutex::new(HashMap::new()),
            next_task: AtomicU64::new(1),
            config,
            channel,
            terminal,
            terminal_tx,
            services,
            error_sink,
            control_tx,
            deadline,
            stats: RelayStats::default(),
            runtime: handle.clone(),
            next_id: AtomicU64::new(1),
        });

        let workers = subscriptions
            .into_iter()
            .map(|(stage, sub)| handle.spawn(dispatcher::run_stage(shared.clone(), stage, sub)))
            .collect();
        let terminal_worker = handle.spawn(dispatcher::run_terminal(
            shared.clone(),
            terminal_rx,
            shutdown_rx.clone(),
        ));
        let supervisor = handle.spawn(supervise(shared.clone(), control_rx, shutdown_rx));

        Ok(Relay {
            handle: RelayHandle { shared },
            workers,
            terminal_worker,
            supervisor,
            shutdown_tx,
            runtime,
        })
    }
}

/// Cloneable publishing side of a running coordinator.
#[derive(Clone)]
pub struct RelayHandle {
    shared: Arc<Shared>,
}

impl RelayHandle {
    /// Creates the correlation for a new inbound request without publishing.
    pub fn open(&self, request: Request, sink: Arc<dyn ResponseSink>) -> Correlation {
        let id = CorrelationId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        Correlation::new(id, request, sink)
    }

    /// Inbound boundary: builds a task tagged with the configured initial tag
    /// and publishes it.
    pub fn on_request(
        &self,
        request: Request,
        sink: Arc<dyn ResponseSink>,
    ) -> Result<CorrelationId, RelayError> {
        let tag = self.shared.config.initial_tag.clone();
        self.on_request_tagged(request, sink, &tag)
    }

    pub fn on_request_tagged(
        &self,
        request: Request,
        sink: Arc<dyn ResponseSink>,
        tag: &str,
    ) -> Result<CorrelationId, RelayError> {
        let correlation = self.open(request, sink);
        let id = correlation.id();
        self.publish(Task::new(correlation, tag))?;
        Ok(id)
    }

    pub fn publish(&self, task: Task) -> Result<PublishOutcome, RelayError> {
        self.shared.publish(task)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.channel.is_closed()
    }

    pub fn config(&self) -> &RelayConfig {
        &self.shared.config
    }

    pub fn services(&self) -> &Arc<ServiceRegistry> {
        &self.shared.services
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Runtime the stage actions execute on.
    pub fn runtime(&self) -> &Handle {
        &self.shared.runtime
    }
}

/// Owner of a running coordinator. Dropping it without calling
/// [`shutdown`](Self::shutdown) abandons queued work.
pub struct Relay {
    handle: RelayHandle,
    workers: Vec<JoinHandle<()>>,
    terminal_worker: JoinHandle<()>,
    supervisor: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
    runtime: Option<Runtime>,
}

impl Relay {
    pub fn handle(&self) -> RelayHandle {
        self.handle.clone()
    }

    pub fn open(&self, request: Request, sink: Arc<dyn ResponseSink>) -> Correlation {
        self.handle.open(request, sink)
    }

    pub fn on_request(
        &self,
        request: Request,
        sink: Arc<dyn ResponseSink>,
    ) -> Result<CorrelationId, RelayError> {
        self.handle.on_request(request, sink)
    }

    pub fn on_request_tagged(
        &self,
        request: Request,
        sink: Arc<dyn ResponseSink>,
        tag: &str,
    ) -> Result<CorrelationId, RelayError> {
        self.handle.on_request_tagged(request, sink, tag)
    }

    pub fn publish(&self, task: Task) -> Result<PublishOutcome, RelayError> {
        self.handle.publish(task)
    }

    pub fn config(&self) -> &RelayConfig {
        self.handle.config()
    }

    pub fn services(&self) -> &Arc<ServiceRegistry> {
        self.handle.services()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.handle.stats()
    }

    pub fn runtime(&self) -> &Handle {
        self.handle.runtime()
    }

    /// Closes the channel, lets queued deliveries and running actions finish,
    /// then stops the terminal worker and the supervisor. Whatever is still
    /// running once `shutdown_grace` has passed is aborted and its peer gets
    /// the transport's fallback reply.
    pub async fn shutdown(mut self) {
        self.drain().await;
    }

    /// Blocking variant for callers outside any runtime.
    pub fn shutdown_blocking(mut self) {
        match self.runtime.take() {
            Some(runtime) => {
                runtime.block_on(self.drain());
                runtime.shutdown_background();
            }
            None => {
                let handle = self.handle.shared.runtime.clone();
                handle.block_on(self.drain());
            }
        }
    }

    async fn drain(&mut self) {
        let shared = self.handle.shared.clone();
        let grace = shared.config.shutdown_grace();
        tracing::info!("Relay: shutting down (grace {:?})", grace);
        shared.channel.close();

        let loops: Vec<AbortHandle> = self
            .workers
            .iter()
            .chain([&self.terminal_worker, &self.supervisor])
            .map(JoinHandle::abort_handle)
            .collect();
        let orderly = tokio::time::timeout(grace, async {
            for worker in self.workers.drain(..) {
                let _ = worker.await;
            }
            settle(&shared).await;

            let _ = self.shutdown_tx.send(true);
            let _ = (&mut self.terminal_worker).await;
            let _ = (&mut self.supervisor).await;
            settle(&shared).await;
        })
        .await;

        if orderly.is_err() {
            for handle in loops {
                handle.abort();
            }
            let aborted = shared.abort_running();
            tracing::warn!("Relay: grace period elapsed, aborted {} running action(s)", aborted);
        }

        let stats = shared.stats.snapshot();
        tracing::info!(
            "Relay: stopped after {} publish(es), {} repl(ies), {} fallback(s), {} fault(s)",
            stats.published,
            stats.replies,
            stats.fallbacks,
            stats.stage_faults
        );
    }
}

/// Waits until no action holds a permit from either pool.
async fn settle(shared: &Shared) {
    let all = u32::try_from(shared.config.max_in_flight).unwrap_or(u32::MAX);
    for pool in [&shared.permits, &shared.reserve] {
        if let Ok(permits) = pool.acquire_many(all).await {
            drop(permits);
        }
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}
