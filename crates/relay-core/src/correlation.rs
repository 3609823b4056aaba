use core::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};

use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::error::RelayError;
use crate::task::{Reply, Request};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId(pub u64);

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CorrelationState {
    Created = 0,
    InFlight = 1,
    Terminal = 2,
    Errored = 3,
}

impl CorrelationState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => CorrelationState::Created,
            1 => CorrelationState::InFlight,
            2 => CorrelationState::Terminal,
            _ => CorrelationState::Errored,
        }
    }
}

/// Signals raised by correlations towards the coordinator's supervisor.
#[derive(Debug)]
pub enum ControlSignal {
    /// Every ticket of the correlation was dropped.
    Quiesced(Correlation),
    /// The correlation's deadline elapsed.
    Expired(Correlation),
}

/// Outbound half of the transport boundary.
pub trait ResponseSink: Send + Sync {
    /// Hands the reply to the network peer. Called at most once per correlation.
    fn write(&self, reply: Reply) -> Result<(), RelayError>;

    /// Reply used when neither the pipeline nor the terminal could produce one.
    fn fallback(&self, error: &RelayError) -> Reply {
        match error {
            RelayError::DeadlineExceeded { .. } => Reply::text(504, "Gateway Timeout"),
            _ => Reply::text(500, "Internal Server Error"),
        }
    }
}

type IdleHook = Box<dyn FnOnce() + Send>;

struct Inner {
    id: CorrelationId,
    request: Arc<Request>,
    sink: Arc<dyn ResponseSink>,
    state: AtomicU8,
    /// Outstanding tickets: queued or running deliveries plus publishers mid fan-out.
    pending: AtomicUsize,
    faults: AtomicUsize,
    replied: AtomicBool,
    notifier: OnceLock<mpsc::UnboundedSender<ControlSignal>>,
    deadline: Mutex<Option<AbortHandle>>,
    unmatched_tag: Mutex<Option<String>>,
    /// Stage deliveries of any generation that have not finished yet.
    work: AtomicUsize,
    idle_hooks: Mutex<Vec<IdleHook>>,
    running: Mutex<Vec<AbortHandle>>,
}

/// Identity tying every generation of one inbound request together.
///
/// Cloning is cheap; all clones share the same state machine.
#[derive(Clone)]
pub struct Correlation {
    inner: Arc<Inner>,
}

impl fmt::Debug for Correlation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Correlation")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("pending", &self.pending())
            .finish()
    }
}

impl Correlation {
    pub fn new(id: CorrelationId, request: Request, sink: Arc<dyn ResponseSink>) -> Self {
        Self {
            inner: Arc::new(Inner {
                id,
                request: Arc::new(request),
                sink,
                state: AtomicU8::new(CorrelationState::Created as u8),
                pending: AtomicUsize::new(0),
                faults: AtomicUsize::new(0),
                replied: AtomicBool::new(false),
                notifier: OnceLock::new(),
                deadline: Mutex::new(None),
                unmatched_tag: Mutex::new(None),
                work: AtomicUsize::new(0),
                idle_hooks: Mutex::new(Vec::new()),
                running: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn id(&self) -> CorrelationId {
        self.inner.id
    }

    pub fn request(&self) -> &Request {
        &self.inner.request
    }

    pub fn sink(&self) -> &Arc<dyn ResponseSink> {
        &self.inner.sink
    }

    pub fn state(&self) -> CorrelationState {
        CorrelationState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub fn is_resolved(&self) -> bool {
        matches!(
            self.state(),
            CorrelationState::Terminal | CorrelationState::Errored
        )
    }

    /// Moves `Created -> InFlight` and installs the supervisor channel.
    ///
    /// Returns `true` only for the call that performed the transition.
    pub fn arm(&self, notifier: &mpsc::UnboundedSender<ControlSignal>) -> bool {
        let armed = self
            .inner
            .state
            .compare_exchange(
                CorrelationState::Created as u8,
                CorrelationState::InFlight as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if armed {
            let _ = self.inner.notifier.set(notifier.clone());
        }
        armed
    }

    /// Claims the final state. Only one of `Terminal` / `Errored` can ever win.
    pub fn try_resolve(&self, outcome: CorrelationState) -> bool {
        debug_assert!(matches!(
            outcome,
            CorrelationState::Terminal | CorrelationState::Errored
        ));
        self.inner
            .state
            .compare_exchange(
                CorrelationState::InFlight as u8,
                outcome as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Writes the reply unless one was already sent.
    pub fn reply(&self, reply: Reply) -> Result<(), RelayError> {
        if self.inner.replied.swap(true, Ordering::AcqRel) {
            return Err(RelayError::DuplicateTerminalInvocation {
                correlation: self.inner.id,
            });
        }
        self.inner.sink.write(reply)
    }

    pub fn has_replied(&self) -> bool {
        self.inner.replied.load(Ordering::Acquire)
    }

    /// Writes the transport's own fallback reply for `error`.
    pub fn reply_fallback(&self, error: &RelayError) -> Result<(), RelayError> {
        let reply = self.inner.sink.fallback(error);
        self.reply(reply)
    }

    pub fn record_fault(&self) {
        self.inner.faults.fetch_add(1, Ordering::AcqRel);
    }

    pub fn faults(&self) -> usize {
        self.inner.faults.load(Ordering::Acquire)
    }

    pub fn note_unmatched(&self, tag: &str) {
        if let Ok(mut slot) = self.inner.unmatched_tag.lock() {
            *slot = Some(tag.to_string());
        }
    }

    pub fn unmatched_tag(&self) -> Option<String> {
        self.inner.unmatched_tag.lock().ok().and_then(|slot| slot.clone())
    }

    pub fn set_deadline(&self, handle: AbortHandle) {
        if let Ok(mut slot) = self.inner.deadline.lock() {
            *slot = Some(handle);
        }
    }

    pub fn cancel_deadline(&self) {
        if let Ok(mut slot) = self.inner.deadline.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::Acquire)
    }

    /// Takes a ticket on the correlation's outstanding work.
    pub fn ticket(&self) -> Ticket {
        self.inner.pending.fetch_add(1, Ordering::AcqRel);
        Ticket {
            correlation: self.clone(),
        }
    }

    /// Takes a share of the correlation's outstanding stage work.
    pub fn work_ticket(&self) -> WorkTicket {
        self.inner.work.fetch_add(1, Ordering::AcqRel);
        WorkTicket {
            correlation: self.clone(),
        }
    }

    pub fn outstanding_work(&self) -> usize {
        self.inner.work.load(Ordering::Acquire)
    }

    /// Runs `hook` once no work ticket of this correlation is left, right
    /// away if there is none.
    pub fn when_idle(&self, hook: impl FnOnce() + Send + 'static) {
        let Ok(mut hooks) = self.inner.idle_hooks.lock() else {
            return;
        };
        if self.inner.work.load(Ordering::Acquire) > 0 {
            hooks.push(Box::new(hook));
            return;
        }
        drop(hooks);
        hook();
    }

    fn run_idle_hooks(&self) {
        let hooks = match self.inner.idle_hooks.lock() {
            Ok(mut hooks) if self.inner.work.load(Ordering::Acquire) == 0 => {
                std::mem::take(&mut *hooks)
            }
            _ => return,
        };
        for hook in hooks {
            hook();
        }
    }

    /// Remembers a runtime task working on this correlation so it can be
    /// aborted when the correlation expires.
    pub fn track_task(&self, handle: AbortHandle) {
        if let Ok(mut running) = self.inner.running.lock() {
            running.retain(|h| !h.is_finished());
            running.push(handle);
        }
    }

    /// Aborts every tracked task still running. Returns how many were aborted.
    pub fn abort_running(&self) -> usize {
        let running = match self.inner.running.lock() {
            Ok(mut running) => std::mem::take(&mut *running),
            Err(_) => return 0,
        };
        let mut aborted = 0;
        for handle in running.into_iter().filter(|h| !h.is_finished()) {
            handle.abort();
            aborted += 1;
        }
        aborted
    }

    pub fn same_as(&self, other: &Correlation) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn notify(&self, signal: ControlSignal) {
        if let Some(tx) = self.inner.notifier.get() {
            if tx.send(signal).is_err() {
                tracing::debug!("Correlation {}: supervisor gone, signal dropped", self.inner.id);
            }
        }
    }

    /// Raises a deadline expiry towards the supervisor.
    pub fn expire(&self) {
        self.notify(ControlSignal::Expired(self.clone()));
    }
}

/// RAII share of a correlation's outstanding work.
///
/// When the last ticket drops the supervisor is told the correlation went
/// quiet, which is how dead-ended chains are detected.
pub struct Ticket {
    correlation: Correlation,
}

impl Ticket {
    pub fn correlation(&self) -> &Correlation {
        &self.correlation
    }
}

impl Clone for Ticket {
    fn clone(&self) -> Self {
        self.correlation.ticket()
    }
}

impl fmt::Debug for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Ticket").field(&self.correlation.id()).finish()
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        if self.correlation.inner.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.correlation
                .notify(ControlSignal::Quiesced(self.correlation.clone()));
        }
    }
}

/// RAII share of the stage work outstanding on a correlation, across all
/// generations. Hooks registered with [`Correlation::when_idle`] run when the
/// last one drops.
pub struct WorkTicket {
    correlation: Correlation,
}

impl Clone for WorkTicket {
    fn clone(&self) -> Self {
        self.correlation.work_ticket()
    }
}

impl fmt::Debug for WorkTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("WorkTicket").field(&self.correlation.id()).finish()
    }
}

impl Drop for WorkTicket {
    fn drop(&mut self) {
        if self.correlation.inner.work.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.correlation.run_idle_hooks();
        }
    }
}
