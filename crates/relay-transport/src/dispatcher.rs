use std::any::Any;
use std::borrow::Borrow;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use relay_core::{
    CorrelationState, Outcome, RelayError, Stage, StageInput, StageMode, Subscription, Task,
    Ticket, WorkTicket,
};
use tokio::sync::{mpsc, watch};

use crate::server::Shared;

/// One delivery of a published task to one consumer.
///
/// Cloning an envelope takes another ticket on the correlation and, under
/// wait-for-all, another share of its outstanding stage work; dropping it
/// gives them back.
#[derive(Clone)]
pub struct Envelope {
    pub(crate) task: Arc<Task>,
    pub(crate) ticket: Ticket,
    pub(crate) work: Option<WorkTicket>,
}

impl Envelope {
    pub(crate) fn new(task: Arc<Task>, ticket: Ticket, work: Option<WorkTicket>) -> Self {
        Self { task, ticket, work }
    }

    pub fn task(&self) -> &Arc<Task> {
        &self.task
    }
}

impl Borrow<Task> for Envelope {
    fn borrow(&self) -> &Task {
        &self.task
    }
}

/// Receive loop of one filtered stage.
///
/// Every delivery runs as its own runtime task so it can be aborted. Serial
/// stages wait for it before taking the next one off the queue.
pub(crate) async fn run_stage(shared: Arc<Shared>, stage: Stage, mut sub: Subscription<Envelope>) {
    tracing::debug!("StageWorker `{}` started ({:?})", stage.name(), stage.mode());

    while let Some(envelope) = sub.rx.recv().await {
        let Ok(permit) = shared.permits.clone().acquire_owned().await else {
            break;
        };
        let correlation = envelope.task.correlation().clone();
        let action = {
            let shared = shared.clone();
            let stage = stage.clone();
            async move {
                execute_stage(&shared, &stage, envelope).await;
                drop(permit);
            }
        };
        let running = shared.spawn_action(&correlation, action);
        if stage.mode() == StageMode::Serial {
            // Aborted on expiry or forced shutdown; the next delivery goes on.
            let _ = running.await;
        }
    }

    tracing::debug!("StageWorker `{}` drained", stage.name());
}

async fn execute_stage(shared: &Arc<Shared>, stage: &Stage, envelope: Envelope) {
    let Envelope { task, ticket, work } = envelope;
    shared.stats.record_delivery();

    let input = StageInput::new(task.clone(), stage.shared_name(), shared.services.clone());
    let result = AssertUnwindSafe((stage.action())(input)).catch_unwind().await;

    match result {
        Ok(Ok(Outcome::Done)) => {
            tracing::debug!("Stage `{}` done with {} (tag `{}`)", stage.name(), task.id(), task.tag());
        }
        Ok(Ok(Outcome::Continue(next))) => {
            tracing::debug!(
                "Stage `{}` advanced {}: `{}` -> `{}`",
                stage.name(),
                task.id(),
                task.tag(),
                next.tag()
            );
            let correlation = next.correlation().clone();
            if let Err(e) = shared.publish(next) {
                shared.fault(&correlation, e);
            }
        }
        Ok(Err(e)) => shared.fault(
            task.correlation(),
            RelayError::StageAction {
                stage: stage.name().to_string(),
                correlation: task.id(),
                message: e.to_string(),
            },
        ),
        Err(panic) => shared.fault(
            task.correlation(),
            RelayError::StageAction {
                stage: stage.name().to_string(),
                correlation: task.id(),
                message: panic_message(panic),
            },
        ),
    }

    // Republication above already took fresh tickets, so dropping these
    // cannot make the correlation look idle mid-chain.
    drop(work);
    drop(ticket);
}

/// Receive loop of the terminal stage. Stops once shutdown is signalled and
/// the queue has been drained.
pub(crate) async fn run_terminal(
    shared: Arc<Shared>,
    mut rx: mpsc::UnboundedReceiver<Envelope>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            next = rx.recv() => match next {
                Some(envelope) => spawn_terminal(&shared, envelope).await,
                None => break,
            },
            _ = shutdown.changed() => {
                while let Ok(envelope) = rx.try_recv() {
                    spawn_terminal(&shared, envelope).await;
                }
                break;
            }
        }
    }
    tracing::debug!("TerminalWorker drained");
}

async fn spawn_terminal(shared: &Arc<Shared>, envelope: Envelope) {
    let Ok(permit) = shared.reserve.clone().acquire_owned().await else {
        return;
    };
    let correlation = envelope.task.correlation().clone();
    let action = {
        let shared = shared.clone();
        async move {
            execute_terminal(&shared, envelope).await;
            drop(permit);
        }
    };
    shared.spawn_action(&correlation, action);
}

async fn execute_terminal(shared: &Arc<Shared>, envelope: Envelope) {
    let Envelope { task, ticket, .. } = envelope;
    let correlation = task.correlation().clone();

    if !correlation.try_resolve(CorrelationState::Terminal) {
        match correlation.state() {
            CorrelationState::Terminal => {
                shared.stats.record_duplicate_terminal();
                shared.error_sink.report(&RelayError::DuplicateTerminalInvocation {
                    correlation: correlation.id(),
                });
            }
            state => {
                tracing::debug!("Terminal skipped {}: already {:?}", correlation.id(), state);
            }
        }
        return;
    }

    correlation.cancel_deadline();
    let scoped = task.scoped(shared.terminal.name());
    shared.answer(&correlation, scoped, None).await;
    drop(ticket);
}

pub(crate) fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_payloads_become_messages() {
        assert_eq!(panic_message(Box::new("boom")), "panicked: boom");
        assert_eq!(panic_message(Box::new(String::from("bang"))), "panicked: bang");
        assert_eq!(panic_message(Box::new(7u8)), "panicked");
    }
}
