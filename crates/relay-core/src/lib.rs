pub mod channel;
pub mod config;
pub mod correlation;
pub mod error;
pub mod registry;
pub mod stage;
pub mod task;

pub use bytes::Bytes;
pub use channel::{BroadcastChannel, Subscription};
pub use config::{CompletionDiscipline, RelayConfig};
pub use correlation::{
    ControlSignal, Correlation, CorrelationId, CorrelationState, ResponseSink, Ticket, WorkTicket,
};
pub use error::{ErrorSink, RelayError, StageError, TracingErrorSink};
pub use registry::ServiceRegistry;
pub use stage::{
    Outcome, Predicate, Stage, StageAction, StageInput, StageMode, Terminal, TerminalAction,
    TerminalInput,
};
pub use task::{EventKind, MemorySink, Reply, Request, Task};

use std::sync::Arc;
use std::time::Duration;

/// Collects everything a coordinator needs before it starts.
///
/// Stages are registered here, once, in order; nothing can be attached after
/// the coordinator built from this builder has started.
pub struct PipelineBuilder {
    pub config: RelayConfig,
    pub services: ServiceRegistry,
    stages: Vec<Stage>,
    terminal: Option<Terminal>,
    error_sink: Option<Arc<dyn ErrorSink>>,
}

/// Validated output of [`PipelineBuilder::into_parts`].
pub struct PipelineParts {
    pub config: RelayConfig,
    pub services: Arc<ServiceRegistry>,
    pub stages: Vec<Stage>,
    pub terminal: Terminal,
    pub error_sink: Arc<dyn ErrorSink>,
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self {
            config: RelayConfig::default(),
            services: ServiceRegistry::new(),
            stages: Vec::new(),
            terminal: None,
            error_sink: None,
        }
    }

    /// Overrides the default configuration.
    pub fn with_config(mut self, config: RelayConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_completion(mut self, completion: CompletionDiscipline) -> Self {
        self.config.completion = completion;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.config.deadline_ms = u64::try_from(deadline.as_millis())
            .unwrap_or(u64::MAX)
            .max(1);
        self
    }

    /// Bounds how long shutdown waits for running actions before aborting them.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.config.shutdown_grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_max_in_flight(mut self, permits: usize) -> Self {
        self.config.max_in_flight = permits;
        self
    }

    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.config.worker_threads = threads;
        self
    }

    pub fn stage(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn stages(mut self, stages: impl IntoIterator<Item = Stage>) -> Self {
        self.stages.extend(stages);
        self
    }

    /// Sets the terminal stage. A second call replaces the first.
    pub fn terminal(mut self, terminal: Terminal) -> Self {
        if let Some(previous) = self.terminal.replace(terminal) {
            tracing::warn!("PipelineBuilder: terminal `{}` replaced", previous.name());
        }
        self
    }

    pub fn service<T: Send + Sync + 'static>(mut self, instance: Arc<T>) -> Self {
        self.services.register_instance(instance);
        self
    }

    pub fn with_services(mut self, services: ServiceRegistry) -> Self {
        self.services = services;
        self
    }

    pub fn error_sink(mut self, sink: Arc<dyn ErrorSink>) -> Self {
        self.error_sink = Some(sink);
        self
    }

    pub fn into_parts(self) -> Result<PipelineParts, RelayError> {
        self.config.validate()?;
        let terminal = self
            .terminal
            .ok_or_else(|| RelayError::Config("no terminal stage registered".into()))?;

        for (i, stage) in self.stages.iter().enumerate() {
            let clash = self.stages[..i].iter().any(|s| s.name() == stage.name())
                || stage.name() == terminal.name();
            if clash {
                return Err(RelayError::Config(format!(
                    "stage name `{}` registered twice",
                    stage.name()
                )));
            }
        }

        Ok(PipelineParts {
            config: self.config,
            services: Arc::new(self.services),
            stages: self.stages,
            terminal,
            error_sink: self
                .error_sink
                .unwrap_or_else(|| Arc::new(TracingErrorSink)),
        })
    }
}
