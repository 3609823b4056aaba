use std::time::Duration;

use crate::correlation::CorrelationId;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// A stage action returned an error or panicked. Isolated to that stage.
    #[error("stage `{stage}` failed for correlation {correlation}: {message}")]
    StageAction {
        stage: String,
        correlation: CorrelationId,
        message: String,
    },
    /// The correlation ran out of work without any stage, terminal included,
    /// matching its last generation.
    #[error("no stage matched correlation {correlation} (last tag `{tag}`)")]
    NoMatchingStage { correlation: CorrelationId, tag: String },
    #[error("terminal invoked again for correlation {correlation}; reply already sent")]
    DuplicateTerminalInvocation { correlation: CorrelationId },
    #[error("broadcast channel is closed")]
    ChannelClosed,
    #[error("correlation {correlation} missed its {deadline:?} deadline")]
    DeadlineExceeded {
        correlation: CorrelationId,
        deadline: Duration,
    },
    #[error("stage `{stage}` attached after the pipeline started")]
    AttachAfterStart { stage: String },
    #[error("service `{0}` is not registered")]
    MissingService(&'static str),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("connection {0} is not open")]
    UnknownConnection(u64),
    #[error(transparent)]
    Transport(#[from] std::io::Error),
    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}

impl RelayError {
    /// Short machine-readable name, used in fallback task documents.
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::StageAction { .. } => "stage_action",
            RelayError::NoMatchingStage { .. } => "no_matching_stage",
            RelayError::DuplicateTerminalInvocation { .. } => "duplicate_terminal",
            RelayError::ChannelClosed => "channel_closed",
            RelayError::DeadlineExceeded { .. } => "deadline_exceeded",
            RelayError::AttachAfterStart { .. } => "attach_after_start",
            RelayError::MissingService(_) => "missing_service",
            RelayError::Config(_) => "config",
            RelayError::Protocol(_) => "protocol",
            RelayError::UnknownConnection(_) => "unknown_connection",
            RelayError::Transport(_) => "transport",
            RelayError::Toml(_) => "toml",
        }
    }
}

/// Error returned by stage and terminal actions.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct StageError(pub String);

impl StageError {
    pub fn new(message: impl Into<String>) -> Self {
        StageError(message.into())
    }
}

impl From<&str> for StageError {
    fn from(message: &str) -> Self {
        StageError(message.to_string())
    }
}

impl From<String> for StageError {
    fn from(message: String) -> Self {
        StageError(message)
    }
}

impl From<serde_json::Error> for StageError {
    fn from(e: serde_json::Error) -> Self {
        StageError(e.to_string())
    }
}

impl From<RelayError> for StageError {
    fn from(e: RelayError) -> Self {
        StageError(e.to_string())
    }
}

/// Coordinator-level sink for every stage-local fault.
///
/// Faults never reach sibling stages or the transport; they end up here.
pub trait ErrorSink: Send + Sync {
    fn report(&self, error: &RelayError);
}

/// Default sink: one `tracing` event per fault.
#[derive(Debug, Default)]
pub struct TracingErrorSink;

impl ErrorSink for TracingErrorSink {
    fn report(&self, error: &RelayError) {
        match error {
            RelayError::DuplicateTerminalInvocation { .. } => {
                tracing::warn!(kind = error.kind(), "{}", error);
            }
            _ => tracing::error!(kind = error.kind(), "{}", error),
        }
    }
}
