use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::RelayError;

/// When the terminal stage is allowed to fire relative to the other stages.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CompletionDiscipline {
    /// The terminal waits until every stage working on the same correlation
    /// has finished, whichever generation it picked up.
    WaitForAll,
    /// The terminal fires as soon as its own predicate matches.
    #[default]
    FireAndForget,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    pub worker_threads: usize,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub completion: CompletionDiscipline,
    /// Per-correlation deadline in milliseconds.
    pub deadline_ms: u64,
    /// Upper bound on concurrently running stage actions. Terminal deliveries
    /// and fallback escapes draw from a separate pool of the same size.
    pub max_in_flight: usize,
    /// How long shutdown waits for running actions before aborting them.
    pub shutdown_grace_ms: u64,
    /// Tag given to tasks built by the transport when no route binding applies.
    pub initial_tag: String,
    /// Tag carried by synthesised fallback tasks.
    pub fallback_tag: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            worker_threads: num_cpus::get(),
            tls_cert: None,
            tls_key: None,
            completion: CompletionDiscipline::FireAndForget,
            deadline_ms: 30_000,
            max_in_flight: 1024,
            shutdown_grace_ms: 5_000,
            initial_tag: String::new(),
            fallback_tag: "fallback".to_string(),
        }
    }
}

impl RelayConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, RelayError> {
        let config: RelayConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, RelayError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), RelayError> {
        if self.worker_threads == 0 {
            return Err(RelayError::Config("worker_threads must be at least 1".into()));
        }
        if self.deadline_ms == 0 {
            return Err(RelayError::Config("deadline_ms must be positive".into()));
        }
        if self.max_in_flight == 0 || u32::try_from(self.max_in_flight).is_err() {
            return Err(RelayError::Config(
                "max_in_flight must be between 1 and u32::MAX".into(),
            ));
        }
        if self.tls_cert.is_some() != self.tls_key.is_some() {
            return Err(RelayError::Config(
                "tls_cert and tls_key must be given together".into(),
            ));
        }
        Ok(())
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_cert.is_some() && self.tls_key.is_some()
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
