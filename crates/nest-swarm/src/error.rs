// ABOUTME: Error type for the swarm runner's public surface.
// ABOUTME: Wraps transport, registry, and settings failures plus lifecycle misuse.

use crate::runner::RunnerState;
use crate::registry::RegistryError;
use nest_config::SettingsError;
use nest_transport::{AgentId, TransportError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Invalid settings: {0}")]
    Settings(#[from] SettingsError),

    #[error("Runner is not running (state: {0})")]
    NotRunning(RunnerState),

    #[error("Unknown agent: {0} (auto-registration disabled)")]
    UnknownAgent(AgentId),

    #[error("Outbound queue full for agent {agent} (capacity {capacity})")]
    QueueFull { agent: AgentId, capacity: usize },

    #[error("Runner faulted: {0}")]
    Faulted(String),
}

impl From<RegistryError> for RunnerError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::QueueFull { agent, capacity } => {
                RunnerError::QueueFull { agent, capacity }
            }
            RegistryError::UnknownAgent(id) => RunnerError::UnknownAgent(id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_error_conversion() {
        let err: RunnerError = RegistryError::QueueFull {
            agent: AgentId::new("agent-1"),
            capacity: 8,
        }
        .into();
        assert!(matches!(err, RunnerError::QueueFull { capacity: 8, .. }));

        let err: RunnerError = RegistryError::UnknownAgent(AgentId::new("ghost")).into();
        assert!(matches!(err, RunnerError::UnknownAgent(_)));
    }

    #[test]
    fn test_error_display() {
        let err = RunnerError::NotRunning(RunnerState::Idle);
        assert!(format!("{}", err).contains("not running"));

        let err = RunnerError::Faulted("udp socket lost".to_string());
        let display = format!("{}", err);
        assert!(display.contains("faulted"));
        assert!(display.contains("udp socket lost"));
    }
}
