//! Typed error hierarchy for the vigil orchestrator.
//!
//! Four top-level enums cover the subsystems:
//! - `IntakeError` — ticket validation failures (exit code 1 territory)
//! - `SupervisorError` — supervised process failures (force ABORT)
//! - `StoreError` — persisted state failures
//! - `SessionError` — attention-window session failures (exit code 2 territory)

use thiserror::Error;

/// Errors from ticket intake. These never enter the phase machine.
#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("Ticket is missing required field '{field}'")]
    MissingField { field: &'static str },

    #[error("Ticket {id} is ambiguous: {message}")]
    Ambiguous { id: String, message: String },

    #[error("Failed to read ticket file at {path}: {source}")]
    ReadFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse ticket JSON: {0}")]
    ParseFailed(#[source] serde_json::Error),
}

/// Errors from the process supervisor. A spawn failure or an unhandled
/// crash aborts the owning project's queue.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Failed to spawn process '{command}': {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("No supervised process named '{0}'")]
    UnknownProcess(String),

    #[error("Failed to open log file at {path}: {source}")]
    LogOpenFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Process '{name}' crashed with exit code {exit_code:?}")]
    Crashed {
        name: String,
        exit_code: Option<i32>,
    },
}

/// Errors from the durable state store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Work item {0} not found")]
    WorkItemNotFound(String),

    #[error("Failed to write {path}: {source}")]
    WriteFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read {path}: {source}")]
    ReadFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt state document at {path}: {source}")]
    Corrupt {
        path: std::path::PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("State directory is locked by another vigil process")]
    Locked,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from session-scoped operator commands.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("No active attention window")]
    NoActiveSession,

    #[error("An attention window is already active (started {started_at})")]
    AlreadyActive { started_at: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intake_error_ambiguous_carries_id() {
        let err = IntakeError::Ambiguous {
            id: "TCK-7".into(),
            message: "no acceptance criteria".into(),
        };
        match &err {
            IntakeError::Ambiguous { id, .. } => assert_eq!(id, "TCK-7"),
            _ => panic!("Expected Ambiguous variant"),
        }
        assert!(err.to_string().contains("TCK-7"));
    }

    #[test]
    fn supervisor_error_spawn_failed_is_matchable() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "binary not found");
        let err = SupervisorError::SpawnFailed {
            command: "npm test".into(),
            source: io_err,
        };
        match &err {
            SupervisorError::SpawnFailed { source, .. } => {
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
            }
            _ => panic!("Expected SpawnFailed"),
        }
    }

    #[test]
    fn store_error_not_found_carries_id() {
        let err = StoreError::WorkItemNotFound("wi-42".into());
        assert!(err.to_string().contains("wi-42"));
    }

    #[test]
    fn session_error_converts_from_store_error() {
        let inner = StoreError::Locked;
        let err: SessionError = inner.into();
        assert!(matches!(err, SessionError::Store(StoreError::Locked)));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&IntakeError::MissingField { field: "title" });
        assert_std_error(&StoreError::Locked);
        assert_std_error(&SessionError::NoActiveSession);
    }
}
