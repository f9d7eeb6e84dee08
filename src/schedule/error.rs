//! Error types for the schedule module

use std::fmt;

/// Result type for schedule operations
pub type ScheduleResult<T> = Result<T, ScheduleError>;

/// Schedule-specific errors
#[derive(Debug)]
pub enum ScheduleError {
    /// Cadence definition cannot be run
    InvalidSchedule {
        name: String,
        reason: String,
    },

    /// Cycle was superseded before it finished
    CycleAborted {
        name: String,
    },

    /// Worker could not be launched or talked to
    WorkerFailed {
        reason: String,
    },

    /// Upstream snapshot could not be read
    SnapshotFailed {
        reason: String,
    },

    /// Serialization/deserialization error
    SerializationError {
        reason: String,
    },

    /// IO error
    IoError {
        operation: String,
        reason: String,
    },
}

impl fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidSchedule { name, reason } => {
                write!(f, "Invalid schedule '{}': {}", name, reason)
            }
            Self::CycleAborted { name } => {
                write!(f, "Cycle of schedule '{}' was aborted", name)
            }
            Self::WorkerFailed { reason } => {
                write!(f, "Worker failed: {}", reason)
            }
            Self::SnapshotFailed { reason } => {
                write!(f, "Failed to read upstream snapshot: {}", reason)
            }
            Self::SerializationError { reason } => {
                write!(f, "Serialization error: {}", reason)
            }
            Self::IoError { operation, reason } => {
                write!(f, "IO error during '{}': {}", operation, reason)
            }
        }
    }
}

impl std::error::Error for ScheduleError {}

impl From<serde_json::Error> for ScheduleError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError {
            reason: err.to_string(),
        }
    }
}

impl From<std::io::Error> for ScheduleError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError {
            operation: "unknown".to_string(),
            reason: err.to_string(),
        }
    }
}

impl ScheduleError {
    /// Create an invalid schedule error
    pub fn invalid_schedule(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidSchedule {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create a worker error
    pub fn worker(reason: impl Into<String>) -> Self {
        Self::WorkerFailed {
            reason: reason.into(),
        }
    }

    /// Create an IO error with context
    pub fn io_error(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::IoError {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Check if the error is recoverable
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::CycleAborted { .. }
                | Self::WorkerFailed { .. }
                | Self::SnapshotFailed { .. }
                | Self::IoError { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_schedule_error() {
        let err = ScheduleError::invalid_schedule("news", "no keywords or feeds");
        assert!(err.to_string().contains("news"));
        assert!(err.to_string().contains("no keywords"));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_is_recoverable() {
        assert!(ScheduleError::worker("spawn").is_recoverable());
        assert!(ScheduleError::CycleAborted { name: "default".into() }.is_recoverable());
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<i32>("not a number").unwrap_err();
        let err: ScheduleError = json_err.into();
        assert!(matches!(err, ScheduleError::SerializationError { .. }));
    }
}
