use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Result of one operation on the surface, consumed by front-ends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub status: CommandStatus,
    pub message: String,
    #[serde(default)]
    pub details: Value,
}

impl ExecutionOutcome {
    pub fn success(message: impl Into<String>, details: Value) -> Self {
        Self {
            status: CommandStatus::Ok,
            message: message.into(),
            details,
        }
    }

    pub fn user_error(message: impl Into<String>, details: Value) -> Self {
        Self {
            status: CommandStatus::UserError,
            message: message.into(),
            details,
        }
    }

    pub fn failure(message: impl Into<String>, details: Value) -> Self {
        Self {
            status: CommandStatus::Failure,
            message: message.into(),
            details,
        }
    }

    pub fn conflict(message: impl Into<String>, details: Value) -> Self {
        Self {
            status: CommandStatus::Conflict,
            message: message.into(),
            details,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.status.exit_code()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CommandStatus {
    /// Operation completed.
    Ok,
    /// Bad input, unknown package, missing bubble: reported, not retried.
    UserError,
    /// Environmental failure (subprocess, filesystem, backend).
    Failure,
    /// A conflict that needs manual intervention.
    Conflict,
}

impl CommandStatus {
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Ok => 0,
            Self::UserError => 1,
            Self::Failure => 2,
            Self::Conflict => 3,
        }
    }
}
