//! The engine-wide error taxonomy. Every variant carries a stable
//! diagnostic code; front-ends map `status()` straight onto exit codes.

use crate::core::bubble::BubbleError;
use crate::core::daemon::DaemonError;
use crate::core::flock::LockError;
use crate::core::installer::InstallerError;
use crate::core::kb::KbError;
use crate::core::loader::LoaderError;
use crate::core::tooling::diagnostics::codes;
use crate::core::tooling::outcome::{CommandStatus, ExecutionOutcome};

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("[{code}] {message}")]
    User { code: &'static str, message: String },
    #[error(transparent)]
    Spec(#[from] vx_domain::SpecError),
    #[error(transparent)]
    Kb(#[from] KbError),
    #[error(transparent)]
    Installer(#[from] InstallerError),
    #[error(transparent)]
    Bubble(#[from] BubbleError),
    #[error(transparent)]
    Loader(#[from] LoaderError),
    #[error(transparent)]
    Daemon(#[from] DaemonError),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("[VX900] operation cancelled")]
    Cancelled,
    #[error("[VX200] {0}")]
    Other(#[from] anyhow::Error),
}

impl CoreError {
    pub fn user(message: impl Into<String>) -> Self {
        Self::User {
            code: codes::BAD_SPEC,
            message: message.into(),
        }
    }

    pub fn unknown_package(name: &str) -> Self {
        Self::User {
            code: codes::UNKNOWN_PACKAGE,
            message: format!("package '{name}' is not installed"),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::User { code, .. } => code,
            Self::Spec(_) => codes::BAD_SPEC,
            Self::Kb(err) => match err {
                KbError::Conflict(_) => codes::KB_CONFLICT,
                KbError::BackendUnavailable { .. } => codes::BACKEND_UNAVAILABLE,
                KbError::SchemaMismatch { .. } => codes::SCHEMA_MISMATCH,
                KbError::Backend(_) | KbError::Decode { .. } => codes::KB_WRITE_FAILURE,
            },
            Self::Installer(err) => err.code(),
            Self::Bubble(err) => match err {
                BubbleError::VerificationFailed { .. } => codes::VERIFICATION_FAILED,
                BubbleError::Corrupted { .. } => codes::BUBBLE_CORRUPTED,
                BubbleError::Cancelled => codes::CANCELLED,
                BubbleError::Installer(inner) => inner.code(),
                BubbleError::Kb(_) => codes::KB_WRITE_FAILURE,
                BubbleError::Io(_) => codes::ENV_FAILURE,
            },
            Self::Loader(err) => match err {
                LoaderError::BubbleNotFound { .. } => codes::BUBBLE_NOT_FOUND,
                LoaderError::Corrupted { .. } => codes::BUBBLE_CORRUPTED,
            },
            Self::Daemon(err) => match err {
                DaemonError::Timeout { .. } => codes::WORKER_TIMEOUT,
                DaemonError::Cancelled => codes::CANCELLED,
                _ => codes::WORKER_FAILURE,
            },
            Self::Lock(err) => match err {
                LockError::Locked { .. } => codes::LOCKED,
                LockError::Io(_) => codes::ENV_FAILURE,
            },
            Self::Cancelled => codes::CANCELLED,
            Self::Other(_) => codes::ENV_FAILURE,
        }
    }

    pub fn status(&self) -> CommandStatus {
        match self {
            Self::User { .. } | Self::Spec(_) | Self::Cancelled => CommandStatus::UserError,
            Self::Installer(InstallerError::InstallFailed { .. }) => CommandStatus::UserError,
            Self::Loader(LoaderError::BubbleNotFound { .. }) => CommandStatus::UserError,
            Self::Kb(KbError::Conflict(_)) => CommandStatus::Conflict,
            Self::Bubble(BubbleError::Cancelled) | Self::Daemon(DaemonError::Cancelled) => {
                CommandStatus::UserError
            }
            _ => CommandStatus::Failure,
        }
    }

    /// Render the error as an outcome: stable code, localized message,
    /// technical detail preserved for diagnostics.
    pub fn into_outcome(self, catalog: &crate::core::tooling::messages::Catalog) -> ExecutionOutcome {
        let code = self.code();
        let detail = self.to_string();
        ExecutionOutcome {
            status: self.status(),
            message: catalog.message(code).to_string(),
            details: serde_json::json!({
                "code": code,
                "detail": detail,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tooling::messages::Catalog;

    #[test]
    fn conflict_maps_to_exit_code_three() {
        let err = CoreError::Kb(KbError::Conflict("pkg:x".into()));
        assert_eq!(err.status().exit_code(), 3);
        assert_eq!(err.code(), codes::KB_CONFLICT);
    }

    #[test]
    fn bubble_not_found_is_a_user_error() {
        let err = CoreError::Loader(LoaderError::BubbleNotFound {
            spec: "x==1.0".into(),
        });
        assert_eq!(err.status().exit_code(), 1);
        assert_eq!(err.code(), codes::BUBBLE_NOT_FOUND);
    }

    #[test]
    fn outcome_preserves_detail_and_code() {
        let err = CoreError::unknown_package("ghost");
        let outcome = err.into_outcome(&Catalog::for_language("en"));
        assert_eq!(outcome.details["code"], codes::UNKNOWN_PACKAGE);
        assert!(outcome.details["detail"]
            .as_str()
            .unwrap()
            .contains("ghost"));
    }
}
