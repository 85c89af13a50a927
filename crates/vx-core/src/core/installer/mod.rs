//! Installer driver: owns the subprocess relationship with the ecosystem's
//! native installer, selected from a configurable priority list.

pub(crate) mod driver;
pub(crate) mod report;
pub(crate) mod reorder;

pub use driver::{InstallerDriver, InstallerTool, Preflight, StagedDelta, StagedResult};
pub use reorder::version_reorder;
pub use report::InstallReport;

#[derive(Debug, thiserror::Error)]
pub enum InstallerError {
    #[error("[VX303] no installer tool found; tried {tried:?}")]
    NoInstaller { tried: Vec<String> },
    #[error("[VX300] installer failed during {phase}: {stderr_tail}")]
    InstallFailed { phase: String, stderr_tail: String },
    #[error("[VX301] installer produced unreadable output: {0}")]
    Protocol(String),
    #[error("[VX302] installer timed out after {seconds}s during {phase}")]
    Timeout { phase: String, seconds: u64 },
    #[error("[VX200] {0}")]
    Io(#[from] anyhow::Error),
}

impl InstallerError {
    pub fn code(&self) -> &'static str {
        use crate::core::tooling::diagnostics::codes;
        match self {
            Self::NoInstaller { .. } => codes::NO_INSTALLER,
            Self::InstallFailed { .. } => codes::INSTALL_FAILED,
            Self::Protocol(_) => codes::INSTALLER_PROTOCOL,
            Self::Timeout { .. } => codes::INSTALL_TIMEOUT,
            Self::Io(_) => codes::ENV_FAILURE,
        }
    }
}
