//! Stable diagnostic codes surfaced alongside every user-visible error.

pub mod codes {
    pub const BAD_SPEC: &str = "VX100";
    pub const UNKNOWN_PACKAGE: &str = "VX101";
    pub const BUBBLE_NOT_FOUND: &str = "VX110";

    pub const ENV_FAILURE: &str = "VX200";
    pub const LOCKED: &str = "VX201";
    pub const BACKEND_UNAVAILABLE: &str = "VX210";
    pub const SCHEMA_MISMATCH: &str = "VX211";

    pub const INSTALL_FAILED: &str = "VX300";
    pub const INSTALLER_PROTOCOL: &str = "VX301";
    pub const INSTALL_TIMEOUT: &str = "VX302";
    pub const NO_INSTALLER: &str = "VX303";

    pub const VERIFICATION_FAILED: &str = "VX400";
    pub const BUBBLE_CORRUPTED: &str = "VX401";

    pub const LOADER_STATE: &str = "VX500";

    pub const WORKER_FAILURE: &str = "VX600";
    pub const WORKER_TIMEOUT: &str = "VX601";

    pub const KB_CONFLICT: &str = "VX800";
    pub const KB_WRITE_FAILURE: &str = "VX810";

    pub const CANCELLED: &str = "VX900";
}
