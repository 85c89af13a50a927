#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate
)]

pub mod distribution;
pub mod manifest;
pub mod name;
pub mod snapshot;
pub mod spec;

pub use distribution::{package_map, scan_distributions, top_level_modules, InstalledDist};
pub use manifest::{BubbleManifest, EntryKind, ManifestEntry, MANIFEST_FORMAT_VERSION};
pub use name::CanonicalName;
pub use snapshot::{EnvSnapshot, LAST_GOOD_SNAPSHOT_ID};
pub use spec::{split_requirement, PackageSpec, SpecError};
