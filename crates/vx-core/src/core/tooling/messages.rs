//! Minimal localized-message catalog. Full translation catalogs are an
//! external collaborator; the core guarantees a stable code → message
//! mapping with an English fallback so front-ends can render failures
//! without string-matching.

use super::diagnostics::codes;

#[derive(Debug, Clone, Copy)]
pub struct Catalog {
    language: &'static str,
    entries: &'static [(&'static str, &'static str)],
}

const EN: &[(&str, &str)] = &[
    (codes::BAD_SPEC, "the package spec could not be parsed"),
    (codes::UNKNOWN_PACKAGE, "no such package is installed"),
    (codes::BUBBLE_NOT_FOUND, "no bubble exists for this version"),
    (codes::ENV_FAILURE, "an environment operation failed"),
    (codes::LOCKED, "another process holds the installation lock"),
    (codes::BACKEND_UNAVAILABLE, "the knowledge base backend is unreachable"),
    (codes::SCHEMA_MISMATCH, "the knowledge base schema needs a rebuild"),
    (codes::INSTALL_FAILED, "the installer reported a failure"),
    (codes::INSTALLER_PROTOCOL, "the installer produced unreadable output"),
    (codes::INSTALL_TIMEOUT, "the installer timed out"),
    (codes::NO_INSTALLER, "no installer tool from the priority list was found"),
    (codes::VERIFICATION_FAILED, "the bubble failed import verification"),
    (codes::BUBBLE_CORRUPTED, "the bubble no longer matches its manifest"),
    (codes::LOADER_STATE, "the runtime loader refused the request"),
    (codes::WORKER_FAILURE, "a worker process failed"),
    (codes::WORKER_TIMEOUT, "a worker request timed out"),
    (codes::KB_CONFLICT, "a concurrent writer changed the knowledge base"),
    (codes::KB_WRITE_FAILURE, "a knowledge base write failed"),
    (codes::CANCELLED, "the operation was cancelled"),
];

impl Catalog {
    /// Select the catalog for a configured `language_code`. Only English
    /// ships with the core; front-ends layer real translation catalogs on
    /// top of the stable codes.
    pub fn for_language(language_code: &str) -> Self {
        let _ = language_code;
        Self {
            language: "en",
            entries: EN,
        }
    }

    pub fn language(&self) -> &'static str {
        self.language
    }

    pub fn message(&self, code: &str) -> &'static str {
        self.entries
            .iter()
            .find(|(key, _)| *key == code)
            .map_or("an unexpected error occurred", |(_, msg)| *msg)
    }
}
