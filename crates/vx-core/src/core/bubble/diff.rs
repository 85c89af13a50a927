//! Staged-vs-main classification: every file that would enter a bubble is
//! `identical` (same hash at the same relative path in main), `added`
//! (absent from main), or `differs`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::core::fsutil;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileDisposition {
    Identical,
    Added,
    Differs,
}

#[derive(Clone, Debug)]
pub struct StagedFile {
    pub relative_path: String,
    pub staged_path: PathBuf,
    pub sha256: String,
    pub size: u64,
    pub disposition: FileDisposition,
}

/// Classify `relative_paths` (from the staged root) against the main
/// environment. Paths that do not exist in the staged root are skipped;
/// installers sometimes record files they never wrote.
pub fn diff_staged_files(
    staged_root: &Path,
    main_root: &Path,
    relative_paths: &[String],
) -> Result<Vec<StagedFile>> {
    let mut out = Vec::new();
    for rel in relative_paths {
        let staged_path = staged_root.join(rel);
        if !staged_path.is_file() {
            continue;
        }
        let metadata = staged_path
            .metadata()
            .with_context(|| format!("failed to stat {}", staged_path.display()))?;
        let sha256 = fsutil::sha256_file(&staged_path)?;
        let main_path = main_root.join(rel);
        let disposition = if !main_path.is_file() {
            FileDisposition::Added
        } else if fsutil::sha256_file(&main_path)? == sha256 {
            FileDisposition::Identical
        } else {
            FileDisposition::Differs
        };
        out.push(StagedFile {
            relative_path: rel.clone(),
            staged_path,
            sha256,
            size: metadata.len(),
            disposition,
        });
    }
    Ok(out)
}

/// Compiled native objects force a bubble to carry its own bytes.
pub fn is_native_file(relative_path: &str) -> bool {
    let lower = relative_path.to_lowercase();
    [".so", ".pyd", ".dylib", ".dll"]
        .iter()
        .any(|ext| lower.ends_with(ext))
        || lower.contains(".so.")
}
