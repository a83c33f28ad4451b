use anyhow::{Context, Result};
use globset::{GlobBuilder, GlobMatcher};
use log::{debug, warn};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::pipeline::model::ArtifactSpec;

/// Compile an artifact pattern; `*` never crosses a `/`
pub fn compile_pattern(pattern: &str) -> std::result::Result<GlobMatcher, globset::Error> {
    Ok(GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()?
        .compile_matcher())
}

/// Outcome of matching declared artifacts against the output directory
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtifactScan {
    /// Files that matched at least one pattern
    pub found: BTreeSet<PathBuf>,
    /// Specs whose pattern matched nothing
    pub missing: Vec<ArtifactSpec>,
}

/// Match `specs` against the regular files below `output_dir`.
///
/// Only the output directory is read and symlinks are never followed, so a
/// match can not point outside of it. A missing directory matches nothing.
/// `reserved` paths, relative to `output_dir`, are never reported.
pub fn collect_artifacts(
    output_dir: &Path,
    specs: &[ArtifactSpec],
    reserved: &[PathBuf],
) -> Result<ArtifactScan> {
    let mut scan = ArtifactScan::default();
    if specs.is_empty() {
        return Ok(scan);
    }

    let files = if output_dir.is_dir() {
        let mut files = list_files(output_dir)?;
        files.retain(|file| !reserved.contains(file));
        files
    } else {
        debug!("Output directory {} does not exist", output_dir.display());
        Vec::new()
    };

    for spec in specs {
        let matcher = compile_pattern(&spec.path)
            .with_context(|| format!("Invalid artifact pattern '{}'", spec.path))?;
        let mut matched = false;
        for relative in &files {
            if matcher.is_match(relative) {
                scan.found.insert(output_dir.join(relative));
                matched = true;
            }
        }
        if !matched {
            scan.missing.push(spec.clone());
        }
    }

    Ok(scan)
}

/// Relative paths of all regular files below `root`, sorted
fn list_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if dir != root => {
                warn!("Skipping unreadable directory {}: {}", dir.display(), err);
                continue;
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("Failed to read directory {}", dir.display()))
            }
        };
        for entry in entries {
            let entry = entry?;
            // file_type() does not follow symlinks
            let file_type = entry.file_type()?;
            let path = entry.path();
            if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_file() {
                if let Ok(relative) = path.strip_prefix(root) {
                    files.push(relative.to_path_buf());
                }
            }
        }
    }

    files.sort();
    Ok(files)
}
