use anyhow::{Context, Result};
use log::debug;
use std::path::{Component, Path, PathBuf};

/// Expand `~` and environment variables in a path string
pub fn expand_path_str(path: &str) -> String {
    shellexpand::full(path)
        .unwrap_or_else(|_| path.into())
        .into_owned()
}

/// Expand a PathBuf with environment variables
pub fn expand_path_buf(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();
    PathBuf::from(expand_path_str(&path_str))
}

/// Join `path` onto `base` unless it is already absolute, then normalize
/// `.` and `..` components lexically. Never touches the filesystem.
pub fn absolutize(path: &Path, base: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    };
    normalize(&joined)
}

fn normalize(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            // `..` at the root stays at the root; leading `..` of a relative path is kept
            Component::ParentDir => match normalized.components().next_back() {
                Some(Component::Normal(_)) => {
                    normalized.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => normalized.push(".."),
            },
            other => normalized.push(other.as_os_str()),
        }
    }
    if normalized.as_os_str().is_empty() {
        normalized.push(".");
    }
    normalized
}

/// Create a directory and all parent directories if they don't exist
pub fn ensure_directory(path: &Path) -> Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)
            .with_context(|| format!("Failed to create directory: {path:?}"))?;
        debug!("Created directory: {path:?}");
    }
    Ok(())
}

/// Make a clean output directory, ensuring it exists and is empty
pub fn prepare_output_directory(dir: &Path) -> Result<()> {
    ensure_directory(dir)?;

    let mut entries = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read output directory {}", dir.display()))?;
    if entries.next().is_some() {
        anyhow::bail!(
            "Output directory '{}' is not empty. Please clear it or pick another run id",
            dir.display()
        );
    }

    Ok(())
}

/// Convenience function to copy a file with better error handling
pub fn copy_file(source: &Path, dest: &Path) -> Result<()> {
    std::fs::copy(source, dest)
        .with_context(|| format!("Failed to copy {source:?} to {dest:?}"))?;
    debug!("Copied {source:?} to {dest:?}");
    Ok(())
}
