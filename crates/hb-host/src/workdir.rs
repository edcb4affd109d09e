//! Working-directory resolution
//!
//! Every connection owns its working directory; all relative paths in
//! command, read, write, and open requests resolve against it.

use std::path::{Path, PathBuf};

use hb_core::error::ExecError;

/// Resolve a request path against the connection's working directory.
///
/// Absolute paths pass through untouched; a leading `~` expands to the
/// user's home directory.
pub fn resolve(base: &Path, path: &str) -> PathBuf {
    if let Some(expanded) = expand_home(path) {
        return expanded;
    }

    let candidate = Path::new(path);
    if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        base.join(candidate)
    }
}

/// Detect the builtin `cd` and extract its target.
///
/// Returns `None` for anything that should go to the shell. A bare `cd`
/// yields an empty target, which `change_dir` maps to the home directory.
pub fn parse_cd(command: &str) -> Option<&str> {
    let trimmed = command.trim();
    if trimmed == "cd" {
        return Some("");
    }
    trimmed.strip_prefix("cd ").map(str::trim)
}

/// Change the working directory, verifying the target exists and is a
/// directory. Returns the new canonical directory; the caller's state is
/// untouched on failure.
pub fn change_dir(base: &Path, target: &str) -> Result<PathBuf, ExecError> {
    let resolved = if target.is_empty() {
        dirs::home_dir().ok_or_else(|| ExecError::DirectoryNotFound("~".to_string()))?
    } else {
        resolve(base, target)
    };

    let display = resolved.display().to_string();
    let canonical = resolved
        .canonicalize()
        .map_err(|_| ExecError::DirectoryNotFound(display.clone()))?;

    if !canonical.is_dir() {
        return Err(ExecError::DirectoryNotFound(display));
    }

    Ok(canonical)
}

fn expand_home(path: &str) -> Option<PathBuf> {
    if path == "~" {
        return dirs::home_dir();
    }
    let rest = path.strip_prefix("~/")?;
    dirs::home_dir().map(|home| home.join(rest))
}
