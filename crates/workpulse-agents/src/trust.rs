use crate::AgentError;
use std::path::{Path, PathBuf};

/// Resolves an agent script against the trusted directories.
///
/// Relative paths are looked up in each trusted directory in order. The
/// canonical result must live under a canonical trusted root, so symlinks and
/// `..` segments cannot escape.
pub fn resolve_trusted_script(
    script: &Path,
    trusted_dirs: &[PathBuf],
) -> Result<PathBuf, AgentError> {
    let roots: Vec<PathBuf> = trusted_dirs
        .iter()
        .filter_map(|dir| dir.canonicalize().ok())
        .collect();
    if roots.is_empty() {
        return Err(AgentError::UntrustedPath(script.to_path_buf()));
    }

    let candidates: Vec<PathBuf> = if script.is_absolute() {
        vec![script.to_path_buf()]
    } else {
        roots.iter().map(|root| root.join(script)).collect()
    };

    let mut found_outside = false;
    for candidate in candidates {
        let Ok(resolved) = candidate.canonicalize() else {
            continue;
        };
        if !resolved.is_file() {
            continue;
        }
        if roots.iter().any(|root| resolved.starts_with(root)) {
            return Ok(resolved);
        }
        found_outside = true;
    }

    if found_outside {
        Err(AgentError::UntrustedPath(script.to_path_buf()))
    } else {
        Err(AgentError::ScriptNotFound(script.to_path_buf()))
    }
}
