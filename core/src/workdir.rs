use std::path::Path;
use std::path::PathBuf;

use crate::error::RuntimeError;

/// Home directory of the managing process, falling back to `/`.
pub fn default_working_directory() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("/"))
}

/// Expands a leading `~` (alone or followed by `/`) to the home directory.
pub fn expand_home(raw: &str) -> PathBuf {
    if raw == "~" {
        return default_working_directory();
    }
    if let Some(rest) = raw.strip_prefix("~/") {
        return default_working_directory().join(rest);
    }
    PathBuf::from(raw)
}

/// Resolves a client-supplied working directory for a new session.
///
/// `None` (or an empty string) yields the home directory. Anything else must
/// name an existing directory.
pub fn resolve_session_directory(raw: Option<&str>) -> Result<PathBuf, RuntimeError> {
    let Some(raw) = raw.filter(|raw| !raw.trim().is_empty()) else {
        return Ok(default_working_directory());
    };
    let expanded = expand_home(raw);
    let resolved = expanded
        .canonicalize()
        .map_err(|_| RuntimeError::invalid_working_directory(raw))?;
    if !is_directory(&resolved) {
        return Err(RuntimeError::invalid_working_directory(raw));
    }
    Ok(resolved)
}

fn is_directory(path: &Path) -> bool {
    path.metadata().map(|meta| meta.is_dir()).unwrap_or(false)
}
