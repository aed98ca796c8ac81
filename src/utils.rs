//! Utility functions for the relay

use std::path::{Path, PathBuf};

use crate::Result;

/// Validate and canonicalize a path that must already exist
pub fn validate_and_canonicalize_path(path: &Path) -> Result<PathBuf> {
    let canonical_path = path.canonicalize().map_err(|_| {
        crate::Error::InvalidPath(format!("Invalid or non-existent path: {}", path.display()))
    })?;

    if !canonical_path.is_absolute() {
        return Err(crate::Error::InvalidPath("Path must be absolute".to_string()));
    }

    Ok(canonical_path)
}

/// Lossy text of one output chunk, for `output` events
pub fn chunk_to_text(chunk: &[u8]) -> String {
    String::from_utf8_lossy(chunk).into_owned()
}
