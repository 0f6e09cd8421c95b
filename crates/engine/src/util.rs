//! Small shared helpers — entity IDs, clocks, path canonicalization.

use std::path::{Path, PathBuf};

use rand::RngCore;

/// Generate a fresh 64-character hex entity ID.
pub fn new_id() -> String {
    let mut buf = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

/// Generate a name for an anonymous volume. Distinguishable from user names
/// only by convention: it is a full-length hex string, like an ID.
pub fn anonymous_volume_name() -> String {
    new_id()
}

/// Seconds since the Unix epoch, as stored in exit-code timestamps.
pub fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Resolve symlinks when the path exists; otherwise return it unchanged.
/// Stored config paths are compared in this canonical form so that a
/// symlinked graph root does not read as a relocation.
pub fn canonical_path(path: &Path) -> PathBuf {
    match std::fs::canonicalize(path) {
        Ok(resolved) => resolved,
        Err(_) => path.to_path_buf(),
    }
}

/// True if `id` is plausibly a full hex entity ID.
pub fn is_full_id(id: &str) -> bool {
    id.len() == 64 && id.bytes().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_id_shape() {
        let id = new_id();
        assert_eq!(id.len(), 64);
        assert!(is_full_id(&id));
        assert_ne!(id, new_id());
    }

    #[test]
    fn test_canonical_path_missing() {
        let p = Path::new("/definitely/not/a/real/path");
        assert_eq!(canonical_path(p), p.to_path_buf());
    }
}
