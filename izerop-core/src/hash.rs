//! Content hashing: SHA-256 over the full byte stream, lowercase hex.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io;
use std::path::Path;

/// Hashes a file's contents. `None` when the file cannot be read; callers
/// fall back to size and timestamp heuristics in that case.
pub fn hash_file(path: &Path) -> Option<String> {
    let mut file = File::open(path).ok()?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher).ok()?;
    Some(format!("{:x}", hasher.finalize()))
}

pub fn hash_bytes(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_hash_matches_byte_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"abcd").unwrap();

        let from_file = hash_file(&path).unwrap();
        assert_eq!(from_file, hash_bytes(b"abcd"));
        assert_eq!(from_file.len(), 64);
        assert_eq!(from_file, from_file.to_lowercase());
    }

    #[test]
    fn unreadable_file_yields_none() {
        assert!(hash_file(Path::new("/nonexistent/iz-hash-test")).is_none());
    }
}
