//! Persistent sync state: cursor, per-file records, note mapping.
//!
//! The state file is the only thing bridging runs. It lives in the profile
//! config directory, never inside the sync dir, so it is never uploaded as a
//! user file.

use crate::error::{SyncError, SyncResult};
use crate::fsops;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

/// Old in-tree location of the state file, migrated away on first load.
pub const LEGACY_STATE_FILE: &str = ".izerop-sync.json";

/// Last-known state of a synced file, keyed by relative path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub remote_id: String,
    pub size: u64,
    /// SHA-256 of the local bytes at the last successful transfer. Empty
    /// means unknown.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hash: String,
    /// Server-supplied timestamp string, opaque to the engine.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub remote_time: String,
    /// Local mtime (unix seconds) observed at the last successful transfer.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub local_mod: i64,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

/// Durable sync state for one profile.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncState {
    /// Opaque server cursor; the next pull resumes from here.
    #[serde(default)]
    pub cursor: String,
    /// Local relative path to remote id, for note files only.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub notes: HashMap<String, String>,
    /// Local relative path to last-synced record.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub files: HashMap<String, FileRecord>,
}

impl SyncState {
    /// Loads state from `path`. A missing or malformed file yields a fresh
    /// empty state so one corrupt record never bricks the whole tool.
    pub fn load(path: &Path) -> Self {
        match fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|err| {
                warn!(path = %path.display(), %err, "state file malformed, starting fresh");
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    /// Atomically replaces the state file. Mode 0600 on unix.
    pub fn save(&self, path: &Path) -> SyncResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let data =
            serde_json::to_vec_pretty(self).map_err(|err| SyncError::State(err.to_string()))?;
        fsops::write_atomic(path, &data)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o600));
        }
        Ok(())
    }
}

/// Moves the legacy in-tree state file to its per-profile location. The
/// legacy copy is removed only once the new file exists.
pub fn migrate_legacy_state(sync_dir: &Path, state_path: &Path) {
    let legacy = sync_dir.join(LEGACY_STATE_FILE);
    if !legacy.exists() {
        return;
    }
    if state_path.exists() {
        let _ = fs::remove_file(&legacy);
        return;
    }
    let Ok(bytes) = fs::read(&legacy) else { return };
    if let Some(parent) = state_path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    if fs::write(state_path, &bytes).is_ok() {
        debug!(from = %legacy.display(), to = %state_path.display(), "migrated legacy state");
        let _ = fs::remove_file(&legacy);
    }
}
