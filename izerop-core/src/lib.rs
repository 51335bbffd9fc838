//! Core library for izerop – bidirectional sync engine for the izerop
//! personal cloud.

mod config;
mod engine;
mod error;
mod fsops;
mod hash;
mod ignore;
mod remote;
mod state;
mod watcher;

pub use config::{RemoteCfg, SyncConfig};
pub use engine::{Engine, SyncStats};
pub use error::{SyncError, SyncResult};
pub use fsops::{conflict_path, CONFLICT_MARKER, TMP_SUFFIX};
pub use hash::{hash_bytes, hash_file};
pub use ignore::{IgnoreRules, IGNORE_FILE};
pub use remote::{
    Change, ChangeAction, ChangeKind, ChangePage, Manifest, RemoteDirectory, RemoteFile,
    RemoteStore, SyncStatus,
};
pub use state::{migrate_legacy_state, FileRecord, SyncState, LEGACY_STATE_FILE};
pub use watcher::{spawn_watcher, WatcherCommand, WatcherHandle, WatcherState};
