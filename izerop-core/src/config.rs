use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Remote endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RemoteCfg {
    /// izerop HTTP API endpoint
    Http { server_url: String, token: String },
}

/// Per-profile sync configuration consumed by the engine and the watcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Local directory kept in sync.
    pub sync_dir: PathBuf,
    /// Name of the remote root directory everything syncs under.
    #[serde(default = "SyncConfig::default_root_dir")]
    pub root_dir: String,
    /// Location of the durable state file. Owned by the surrounding config
    /// layer; never inside the sync dir.
    pub state_file: PathBuf,
    /// Seconds between server change polls.
    #[serde(default = "SyncConfig::default_poll_secs")]
    pub poll_secs: u64,
    /// Seconds of filesystem quiet before local changes are pushed.
    #[serde(default = "SyncConfig::default_settle_secs")]
    pub settle_secs: u64,
}

impl SyncConfig {
    fn default_root_dir() -> String {
        "root".into()
    }
    fn default_poll_secs() -> u64 {
        30
    }
    fn default_settle_secs() -> u64 {
        12
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_in() {
        let cfg: SyncConfig = serde_json::from_str(
            r#"{"sync_dir": "/tmp/sync", "state_file": "/tmp/state.json"}"#,
        )
        .unwrap();
        assert_eq!(cfg.root_dir, "root");
        assert_eq!(cfg.poll_secs, 30);
        assert_eq!(cfg.settle_secs, 12);
    }
}
