//! The remote store seam.
//!
//! The engine sees only this trait; URL shapes, auth headers, and encodings
//! are adapter concerns.

use crate::error::SyncResult;
use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;

/// A directory as the server reports it. Paths carry a leading `/`.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteDirectory {
    pub id: String,
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub file_count: u32,
}

/// A file as the server reports it. `content_hash` may be absent; `has_text`
/// distinguishes inline text storage from blob storage.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteFile {
    pub id: String,
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub content_hash: Option<String>,
    #[serde(default)]
    pub has_text: bool,
    #[serde(default)]
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    File,
    Directory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    Created,
    Modified,
    Deleted,
}

/// One record from the server's change feed.
#[derive(Debug, Clone, Deserialize)]
pub struct Change {
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    pub action: ChangeAction,
    pub id: String,
    pub path: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub content_hash: Option<String>,
    #[serde(default)]
    pub updated_at: String,
}

/// One page of the change feed. An empty `next_cursor` means the server did
/// not advance the position.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChangePage {
    #[serde(default)]
    pub changes: Vec<Change>,
    #[serde(default, rename = "cursor")]
    pub next_cursor: String,
    #[serde(default)]
    pub has_more: bool,
}

/// Full server snapshot under one root, used by reconcile.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub directories: Vec<RemoteDirectory>,
    #[serde(default)]
    pub files: Vec<RemoteFile>,
}

/// Account-level sync summary. Informational only.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SyncStatus {
    #[serde(default)]
    pub file_count: u64,
    #[serde(default)]
    pub directory_count: u64,
    #[serde(default)]
    pub total_size: u64,
    #[serde(default)]
    pub storage_limit: u64,
    #[serde(default)]
    pub cursor: String,
    #[serde(default)]
    pub last_sync: String,
}

/// Operations the sync engine needs from a remote store.
#[async_trait]
pub trait RemoteStore: Send + Sync + 'static {
    async fn list_directories(&self) -> SyncResult<Vec<RemoteDirectory>>;

    /// Lists files, optionally restricted to one directory.
    async fn list_files(&self, directory_id: Option<&str>) -> SyncResult<Vec<RemoteFile>>;

    /// Fetches changes after `cursor`; `None` starts from the beginning.
    async fn get_changes(&self, cursor: Option<&str>) -> SyncResult<ChangePage>;

    async fn get_manifest(&self, root: &str) -> SyncResult<Manifest>;

    async fn sync_status(&self) -> SyncResult<SyncStatus>;

    async fn create_directory(
        &self,
        name: &str,
        parent_id: Option<&str>,
    ) -> SyncResult<RemoteDirectory>;

    /// Multipart upload of a local file's bytes.
    async fn upload_binary(
        &self,
        local: &Path,
        directory_id: &str,
        name: &str,
    ) -> SyncResult<RemoteFile>;

    /// Creates a file whose contents the server stores inline.
    async fn create_text(
        &self,
        name: &str,
        contents: &str,
        directory_id: &str,
    ) -> SyncResult<RemoteFile>;

    /// Replaces the inline contents of a text file.
    async fn update_contents(&self, file_id: &str, contents: &str) -> SyncResult<RemoteFile>;

    async fn move_file(
        &self,
        file_id: &str,
        new_name: Option<&str>,
        new_directory_id: Option<&str>,
    ) -> SyncResult<RemoteFile>;

    async fn delete_file(&self, file_id: &str) -> SyncResult<()>;

    async fn delete_directory(&self, directory_id: &str) -> SyncResult<()>;

    /// Downloads a file's bytes into `dest`, returning the server-suggested
    /// filename when one is present. Implementations must drop credentials
    /// when a redirect leaves the origin host.
    async fn download(&self, file_id: &str, dest: &Path) -> SyncResult<String>;
}
