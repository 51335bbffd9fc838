//! In-memory [`RemoteStore`] used by the engine and watcher tests.
#![allow(dead_code)]

use async_trait::async_trait;
use izerop_core::{
    hash_bytes, Change, ChangeAction, ChangeKind, ChangePage, Manifest, RemoteDirectory,
    RemoteFile, RemoteStore, SyncError, SyncResult, SyncStatus,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
pub struct MockFile {
    pub id: String,
    pub path: String,
    pub bytes: Vec<u8>,
    pub has_text: bool,
    pub updated_at: String,
}

#[derive(Default)]
struct Inner {
    dirs: Vec<RemoteDirectory>,
    files: Vec<MockFile>,
    pages: HashMap<String, ChangePage>,
    calls: Vec<String>,
}

/// Shared-state mock server. Clones observe the same tree, so a clone can be
/// handed to the watcher while the test inspects the original.
#[derive(Clone)]
pub struct MockRemote {
    inner: Arc<Mutex<Inner>>,
    ticks: Arc<AtomicU64>,
    expose_hashes: bool,
}

impl MockRemote {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            ticks: Arc::new(AtomicU64::new(0)),
            expose_hashes: true,
        }
    }

    /// A server that never reports `content_hash`, for heuristic paths.
    pub fn without_hashes() -> Self {
        Self {
            expose_hashes: false,
            ..Self::new()
        }
    }

    fn tick(&self) -> String {
        format!("t{}", self.ticks.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub fn seed_dir(&self, path: &str) -> String {
        let id = format!("d{}", self.ticks.fetch_add(1, Ordering::SeqCst) + 1);
        let mut inner = self.inner.lock().unwrap();
        let parent_id = inner
            .dirs
            .iter()
            .find(|d| d.path == parent_of(path))
            .map(|d| d.id.clone());
        inner.dirs.push(RemoteDirectory {
            id: id.clone(),
            name: basename(path).to_string(),
            path: path.to_string(),
            parent_id,
            file_count: 0,
        });
        id
    }

    pub fn seed_file(&self, path: &str, bytes: &[u8], has_text: bool) -> String {
        let id = format!("f{}", self.ticks.fetch_add(1, Ordering::SeqCst) + 1);
        let updated_at = self.tick();
        self.inner.lock().unwrap().files.push(MockFile {
            id: id.clone(),
            path: path.to_string(),
            bytes: bytes.to_vec(),
            has_text,
            updated_at,
        });
        id
    }

    /// Server-side edit: new bytes, new `updated_at`.
    pub fn mutate_file(&self, path: &str, bytes: &[u8]) {
        let updated_at = self.tick();
        let mut inner = self.inner.lock().unwrap();
        let file = inner
            .files
            .iter_mut()
            .find(|f| f.path == path)
            .expect("mutate_file: unknown path");
        file.bytes = bytes.to_vec();
        file.updated_at = updated_at;
    }

    pub fn remove_file(&self, path: &str) {
        self.inner.lock().unwrap().files.retain(|f| f.path != path);
    }

    pub fn set_page(&self, cursor: &str, page: ChangePage) {
        self.inner
            .lock()
            .unwrap()
            .pages
            .insert(cursor.to_string(), page);
    }

    /// Builds a change record for a file currently in the store, carrying
    /// its real id, hash, and timestamp.
    pub fn change_for(&self, path: &str, action: ChangeAction) -> Change {
        let file = self.file_at(path).expect("change_for: unknown path");
        Change {
            kind: ChangeKind::File,
            action,
            id: file.id.clone(),
            path: file.path.clone(),
            size: file.bytes.len() as u64,
            content_hash: self.expose_hashes.then(|| hash_bytes(&file.bytes)),
            updated_at: file.updated_at.clone(),
        }
    }

    pub fn file_at(&self, path: &str) -> Option<MockFile> {
        self.inner
            .lock()
            .unwrap()
            .files
            .iter()
            .find(|f| f.path == path)
            .cloned()
    }

    pub fn file_updated_at(&self, path: &str) -> Option<String> {
        self.file_at(path).map(|f| f.updated_at)
    }

    pub fn dir_at(&self, path: &str) -> bool {
        self.inner.lock().unwrap().dirs.iter().any(|d| d.path == path)
    }

    pub fn calls(&self) -> Vec<String> {
        self.inner.lock().unwrap().calls.clone()
    }

    fn log(&self, call: String) {
        self.inner.lock().unwrap().calls.push(call);
    }

    fn to_remote_file(&self, file: &MockFile) -> RemoteFile {
        RemoteFile {
            id: file.id.clone(),
            name: basename(&file.path).to_string(),
            path: file.path.clone(),
            size: file.bytes.len() as u64,
            content_hash: self.expose_hashes.then(|| hash_bytes(&file.bytes)),
            has_text: file.has_text,
            updated_at: file.updated_at.clone(),
        }
    }
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn parent_of(path: &str) -> String {
    match path.rsplit_once('/') {
        Some(("", _)) | None => "/".to_string(),
        Some((parent, _)) => parent.to_string(),
    }
}

fn not_found(what: &str) -> SyncError {
    SyncError::Api {
        status: 404,
        message: format!("{what} not found"),
    }
}

#[async_trait]
impl RemoteStore for MockRemote {
    async fn list_directories(&self) -> SyncResult<Vec<RemoteDirectory>> {
        Ok(self.inner.lock().unwrap().dirs.clone())
    }

    async fn list_files(&self, directory_id: Option<&str>) -> SyncResult<Vec<RemoteFile>> {
        let inner = self.inner.lock().unwrap();
        let files = match directory_id {
            Some(dir_id) => {
                let dir_path = inner
                    .dirs
                    .iter()
                    .find(|d| d.id == dir_id)
                    .map(|d| d.path.clone())
                    .ok_or_else(|| not_found("directory"))?;
                inner
                    .files
                    .iter()
                    .filter(|f| parent_of(&f.path) == dir_path)
                    .map(|f| self.to_remote_file(f))
                    .collect()
            }
            None => inner.files.iter().map(|f| self.to_remote_file(f)).collect(),
        };
        Ok(files)
    }

    async fn get_changes(&self, cursor: Option<&str>) -> SyncResult<ChangePage> {
        let key = cursor.unwrap_or("");
        let page = self.inner.lock().unwrap().pages.get(key).cloned();
        Ok(page.unwrap_or(ChangePage {
            changes: Vec::new(),
            next_cursor: key.to_string(),
            has_more: false,
        }))
    }

    async fn get_manifest(&self, _root: &str) -> SyncResult<Manifest> {
        let inner = self.inner.lock().unwrap();
        Ok(Manifest {
            directories: inner.dirs.clone(),
            files: inner.files.iter().map(|f| self.to_remote_file(f)).collect(),
        })
    }

    async fn sync_status(&self) -> SyncResult<SyncStatus> {
        let inner = self.inner.lock().unwrap();
        Ok(SyncStatus {
            file_count: inner.files.len() as u64,
            directory_count: inner.dirs.len() as u64,
            total_size: inner.files.iter().map(|f| f.bytes.len() as u64).sum(),
            storage_limit: 1 << 30,
            cursor: String::new(),
            last_sync: String::new(),
        })
    }

    async fn create_directory(
        &self,
        name: &str,
        parent_id: Option<&str>,
    ) -> SyncResult<RemoteDirectory> {
        let id = format!("d{}", self.ticks.fetch_add(1, Ordering::SeqCst) + 1);
        let mut inner = self.inner.lock().unwrap();
        let parent_path = match parent_id {
            Some(pid) => inner
                .dirs
                .iter()
                .find(|d| d.id == pid)
                .map(|d| d.path.clone())
                .ok_or_else(|| not_found("parent directory"))?,
            None => String::new(),
        };
        let path = format!("{parent_path}/{name}");
        let dir = RemoteDirectory {
            id: id.clone(),
            name: name.to_string(),
            path: path.clone(),
            parent_id: parent_id.map(str::to_string),
            file_count: 0,
        };
        inner.dirs.push(dir.clone());
        inner.calls.push(format!("mkdir:{path}"));
        Ok(dir)
    }

    async fn upload_binary(
        &self,
        local: &Path,
        directory_id: &str,
        name: &str,
    ) -> SyncResult<RemoteFile> {
        let bytes = std::fs::read(local)?;
        let updated_at = self.tick();
        let new_id = format!("f{}", self.ticks.fetch_add(1, Ordering::SeqCst) + 1);
        let mut inner = self.inner.lock().unwrap();
        let dir_path = inner
            .dirs
            .iter()
            .find(|d| d.id == directory_id)
            .map(|d| d.path.clone())
            .ok_or_else(|| not_found("directory"))?;
        let path = format!("{dir_path}/{name}");
        inner.calls.push(format!("upload:{path}"));
        // re-upload to an existing path replaces the blob
        if let Some(existing) = inner.files.iter_mut().find(|f| f.path == path) {
            existing.bytes = bytes;
            existing.updated_at = updated_at;
            let snapshot = existing.clone();
            return Ok(self.to_remote_file(&snapshot));
        }
        let file = MockFile {
            id: new_id,
            path,
            bytes,
            has_text: false,
            updated_at,
        };
        inner.files.push(file.clone());
        Ok(self.to_remote_file(&file))
    }

    async fn create_text(
        &self,
        name: &str,
        contents: &str,
        directory_id: &str,
    ) -> SyncResult<RemoteFile> {
        let updated_at = self.tick();
        let id = format!("f{}", self.ticks.fetch_add(1, Ordering::SeqCst) + 1);
        let mut inner = self.inner.lock().unwrap();
        let dir_path = inner
            .dirs
            .iter()
            .find(|d| d.id == directory_id)
            .map(|d| d.path.clone())
            .ok_or_else(|| not_found("directory"))?;
        let path = format!("{dir_path}/{name}");
        inner.calls.push(format!("create_text:{path}"));
        // creating over an existing path replaces the contents
        if let Some(existing) = inner.files.iter_mut().find(|f| f.path == path) {
            existing.bytes = contents.as_bytes().to_vec();
            existing.has_text = true;
            existing.updated_at = updated_at;
            let snapshot = existing.clone();
            return Ok(self.to_remote_file(&snapshot));
        }
        let file = MockFile {
            id,
            path,
            bytes: contents.as_bytes().to_vec(),
            has_text: true,
            updated_at,
        };
        inner.files.push(file.clone());
        Ok(self.to_remote_file(&file))
    }

    async fn update_contents(&self, file_id: &str, contents: &str) -> SyncResult<RemoteFile> {
        let updated_at = self.tick();
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(format!("update:{file_id}"));
        let file = inner
            .files
            .iter_mut()
            .find(|f| f.id == file_id)
            .ok_or_else(|| not_found("file"))?;
        file.bytes = contents.as_bytes().to_vec();
        file.updated_at = updated_at;
        let snapshot = file.clone();
        Ok(self.to_remote_file(&snapshot))
    }

    async fn move_file(
        &self,
        file_id: &str,
        new_name: Option<&str>,
        new_directory_id: Option<&str>,
    ) -> SyncResult<RemoteFile> {
        let mut inner = self.inner.lock().unwrap();
        let new_dir_path = match new_directory_id {
            Some(dir_id) => Some(
                inner
                    .dirs
                    .iter()
                    .find(|d| d.id == dir_id)
                    .map(|d| d.path.clone())
                    .ok_or_else(|| not_found("directory"))?,
            ),
            None => None,
        };
        let file = inner
            .files
            .iter_mut()
            .find(|f| f.id == file_id)
            .ok_or_else(|| not_found("file"))?;
        let dir_path = new_dir_path.unwrap_or_else(|| parent_of(&file.path));
        let name = new_name
            .map(str::to_string)
            .unwrap_or_else(|| basename(&file.path).to_string());
        file.path = format!("{dir_path}/{name}");
        let snapshot = file.clone();
        inner.calls.push(format!("move:{file_id}"));
        Ok(self.to_remote_file(&snapshot))
    }

    async fn delete_file(&self, file_id: &str) -> SyncResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.files.len();
        inner.files.retain(|f| f.id != file_id);
        if inner.files.len() == before {
            return Err(not_found("file"));
        }
        inner.calls.push(format!("delete:{file_id}"));
        Ok(())
    }

    async fn delete_directory(&self, directory_id: &str) -> SyncResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.dirs.len();
        inner.dirs.retain(|d| d.id != directory_id);
        if inner.dirs.len() == before {
            return Err(not_found("directory"));
        }
        inner.calls.push(format!("delete_dir:{directory_id}"));
        Ok(())
    }

    async fn download(&self, file_id: &str, dest: &Path) -> SyncResult<String> {
        let bytes = {
            let inner = self.inner.lock().unwrap();
            inner
                .files
                .iter()
                .find(|f| f.id == file_id)
                .map(|f| f.bytes.clone())
                .ok_or_else(|| not_found("file"))?
        };
        self.log(format!("download:{file_id}"));
        std::fs::write(dest, bytes)?;
        Ok(String::new())
    }
}

/// A file change record the way the server's feed reports it.
pub fn file_change(action: ChangeAction, id: &str, path: &str, bytes: &[u8]) -> Change {
    Change {
        kind: ChangeKind::File,
        action,
        id: id.to_string(),
        path: path.to_string(),
        size: bytes.len() as u64,
        content_hash: Some(hash_bytes(bytes)),
        updated_at: String::new(),
    }
}

pub fn dir_change(action: ChangeAction, id: &str, path: &str) -> Change {
    Change {
        kind: ChangeKind::Directory,
        action,
        id: id.to_string(),
        path: path.to_string(),
        size: 0,
        content_hash: None,
        updated_at: String::new(),
    }
}

pub fn page(changes: Vec<Change>, next_cursor: &str, has_more: bool) -> ChangePage {
    ChangePage {
        changes,
        next_cursor: next_cursor.to_string(),
        has_more,
    }
}

/// Rewinds a file's mtime so it no longer looks actively edited and no
/// longer matches a recorded `local_mod`.
pub fn backdate(path: &Path, secs: u64) {
    let file = std::fs::File::options().write(true).open(path).unwrap();
    let then = std::time::SystemTime::now() - std::time::Duration::from_secs(secs);
    file.set_modified(then).unwrap();
}
