//! The sync engine: pull (remote to local), push (local to remote), and
//! full reconcile against the server manifest.
//!
//! One engine drives one cycle. It borrows the durable [`SyncState`], applies
//! transfers, and leaves persistence to the caller so state hits disk exactly
//! once per cycle.

use crate::error::{SyncError, SyncResult};
use crate::fsops;
use crate::hash;
use crate::ignore::IgnoreRules;
use crate::remote::{Change, ChangeAction, ChangeKind, RemoteDirectory, RemoteFile, RemoteStore};
use crate::state::{FileRecord, SyncState};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Files touched more recently than this are assumed to still be under
/// active edit and are left alone by pull.
const ACTIVE_EDIT_WINDOW_SECS: i64 = 30;

/// Upper size bound for the NUL-byte text sniff on fresh uploads.
const TEXT_SNIFF_LIMIT: u64 = 100 * 1024;

/// Extensions the server stores as inline text.
const TEXT_EXTENSIONS: &[&str] = &[
    "txt", "md", "json", "yml", "yaml", "xml", "html", "css", "js", "ts", "rb", "py", "go", "sh",
    "bash", "toml", "csv", "log", "env", "conf", "cfg", "ini", "sql", "svg",
];

/// Counters for one pull, push, or reconcile cycle.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    pub downloaded: u32,
    pub uploaded: u32,
    pub deleted: u32,
    pub skipped: u32,
    pub conflicts: u32,
    /// Per-file soft failures; the cycle keeps going past these.
    pub errors: Vec<String>,
}

impl SyncStats {
    /// True when the cycle moved any data.
    pub fn changed(&self) -> bool {
        self.downloaded + self.uploaded + self.deleted + self.conflicts > 0
    }
}

/// One sync cycle over one sync root.
pub struct Engine<'a, R: RemoteStore> {
    remote: &'a R,
    sync_dir: PathBuf,
    root_dir: String,
    state: &'a mut SyncState,
    ignore: IgnoreRules,
}

impl<'a, R: RemoteStore> Engine<'a, R> {
    /// Builds an engine for one cycle, loading the ignore file fresh.
    pub fn new(
        remote: &'a R,
        sync_dir: impl Into<PathBuf>,
        state: &'a mut SyncState,
    ) -> SyncResult<Self> {
        let sync_dir = sync_dir.into();
        if sync_dir.as_os_str().is_empty() {
            return Err(SyncError::NotConfigured);
        }
        if !sync_dir.is_dir() {
            return Err(SyncError::MissingSyncDir(sync_dir));
        }
        let ignore = IgnoreRules::load(&sync_dir);
        Ok(Self {
            remote,
            sync_dir,
            root_dir: "root".into(),
            state,
            ignore,
        })
    }

    /// Overrides the remote root directory name (default `root`).
    pub fn with_root_dir(mut self, root_dir: impl Into<String>) -> Self {
        self.root_dir = root_dir.into();
        self
    }

    fn local_path(&self, rel: &str) -> PathBuf {
        // stored paths use forward slashes; convert at the fs boundary
        self.sync_dir.join(rel.split('/').collect::<PathBuf>())
    }

    fn remote_to_local(&self, remote_path: &str) -> String {
        remote_to_local(&self.root_dir, remote_path)
    }

    fn local_to_remote(&self, rel: &str) -> String {
        local_to_remote(&self.root_dir, rel)
    }

    // ------------------------------------------------------------------
    // pull
    // ------------------------------------------------------------------

    /// Applies remote changes since `cursor` to the local tree, following
    /// pagination to the end. Returns the stats and the cursor to resume
    /// from next time.
    pub async fn pull(&mut self, cursor: &str) -> SyncResult<(SyncStats, String)> {
        let mut stats = SyncStats::default();
        let mut cursor = cursor.to_string();
        loop {
            let since = if cursor.is_empty() {
                None
            } else {
                Some(cursor.as_str())
            };
            let page = self.remote.get_changes(since).await?;
            for change in &page.changes {
                match change.kind {
                    ChangeKind::Directory => self.apply_directory_change(change, &mut stats),
                    ChangeKind::File => self.apply_file_change(change, &mut stats).await,
                }
            }
            // an empty next cursor means the server did not advance
            let advanced = !page.next_cursor.is_empty() && page.next_cursor != cursor;
            if advanced {
                cursor = page.next_cursor;
            }
            if !page.has_more || !advanced {
                break;
            }
        }
        Ok((stats, cursor))
    }

    fn apply_directory_change(&mut self, change: &Change, stats: &mut SyncStats) {
        let rel = self.remote_to_local(&change.path);
        if rel.is_empty() {
            return; // the root itself
        }
        if self.ignore.is_ignored(&rel, true) {
            return;
        }
        let local = self.local_path(&rel);
        match change.action {
            ChangeAction::Created | ChangeAction::Modified => {
                if let Err(err) = fs::create_dir_all(&local) {
                    stats.errors.push(format!("mkdir {rel}: {err}"));
                }
            }
            ChangeAction::Deleted => {
                // only remove once empty; children carry their own deletes
                // and a later cycle can clean the parent
                let empty = fs::read_dir(&local)
                    .map(|mut entries| entries.next().is_none())
                    .unwrap_or(false);
                if empty && fs::remove_dir(&local).is_ok() {
                    stats.deleted += 1;
                }
            }
        }
    }

    async fn apply_file_change(&mut self, change: &Change, stats: &mut SyncStats) {
        let mut rel = self.remote_to_local(&change.path);
        if rel.is_empty() {
            return;
        }
        // extension-less server files are notes; the local twin carries .txt
        let is_note = Path::new(&rel).extension().is_none();
        if is_note {
            rel.push_str(".txt");
        }
        if self.ignore.is_ignored(&rel, false) {
            stats.skipped += 1;
            return;
        }
        let local = self.local_path(&rel);

        match change.action {
            ChangeAction::Created | ChangeAction::Modified => {
                self.download_change(change, &rel, &local, is_note, stats)
                    .await;
            }
            ChangeAction::Deleted => {
                if local.exists() {
                    if let Err(err) = fs::remove_file(&local) {
                        stats.errors.push(format!("remove {rel}: {err}"));
                        return;
                    }
                    stats.deleted += 1;
                }
                self.state.files.remove(&rel);
                self.state.notes.remove(&rel);
            }
        }
    }

    async fn download_change(
        &mut self,
        change: &Change,
        rel: &str,
        local: &Path,
        is_note: bool,
        stats: &mut SyncStats,
    ) {
        if let Some(parent) = local.parent() {
            if let Err(err) = fs::create_dir_all(parent) {
                stats.errors.push(format!("mkdir {}: {err}", parent.display()));
                return;
            }
        }

        // leave files the user is still editing alone this cycle
        if let Ok(meta) = fs::metadata(local) {
            if now_secs() - mtime_secs(&meta) < ACTIVE_EDIT_WINDOW_SECS {
                debug!(path = rel, "recently modified locally, deferring");
                stats.skipped += 1;
                return;
            }
        }

        let local_hash = hash::hash_file(local);

        // identical bytes mean this change is an echo of our own upload;
        // adopt the metadata and skip the download
        if let (Some(remote_hash), Some(lh)) = (change.content_hash.as_deref(), local_hash.as_deref())
        {
            if remote_hash == lh {
                if let Some(rec) = record_from_disk(local, &change.id, &change.updated_at) {
                    self.state.files.insert(rel.to_string(), rec);
                }
                if is_note {
                    self.state.notes.insert(rel.to_string(), change.id.clone());
                }
                stats.skipped += 1;
                return;
            }
        }

        // divergent edit: local moved since the last sync and the incoming
        // content differs (the equal-hash case returned above), so keep the
        // user's copy as a sidecar before the server version lands
        if let (Ok(meta), Some(rec)) = (fs::metadata(local), self.state.files.get(rel)) {
            if mtime_secs(&meta) != rec.local_mod || meta.len() != rec.size {
                let sidecar = fsops::conflict_path(local);
                match fs::copy(local, &sidecar) {
                    Ok(_) => {
                        warn!(path = rel, sidecar = %sidecar.display(), "divergent edit, local copy preserved");
                        stats.conflicts += 1;
                    }
                    Err(err) => stats.errors.push(format!("conflict copy {rel}: {err}")),
                }
            }
        }

        // download into a same-directory temp file, then rename into place
        let tmp = fsops::tmp_path(local);
        if let Err(err) = self.remote.download(&change.id, &tmp).await {
            let _ = fs::remove_file(&tmp);
            stats.errors.push(format!("download {rel}: {err}"));
            return;
        }
        if let Err(err) = fsops::install(&tmp, local) {
            let _ = fs::remove_file(&tmp);
            stats.errors.push(format!("install {rel}: {err}"));
            return;
        }

        if is_note {
            self.state.notes.insert(rel.to_string(), change.id.clone());
        }
        if let Some(rec) = record_from_disk(local, &change.id, &change.updated_at) {
            self.state.files.insert(rel.to_string(), rec);
        }
        debug!(path = rel, note = is_note, "downloaded");
        stats.downloaded += 1;
    }

    // ------------------------------------------------------------------
    // push
    // ------------------------------------------------------------------

    /// Propagates local creates, edits, and deletions to the remote.
    pub async fn push(&mut self) -> SyncResult<SyncStats> {
        let mut stats = SyncStats::default();

        let (root, mut dirs_by_path) = self.init_root_dir().await?;

        // index remote files, only under the sync root
        let root_prefix = format!("/{}", self.root_dir);
        let child_prefix = format!("{root_prefix}/");
        let mut files_by_path: HashMap<String, RemoteFile> = HashMap::new();
        let scoped: Vec<(String, String)> = dirs_by_path
            .iter()
            .filter(|(path, _)| path.as_str() == root_prefix || path.starts_with(&child_prefix))
            .map(|(path, dir)| (path.clone(), dir.id.clone()))
            .collect();
        for (path, dir_id) in scoped {
            match self.remote.list_files(Some(&dir_id)).await {
                Ok(files) => {
                    for file in files {
                        files_by_path.insert(file.path.clone(), file);
                    }
                }
                Err(err) => stats.errors.push(format!("list files in {path}: {err}")),
            }
        }

        let mut walker = WalkDir::new(&self.sync_dir).min_depth(1).into_iter();
        while let Some(entry) = walker.next() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    stats.errors.push(format!("walk: {err}"));
                    continue;
                }
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_dir = entry.file_type().is_dir();

            if name.starts_with('.') {
                if is_dir {
                    walker.skip_current_dir();
                }
                continue;
            }
            if !is_dir && name.ends_with(fsops::TMP_SUFFIX) {
                continue;
            }
            if !is_dir && name.contains(fsops::CONFLICT_MARKER) {
                stats.skipped += 1;
                continue;
            }

            let rel = match entry.path().strip_prefix(&self.sync_dir) {
                Ok(rel) => rel.to_string_lossy().replace('\\', "/"),
                Err(_) => continue,
            };
            if self.ignore.is_ignored(&rel, is_dir) {
                if is_dir {
                    walker.skip_current_dir();
                } else {
                    stats.skipped += 1;
                }
                continue;
            }

            if is_dir {
                self.push_directory(&rel, &name, &root, &mut dirs_by_path, &mut stats)
                    .await;
            } else {
                self.push_file(entry.path(), &rel, &files_by_path, &dirs_by_path, &mut stats)
                    .await;
            }
        }

        self.propagate_deletions(&mut stats).await;
        Ok(stats)
    }

    /// Discovers or creates the sync root on the server and returns it with
    /// a path index of every remote directory.
    async fn init_root_dir(
        &self,
    ) -> SyncResult<(RemoteDirectory, HashMap<String, RemoteDirectory>)> {
        let dirs = self.remote.list_directories().await?;
        let mut by_path: HashMap<String, RemoteDirectory> =
            dirs.into_iter().map(|d| (d.path.clone(), d)).collect();
        let root_path = format!("/{}", self.root_dir);
        if let Some(root) = by_path.get(&root_path) {
            return Ok((root.clone(), by_path));
        }
        let root = self.remote.create_directory(&self.root_dir, None).await?;
        by_path.insert(root_path, root.clone());
        Ok((root, by_path))
    }

    async fn push_directory(
        &mut self,
        rel: &str,
        name: &str,
        root: &RemoteDirectory,
        dirs_by_path: &mut HashMap<String, RemoteDirectory>,
        stats: &mut SyncStats,
    ) {
        let remote_path = self.local_to_remote(rel);
        if dirs_by_path.contains_key(&remote_path) {
            return;
        }
        let parent_id = dirs_by_path
            .get(&parent_remote_path(&remote_path))
            .map(|dir| dir.id.clone())
            .unwrap_or_else(|| root.id.clone());
        debug!(path = %remote_path, "creating remote directory");
        match self.remote.create_directory(name, Some(&parent_id)).await {
            Ok(dir) => {
                dirs_by_path.insert(remote_path, dir);
            }
            Err(err) => stats.errors.push(format!("mkdir {remote_path}: {err}")),
        }
    }

    async fn push_file(
        &mut self,
        path: &Path,
        rel: &str,
        files_by_path: &HashMap<String, RemoteFile>,
        dirs_by_path: &HashMap<String, RemoteDirectory>,
        stats: &mut SyncStats,
    ) {
        let meta = match fs::metadata(path) {
            Ok(meta) => meta,
            Err(err) => {
                stats.errors.push(format!("stat {rel}: {err}"));
                return;
            }
        };
        let remote_path = self.local_to_remote(rel);

        // tracked notes go through the inline-contents API
        if let Some(note_id) = self.state.notes.get(rel).cloned() {
            self.push_note(
                path,
                rel,
                &remote_path,
                &note_id,
                &meta,
                files_by_path,
                dirs_by_path,
                stats,
            )
            .await;
            return;
        }

        let local_hash = hash::hash_file(path);

        if let Some(remote) = files_by_path.get(&remote_path) {
            // identical content on both sides: adopt the remote metadata
            if let (Some(remote_hash), Some(lh)) =
                (remote.content_hash.as_deref(), local_hash.as_deref())
            {
                if remote_hash == lh {
                    self.refresh_record(rel, &meta, lh, remote);
                    stats.skipped += 1;
                    return;
                }
            }

            let rec = self.state.files.get(rel).cloned();
            if let (Some(rec), Some(lh)) = (rec.as_ref(), local_hash.as_deref()) {
                if !rec.hash.is_empty() && rec.hash == lh {
                    if rec.remote_time != remote.updated_at {
                        // remote advanced while local sat still; adopt the
                        // new metadata and let the next pull install it
                        self.refresh_record(rel, &meta, lh, remote);
                    }
                    stats.skipped += 1;
                    return;
                }
            }

            // both sides moved: keep the remote version as a sidecar, then
            // push local as the winner
            if let Some(rec) = rec.as_ref() {
                if !rec.remote_time.is_empty() && rec.remote_time != remote.updated_at {
                    let sidecar = fsops::conflict_path(path);
                    match self.remote.download(&remote.id, &sidecar).await {
                        Ok(_) => {
                            warn!(path = rel, sidecar = %sidecar.display(), "divergent edit, remote copy preserved");
                        }
                        Err(err) => {
                            let _ = fs::remove_file(&sidecar);
                            stats.errors.push(format!("conflict download {rel}: {err}"));
                        }
                    }
                    stats.conflicts += 1;
                }
            }

            self.update_in_place(path, rel, &meta, remote, dirs_by_path, stats)
                .await;
            return;
        }

        self.upload_new(path, rel, &remote_path, &meta, dirs_by_path, stats)
            .await;
    }

    #[allow(clippy::too_many_arguments)]
    async fn push_note(
        &mut self,
        path: &Path,
        rel: &str,
        remote_path: &str,
        note_id: &str,
        meta: &fs::Metadata,
        files_by_path: &HashMap<String, RemoteFile>,
        dirs_by_path: &HashMap<String, RemoteDirectory>,
        stats: &mut SyncStats,
    ) {
        // the note's server path carries no .txt
        let note_remote_path = remote_path.strip_suffix(".txt").unwrap_or(remote_path);

        if let Some(remote) = files_by_path.get(note_remote_path) {
            if !remote.has_text {
                // the server-side representation flipped to a blob;
                // recreate inline and repoint the mapping
                self.recreate_note(path, rel, note_remote_path, remote, dirs_by_path, stats)
                    .await;
                return;
            }
            if remote.size == meta.len() {
                stats.skipped += 1;
                return;
            }
        }

        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) => {
                stats.errors.push(format!("read {rel}: {err}"));
                return;
            }
        };
        match self.remote.update_contents(note_id, &contents).await {
            Ok(updated) => {
                debug!(path = rel, "updated note");
                self.record_upload(rel, path, meta, &updated);
                stats.uploaded += 1;
            }
            Err(err) => stats.errors.push(format!("update note {rel}: {err}")),
        }
    }

    async fn recreate_note(
        &mut self,
        path: &Path,
        rel: &str,
        note_remote_path: &str,
        remote: &RemoteFile,
        dirs_by_path: &HashMap<String, RemoteDirectory>,
        stats: &mut SyncStats,
    ) {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) => {
                stats.errors.push(format!("read {rel}: {err}"));
                return;
            }
        };
        let Some(dir) = dirs_by_path.get(&parent_remote_path(note_remote_path)) else {
            stats
                .errors
                .push(format!("no remote directory for {note_remote_path}"));
            return;
        };
        if let Err(err) = self.remote.delete_file(&remote.id).await {
            stats.errors.push(format!("recreate note {rel}: {err}"));
            return;
        }
        match self
            .remote
            .create_text(&remote.name, &contents, &dir.id)
            .await
        {
            Ok(created) => {
                let meta = fs::metadata(path).ok();
                self.state.notes.insert(rel.to_string(), created.id.clone());
                if let Some(meta) = meta {
                    self.record_upload(rel, path, &meta, &created);
                }
                stats.uploaded += 1;
            }
            Err(err) => stats.errors.push(format!("recreate note {rel}: {err}")),
        }
    }

    async fn update_in_place(
        &mut self,
        path: &Path,
        rel: &str,
        meta: &fs::Metadata,
        remote: &RemoteFile,
        dirs_by_path: &HashMap<String, RemoteDirectory>,
        stats: &mut SyncStats,
    ) {
        let result = if remote.has_text {
            match fs::read_to_string(path) {
                Ok(contents) => self.remote.update_contents(&remote.id, &contents).await,
                Err(err) => {
                    stats.errors.push(format!("read {rel}: {err}"));
                    return;
                }
            }
        } else {
            // the server replaces the blob for an existing path on re-upload
            let Some(dir) = dirs_by_path.get(&parent_remote_path(&remote.path)) else {
                stats
                    .errors
                    .push(format!("no remote directory for {}", remote.path));
                return;
            };
            self.remote.upload_binary(path, &dir.id, &remote.name).await
        };
        match result {
            Ok(updated) => {
                debug!(path = rel, "updated");
                self.record_upload(rel, path, meta, &updated);
                stats.uploaded += 1;
            }
            Err(err) => stats.errors.push(format!("update {rel}: {err}")),
        }
    }

    async fn upload_new(
        &mut self,
        path: &Path,
        rel: &str,
        remote_path: &str,
        meta: &fs::Metadata,
        dirs_by_path: &HashMap<String, RemoteDirectory>,
        stats: &mut SyncStats,
    ) {
        let Some(dir) = dirs_by_path.get(&parent_remote_path(remote_path)) else {
            stats
                .errors
                .push(format!("no remote directory for {remote_path}"));
            return;
        };
        let dir_id = dir.id.clone();
        let Some(name) = path.file_name().and_then(|n| n.to_str()).map(String::from) else {
            stats.errors.push(format!("bad file name: {rel}"));
            return;
        };
        let result = match text_upload_contents(path, meta) {
            Some(contents) => self.remote.create_text(&name, &contents, &dir_id).await,
            None => self.remote.upload_binary(path, &dir_id, &name).await,
        };
        match result {
            Ok(created) => {
                debug!(path = rel, id = %created.id, "uploaded");
                self.record_upload(rel, path, meta, &created);
                stats.uploaded += 1;
            }
            Err(err) => stats.errors.push(format!("upload {rel}: {err}")),
        }
    }

    /// Tracked paths whose local file disappeared were deleted by the user:
    /// propagate the delete and drop the entries. Ignored paths are left
    /// untouched until un-ignored.
    async fn propagate_deletions(&mut self, stats: &mut SyncStats) {
        let tracked: Vec<(String, FileRecord)> = self
            .state
            .files
            .iter()
            .map(|(rel, rec)| (rel.clone(), rec.clone()))
            .collect();
        for (rel, rec) in tracked {
            if self.local_path(&rel).exists() || self.ignore.is_ignored(&rel, false) {
                continue;
            }
            if rec.remote_id.is_empty() {
                self.state.files.remove(&rel);
                continue;
            }
            match self.remote.delete_file(&rec.remote_id).await {
                Ok(()) => {
                    debug!(path = rel, "deleted remotely");
                    self.state.files.remove(&rel);
                    self.state.notes.remove(&rel);
                    stats.deleted += 1;
                }
                Err(err) => stats.errors.push(format!("delete {rel}: {err}")),
            }
        }

        let notes: Vec<(String, String)> = self
            .state
            .notes
            .iter()
            .map(|(rel, id)| (rel.clone(), id.clone()))
            .collect();
        for (rel, note_id) in notes {
            if self.local_path(&rel).exists() || self.ignore.is_ignored(&rel, false) {
                continue;
            }
            match self.remote.delete_file(&note_id).await {
                Ok(()) => {
                    self.state.notes.remove(&rel);
                    self.state.files.remove(&rel);
                    stats.deleted += 1;
                }
                Err(err) => stats.errors.push(format!("delete note {rel}: {err}")),
            }
        }
    }

    // ------------------------------------------------------------------
    // reconcile
    // ------------------------------------------------------------------

    /// Authoritative reconciliation treating the server manifest as truth.
    /// With `dry_run` every decision is counted but nothing is written,
    /// locally or remotely.
    pub async fn reconcile(&mut self, dry_run: bool) -> SyncResult<SyncStats> {
        let mut stats = SyncStats::default();
        let manifest = self.remote.get_manifest(&self.root_dir).await?;
        let child_prefix = format!("/{}/", self.root_dir);

        // index manifest files by local relative path; notes get their .txt.
        // Anything outside the sync root is not this engine's concern.
        let mut remote_by_rel: HashMap<String, RemoteFile> = HashMap::new();
        for file in &manifest.files {
            let Some(rest) = file.path.strip_prefix(&child_prefix) else {
                continue;
            };
            let mut rel = rest.to_string();
            if Path::new(&rel).extension().is_none() {
                rel.push_str(".txt");
            }
            remote_by_rel.insert(rel, file.clone());
        }

        for dir in &manifest.directories {
            let Some(rest) = dir.path.strip_prefix(&child_prefix) else {
                continue;
            };
            if rest.is_empty() || self.ignore.is_ignored(rest, true) {
                continue;
            }
            if !dry_run {
                if let Err(err) = fs::create_dir_all(self.local_path(rest)) {
                    stats.errors.push(format!("mkdir {rest}: {err}"));
                }
            }
        }

        // phase A: remote to local
        for (rel, remote) in &remote_by_rel {
            if self.ignore.is_ignored(rel, false) {
                continue;
            }
            let local = self.local_path(rel);

            if !local.exists() {
                stats.downloaded += 1;
                if !dry_run {
                    if let Err(msg) = self.fetch_into(remote, rel, &local).await {
                        stats.downloaded -= 1;
                        stats.errors.push(msg);
                    }
                }
                continue;
            }

            let meta = match fs::metadata(&local) {
                Ok(meta) => meta,
                Err(err) => {
                    stats.errors.push(format!("stat {rel}: {err}"));
                    continue;
                }
            };
            let local_hash = hash::hash_file(&local);

            let in_sync = match (remote.content_hash.as_deref(), local_hash.as_deref()) {
                (Some(remote_hash), Some(lh)) => remote_hash == lh,
                // no server hash: fall back to size plus last-seen timestamp
                _ => self
                    .state
                    .files
                    .get(rel)
                    .map(|rec| rec.remote_time == remote.updated_at && remote.size == meta.len())
                    .unwrap_or(false),
            };
            if in_sync {
                if !dry_run {
                    if let Some(lh) = local_hash.as_deref() {
                        self.refresh_record(rel, &meta, lh, remote);
                    }
                }
                stats.skipped += 1;
                continue;
            }

            // server wins; a locally modified copy survives as a sidecar
            let locally_modified = self
                .state
                .files
                .get(rel)
                .map(|rec| {
                    !rec.hash.is_empty()
                        && local_hash
                            .as_deref()
                            .map(|lh| lh != rec.hash)
                            .unwrap_or(true)
                })
                .unwrap_or(false);
            if locally_modified {
                stats.conflicts += 1;
                if !dry_run {
                    if let Err(err) = fs::copy(&local, fsops::conflict_path(&local)) {
                        stats.errors.push(format!("conflict copy {rel}: {err}"));
                    }
                }
            }

            stats.downloaded += 1;
            if !dry_run {
                if let Err(msg) = self.fetch_into(remote, rel, &local).await {
                    stats.downloaded -= 1;
                    stats.errors.push(msg);
                }
            }
        }

        // phase B: local files absent from the manifest
        let dirs_ctx = if dry_run {
            None
        } else {
            Some(self.init_root_dir().await?)
        };

        let mut walker = WalkDir::new(&self.sync_dir).min_depth(1).into_iter();
        while let Some(entry) = walker.next() {
            let Ok(entry) = entry else { continue };
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_dir = entry.file_type().is_dir();

            if name.starts_with('.') {
                if is_dir {
                    walker.skip_current_dir();
                }
                continue;
            }
            let rel = match entry.path().strip_prefix(&self.sync_dir) {
                Ok(rel) => rel.to_string_lossy().replace('\\', "/"),
                Err(_) => continue,
            };
            if self.ignore.is_ignored(&rel, is_dir) {
                if is_dir {
                    walker.skip_current_dir();
                }
                continue;
            }
            if is_dir
                || name.ends_with(fsops::TMP_SUFFIX)
                || name.contains(fsops::CONFLICT_MARKER)
            {
                continue;
            }
            if remote_by_rel.contains_key(&rel) {
                continue; // handled in phase A
            }

            let was_tracked = self
                .state
                .files
                .get(&rel)
                .map(|rec| !rec.remote_id.is_empty())
                .unwrap_or(false);
            if was_tracked {
                // tracked but gone from the manifest: the server deleted it
                stats.deleted += 1;
                if !dry_run {
                    let _ = fs::remove_file(entry.path());
                    self.state.files.remove(&rel);
                    self.state.notes.remove(&rel);
                }
                continue;
            }

            if dry_run {
                stats.uploaded += 1;
                continue;
            }
            let (_, dirs_by_path) = dirs_ctx.as_ref().expect("dir index built for wet run");
            let remote_path = self.local_to_remote(&rel);
            match fs::metadata(entry.path()) {
                Ok(meta) => {
                    self.upload_new(
                        entry.path(),
                        &rel,
                        &remote_path,
                        &meta,
                        dirs_by_path,
                        &mut stats,
                    )
                    .await;
                }
                Err(err) => stats.errors.push(format!("stat {rel}: {err}")),
            }
        }

        Ok(stats)
    }

    /// Downloads `remote` into `local` via the temp-file pattern and records
    /// it in state. Soft failures come back as ready-made error strings.
    async fn fetch_into(
        &mut self,
        remote: &RemoteFile,
        rel: &str,
        local: &Path,
    ) -> Result<(), String> {
        if let Some(parent) = local.parent() {
            fs::create_dir_all(parent).map_err(|err| format!("mkdir {rel}: {err}"))?;
        }
        let tmp = fsops::tmp_path(local);
        if let Err(err) = self.remote.download(&remote.id, &tmp).await {
            let _ = fs::remove_file(&tmp);
            return Err(format!("download {rel}: {err}"));
        }
        if let Err(err) = fsops::install(&tmp, local) {
            let _ = fs::remove_file(&tmp);
            return Err(format!("install {rel}: {err}"));
        }
        if Path::new(&remote.path).extension().is_none() {
            self.state.notes.insert(rel.to_string(), remote.id.clone());
        }
        if let Some(rec) = record_from_disk(local, &remote.id, &remote.updated_at) {
            self.state.files.insert(rel.to_string(), rec);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // record bookkeeping
    // ------------------------------------------------------------------

    fn refresh_record(&mut self, rel: &str, meta: &fs::Metadata, hash: &str, remote: &RemoteFile) {
        self.state.files.insert(
            rel.to_string(),
            FileRecord {
                remote_id: remote.id.clone(),
                size: meta.len(),
                hash: hash.to_string(),
                remote_time: remote.updated_at.clone(),
                local_mod: mtime_secs(meta),
            },
        );
    }

    fn record_upload(&mut self, rel: &str, path: &Path, meta: &fs::Metadata, remote: &RemoteFile) {
        self.state.files.insert(
            rel.to_string(),
            FileRecord {
                remote_id: remote.id.clone(),
                size: meta.len(),
                hash: hash::hash_file(path).unwrap_or_default(),
                remote_time: remote.updated_at.clone(),
                local_mod: mtime_secs(meta),
            },
        );
    }
}

/// Strips the root prefix: `/<root>/a/b.txt` to `a/b.txt`. Paths outside the
/// root only lose their leading slash.
pub(crate) fn remote_to_local(root_dir: &str, remote_path: &str) -> String {
    let prefix = format!("/{root_dir}");
    if let Some(rest) = remote_path.strip_prefix(&format!("{prefix}/")) {
        return rest.to_string();
    }
    if remote_path == prefix {
        return String::new();
    }
    remote_path
        .strip_prefix('/')
        .unwrap_or(remote_path)
        .to_string()
}

pub(crate) fn local_to_remote(root_dir: &str, rel: &str) -> String {
    format!("/{root_dir}/{}", rel.replace('\\', "/"))
}

/// Parent of a remote path: `/root/a/b.txt` to `/root/a`.
fn parent_remote_path(remote_path: &str) -> String {
    match remote_path.rsplit_once('/') {
        Some(("", _)) => "/".to_string(),
        Some((parent, _)) => parent.to_string(),
        None => "/".to_string(),
    }
}

/// Decides whether a fresh upload goes in as inline text, returning the
/// contents when it does. Known text extensions and extension-less files are
/// text; otherwise small files with no NUL byte qualify.
fn text_upload_contents(path: &Path, meta: &fs::Metadata) -> Option<String> {
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase());
    match ext {
        None => fs::read_to_string(path).ok(),
        Some(ext) if TEXT_EXTENSIONS.contains(&ext.as_str()) => fs::read_to_string(path).ok(),
        Some(_) if meta.len() < TEXT_SNIFF_LIMIT => {
            let bytes = fs::read(path).ok()?;
            if bytes.contains(&0) {
                return None;
            }
            String::from_utf8(bytes).ok()
        }
        Some(_) => None,
    }
}

fn mtime_secs(meta: &fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn record_from_disk(path: &Path, remote_id: &str, remote_time: &str) -> Option<FileRecord> {
    let meta = fs::metadata(path).ok()?;
    Some(FileRecord {
        remote_id: remote_id.to_string(),
        size: meta.len(),
        hash: hash::hash_file(path).unwrap_or_default(),
        remote_time: remote_time.to_string(),
        local_mod: mtime_secs(&meta),
    })
}
