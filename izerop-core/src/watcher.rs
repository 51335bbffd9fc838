//! Directory watcher: multiplexes filesystem notifications, a server poll
//! ticker, and a stop signal into serialized pull and push cycles.
//!
//! Events matching the ignore set or the self-produced-noise set are dropped
//! at the notify callback, as are events raised while a pull is writing (the
//! `pulling` flag); identical content is short-circuited by hash inside the
//! engine. Surviving events reset a settle timer so bursts coalesce into a
//! single push.

use crate::config::SyncConfig;
use crate::engine::Engine;
use crate::fsops;
use crate::ignore::IgnoreRules;
use crate::remote::RemoteStore;
use crate::state::{migrate_legacy_state, SyncState};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Sleep;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub enum WatcherCommand {
    /// Run one pull+push cycle now.
    SyncNow,
    Stop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatcherState {
    Idle,
    Running,
    Error(String),
}

/// Handle for controlling a running watcher.
#[derive(Debug)]
pub struct WatcherHandle {
    ctrl_tx: mpsc::Sender<WatcherCommand>,
    state_rx: watch::Receiver<WatcherState>,
}

impl WatcherHandle {
    pub fn stop(&self) {
        let _ = self.ctrl_tx.try_send(WatcherCommand::Stop);
    }

    pub fn sync_now(&self) {
        let _ = self.ctrl_tx.try_send(WatcherCommand::SyncNow);
    }

    pub fn state(&self) -> WatcherState {
        self.state_rx.borrow().clone()
    }

    /// Waits until the watcher has shut down and saved its state.
    pub async fn wait_idle(&mut self) {
        loop {
            if !matches!(*self.state_rx.borrow(), WatcherState::Running) {
                return;
            }
            if self.state_rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Spawns the watcher loop for one sync root.
pub fn spawn_watcher<R: RemoteStore>(cfg: SyncConfig, remote: R) -> WatcherHandle {
    let (ctrl_tx, ctrl_rx) = mpsc::channel(4);
    let (state_tx, state_rx) = watch::channel(WatcherState::Idle);
    tokio::spawn(run(cfg, remote, ctrl_rx, state_tx));
    WatcherHandle { ctrl_tx, state_rx }
}

async fn run<R: RemoteStore>(
    cfg: SyncConfig,
    remote: R,
    mut ctrl_rx: mpsc::Receiver<WatcherCommand>,
    state_tx: watch::Sender<WatcherState>,
) {
    migrate_legacy_state(&cfg.sync_dir, &cfg.state_file);
    let mut state = SyncState::load(&cfg.state_file);

    let pulling = Arc::new(AtomicBool::new(false));
    let (event_tx, mut event_rx) = mpsc::channel::<PathBuf>(1024);

    // gates events only; each cycle's engine reloads its own copy
    let ignore = Arc::new(IgnoreRules::load(&cfg.sync_dir));

    // kept alive for the duration of the loop; dropping it unsubscribes
    let _fs_watcher = match watch_tree(&cfg.sync_dir, ignore, event_tx, pulling.clone()) {
        Ok(watcher) => watcher,
        Err(err) => {
            let _ = state_tx.send(WatcherState::Error(format!("watch init: {err}")));
            return;
        }
    };

    let _ = state_tx.send(WatcherState::Running);
    info!(
        dir = %cfg.sync_dir.display(),
        poll = cfg.poll_secs,
        settle = cfg.settle_secs,
        "watching"
    );

    // one full cycle before the loop begins
    run_cycle(&cfg, &remote, &mut state, &pulling).await;

    let mut poll = tokio::time::interval(Duration::from_secs(cfg.poll_secs.max(1)));
    poll.tick().await; // the immediate first tick; the startup cycle covered it

    let settle = Duration::from_secs(cfg.settle_secs);
    let mut settle_timer: Option<Pin<Box<Sleep>>> = None;

    loop {
        tokio::select! {
            Some(cmd) = ctrl_rx.recv() => match cmd {
                WatcherCommand::Stop => break,
                WatcherCommand::SyncNow => {
                    run_cycle(&cfg, &remote, &mut state, &pulling).await;
                }
            },
            Some(path) = event_rx.recv() => {
                debug!(path = %path.display(), "fs event");
                // every surviving event restarts the quiet window
                settle_timer = Some(Box::pin(tokio::time::sleep(settle)));
            }
            _ = poll.tick() => {
                run_pull(&cfg, &remote, &mut state, &pulling).await;
            }
            _ = async { if let Some(timer) = settle_timer.as_mut() { timer.as_mut().await } }, if settle_timer.is_some() => {
                settle_timer = None;
                run_push(&cfg, &remote, &mut state).await;
            }
        }
    }

    if let Err(err) = state.save(&cfg.state_file) {
        warn!(%err, "could not save state on shutdown");
    }
    let _ = state_tx.send(WatcherState::Idle);
}

/// Subscribes to the tree recursively. Ignored paths, noise, and in-pull
/// echoes are dropped inside the callback, on notify's thread, before they
/// reach the loop.
fn watch_tree(
    dir: &Path,
    ignore: Arc<IgnoreRules>,
    tx: mpsc::Sender<PathBuf>,
    pulling: Arc<AtomicBool>,
) -> notify::Result<RecommendedWatcher> {
    let root = dir.to_path_buf();
    let mut watcher = RecommendedWatcher::new(
        move |result: notify::Result<notify::Event>| {
            let Ok(event) = result else { return };
            if !matches!(
                event.kind,
                EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
            ) {
                return;
            }
            if pulling.load(Ordering::SeqCst) {
                return;
            }
            for path in event.paths {
                if is_noise(&path) || is_ignored_event(&ignore, &root, &path) {
                    continue;
                }
                let _ = tx.blocking_send(path);
            }
        },
        notify::Config::default(),
    )?;
    // recursive mode covers directories created later as well
    watcher.watch(dir, RecursiveMode::Recursive)?;
    Ok(watcher)
}

/// Paths the engine itself produces, plus editor droppings.
fn is_noise(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
        return true;
    };
    name.starts_with('.')
        || name.contains(fsops::CONFLICT_MARKER)
        || name.ends_with('~')
        || name.ends_with(".swp")
        || name.ends_with(fsops::TMP_SUFFIX)
}

/// Whether an event path falls in the ignore set, either directly or under
/// an ignored directory. Such events must not reset the settle timer: a busy
/// ignored path (a build tree, say) would otherwise hold off real pushes
/// forever.
fn is_ignored_event(ignore: &IgnoreRules, root: &Path, path: &Path) -> bool {
    if ignore.is_empty() {
        return false;
    }
    let Ok(rel) = path.strip_prefix(root) else {
        return false;
    };
    let rel = rel.to_string_lossy().replace('\\', "/");
    if rel.is_empty() {
        return false;
    }
    if ignore.is_ignored(&rel, path.is_dir()) {
        return true;
    }
    let segments: Vec<&str> = rel.split('/').collect();
    (1..segments.len()).any(|i| ignore.is_ignored(&segments[..i].join("/"), true))
}

async fn run_cycle<R: RemoteStore>(
    cfg: &SyncConfig,
    remote: &R,
    state: &mut SyncState,
    pulling: &Arc<AtomicBool>,
) {
    run_pull(cfg, remote, state, pulling).await;
    run_push(cfg, remote, state).await;
}

async fn run_pull<R: RemoteStore>(
    cfg: &SyncConfig,
    remote: &R,
    state: &mut SyncState,
    pulling: &Arc<AtomicBool>,
) {
    pulling.store(true, Ordering::SeqCst);
    let cursor = state.cursor.clone();
    let outcome = match Engine::new(remote, &cfg.sync_dir, state) {
        Ok(engine) => {
            let mut engine = engine.with_root_dir(&cfg.root_dir);
            engine.pull(&cursor).await
        }
        Err(err) => Err(err),
    };
    // cleared before push so local echoes of downloads are already gated
    pulling.store(false, Ordering::SeqCst);

    match outcome {
        Ok((stats, next_cursor)) => {
            state.cursor = next_cursor;
            if stats.changed() {
                info!(
                    downloaded = stats.downloaded,
                    deleted = stats.deleted,
                    conflicts = stats.conflicts,
                    "pull"
                );
            }
            for err in &stats.errors {
                warn!(%err, "pull");
            }
        }
        Err(err) => error!(%err, "pull failed"),
    }
    if let Err(err) = state.save(&cfg.state_file) {
        warn!(%err, "state save");
    }
}

async fn run_push<R: RemoteStore>(cfg: &SyncConfig, remote: &R, state: &mut SyncState) {
    let outcome = match Engine::new(remote, &cfg.sync_dir, state) {
        Ok(engine) => {
            let mut engine = engine.with_root_dir(&cfg.root_dir);
            engine.push().await
        }
        Err(err) => Err(err),
    };
    match outcome {
        Ok(stats) => {
            if stats.changed() {
                info!(
                    uploaded = stats.uploaded,
                    deleted = stats.deleted,
                    conflicts = stats.conflicts,
                    "push"
                );
            }
            for err in &stats.errors {
                warn!(%err, "push");
            }
        }
        Err(err) => error!(%err, "push failed"),
    }
    if let Err(err) = state.save(&cfg.state_file) {
        warn!(%err, "state save");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noise_paths_are_dropped() {
        assert!(is_noise(Path::new("/s/.izerop-sync.json")));
        assert!(is_noise(Path::new("/s/a.conflict.txt")));
        assert!(is_noise(Path::new("/s/a.txt.izerop-tmp")));
        assert!(is_noise(Path::new("/s/a.txt~")));
        assert!(is_noise(Path::new("/s/.a.txt.swp")));
        assert!(!is_noise(Path::new("/s/docs/a.txt")));
    }

    #[test]
    fn ignored_event_paths_are_dropped() {
        let ignore = IgnoreRules::parse("build/\n*.log\n");
        let root = Path::new("/s");

        assert!(is_ignored_event(&ignore, root, Path::new("/s/app.log")));
        assert!(is_ignored_event(&ignore, root, Path::new("/s/sub/app.log")));
        // anything under an ignored directory is ignored too
        assert!(is_ignored_event(&ignore, root, Path::new("/s/build/deep/x.o")));
        assert!(!is_ignored_event(&ignore, root, Path::new("/s/docs/a.txt")));
        // outside the sync root is not ours to judge
        assert!(!is_ignored_event(&ignore, root, Path::new("/elsewhere/app.log")));

        let empty = IgnoreRules::parse("");
        assert!(!is_ignored_event(&empty, root, Path::new("/s/anything")));
    }
}
