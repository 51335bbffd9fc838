use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use izerop_core::{
    migrate_legacy_state, spawn_watcher, Engine, RemoteCfg, RemoteStore, SyncConfig, SyncState,
    SyncStats,
};
use izerop_remote_http::HttpRemote;
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "izerop", version, about = "izerop – personal cloud sync CLI")]
struct Cli {
    /// Path to the profile config file (YAML)
    #[arg(short, long, default_value = "izerop.yaml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Pull remote changes, then push local ones
    Sync,
    /// Apply remote changes since the last cursor
    Pull,
    /// Upload local changes
    Push,
    /// Full reconciliation against the server manifest
    Reconcile {
        /// Enumerate decisions without writing anything
        #[arg(long)]
        dry_run: bool,
    },
    /// Watch the sync dir and keep both sides converged
    Watch,
    /// Show server-side sync status
    Status,
}

/// On-disk profile. `state_file` defaults under the user config dir so the
/// state never lives inside the sync dir itself.
#[derive(Debug, Deserialize)]
struct Profile {
    remote: RemoteCfg,
    sync_dir: PathBuf,
    #[serde(default = "Profile::default_root_dir")]
    root_dir: String,
    #[serde(default)]
    state_file: Option<PathBuf>,
    #[serde(default = "Profile::default_poll_secs")]
    poll_secs: u64,
    #[serde(default = "Profile::default_settle_secs")]
    settle_secs: u64,
}

impl Profile {
    fn default_root_dir() -> String {
        "root".into()
    }
    fn default_poll_secs() -> u64 {
        30
    }
    fn default_settle_secs() -> u64 {
        12
    }

    fn sync_config(&self) -> Result<SyncConfig> {
        let state_file = match &self.state_file {
            Some(path) => path.clone(),
            None => {
                let home = std::env::var_os("HOME")
                    .ok_or_else(|| anyhow!("HOME not set; configure state_file explicitly"))?;
                PathBuf::from(home).join(".config/izerop/profiles/default/sync-state.json")
            }
        };
        Ok(SyncConfig {
            sync_dir: self.sync_dir.clone(),
            root_dir: self.root_dir.clone(),
            state_file,
            poll_secs: self.poll_secs,
            settle_secs: self.settle_secs,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let text = fs::read_to_string(&cli.config)
        .with_context(|| format!("read config {}", cli.config))?;
    let profile: Profile = serde_yaml::from_str(&text).context("parse config")?;
    let cfg = profile.sync_config()?;

    let RemoteCfg::Http { server_url, token } = &profile.remote;
    let remote = HttpRemote::new(server_url.as_str(), token.as_str())?;

    match cli.command {
        Command::Sync => {
            run_pull(&cfg, &remote).await?;
            run_push(&cfg, &remote).await?;
        }
        Command::Pull => run_pull(&cfg, &remote).await?,
        Command::Push => run_push(&cfg, &remote).await?,
        Command::Reconcile { dry_run } => {
            migrate_legacy_state(&cfg.sync_dir, &cfg.state_file);
            let mut state = SyncState::load(&cfg.state_file);
            let mut engine =
                Engine::new(&remote, &cfg.sync_dir, &mut state)?.with_root_dir(&cfg.root_dir);
            let outcome = engine.reconcile(dry_run).await;
            if !dry_run {
                state.save(&cfg.state_file)?;
            }
            let label = if dry_run { "reconcile (dry run)" } else { "reconcile" };
            print_stats(label, &outcome?);
        }
        Command::Watch => {
            let mut handle = spawn_watcher(cfg, remote);
            println!("izerop watching... press Ctrl+C to stop");
            tokio::signal::ctrl_c().await?;
            handle.stop();
            handle.wait_idle().await;
        }
        Command::Status => {
            let status = remote.sync_status().await?;
            println!("files:       {}", status.file_count);
            println!("directories: {}", status.directory_count);
            println!("used:        {} / {} bytes", status.total_size, status.storage_limit);
            println!("cursor:      {}", status.cursor);
            println!("last sync:   {}", status.last_sync);
        }
    }
    Ok(())
}

async fn run_pull(cfg: &SyncConfig, remote: &HttpRemote) -> Result<()> {
    migrate_legacy_state(&cfg.sync_dir, &cfg.state_file);
    let mut state = SyncState::load(&cfg.state_file);
    let cursor = state.cursor.clone();
    let mut engine = Engine::new(remote, &cfg.sync_dir, &mut state)?.with_root_dir(&cfg.root_dir);
    let outcome = engine.pull(&cursor).await;
    // transfers applied before a hard error are real progress: keep them
    if let Ok((_, next_cursor)) = &outcome {
        state.cursor = next_cursor.clone();
    }
    state.save(&cfg.state_file)?;
    let (stats, _) = outcome?;
    print_stats("pull", &stats);
    Ok(())
}

async fn run_push(cfg: &SyncConfig, remote: &HttpRemote) -> Result<()> {
    migrate_legacy_state(&cfg.sync_dir, &cfg.state_file);
    let mut state = SyncState::load(&cfg.state_file);
    let mut engine = Engine::new(remote, &cfg.sync_dir, &mut state)?.with_root_dir(&cfg.root_dir);
    let outcome = engine.push().await;
    state.save(&cfg.state_file)?;
    print_stats("push", &outcome?);
    Ok(())
}

fn print_stats(label: &str, stats: &SyncStats) {
    println!(
        "{label}: {} downloaded, {} uploaded, {} deleted, {} conflicts, {} skipped",
        stats.downloaded, stats.uploaded, stats.deleted, stats.conflicts, stats.skipped
    );
    for err in &stats.errors {
        eprintln!("  ! {err}");
    }
}
