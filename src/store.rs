//! Iteration directory bookkeeping.
//!
//! Every fine-tuning step produces a numbered subdirectory (`0001`, `0002`,
//! ...) under the run output root. Directory presence is the sole source of
//! truth for "current iteration": nothing else is persisted. The store keeps
//! the current checkpoint plus the best-by-validation-reward checkpoint and
//! prunes everything else, preserving any `chat-completion-logs` directory a
//! pruned iteration may carry. Remote sync is fire-and-forget.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{info, warn};

/// Subdirectory preserved when an iteration directory is pruned.
pub const CHAT_LOGS_DIR: &str = "chat-completion-logs";

// ---------------------------------------------------------------------------
// Iteration numbering
// ---------------------------------------------------------------------------

/// The path of iteration `n` under `root`: a zero-padded four-digit name.
pub fn iteration_dir(root: &Path, n: u64) -> PathBuf {
    root.join(format!("{n:04}"))
}

/// Parse a directory name as an iteration number.
fn iteration_number(name: &std::ffi::OsStr) -> Option<u64> {
    let name = name.to_str()?;
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    name.parse().ok()
}

/// List the iteration numbers present under `root`, ascending.
pub fn iterations(root: &Path) -> Result<Vec<u64>> {
    let mut numbers = Vec::new();
    let entries =
        std::fs::read_dir(root).with_context(|| format!("failed to read {}", root.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to read entry in {}", root.display()))?;
        if !entry.path().is_dir() {
            continue;
        }
        if let Some(n) = iteration_number(&entry.file_name()) {
            numbers.push(n);
        }
    }
    numbers.sort_unstable();
    Ok(numbers)
}

/// Highest iteration number present under `root`, or 0 when none exist.
///
/// Creates the root directory if needed, so a fresh run starts at 0.
pub fn current_iteration(root: &Path) -> Result<u64> {
    std::fs::create_dir_all(root).with_context(|| format!("failed to create {}", root.display()))?;
    Ok(iterations(root)?.into_iter().max().unwrap_or(0))
}

/// Path of the newest checkpoint directory, if any iteration has completed.
pub fn latest_checkpoint(root: &Path) -> Result<Option<PathBuf>> {
    let current = current_iteration(root)?;
    if current == 0 {
        return Ok(None);
    }
    let dir = iteration_dir(root, current);
    Ok(dir.is_dir().then_some(dir))
}

// ---------------------------------------------------------------------------
// Pruning
// ---------------------------------------------------------------------------

/// Delete every iteration directory whose number is not in `keep`.
///
/// A pruned iteration's `chat-completion-logs` subdirectory survives: it is
/// moved aside, the checkpoint files are deleted, and the logs are moved back
/// into a recreated (otherwise empty) iteration directory. Failures on
/// individual directories are logged and skipped; pruning never aborts the
/// loop. Idempotent when re-applied with the same keep set.
pub fn retain(root: &Path, keep: &BTreeSet<u64>) -> Result<Vec<u64>> {
    let mut removed = Vec::new();
    for n in iterations(root)? {
        if keep.contains(&n) {
            continue;
        }
        match prune_iteration(root, n) {
            Ok(()) => {
                info!(iteration = n, "pruned iteration directory");
                removed.push(n);
            }
            Err(error) => {
                warn!(iteration = n, error = %error, "failed to prune iteration directory");
            }
        }
    }
    Ok(removed)
}

fn prune_iteration(root: &Path, n: u64) -> Result<()> {
    let dir = iteration_dir(root, n);
    let chat_logs = dir.join(CHAT_LOGS_DIR);

    if chat_logs.is_dir() {
        let stash = root.join(format!("temp-{n:04}-logs"));
        std::fs::rename(&chat_logs, &stash)
            .with_context(|| format!("failed to stash {}", chat_logs.display()))?;
        std::fs::remove_dir_all(&dir)
            .with_context(|| format!("failed to remove {}", dir.display()))?;
        std::fs::create_dir(&dir).with_context(|| format!("failed to recreate {}", dir.display()))?;
        std::fs::rename(&stash, &chat_logs)
            .with_context(|| format!("failed to restore {}", chat_logs.display()))?;
    } else {
        std::fs::remove_dir_all(&dir)
            .with_context(|| format!("failed to remove {}", dir.display()))?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Remote sync
// ---------------------------------------------------------------------------

/// Pushes the retained local state to remote storage. Implementations are
/// expected to be idempotent: the remote converges to the local set because
/// sync runs after both pruning and new checkpoints.
#[async_trait]
pub trait StorageSync: Send + Sync {
    async fn sync(&self, root: &Path) -> Result<()>;
}

/// Sync by shelling out to `rsync --archive --delete` against a remote
/// target (e.g. an ssh or mounted-bucket path).
#[derive(Debug, Clone)]
pub struct RsyncStorageSync {
    pub target: String,
}

#[async_trait]
impl StorageSync for RsyncStorageSync {
    async fn sync(&self, root: &Path) -> Result<()> {
        let source = format!("{}/", root.display());
        let status = tokio::process::Command::new("rsync")
            .arg("--archive")
            .arg("--delete")
            .arg(&source)
            .arg(&self.target)
            .status()
            .await
            .context("failed to spawn rsync")?;
        if !status.success() {
            anyhow::bail!("rsync exited with {status}");
        }
        Ok(())
    }
}

/// Fire-and-forget sync: spawn the operation and log its outcome. Never
/// blocks the loop and never propagates failure.
pub fn spawn_sync(sync: Arc<dyn StorageSync>, root: PathBuf) {
    tokio::spawn(async move {
        match sync.sync(&root).await {
            Ok(()) => info!(root = %root.display(), "synced output root to remote storage"),
            Err(error) => warn!(root = %root.display(), error = %error, "remote sync failed"),
        }
    });
}
