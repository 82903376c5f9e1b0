//! Run control: stop requests, pacing and the single-instance lock.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use super::error::ImportError;

struct StopInner {
    requested: AtomicBool,
    notify: Notify,
    stop_file: Option<PathBuf>,
}

/// Cooperative stop request shared between the runner and whoever wants
/// it to stop (Ctrl-C handler, stop file, tests).
///
/// Runners check it at batch boundaries; nothing is interrupted mid-batch.
#[derive(Clone)]
pub struct StopSignal {
    inner: Arc<StopInner>,
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new(None)
    }
}

impl std::fmt::Debug for StopSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StopSignal")
            .field("requested", &self.inner.requested.load(Ordering::SeqCst))
            .field("stop_file", &self.inner.stop_file)
            .finish()
    }
}

impl StopSignal {
    /// A signal that also trips when `stop_file` exists.
    pub fn new(stop_file: Option<PathBuf>) -> Self {
        Self {
            inner: Arc::new(StopInner {
                requested: AtomicBool::new(false),
                notify: Notify::new(),
                stop_file,
            }),
        }
    }

    pub fn request_stop(&self) {
        self.inner.requested.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Whether a stop was requested, polling the stop file.
    pub fn is_stopped(&self) -> bool {
        if self.inner.requested.load(Ordering::SeqCst) {
            return true;
        }
        if let Some(path) = &self.inner.stop_file {
            if path.exists() {
                tracing::info!("Stop file {} found", path.display());
                self.request_stop();
                return true;
            }
        }
        false
    }

    /// Resolves once `request_stop` has been called.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.inner.requested.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }

    /// Trip the signal on Ctrl-C. A second Ctrl-C is left to the default handler.
    pub fn listen_for_ctrl_c(&self) {
        let signal = self.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupt received, stopping after the current batch");
                signal.request_stop();
            }
        });
    }

    pub fn stop_file(&self) -> Option<&Path> {
        self.inner.stop_file.as_deref()
    }
}

/// Exponential backoff for the `attempt`-th consecutive failure (1-based):
/// `base_ms * 2^(attempt - 1)`, capped at `max_ms`.
pub fn backoff_delay(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    let exponent = attempt.saturating_sub(1).min(32);
    let delay_ms = base_ms.saturating_mul(1u64 << exponent);
    Duration::from_millis(delay_ms.min(max_ms))
}

/// Yield point between batches and during backoff.
#[async_trait]
pub trait Pacer: Send + Sync {
    async fn pause(&self, duration: Duration);
}

/// Sleeps on the tokio timer, waking early when a stop is requested.
#[derive(Debug, Clone, Default)]
pub struct TokioPacer {
    stop: Option<StopSignal>,
}

impl TokioPacer {
    pub fn new(stop: StopSignal) -> Self {
        Self { stop: Some(stop) }
    }
}

#[async_trait]
impl Pacer for TokioPacer {
    async fn pause(&self, duration: Duration) {
        if duration.is_zero() {
            tokio::task::yield_now().await;
            return;
        }
        match &self.stop {
            Some(stop) => {
                tokio::select! {
                    _ = tokio::time::sleep(duration) => {}
                    _ = stop.cancelled() => {}
                }
            }
            None => tokio::time::sleep(duration).await,
        }
    }
}

/// Best-effort single-instance guard: a lock file holding `pid@hostname`.
///
/// Released when dropped. A lock left behind by a dead process on this
/// host is replaced.
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
    owner: String,
}

impl InstanceLock {
    pub fn acquire(path: &Path) -> Result<Self, ImportError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let owner = owner_tag();
        match Self::create(path, &owner) {
            Ok(lock) => return Ok(lock),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e.into()),
        }

        let mut existing = String::new();
        File::open(path)?.read_to_string(&mut existing)?;
        let existing = existing.trim().to_string();

        if !is_stale(&existing) {
            return Err(ImportError::Locked {
                path: path.display().to_string(),
                owner: existing,
            });
        }

        tracing::warn!(
            "Removing stale lock {} left by {}",
            path.display(),
            existing
        );
        std::fs::remove_file(path)?;
        Ok(Self::create(path, &owner)?)
    }

    fn create(path: &Path, owner: &str) -> std::io::Result<Self> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;
        writeln!(file, "{owner}")?;
        Ok(Self {
            path: path.to_path_buf(),
            owner: owner.to_string(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        // Only remove the file if it is still ours.
        let ours = std::fs::read_to_string(&self.path)
            .map(|c| c.trim() == self.owner)
            .unwrap_or(false);
        if ours {
            if let Err(e) = std::fs::remove_file(&self.path) {
                tracing::warn!("Failed to remove lock {}: {}", self.path.display(), e);
            }
        }
    }
}

fn current_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

fn owner_tag() -> String {
    format!("{}@{}", std::process::id(), current_hostname())
}

/// A lock is stale when it names a process on this host that no longer
/// exists. Locks from other hosts or in an unknown format are respected.
fn is_stale(owner: &str) -> bool {
    let Some((pid, host)) = owner.split_once('@') else {
        return false;
    };
    let Ok(pid) = pid.parse::<u32>() else {
        return false;
    };
    host == current_hostname() && !process_exists(pid)
}

fn process_exists(pid: u32) -> bool {
    #[cfg(unix)]
    {
        // Signal 0 only checks that the process exists. EPERM means it
        // exists but belongs to another user.
        if unsafe { libc::kill(pid as libc::pid_t, 0) } == 0 {
            return true;
        }
        std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}
