use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};

const LOCK_FILE: &str = "lock";
const REFRESH_INTERVAL: Duration = Duration::from_secs(10);
const STALE_AFTER: Duration = Duration::from_secs(30);

/// How an existing lock marker is treated on acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Any existing marker fails the open.
    Hard,
    /// A marker whose timestamp has gone stale is stolen.
    Soft,
    /// Open regardless of markers or live holders.
    Ignore,
}

/// Cooperative exclusive lock on a database directory.
///
/// A `lock` marker file inside the directory carries the holder's pid and a
/// unix timestamp; the holder also keeps an exclusive OS lock on the marker
/// and refreshes the timestamp from a background watcher, so peers can tell
/// a live holder from a crashed one.
#[derive(Debug)]
pub struct FileLock {
    file: Option<File>,
    path: PathBuf,
    shutdown: Option<watch::Sender<bool>>,
    watcher: Option<JoinHandle<()>>,
}

impl FileLock {
    /// Acquire the directory lock, creating the marker file.
    pub async fn acquire(dir: &Path, mode: LockMode) -> Result<Self> {
        let path = dir.join(LOCK_FILE);

        match mode {
            LockMode::Hard => {
                if path.exists() {
                    return Err(Error::DatabaseLocked(format!(
                        "lock marker present at {}",
                        path.display()
                    )));
                }
            }
            LockMode::Soft => {
                if path.exists() {
                    let age = marker_age(&path)?;
                    if age <= STALE_AFTER {
                        return Err(Error::DatabaseLocked(format!(
                            "live lock marker at {} ({}s old)",
                            path.display(),
                            age.as_secs()
                        )));
                    }
                    tracing::warn!(
                        path = %path.display(),
                        age_secs = age.as_secs(),
                        "stealing stale directory lock"
                    );
                }
            }
            LockMode::Ignore => {}
        }

        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;

        if let Err(e) = try_os_lock(&file) {
            if mode != LockMode::Ignore {
                return Err(Error::DatabaseLocked(format!(
                    "directory lock held by a live process: {e}"
                )));
            }
            tracing::warn!(path = %path.display(), error = %e, "ignoring held directory lock");
        }

        write_marker(&mut file)?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let watcher = spawn_watcher(file.try_clone()?, path.clone(), shutdown_rx);

        Ok(Self {
            file: Some(file),
            path,
            shutdown: Some(shutdown),
            watcher: Some(watcher),
        })
    }

    /// Stop the watcher, drop the OS lock, and remove the marker.
    pub async fn release(mut self) -> Result<()> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
        if let Some(watcher) = self.watcher.take() {
            watcher.await?;
        }
        self.file.take();
        // Another holder (ignore mode, or a soft-lock steal) may have
        // removed the marker already.
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
        if self.file.take().is_some() {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

fn spawn_watcher(
    mut file: File,
    path: PathBuf,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(REFRESH_INTERVAL);
        ticker.tick().await; // first tick fires immediately
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = write_marker(&mut file) {
                        tracing::warn!(path = %path.display(), error = %e, "lock marker refresh failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}

fn write_marker(file: &mut File) -> Result<()> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    file.seek(SeekFrom::Start(0))?;
    file.set_len(0)?;
    write!(file, "{} {}", std::process::id(), now)?;
    file.sync_all()?;
    Ok(())
}

fn marker_age(path: &Path) -> Result<Duration> {
    let content = std::fs::read_to_string(path)?;
    let stamp: u64 = content
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    Ok(Duration::from_secs(now.saturating_sub(stamp)))
}

#[cfg(unix)]
fn try_os_lock(file: &File) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if result != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
fn try_os_lock(_file: &File) -> std::io::Result<()> {
    // The marker timestamp is the only protection on platforms without flock.
    Ok(())
}
