//! # Durable Store Files
//!
//! Every persisted store is one file under the state directory. Writes go to a
//! sibling `*.tmp` file first and are then renamed over the target, so a crash
//! mid-write leaves either the old or the new content, never a torn file.
//!
//! Also hosts the run lock used to keep patrol runs from overlapping.

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::PatrolError;

pub const WATCHLIST_FILE: &str = "watchlist.toml";
pub const METRICS_FILE: &str = "metrics.json";
pub const ROTATION_FILE: &str = "rotation.json";
pub const SEEN_FILE: &str = "seen.json";
pub const DISCOVERY_FILE: &str = "discovery.json";
pub const LOCK_FILE: &str = "patrol.lock";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Json,
    Toml,
}

impl Format {
    fn of(path: &Path) -> Self {
        match path.extension().and_then(|s| s.to_str()) {
            Some("toml") => Format::Toml,
            _ => Format::Json,
        }
    }
}

/// Load `T` from `path`; a missing file yields `T::default()`.
pub fn load_or_default<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    if !path.exists() {
        return Ok(T::default());
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    if content.trim().is_empty() {
        return Ok(T::default());
    }
    let value = match Format::of(path) {
        Format::Toml => toml::from_str(&content)
            .with_context(|| format!("parsing TOML {}", path.display()))?,
        Format::Json => serde_json::from_str(&content)
            .with_context(|| format!("parsing JSON {}", path.display()))?,
    };
    Ok(value)
}

/// Serialize `value` and atomically replace `path` with it.
pub fn save_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let body = match Format::of(path) {
        Format::Toml => toml::to_string_pretty(value).context("serializing TOML")?,
        Format::Json => serde_json::to_string_pretty(value).context("serializing JSON")?,
    };
    write_atomic(path, body.as_bytes())
}

/// Atomically replace `path` with raw `bytes`.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
    }
    let tmp = tmp_path(path);
    {
        let mut f =
            fs::File::create(&tmp).with_context(|| format!("creating {}", tmp.display()))?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }
    fs::rename(&tmp, path)
        .with_context(|| format!("renaming {} -> {}", tmp.display(), path.display()))?;
    tracing::debug!(target: "store", path = %path.display(), bytes = bytes.len(), "store flushed");
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Exclusive marker for an active run, holding the owner's pid. Removed on
/// drop. A marker left behind by a process that no longer exists is reclaimed
/// by the next acquirer.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

/// A marker without a readable pid younger than this is assumed to be mid-acquire.
const LOCK_GRACE: Duration = Duration::from_secs(60);

impl RunLock {
    pub fn acquire(state_dir: &Path) -> Result<Self, PatrolError> {
        fs::create_dir_all(state_dir).map_err(|e| PatrolError::persistence("lock", e))?;
        let path = state_dir.join(LOCK_FILE);
        match Self::create(&path) {
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                if !lock_is_stale(&path) {
                    return Err(PatrolError::RunInProgress(path.display().to_string()));
                }
                tracing::warn!(
                    target: "store",
                    path = %path.display(),
                    "reclaiming stale run lock"
                );
                match fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(PatrolError::persistence("lock", e)),
                }
                Self::create(&path).map_err(|e| lock_error(&path, e))
            }
            other => other.map_err(|e| lock_error(&path, e)),
        }
    }

    fn create(path: &Path) -> io::Result<Self> {
        let mut f = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;
        let written = writeln!(f, "pid={}", std::process::id()).and_then(|_| f.sync_all());
        if let Err(e) = written {
            let _ = fs::remove_file(path);
            return Err(e);
        }
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

fn lock_error(path: &Path, e: io::Error) -> PatrolError {
    if e.kind() == io::ErrorKind::AlreadyExists {
        PatrolError::RunInProgress(path.display().to_string())
    } else {
        PatrolError::persistence("lock", e)
    }
}

fn lock_is_stale(path: &Path) -> bool {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => return e.kind() == io::ErrorKind::NotFound,
    };
    match parse_pid(&content) {
        Some(pid) => !process_alive(pid),
        None => fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.elapsed().ok())
            .is_some_and(|age| age > LOCK_GRACE),
    }
}

fn parse_pid(content: &str) -> Option<u32> {
    content
        .lines()
        .find_map(|l| l.trim().strip_prefix("pid="))
        .and_then(|p| p.trim().parse().ok())
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // Signal 0 only checks that the pid exists; nothing is delivered.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    true
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::warn!(target: "store", path = %self.path.display(), "releasing run lock: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn missing_file_loads_default_and_save_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("nested/metrics.json");
        let v: BTreeMap<String, u32> = load_or_default(&p).unwrap();
        assert!(v.is_empty());

        let mut v = BTreeMap::new();
        v.insert("a".to_string(), 1u32);
        save_atomic(&p, &v).unwrap();
        v.insert("b".to_string(), 2);
        save_atomic(&p, &v).unwrap();

        let back: BTreeMap<String, u32> = load_or_default(&p).unwrap();
        assert_eq!(back.len(), 2);
        assert!(!tmp_path(&p).exists());
    }

    #[test]
    fn corrupt_file_is_an_error_not_a_silent_reset() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("seen.json");
        fs::write(&p, "{ not json").unwrap();
        let r: Result<BTreeMap<String, u32>> = load_or_default(&p);
        assert!(r.is_err());
    }

    #[test]
    fn second_lock_is_refused_until_first_drops() {
        let dir = tempfile::tempdir().unwrap();
        let first = RunLock::acquire(dir.path()).unwrap();
        assert!(matches!(
            RunLock::acquire(dir.path()),
            Err(PatrolError::RunInProgress(_))
        ));
        drop(first);
        assert!(RunLock::acquire(dir.path()).is_ok());
    }

    #[test]
    fn fresh_marker_without_pid_is_respected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(LOCK_FILE), "").unwrap();
        assert!(matches!(
            RunLock::acquire(dir.path()),
            Err(PatrolError::RunInProgress(_))
        ));
    }

    #[test]
    fn pid_is_read_back_from_marker() {
        assert_eq!(parse_pid("pid=4242\n"), Some(4242));
        assert_eq!(parse_pid("garbage"), None);
        assert!(process_alive(std::process::id()));
    }

    #[cfg(unix)]
    #[test]
    fn marker_of_exited_process_is_reclaimed() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let dead = child.id();
        child.wait().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LOCK_FILE);
        fs::write(&path, format!("pid={dead}\n")).unwrap();

        let lock = RunLock::acquire(dir.path()).unwrap();
        let owner = parse_pid(&fs::read_to_string(&path).unwrap());
        assert_eq!(owner, Some(std::process::id()));
        drop(lock);
        assert!(!path.exists());
    }
}
