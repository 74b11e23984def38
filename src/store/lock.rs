use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fs2::FileExt;

use crate::error::{PimError, Result};
use crate::liveness;

const SWARM_LOCK_RETRIES: u32 = 50;
const SWARM_LOCK_RETRY_DELAY: Duration = Duration::from_millis(100);
const SWARM_LOCK_STALE_AGE: Duration = Duration::from_secs(10);

/// Acquire an exclusive advisory lock on a file, returning the locked
/// handle. Released when the handle is dropped. Used for single-host
/// counters (crew task id allocation).
pub fn acquire_file_lock(path: &Path) -> Result<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;

    file.lock_exclusive()?;
    Ok(file)
}

pub fn release_file_lock(file: File) -> Result<()> {
    FileExt::unlock(&file)?;
    Ok(())
}

/// Holder of the swarm mutation lock. The lock file is removed on drop.
#[derive(Debug)]
pub struct SwarmLock {
    path: PathBuf,
}

impl Drop for SwarmLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Acquire the swarm lock by exclusive create, stamping the holder pid.
///
/// A lock left behind by a crashed process is forced open once its mtime
/// is older than the stale age and the stamped pid is dead. Retries
/// 50 times at 100 ms before giving up.
pub fn acquire_swarm_lock(path: &Path, pid: u32) -> Result<SwarmLock> {
    for attempt in 0..SWARM_LOCK_RETRIES {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                let _ = write!(file, "{pid}");
                return Ok(SwarmLock {
                    path: path.to_path_buf(),
                });
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                if lock_is_stale(path) {
                    let _ = fs::remove_file(path);
                    continue;
                }
                if attempt + 1 < SWARM_LOCK_RETRIES {
                    std::thread::sleep(SWARM_LOCK_RETRY_DELAY);
                }
            }
            Err(err) => return Err(err.into()),
        }
    }
    Err(PimError::LockFailed(path.display().to_string()))
}

/// Stale iff the lock file is old enough AND the pid it names is dead.
/// An unreadable pid stamp counts as dead (nothing to wait for).
fn lock_is_stale(path: &Path) -> bool {
    let Ok(meta) = fs::metadata(path) else {
        // Vanished between create-attempt and stat: retry will win.
        return false;
    };
    let old_enough = meta
        .modified()
        .ok()
        .and_then(|mtime| mtime.elapsed().ok())
        .map(|age| age > SWARM_LOCK_STALE_AGE)
        .unwrap_or(false);
    if !old_enough {
        return false;
    }
    let holder = fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse::<u32>().ok());
    match holder {
        Some(holder_pid) => !liveness::is_alive(holder_pid),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn file_lock_acquire_and_release() {
        let dir = tempdir().unwrap();
        let lock_path = dir.path().join("counter.lock");
        let file = acquire_file_lock(&lock_path).unwrap();
        release_file_lock(file).unwrap();
        let _file = acquire_file_lock(&lock_path).unwrap();
    }

    #[test]
    fn swarm_lock_is_exclusive_and_cleans_up() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("swarm.lock");

        let lock = acquire_swarm_lock(&path, std::process::id()).unwrap();
        assert!(path.exists());
        let stamped = fs::read_to_string(&path).unwrap();
        assert_eq!(stamped.trim(), std::process::id().to_string());

        drop(lock);
        assert!(!path.exists());
        let _lock = acquire_swarm_lock(&path, std::process::id()).unwrap();
    }

    #[test]
    fn fresh_lock_with_live_pid_is_not_stale() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("swarm.lock");
        fs::write(&path, std::process::id().to_string()).unwrap();
        assert!(!lock_is_stale(&path));
    }

    #[test]
    fn old_lock_with_dead_pid_is_stale() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("swarm.lock");

        let mut child = std::process::Command::new("true").spawn().unwrap();
        let dead_pid = child.id();
        child.wait().unwrap();

        fs::write(&path, dead_pid.to_string()).unwrap();
        // Backdate the mtime beyond the stale age.
        let old = filetime_from_secs_ago(15);
        set_mtime(&path, old);
        assert!(lock_is_stale(&path));

        // Takeover: acquisition succeeds despite the leftover file.
        let _lock = acquire_swarm_lock(&path, std::process::id()).unwrap();
    }

    #[test]
    fn old_lock_with_live_pid_is_not_stale() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("swarm.lock");
        fs::write(&path, std::process::id().to_string()).unwrap();
        set_mtime(&path, filetime_from_secs_ago(15));
        assert!(!lock_is_stale(&path));
    }

    fn filetime_from_secs_ago(secs: u64) -> std::time::SystemTime {
        std::time::SystemTime::now() - Duration::from_secs(secs)
    }

    fn set_mtime(path: &Path, to: std::time::SystemTime) {
        let file = OpenOptions::new().write(true).open(path).unwrap();
        file.set_times(fs::FileTimes::new().set_modified(to)).unwrap();
    }
}
