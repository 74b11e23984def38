use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// On-disk layout of the shared coordination directory.
///
/// ```text
/// base/
///   registry/<name>.json
///   inbox/<name>/<ts>-<rand>.json
///   feed.jsonl
///   claims.json
///   completions.json
///   swarm.lock
/// ```
#[derive(Debug, Clone)]
pub struct MessengerPaths {
    base: PathBuf,
}

impl MessengerPaths {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// Default base directory: `$PI_MESSENGER_DIR` or `~/.pi/agent/messenger`.
    pub fn default_base() -> PathBuf {
        if let Ok(dir) = std::env::var("PI_MESSENGER_DIR") {
            if !dir.trim().is_empty() {
                return PathBuf::from(dir);
            }
        }
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
        Path::new(&home).join(".pi").join("agent").join("messenger")
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(self.registry_dir())?;
        fs::create_dir_all(self.inbox_dir())?;
        Ok(())
    }

    pub fn registry_dir(&self) -> PathBuf {
        self.base.join("registry")
    }

    pub fn registration_path(&self, name: &str) -> PathBuf {
        self.registry_dir().join(format!("{name}.json"))
    }

    pub fn inbox_dir(&self) -> PathBuf {
        self.base.join("inbox")
    }

    pub fn agent_inbox_dir(&self, name: &str) -> PathBuf {
        self.inbox_dir().join(name)
    }

    pub fn feed_path(&self) -> PathBuf {
        self.base.join("feed.jsonl")
    }

    pub fn claims_path(&self) -> PathBuf {
        self.base.join("claims.json")
    }

    pub fn completions_path(&self) -> PathBuf {
        self.base.join("completions.json")
    }

    pub fn swarm_lock_path(&self) -> PathBuf {
        self.base.join("swarm.lock")
    }

    pub fn user_config_path(&self) -> PathBuf {
        self.base.join("config.json")
    }
}

/// Write `bytes` to `path` via a sibling temp file and rename, so readers
/// never observe a partial write.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "file".into());
    let tmp = path.with_file_name(format!(
        ".{file_name}.{}.{}.tmp",
        std::process::id(),
        uuid::Uuid::new_v4().simple()
    ));
    fs::write(&tmp, bytes)?;
    match fs::rename(&tmp, path) {
        Ok(()) => Ok(()),
        Err(err) => {
            let _ = fs::remove_file(&tmp);
            Err(err.into())
        }
    }
}
