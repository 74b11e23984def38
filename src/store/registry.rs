use std::fs;

use chrono::Utc;

use crate::agent;
use crate::error::{PimError, Result};
use crate::liveness;
use crate::model::{FeedEvent, Registration, SessionStats};
use crate::store::feed::FeedStore;
use crate::store::paths::MessengerPaths;

/// Highest numeric suffix probed when auto-resolving a name collision:
/// `base`, `base2`, ... `base99`.
const MAX_NAME_SUFFIX: u32 = 99;
/// Auto-named joins retry the whole probe this many times after losing a
/// write race.
const AUTO_JOIN_RETRIES: u32 = 3;

/// Parameters for registering an agent.
#[derive(Debug, Clone)]
pub struct JoinRequest {
    /// Explicit name (fails on live collision) vs base name (probed).
    pub explicit_name: Option<String>,
    pub base_name: String,
    pub pid: u32,
    pub session_id: String,
    pub cwd: String,
    pub model: String,
    pub is_human: bool,
    pub git_branch: Option<String>,
}

enum Verify {
    Won,
    Lost,
}

/// Presence records under `registry/`, one JSON file per live agent.
///
/// Each record is mutated only by its owning process; peers read records
/// and delete them once the owning pid is observed dead.
pub struct RegistryStore {
    paths: MessengerPaths,
}

impl RegistryStore {
    pub fn open(paths: MessengerPaths) -> Self {
        Self { paths }
    }

    /// Read one registration. `Ok(None)` when absent; corrupt files are an
    /// `invalid_registration` error so callers can distinguish poison from
    /// missing.
    pub fn read(&self, name: &str) -> Result<Option<Registration>> {
        let path = self.paths.registration_path(name);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        let reg: Registration = serde_json::from_str(&content).map_err(|e| {
            PimError::InvalidRegistration(path.display().to_string(), e.to_string())
        })?;
        Ok(Some(reg))
    }

    /// Rewrite a registration in place. Single-writer (the owning agent),
    /// so a direct write is sufficient.
    pub fn write(&self, reg: &Registration) -> Result<()> {
        let json = serde_json::to_string_pretty(reg)?;
        fs::write(self.paths.registration_path(&reg.name), json)?;
        Ok(())
    }

    pub fn remove(&self, name: &str) -> Result<()> {
        let path = self.paths.registration_path(name);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        Ok(())
    }

    /// Is `name` free for `req` to take? A name is available iff no record
    /// exists or the record's pid is dead. Unreadable records cannot prove
    /// liveness and count as dead.
    fn name_available(&self, name: &str) -> bool {
        match self.read(name) {
            Ok(None) => true,
            Ok(Some(existing)) => !liveness::is_alive(existing.pid),
            Err(_) => true,
        }
    }

    /// Register an agent, resolving name collisions.
    ///
    /// Explicit names fail fast on a live collision and overwrite a dead
    /// one. Base names probe `base`, `base2`, ... `base99`, and retry the
    /// whole probe after a lost write race.
    pub fn join(&self, req: &JoinRequest, feed: &FeedStore) -> Result<Registration> {
        self.paths.ensure_dirs()?;

        if let Some(ref name) = req.explicit_name {
            agent::validate_name(name)?;
            if !self.name_available(name) {
                return Err(PimError::NameTaken(name.clone()));
            }
            let reg = self.build_registration(name, req);
            return match self.write_and_verify(&reg)? {
                Verify::Won => {
                    self.announce_join(&reg, feed);
                    Ok(reg)
                }
                Verify::Lost => Err(PimError::RaceLost(name.clone())),
            };
        }

        agent::validate_name(&req.base_name)?;
        for _ in 0..AUTO_JOIN_RETRIES {
            let Some(name) = self.probe_name(&req.base_name) else {
                return Err(PimError::NameTaken(req.base_name.clone()));
            };
            let reg = self.build_registration(&name, req);
            if let Verify::Won = self.write_and_verify(&reg)? {
                self.announce_join(&reg, feed);
                return Ok(reg);
            }
            // Another process won this name; re-probe from scratch.
        }
        Err(PimError::RaceLost(req.base_name.clone()))
    }

    /// First available candidate among `base`, `base2`, ... `base99`.
    fn probe_name(&self, base: &str) -> Option<String> {
        for n in 1..=MAX_NAME_SUFFIX {
            let candidate = if n == 1 {
                base.to_string()
            } else {
                format!("{base}{n}")
            };
            if self.name_available(&candidate) {
                return Some(candidate);
            }
        }
        None
    }

    fn build_registration(&self, name: &str, req: &JoinRequest) -> Registration {
        let now = Utc::now();
        Registration {
            name: name.to_string(),
            pid: req.pid,
            session_id: req.session_id.clone(),
            cwd: req.cwd.clone(),
            model: req.model.clone(),
            started_at: now,
            git_branch: req.git_branch.clone(),
            spec: None,
            is_human: req.is_human,
            session: SessionStats::default(),
            activity: now,
            reservations: vec![],
            status_message: None,
            extensions: serde_json::Map::new(),
        }
    }

    /// Write the record, then read it back and confirm ownership. The pid
    /// plus session id pair identifies this exact process incarnation; a
    /// mismatch means another process won the filename race.
    ///
    /// The write itself is an exclusive create after clearing any dead
    /// predecessor, so contenders for a fresh name collide in the OS, not
    /// in the verify window.
    fn write_and_verify(&self, reg: &Registration) -> Result<Verify> {
        let path = self.paths.registration_path(&reg.name);
        let json = serde_json::to_string_pretty(reg)?;

        if path.exists() && self.name_available(&reg.name) {
            let _ = fs::remove_file(&path);
        }
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(mut file) => {
                use std::io::Write;
                file.write_all(json.as_bytes())?;
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                return Ok(Verify::Lost);
            }
            Err(err) => return Err(err.into()),
        }

        match fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<Registration>(&content) {
                Ok(observed)
                    if observed.pid == reg.pid && observed.session_id == reg.session_id =>
                {
                    Ok(Verify::Won)
                }
                // Someone else's record, or torn mid-race content.
                _ => Ok(Verify::Lost),
            },
            Err(err) => {
                // Read-back failed at the I/O level. Remove the file unless
                // a retry shows someone else already owns it, so no orphan
                // record survives a half-failed join.
                match fs::read_to_string(&path) {
                    Ok(content) if !content.contains(&reg.pid.to_string()) => {}
                    _ => {
                        let _ = fs::remove_file(&path);
                    }
                }
                Err(err.into())
            }
        }
    }

    /// Claim `reg.name` for `reg` with the same write-and-verify protocol
    /// as join. Returns false when another process won the name.
    pub(crate) fn try_claim_name(&self, reg: &Registration) -> Result<bool> {
        if !self.name_available(&reg.name) {
            return Err(PimError::NameTaken(reg.name.clone()));
        }
        match self.write_and_verify(reg)? {
            Verify::Won => Ok(true),
            Verify::Lost => Ok(false),
        }
    }

    fn announce_join(&self, reg: &Registration, feed: &FeedStore) {
        let _ = feed.append(
            &FeedEvent::new(reg.name.clone(), "join").preview(format!("joined (pid {})", reg.pid)),
        );
    }

    /// List all live registrations, evicting records whose pid is dead and
    /// skipping corrupt files. Each eviction logs a `leave` feed event.
    pub fn list(&self, feed: &FeedStore) -> Result<Vec<Registration>> {
        let dir = self.paths.registry_dir();
        if !dir.exists() {
            return Ok(vec![]);
        }
        let mut agents = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Ok(content) = fs::read_to_string(&path) else {
                continue;
            };
            let Ok(reg) = serde_json::from_str::<Registration>(&content) else {
                // Poison registration: skip, never block the list.
                continue;
            };
            if !liveness::is_alive(reg.pid) {
                let _ = fs::remove_file(&path);
                let _ = feed.append(
                    &FeedEvent::new(reg.name.clone(), "leave")
                        .preview(format!("evicted dead agent (pid {})", reg.pid)),
                );
                continue;
            }
            agents.push(reg);
        }
        agents.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(agents)
    }
}
