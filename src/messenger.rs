use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;

use crate::agent;
use crate::config::Config;
use crate::error::{PimError, Result};
use crate::git;
use crate::liveness;
use crate::model::{Claim, Completion, FeedEvent, Message, Registration, Reservation, truncate};
use crate::store::feed::FeedStore;
use crate::store::inbox::{DeliveryHandler, InboxStore};
use crate::store::paths::MessengerPaths;
use crate::store::registry::{JoinRequest, RegistryStore};
use crate::store::swarm::{ClaimIdentity, SwarmStatus, SwarmStore};
use crate::store::watcher::InboxWatcher;

/// Registry list results are cached this long to absorb burst traffic.
const LIST_CACHE_TTL: Duration = Duration::from_secs(1);
/// Activity rewrites are coalesced to at most one per window.
const ACTIVITY_DEBOUNCE: Duration = Duration::from_millis(500);

/// Options for joining the mesh.
#[derive(Debug, Clone, Default)]
pub struct JoinOptions {
    /// Explicit name; falls back to `$PI_AGENT_NAME`, then base probing.
    pub name: Option<String>,
    /// Base for auto-generated names (default "agent").
    pub base: Option<String>,
    pub session_id: Option<String>,
    pub model: Option<String>,
    pub is_human: bool,
    /// Owning process; defaults to this process.
    pub pid: Option<u32>,
}

#[derive(Debug, Clone)]
struct OwnIdentity {
    name: String,
    pid: u32,
    session_id: String,
    cwd: String,
}

struct ListCache {
    at: Instant,
    key: (String, bool, String),
    agents: Vec<Registration>,
}

/// A reservation held by a peer that matches a probed path.
#[derive(Debug, Clone, Serialize)]
pub struct ConflictInfo {
    pub agent: String,
    pub pattern: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub cwd: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_branch: Option<String>,
}

/// An agent's registration plus derived liveness state.
#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub registration: Registration,
    pub alive: bool,
    pub stuck: bool,
    pub idle_seconds: i64,
}

/// The per-process coordination handle: owns the stores, the list cache,
/// and the activity debounce. Everything is instance state so tests can
/// run independent coordinators against temp directories.
pub struct Messenger {
    paths: MessengerPaths,
    config: Config,
    registry: RegistryStore,
    inbox: InboxStore,
    feed: FeedStore,
    swarm: SwarmStore,
    identity: Mutex<Option<OwnIdentity>>,
    list_cache: Mutex<Option<ListCache>>,
    last_activity_write: Mutex<Option<Instant>>,
}

impl Messenger {
    /// Open a coordinator over `base`. Prunes the feed to the configured
    /// retention, as every process does at startup.
    pub fn open(base: impl Into<PathBuf>, config: Config) -> Result<Self> {
        let paths = MessengerPaths::new(base);
        paths.ensure_dirs()?;
        let feed = FeedStore::open(paths.feed_path());
        let _ = feed.prune(config.feed_retention);
        Ok(Self {
            registry: RegistryStore::open(paths.clone()),
            inbox: InboxStore::open(paths.clone()),
            swarm: SwarmStore::open(paths.clone()),
            feed,
            paths,
            config,
            identity: Mutex::new(None),
            list_cache: Mutex::new(None),
            last_activity_write: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn paths(&self) -> &MessengerPaths {
        &self.paths
    }

    pub fn feed_events(&self, limit: Option<usize>) -> Result<Vec<FeedEvent>> {
        self.feed.read(limit)
    }

    // -- identity -----------------------------------------------------------

    fn current_identity(&self) -> Result<OwnIdentity> {
        self.identity
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| PimError::NotRegistered("(no agent attached)".into()))
    }

    fn claim_identity(&self) -> Result<ClaimIdentity> {
        let own = self.current_identity()?;
        Ok(ClaimIdentity {
            agent: own.name,
            session_id: own.session_id,
            pid: own.pid,
        })
    }

    pub fn agent_name(&self) -> Option<String> {
        self.identity.lock().unwrap().as_ref().map(|i| i.name.clone())
    }

    /// Act as an already-registered agent (one-shot CLI invocations).
    pub fn attach(&self, name: &str) -> Result<Registration> {
        let reg = self
            .registry
            .read(name)?
            .ok_or_else(|| PimError::NotRegistered(name.to_string()))?;
        *self.identity.lock().unwrap() = Some(OwnIdentity {
            name: reg.name.clone(),
            pid: reg.pid,
            session_id: reg.session_id.clone(),
            cwd: reg.cwd.clone(),
        });
        Ok(reg)
    }

    // -- lifecycle ----------------------------------------------------------

    pub fn join(&self, opts: JoinOptions) -> Result<Registration> {
        let cwd = std::env::current_dir()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        let request = JoinRequest {
            explicit_name: opts.name.or_else(agent::requested_name),
            base_name: opts.base.unwrap_or_else(|| "agent".into()),
            pid: opts.pid.unwrap_or_else(std::process::id),
            session_id: agent::resolve_session_id(opts.session_id.as_deref()),
            cwd: cwd.clone(),
            model: opts.model.unwrap_or_else(|| "default".into()),
            is_human: opts.is_human,
            git_branch: git::current_branch(std::path::Path::new(&cwd)),
        };
        let reg = self.registry.join(&request, &self.feed)?;
        *self.identity.lock().unwrap() = Some(OwnIdentity {
            name: reg.name.clone(),
            pid: reg.pid,
            session_id: reg.session_id.clone(),
            cwd: reg.cwd.clone(),
        });
        self.invalidate_cache();
        Ok(reg)
    }

    /// Remove the registration (reservations are released implicitly) and
    /// the inbox. Pending messages die with the inbox.
    pub fn leave(&self) -> Result<String> {
        let own = self.current_identity()?;
        self.registry.remove(&own.name)?;
        let inbox_dir = self.inbox.agent_inbox_dir(&own.name);
        if inbox_dir.exists() {
            let _ = fs::remove_dir_all(&inbox_dir);
        }
        let _ = self
            .feed
            .append(&FeedEvent::new(own.name.clone(), "leave").preview("left the mesh"));
        *self.identity.lock().unwrap() = None;
        self.invalidate_cache();
        Ok(own.name)
    }

    /// Rename the attached agent.
    ///
    /// Pending messages are drained through `handler` before the mailbox
    /// moves, preserving per-sender order across the rename; then the new
    /// record is written and verified, the old record deleted, and the
    /// inbox directory migrated.
    pub fn rename(&self, new_name: &str, handler: &dyn DeliveryHandler) -> Result<Registration> {
        agent::validate_name(new_name)?;
        let own = self.current_identity()?;
        if own.name == new_name {
            return Err(PimError::SameName(own.name));
        }

        // Drain before the mailbox moves so nothing is lost to it.
        let _ = self.inbox.drain(&own.name, handler);

        let mut reg = self
            .registry
            .read(&own.name)?
            .ok_or_else(|| PimError::NotRegistered(own.name.clone()))?;
        reg.name = new_name.to_string();

        if !self.registry.try_claim_name(&reg)? {
            return Err(PimError::RaceLost(new_name.to_string()));
        }

        // New inbox: truncate stale leftovers from a dead former owner.
        let new_inbox = self.inbox.agent_inbox_dir(new_name);
        if new_inbox.exists() {
            let _ = fs::remove_dir_all(&new_inbox);
        }
        fs::create_dir_all(&new_inbox)?;

        self.registry.remove(&own.name)?;
        let old_inbox = self.inbox.agent_inbox_dir(&own.name);
        if old_inbox.exists() {
            let _ = fs::remove_dir_all(&old_inbox);
        }

        *self.identity.lock().unwrap() = Some(OwnIdentity {
            name: new_name.to_string(),
            ..own.clone()
        });
        self.invalidate_cache();
        let _ = self.feed.append(
            &FeedEvent::new(own.name, "rename").target(new_name.to_string()),
        );
        Ok(reg)
    }

    // -- listing ------------------------------------------------------------

    /// Live peers, excluding the attached agent, optionally scoped to the
    /// same cwd. Results are cached for one second keyed by
    /// (self-name, scope, cwd); any mutation invalidates the cache.
    pub fn list_active_agents(&self, scope_to_cwd: bool) -> Result<Vec<Registration>> {
        let (self_name, cwd) = match self.identity.lock().unwrap().as_ref() {
            Some(own) => (own.name.clone(), own.cwd.clone()),
            None => (String::new(), String::new()),
        };
        let key = (self_name.clone(), scope_to_cwd, cwd.clone());

        {
            let cache = self.list_cache.lock().unwrap();
            if let Some(ref cached) = *cache {
                if cached.key == key && cached.at.elapsed() < LIST_CACHE_TTL {
                    return Ok(cached.agents.clone());
                }
            }
        }

        let mut agents = self.registry.list(&self.feed)?;
        agents.retain(|a| a.name != self_name);
        if scope_to_cwd && !cwd.is_empty() {
            agents.retain(|a| a.cwd == cwd);
        }

        *self.list_cache.lock().unwrap() = Some(ListCache {
            at: Instant::now(),
            key,
            agents: agents.clone(),
        });
        Ok(agents)
    }

    fn invalidate_cache(&self) {
        // Total invalidation; partial updates diverge.
        *self.list_cache.lock().unwrap() = None;
    }

    pub fn whois(&self, name: &str) -> Result<Registration> {
        self.registry
            .read(name)?
            .ok_or_else(|| PimError::NotRegistered(name.to_string()))
    }

    /// Registration plus derived liveness/stuckness for one agent.
    pub fn status(&self, name: &str) -> Result<StatusReport> {
        let registration = self.whois(name)?;
        let alive = liveness::is_alive(registration.pid);
        let idle_seconds = (Utc::now() - registration.activity).num_seconds();
        let stuck = alive && idle_seconds > self.config.stuck_threshold as i64;
        if stuck && self.config.stuck_notify {
            let _ = self.feed.append(
                &FeedEvent::new(registration.name.clone(), "stuck")
                    .preview(format!("no activity for {idle_seconds}s")),
            );
        }
        Ok(StatusReport {
            registration,
            alive,
            stuck,
            idle_seconds,
        })
    }

    // -- messaging ----------------------------------------------------------

    pub fn send(&self, to: &str, text: &str, reply_to: Option<&str>) -> Result<Message> {
        let own = self.current_identity()?;
        let msg = self.inbox.send(&self.registry, &own.name, to, text, reply_to)?;
        let _ = self.feed.append(
            &FeedEvent::new(own.name, "send")
                .target(to.to_string())
                .preview(truncate(text, 80)),
        );
        self.touch_activity(false);
        Ok(msg)
    }

    /// Deliver to every live peer, scoped to the same cwd when configured.
    pub fn broadcast(&self, text: &str) -> Result<Vec<Message>> {
        let own = self.current_identity()?;
        let peers = self.list_active_agents(self.config.scope_to_folder)?;
        let mut messages = Vec::new();
        for peer in &peers {
            messages.push(
                self.inbox
                    .send(&self.registry, &own.name, &peer.name, text, None)?,
            );
        }
        let _ = self.feed.append(
            &FeedEvent::new(own.name, "broadcast")
                .preview(format!("{} recipients: {}", messages.len(), truncate(text, 60))),
        );
        Ok(messages)
    }

    /// Drain pending inbox messages now (polling fallback for broken
    /// watches and turn boundaries).
    pub fn flush_inbox(&self, handler: &dyn DeliveryHandler) -> Result<usize> {
        let own = self.current_identity()?;
        self.inbox.drain(&own.name, handler)
    }

    /// Pending messages without consuming them.
    pub fn peek_inbox(&self) -> Result<Vec<Message>> {
        let own = self.current_identity()?;
        self.inbox.peek(&own.name)
    }

    /// Start the file-system watcher over the attached agent's inbox.
    pub fn watch_inbox(&self, handler: Arc<dyn DeliveryHandler>) -> Result<InboxWatcher> {
        let own = self.current_identity()?;
        let dir = self.inbox.agent_inbox_dir(&own.name);
        fs::create_dir_all(&dir)?;
        Ok(InboxWatcher::start(dir, handler))
    }

    // -- reservations -------------------------------------------------------

    /// Reserve path patterns for exclusive editing. Fails with `conflict`
    /// when a pattern overlaps a live peer's reservation. Reservations
    /// live on the registration and vanish with it.
    pub fn reserve(&self, patterns: Vec<String>, reason: Option<&str>) -> Result<Registration> {
        let own = self.current_identity()?;
        let patterns: Vec<String> = patterns.iter().map(|p| normalize_path(p)).collect();

        let peers = self.list_active_agents(false)?;
        for peer in &peers {
            for held in &peer.reservations {
                for pattern in &patterns {
                    if patterns_overlap(pattern, &held.pattern) {
                        return Err(PimError::ReservationConflict {
                            path: pattern.clone(),
                            pattern: held.pattern.clone(),
                            owner: peer.name.clone(),
                            cwd: peer.cwd.clone(),
                        });
                    }
                }
            }
        }

        let mut reg = self
            .registry
            .read(&own.name)?
            .ok_or_else(|| PimError::NotRegistered(own.name.clone()))?;
        reg.reservations
            .retain(|r| !patterns.iter().any(|p| p == &r.pattern));
        for pattern in &patterns {
            reg.reservations.push(Reservation {
                pattern: pattern.clone(),
                reason: reason.map(String::from),
            });
        }
        reg.activity = Utc::now();
        self.registry.write(&reg)?;
        self.invalidate_cache();
        let _ = self.feed.append(
            &FeedEvent::new(own.name, "reserve").preview(format!("reserved {}", patterns.join(", "))),
        );
        Ok(reg)
    }

    /// Release reservations; with no patterns, release all.
    pub fn release(&self, patterns: Vec<String>) -> Result<Registration> {
        let own = self.current_identity()?;
        let patterns: Vec<String> = patterns.iter().map(|p| normalize_path(p)).collect();

        let mut reg = self
            .registry
            .read(&own.name)?
            .ok_or_else(|| PimError::NotRegistered(own.name.clone()))?;
        if patterns.is_empty() {
            reg.reservations.clear();
        } else {
            reg.reservations.retain(|r| {
                !patterns
                    .iter()
                    .any(|p| p.trim_end_matches('/') == r.pattern.trim_end_matches('/'))
            });
        }
        reg.activity = Utc::now();
        self.registry.write(&reg)?;
        self.invalidate_cache();
        let _ = self.feed.append(
            &FeedEvent::new(own.name, "release").preview(if patterns.is_empty() {
                "released all".to_string()
            } else {
                format!("released {}", patterns.join(", "))
            }),
        );
        Ok(reg)
    }

    /// All peer reservations matching `path`. Never blocks by itself; the
    /// integrating tool applies read/write policy. The attached agent's
    /// own reservations never conflict with its own probes.
    pub fn check_conflict(&self, path: &str) -> Result<Vec<ConflictInfo>> {
        let path = normalize_path(path);
        let peers = self.list_active_agents(false)?;
        let mut conflicts = Vec::new();
        for peer in &peers {
            for held in &peer.reservations {
                if pattern_matches(&held.pattern, &path) {
                    conflicts.push(ConflictInfo {
                        agent: peer.name.clone(),
                        pattern: held.pattern.clone(),
                        reason: held.reason.clone(),
                        cwd: peer.cwd.clone(),
                        git_branch: peer.git_branch.clone(),
                    });
                }
            }
        }
        Ok(conflicts)
    }

    // -- record upkeep ------------------------------------------------------

    /// Set the custom status message on the own record.
    pub fn set_status(&self, text: Option<&str>) -> Result<Registration> {
        self.update_own(|reg| {
            reg.status_message = text.map(String::from);
        })
    }

    pub fn record_tool_call(&self) {
        let _ = self.update_own_debounced(|reg| {
            reg.session.tool_calls += 1;
        });
    }

    pub fn record_file_modified(&self) {
        let _ = self.update_own_debounced(|reg| {
            reg.session.files_modified += 1;
        });
    }

    pub fn add_tokens(&self, tokens: u64) {
        let _ = self.update_own_debounced(|reg| {
            reg.session.tokens += tokens;
        });
    }

    /// Refresh the activity timestamp. Coalesced by the debounce window
    /// unless forced.
    pub fn touch_activity(&self, force: bool) {
        if force {
            let _ = self.update_own(|_| {});
        } else {
            let _ = self.update_own_debounced(|_| {});
        }
    }

    fn update_own(&self, mutate: impl FnOnce(&mut Registration)) -> Result<Registration> {
        let own = self.current_identity()?;
        let mut reg = self
            .registry
            .read(&own.name)?
            .ok_or_else(|| PimError::NotRegistered(own.name.clone()))?;
        mutate(&mut reg);
        reg.activity = Utc::now();
        self.registry.write(&reg)?;
        *self.last_activity_write.lock().unwrap() = Some(Instant::now());
        self.invalidate_cache();
        Ok(reg)
    }

    fn update_own_debounced(&self, mutate: impl FnOnce(&mut Registration)) -> Result<()> {
        {
            let last = self.last_activity_write.lock().unwrap();
            if let Some(at) = *last {
                if at.elapsed() < ACTIVITY_DEBOUNCE {
                    return Ok(());
                }
            }
        }
        self.update_own(mutate).map(|_| ())
    }

    // -- swarm --------------------------------------------------------------

    pub fn swarm_claim(&self, spec: &str, task_id: &str, reason: Option<&str>) -> Result<Claim> {
        let who = self.claim_identity()?;
        let claim = self.swarm.claim(&self.registry, &who, spec, task_id, reason)?;
        let auto_status = self.config.auto_status;
        let _ = self.update_own(|reg| {
            reg.spec = Some(spec.to_string());
            if auto_status && reg.status_message.is_none() {
                reg.status_message = Some(format!("working {task_id} in {spec}"));
            }
        });
        let _ = self.feed.append(
            &FeedEvent::new(who.agent, "claim")
                .target(format!("{spec}#{task_id}")),
        );
        Ok(claim)
    }

    pub fn swarm_unclaim(&self, spec: &str, task_id: &str) -> Result<()> {
        let who = self.claim_identity()?;
        self.swarm.unclaim(&self.registry, &who, spec, task_id)?;
        let auto_status = self.config.auto_status;
        let _ = self.update_own(|reg| {
            reg.spec = None;
            if auto_status {
                reg.status_message = None;
            }
        });
        let _ = self.feed.append(
            &FeedEvent::new(who.agent, "unclaim")
                .target(format!("{spec}#{task_id}")),
        );
        Ok(())
    }

    pub fn swarm_complete(
        &self,
        spec: &str,
        task_id: &str,
        notes: Option<&str>,
    ) -> Result<Completion> {
        let who = self.claim_identity()?;
        let completion = self
            .swarm
            .complete(&self.registry, &who, spec, task_id, notes)?;
        let auto_status = self.config.auto_status;
        let _ = self.update_own(|reg| {
            reg.spec = None;
            if auto_status {
                reg.status_message = None;
            }
        });
        let _ = self.feed.append(
            &FeedEvent::new(who.agent, "complete")
                .target(format!("{spec}#{task_id}")),
        );
        Ok(completion)
    }

    pub fn swarm_status(&self, spec: &str) -> Result<SwarmStatus> {
        self.swarm.status(&self.registry, spec)
    }

    pub fn current_claim(&self) -> Result<Option<(String, String)>> {
        let own = self.current_identity()?;
        self.swarm.current_claim(&self.registry, &own.name)
    }

    /// Append an event on behalf of the attached agent (crew transitions,
    /// edit/commit/test-run notices from integrating tools).
    pub fn append_event(&self, kind: &str, target: Option<&str>, preview: Option<&str>) {
        let agent = self
            .agent_name()
            .unwrap_or_else(|| "(unattached)".to_string());
        let mut event = FeedEvent::new(agent, kind);
        if let Some(target) = target {
            event = event.target(target.to_string());
        }
        if let Some(preview) = preview {
            event = event.preview(truncate(preview, 120));
        }
        let _ = self.feed.append(&event);
    }
}

// ---------------------------------------------------------------------------
// Path matching
// ---------------------------------------------------------------------------

/// Lexically normalize a path: resolve `.`/`..` components, collapse
/// duplicate separators. Preserves a trailing slash (directory marker).
fn normalize_path(path: &str) -> String {
    let mut components: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                components.pop();
            }
            c => components.push(c),
        }
    }
    let normalized = components.join("/");
    if path.ends_with('/') && !normalized.is_empty() {
        format!("{normalized}/")
    } else {
        normalized
    }
}

/// A pattern matches a path when they are equal or the pattern, treated as
/// a directory, is a prefix component of the path.
fn pattern_matches(pattern: &str, path: &str) -> bool {
    let pattern = normalize_path(pattern);
    let path = normalize_path(path);
    let pattern_trimmed = pattern.trim_end_matches('/');
    let path_trimmed = path.trim_end_matches('/');
    if pattern_trimmed == path_trimmed {
        return true;
    }
    path_trimmed.starts_with(&format!("{pattern_trimmed}/"))
}

/// Two patterns overlap when either would match paths under the other.
fn patterns_overlap(a: &str, b: &str) -> bool {
    pattern_matches(a, b) || pattern_matches(b, a)
}
