use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use chrono::Utc;
use serde::Serialize;

use crate::error::{PimError, Result};
use crate::liveness;
use crate::model::{Claim, Completion};
use crate::store::lock;
use crate::store::paths::{MessengerPaths, write_atomic};
use crate::store::registry::RegistryStore;

type ClaimMap = BTreeMap<String, BTreeMap<String, Claim>>;
type CompletionMap = BTreeMap<String, BTreeMap<String, Completion>>;

/// The caller's identity for swarm mutations.
#[derive(Debug, Clone)]
pub struct ClaimIdentity {
    pub agent: String,
    pub session_id: String,
    pub pid: u32,
}

/// Claim/completion state for one spec after a lazy stale purge.
#[derive(Debug, Serialize)]
pub struct SwarmStatus {
    pub spec: String,
    pub claims: BTreeMap<String, Claim>,
    pub completions: BTreeMap<String, Completion>,
}

/// Shared task assignment for swarm specs: `claims.json` and
/// `completions.json`, all mutations serialized by `swarm.lock`.
///
/// Claims are non-durable (stale once the owner is gone or restarted);
/// completions are append-only and take precedence over claims.
pub struct SwarmStore {
    paths: MessengerPaths,
}

impl SwarmStore {
    pub fn open(paths: MessengerPaths) -> Self {
        Self { paths }
    }

    /// Claim (spec, task) for the caller.
    ///
    /// Fails with `already_have_claim` if the caller holds any non-stale
    /// claim anywhere (single-claim rule), `already_claimed` if another
    /// agent holds this task, `already_completed` if the task is done.
    pub fn claim(
        &self,
        registry: &RegistryStore,
        who: &ClaimIdentity,
        spec: &str,
        task_id: &str,
        reason: Option<&str>,
    ) -> Result<Claim> {
        let _lock = self.lock()?;

        let completions = self.load_completions()?;
        let mut claims = self.load_claims()?;
        let removed = cleanup_stale(registry, &mut claims);

        let outcome = (|| {
            if let Some(completion) = completions.get(spec).and_then(|m| m.get(task_id)) {
                return Err(PimError::AlreadyCompleted {
                    spec: spec.to_string(),
                    task_id: task_id.to_string(),
                    by: completion.completed_by.clone(),
                });
            }
            if let Some((held_spec, held_task)) = find_claim_by_agent(&claims, &who.agent) {
                return Err(PimError::AlreadyHaveClaim {
                    spec: held_spec,
                    task_id: held_task,
                });
            }
            if let Some(existing) = claims.get(spec).and_then(|m| m.get(task_id)) {
                return Err(PimError::AlreadyClaimed {
                    spec: spec.to_string(),
                    task_id: task_id.to_string(),
                    by: existing.agent.clone(),
                });
            }

            let claim = Claim {
                agent: who.agent.clone(),
                session_id: who.session_id.clone(),
                pid: who.pid,
                claimed_at: Utc::now(),
                reason: reason.map(String::from),
            };
            claims
                .entry(spec.to_string())
                .or_default()
                .insert(task_id.to_string(), claim.clone());
            Ok(claim)
        })();

        match outcome {
            Ok(claim) => {
                self.store_claims(&claims)?;
                Ok(claim)
            }
            Err(err) => {
                // Lazy garbage collection piggybacks on contention: persist
                // the purge even when the request itself fails.
                if removed > 0 {
                    let _ = self.store_claims(&claims);
                }
                Err(err)
            }
        }
    }

    /// Release the caller's claim on (spec, task).
    pub fn unclaim(
        &self,
        registry: &RegistryStore,
        who: &ClaimIdentity,
        spec: &str,
        task_id: &str,
    ) -> Result<()> {
        let _lock = self.lock()?;

        let mut claims = self.load_claims()?;
        let removed = cleanup_stale(registry, &mut claims);

        let outcome = (|| {
            let existing = claims.get(spec).and_then(|m| m.get(task_id)).cloned();
            let Some(existing) = existing else {
                return Err(PimError::NotClaimed {
                    spec: spec.to_string(),
                    task_id: task_id.to_string(),
                });
            };
            if existing.agent != who.agent {
                return Err(PimError::NotYourClaim {
                    spec: spec.to_string(),
                    task_id: task_id.to_string(),
                    by: existing.agent,
                });
            }
            remove_claim(&mut claims, spec, task_id);
            Ok(())
        })();

        match outcome {
            Ok(()) => self.store_claims(&claims),
            Err(err) => {
                if removed > 0 {
                    let _ = self.store_claims(&claims);
                }
                Err(err)
            }
        }
    }

    /// Complete (spec, task). The completion record is written before the
    /// claim is removed, so a failure between the two leaves a stale claim
    /// (cleanable) but never loses the completion.
    pub fn complete(
        &self,
        registry: &RegistryStore,
        who: &ClaimIdentity,
        spec: &str,
        task_id: &str,
        notes: Option<&str>,
    ) -> Result<Completion> {
        let _lock = self.lock()?;

        let mut completions = self.load_completions()?;
        let mut claims = self.load_claims()?;
        let removed = cleanup_stale(registry, &mut claims);

        let outcome = (|| {
            if let Some(existing) = completions.get(spec).and_then(|m| m.get(task_id)) {
                return Err(PimError::AlreadyCompleted {
                    spec: spec.to_string(),
                    task_id: task_id.to_string(),
                    by: existing.completed_by.clone(),
                });
            }
            let claim = claims.get(spec).and_then(|m| m.get(task_id)).cloned();
            let Some(claim) = claim else {
                return Err(PimError::NotClaimed {
                    spec: spec.to_string(),
                    task_id: task_id.to_string(),
                });
            };
            if claim.agent != who.agent {
                return Err(PimError::NotYourClaim {
                    spec: spec.to_string(),
                    task_id: task_id.to_string(),
                    by: claim.agent,
                });
            }
            Ok(Completion {
                completed_by: who.agent.clone(),
                completed_at: Utc::now(),
                notes: notes.map(String::from),
            })
        })();

        match outcome {
            Ok(completion) => {
                completions
                    .entry(spec.to_string())
                    .or_default()
                    .insert(task_id.to_string(), completion.clone());
                // Completion first; claim removal may fail without losing it.
                self.store_completions(&completions)?;
                remove_claim(&mut claims, spec, task_id);
                self.store_claims(&claims)?;
                Ok(completion)
            }
            Err(err) => {
                if removed > 0 {
                    let _ = self.store_claims(&claims);
                }
                Err(err)
            }
        }
    }

    /// Claim/completion tables for one spec. A read path, but it performs
    /// the same lazy stale purge as mutations.
    pub fn status(&self, registry: &RegistryStore, spec: &str) -> Result<SwarmStatus> {
        let _lock = self.lock()?;

        let mut claims = self.load_claims()?;
        let removed = cleanup_stale(registry, &mut claims);
        if removed > 0 {
            let _ = self.store_claims(&claims);
        }
        let completions = self.load_completions()?;

        Ok(SwarmStatus {
            spec: spec.to_string(),
            claims: claims.get(spec).cloned().unwrap_or_default(),
            completions: completions.get(spec).cloned().unwrap_or_default(),
        })
    }

    /// The caller's current non-stale claim, if any.
    pub fn current_claim(
        &self,
        registry: &RegistryStore,
        agent: &str,
    ) -> Result<Option<(String, String)>> {
        let _lock = self.lock()?;
        let mut claims = self.load_claims()?;
        cleanup_stale(registry, &mut claims);
        Ok(find_claim_by_agent(&claims, agent))
    }

    /// The lock is stamped with this process's pid: that is the process
    /// whose death makes the lock stale.
    fn lock(&self) -> Result<lock::SwarmLock> {
        lock::acquire_swarm_lock(&self.paths.swarm_lock_path(), std::process::id())
    }

    fn load_claims(&self) -> Result<ClaimMap> {
        load_map(&self.paths.claims_path())
    }

    fn load_completions(&self) -> Result<CompletionMap> {
        load_map(&self.paths.completions_path())
    }

    fn store_claims(&self, claims: &ClaimMap) -> Result<()> {
        write_atomic(
            &self.paths.claims_path(),
            serde_json::to_string_pretty(claims)?.as_bytes(),
        )
    }

    fn store_completions(&self, completions: &CompletionMap) -> Result<()> {
        write_atomic(
            &self.paths.completions_path(),
            serde_json::to_string_pretty(completions)?.as_bytes(),
        )
    }
}

fn load_map<T: serde::de::DeserializeOwned + Default>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Ok(T::default());
    }
    let content = fs::read_to_string(path)?;
    if content.trim().is_empty() {
        return Ok(T::default());
    }
    Ok(serde_json::from_str(&content)?)
}

/// A claim is stale if its pid is dead, no matching registration exists,
/// or the registration's session id differs (the agent restarted).
fn claim_is_stale(registry: &RegistryStore, claim: &Claim) -> bool {
    if !liveness::is_alive(claim.pid) {
        return true;
    }
    match registry.read(&claim.agent) {
        Ok(Some(reg)) => reg.session_id != claim.session_id,
        // Missing or unreadable registration: nothing vouches for the claim.
        Ok(None) | Err(_) => true,
    }
}

/// Remove stale entries and empty spec buckets. Returns how many claims
/// were purged. Idempotent: a second pass removes nothing.
fn cleanup_stale(registry: &RegistryStore, claims: &mut ClaimMap) -> usize {
    let mut removed = 0;
    for tasks in claims.values_mut() {
        let before = tasks.len();
        tasks.retain(|_, claim| !claim_is_stale(registry, claim));
        removed += before - tasks.len();
    }
    claims.retain(|_, tasks| !tasks.is_empty());
    removed
}

fn find_claim_by_agent(claims: &ClaimMap, agent: &str) -> Option<(String, String)> {
    for (spec, tasks) in claims {
        for (task_id, claim) in tasks {
            if claim.agent == agent {
                return Some((spec.clone(), task_id.clone()));
            }
        }
    }
    None
}

fn remove_claim(claims: &mut ClaimMap, spec: &str, task_id: &str) {
    if let Some(tasks) = claims.get_mut(spec) {
        tasks.remove(task_id);
        if tasks.is_empty() {
            claims.remove(spec);
        }
    }
}
