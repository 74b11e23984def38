use std::fs;

use tempfile::tempdir;

use pim::config::Config;
use pim::error::PimError;
use pim::messenger::{JoinOptions, Messenger};
use pim::store::paths::MessengerPaths;

fn open(base: &std::path::Path) -> Messenger {
    Messenger::open(base, Config::default()).unwrap()
}

fn join(m: &Messenger, name: &str) {
    m.join(JoinOptions {
        name: Some(name.into()),
        session_id: Some(format!("sess-{name}")),
        ..JoinOptions::default()
    })
    .unwrap();
}

fn dead_pid() -> u32 {
    let mut child = std::process::Command::new("true").spawn().unwrap();
    let pid = child.id();
    child.wait().unwrap();
    pid
}

// S4: the single-claim rule: a second claim anywhere reports the
// existing location; unclaim or complete frees the agent.
#[test]
fn single_claim_rule_names_existing_claim() {
    let dir = tempdir().unwrap();
    let p1 = open(dir.path());
    join(&p1, "P1");

    p1.swarm_claim("spec.md", "T-1", None).unwrap();

    match p1.swarm_claim("spec.md", "T-2", None).unwrap_err() {
        PimError::AlreadyHaveClaim { spec, task_id } => {
            assert_eq!(spec, "spec.md");
            assert_eq!(task_id, "T-1");
        }
        other => panic!("expected AlreadyHaveClaim, got {other:?}"),
    }

    p1.swarm_unclaim("spec.md", "T-1").unwrap();
    p1.swarm_claim("spec.md", "T-2", None).unwrap();
    p1.swarm_complete("spec.md", "T-2", None).unwrap();
    p1.swarm_claim("spec.md", "T-3", None).unwrap();
}

// S5: complete writes the completion before removing the claim. After a
// simulated crash between the two writes, the next reader purges the
// stale claim and re-claims report already_completed.
#[test]
fn completion_durability_convergence() {
    let dir = tempdir().unwrap();
    let paths = MessengerPaths::new(dir.path());

    let crashed = open(dir.path());
    crashed
        .join(JoinOptions {
            name: Some("Crashed".into()),
            session_id: Some("sess-crashed".into()),
            pid: Some(dead_pid()),
            ..JoinOptions::default()
        })
        .unwrap();

    // State as left by a failure after the completion write but before
    // the claim removal.
    let claim = serde_json::json!({
        "spec.md": {"T-7": {
            "agent": "Crashed",
            "session_id": "sess-crashed",
            "pid": crashed.whois("Crashed").unwrap().pid,
            "claimed_at": "2026-08-01T00:00:00Z"
        }}
    });
    let completion = serde_json::json!({
        "spec.md": {"T-7": {
            "completed_by": "Crashed",
            "completed_at": "2026-08-01T00:00:10Z",
            "notes": "work done"
        }}
    });
    fs::write(paths.claims_path(), claim.to_string()).unwrap();
    fs::write(paths.completions_path(), completion.to_string()).unwrap();

    let p2 = open(dir.path());
    join(&p2, "P2");

    // The next reader purges the stale claim
    let status = p2.swarm_status("spec.md").unwrap();
    assert!(status.claims.is_empty());
    assert_eq!(status.completions["T-7"].notes.as_deref(), Some("work done"));

    // A re-claim by anyone reports already_completed, never already_claimed
    match p2.swarm_claim("spec.md", "T-7", None).unwrap_err() {
        PimError::AlreadyCompleted { by, .. } => assert_eq!(by, "Crashed"),
        other => panic!("expected AlreadyCompleted, got {other:?}"),
    }
}

// Property 2: concurrent claims on the same task: exactly one winner.
#[test]
fn concurrent_claims_have_one_winner() {
    let dir = tempdir().unwrap();
    let base = dir.path().to_path_buf();
    for i in 0..5 {
        let m = open(&base);
        join(&m, &format!("W{i}"));
    }

    let handles: Vec<_> = (0..5)
        .map(|i| {
            let base = base.clone();
            std::thread::spawn(move || {
                let m = open(&base);
                m.attach(&format!("W{i}")).unwrap();
                m.swarm_claim("spec.md", "T-1", None)
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    for result in results {
        if let Err(err) = result {
            assert!(matches!(err, PimError::AlreadyClaimed { .. }));
        }
    }
}

// Property 3: at a quiescent moment every agent holds at most one
// non-stale claim, even after claim/unclaim churn.
#[test]
fn claim_churn_preserves_single_claim_invariant() {
    let dir = tempdir().unwrap();
    let m = open(dir.path());
    join(&m, "Churner");

    for round in 0..5 {
        let task = format!("T-{round}");
        m.swarm_claim("spec.md", &task, None).unwrap();
        assert_eq!(
            m.current_claim().unwrap(),
            Some(("spec.md".into(), task.clone()))
        );
        m.swarm_unclaim("spec.md", &task).unwrap();
        assert_eq!(m.current_claim().unwrap(), None);
    }
}

// A restarted agent (same name, new session id) no longer owns its old
// claim; the task frees up for others.
#[test]
fn restart_invalidates_previous_claims() {
    let dir = tempdir().unwrap();
    let first = open(dir.path());
    join(&first, "Restarter");
    first.swarm_claim("spec.md", "T-1", None).unwrap();

    // Restart: leave + rejoin under the same name with a new session
    first.leave().unwrap();
    let second = open(dir.path());
    second
        .join(JoinOptions {
            name: Some("Restarter".into()),
            session_id: Some("sess-new".into()),
            ..JoinOptions::default()
        })
        .unwrap();

    // The stale claim does not bind the restarted agent
    second.swarm_claim("spec.md", "T-2", None).unwrap();

    let other = open(dir.path());
    join(&other, "Other");
    other.swarm_claim("spec.md", "T-1", None).unwrap();
}
