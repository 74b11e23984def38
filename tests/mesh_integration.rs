use std::fs;
use std::sync::Mutex;

use tempfile::tempdir;

use pim::config::Config;
use pim::error::PimError;
use pim::messenger::{JoinOptions, Messenger};
use pim::model::Message;
use pim::store::inbox::DeliveryHandler;
use pim::store::paths::MessengerPaths;

struct Recorder {
    delivered: Mutex<Vec<Message>>,
}

impl Recorder {
    fn new() -> Self {
        Self {
            delivered: Mutex::new(vec![]),
        }
    }
    fn texts(&self) -> Vec<String> {
        self.delivered
            .lock()
            .unwrap()
            .iter()
            .map(|m| m.text.clone())
            .collect()
    }
}

impl DeliveryHandler for Recorder {
    fn deliver(&self, message: &Message) {
        self.delivered.lock().unwrap().push(message.clone());
    }
    fn notify(&self, _kind: &str, _text: &str) {}
}

fn open(base: &std::path::Path) -> Messenger {
    Messenger::open(base, Config::default()).unwrap()
}

fn dead_pid() -> u32 {
    let mut child = std::process::Command::new("true").spawn().unwrap();
    let pid = child.id();
    child.wait().unwrap();
    pid
}

// S1: two processes simultaneously join with the same base name: the
// registry ends up with `Swift` and `Swift2`, never a shared name.
#[test]
fn name_collision_resolves_to_suffixed_names() {
    let dir = tempdir().unwrap();
    let base = dir.path().to_path_buf();

    let handles: Vec<_> = (0..2)
        .map(|i| {
            let base = base.clone();
            std::thread::spawn(move || {
                let messenger = open(&base);
                messenger
                    .join(JoinOptions {
                        base: Some("Swift".into()),
                        session_id: Some(format!("sess-{i}")),
                        ..JoinOptions::default()
                    })
                    .map(|reg| reg.name)
            })
        })
        .collect();

    let mut names: Vec<String> = handles
        .into_iter()
        .map(|h| h.join().unwrap().unwrap())
        .collect();
    names.sort();
    assert_eq!(names, vec!["Swift", "Swift2"]);

    let paths = MessengerPaths::new(&base);
    assert!(paths.registration_path("Swift").exists());
    assert!(paths.registration_path("Swift2").exists());

    let outside = open(&base);
    let seen = outside.list_active_agents(false).unwrap();
    assert_eq!(seen.len(), 2);
}

// S2: a registration whose process died ungracefully is evicted by the
// next list, with a leave event in the feed.
#[test]
fn dead_agent_cleanup_on_list() {
    let dir = tempdir().unwrap();

    let p1 = open(dir.path());
    p1.join(JoinOptions {
        name: Some("Alpha".into()),
        session_id: Some("sess-alpha".into()),
        pid: Some(dead_pid()),
        ..JoinOptions::default()
    })
    .unwrap();

    let p2 = open(dir.path());
    p2.join(JoinOptions {
        name: Some("Beta".into()),
        session_id: Some("sess-beta".into()),
        ..JoinOptions::default()
    })
    .unwrap();

    let agents = p2.list_active_agents(false).unwrap();
    assert!(agents.is_empty(), "Alpha evicted, Beta is self-excluded");

    let paths = MessengerPaths::new(dir.path());
    assert!(!paths.registration_path("Alpha").exists());

    let events = p2.feed_events(None).unwrap();
    assert!(
        events
            .iter()
            .any(|e| e.kind == "leave" && e.agent == "Alpha"),
        "feed records the eviction"
    );
}

// S3: rename drains pending messages before migrating the mailbox, so
// nothing is lost and per-sender order holds across the rename.
#[test]
fn rename_preserves_pending_mail_and_mailbox_moves() {
    let dir = tempdir().unwrap();
    let p1 = open(dir.path());
    let p2 = open(dir.path());
    p1.join(JoinOptions {
        name: Some("Old".into()),
        session_id: Some("sess-1".into()),
        ..JoinOptions::default()
    })
    .unwrap();
    p2.join(JoinOptions {
        name: Some("Peer".into()),
        session_id: Some("sess-2".into()),
        ..JoinOptions::default()
    })
    .unwrap();

    for i in 0..3 {
        p2.send("Old", &format!("msg-{i}"), None).unwrap();
    }

    let recorder = Recorder::new();
    p1.rename("New", &recorder).unwrap();
    assert_eq!(recorder.texts(), vec!["msg-0", "msg-1", "msg-2"]);

    let paths = MessengerPaths::new(dir.path());
    assert!(!paths.agent_inbox_dir("Old").exists());
    assert!(paths.agent_inbox_dir("New").exists());
    assert_eq!(fs::read_dir(paths.agent_inbox_dir("New")).unwrap().count(), 0);

    // Sends to the new name are delivered
    std::thread::sleep(std::time::Duration::from_millis(1100));
    p2.send("New", "hello new", None).unwrap();
    let recorder = Recorder::new();
    p1.flush_inbox(&recorder).unwrap();
    assert_eq!(recorder.texts(), vec!["hello new"]);

    // The old name is gone
    let err = p2.send("Old", "ghost", None).unwrap_err();
    assert!(matches!(err, PimError::TargetNotFound(_)));
}

// Property 5: messages from one sender arrive in send order.
#[test]
fn single_sender_order_is_preserved() {
    let dir = tempdir().unwrap();
    let sender = open(dir.path());
    let receiver = open(dir.path());
    sender
        .join(JoinOptions {
            name: Some("S".into()),
            session_id: Some("sess-s".into()),
            ..JoinOptions::default()
        })
        .unwrap();
    receiver
        .join(JoinOptions {
            name: Some("R".into()),
            session_id: Some("sess-r".into()),
            ..JoinOptions::default()
        })
        .unwrap();

    for i in 0..10 {
        sender.send("R", &format!("{i}"), None).unwrap();
    }

    let recorder = Recorder::new();
    receiver.flush_inbox(&recorder).unwrap();
    let texts = recorder.texts();
    let expected: Vec<String> = (0..10).map(|i| i.to_string()).collect();
    assert_eq!(texts, expected);
}

// Property 6: a reservation blocks peers' probes on matching paths and
// never the owner's own.
#[test]
fn reservations_block_peers_not_owner() {
    let dir = tempdir().unwrap();
    let a = open(dir.path());
    let b = open(dir.path());
    a.join(JoinOptions {
        name: Some("A".into()),
        session_id: Some("sess-a".into()),
        ..JoinOptions::default()
    })
    .unwrap();
    b.join(JoinOptions {
        name: Some("B".into()),
        session_id: Some("sess-b".into()),
        ..JoinOptions::default()
    })
    .unwrap();

    a.reserve(vec!["src/core/".into()], Some("refactor")).unwrap();

    let conflicts = b.check_conflict("src/core/engine.rs").unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].agent, "A");
    assert_eq!(conflicts[0].reason.as_deref(), Some("refactor"));

    assert!(a.check_conflict("src/core/engine.rs").unwrap().is_empty());
    assert!(b.check_conflict("src/other.rs").unwrap().is_empty());

    // Released with the record: A leaves, B is free after the cache ages out
    a.leave().unwrap();
    std::thread::sleep(std::time::Duration::from_millis(1100));
    assert!(b.check_conflict("src/core/engine.rs").unwrap().is_empty());
}

// Property 9: startup prune keeps the most recent events only.
#[test]
fn startup_prune_bounds_the_feed() {
    let dir = tempdir().unwrap();
    {
        let m = open(dir.path());
        m.join(JoinOptions {
            name: Some("Noisy".into()),
            session_id: Some("sess-n".into()),
            ..JoinOptions::default()
        })
        .unwrap();
        for i in 0..80 {
            m.append_event("edit", Some(&format!("file-{i}.rs")), None);
        }
    }

    let m = Messenger::open(
        dir.path(),
        Config {
            feed_retention: 50,
            ..Config::default()
        },
    )
    .unwrap();
    let events = m.feed_events(None).unwrap();
    assert_eq!(events.len(), 50);
    // Most recent survive
    assert_eq!(events.last().unwrap().target.as_deref(), Some("file-79.rs"));
}
