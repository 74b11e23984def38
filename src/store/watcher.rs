use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode, Watcher as NotifyWatcher};

use crate::store::inbox::{self, DeliveryHandler};

/// Burst coalescing: a change schedules one processing pass this long after.
const DEBOUNCE: Duration = Duration::from_millis(50);
const WATCH_RETRY_BASE: Duration = Duration::from_secs(1);
const WATCH_RETRY_CAP: Duration = Duration::from_secs(30);
const MAX_WATCH_RETRIES: u32 = 10;

#[derive(Default)]
struct GuardState {
    processing: bool,
    pending: bool,
}

struct WatcherShared {
    dir: PathBuf,
    handler: Arc<dyn DeliveryHandler>,
    state: Mutex<GuardState>,
    shutdown: AtomicBool,
}

/// Watches the owner's inbox directory and drains it on change.
///
/// The watch is a hint, never a source of truth: every callback triggers a
/// full directory scan, and `flush()` is the polling fallback that
/// guarantees delivery when watches break. Processing passes are
/// serialized by an in-process guard; calls arriving mid-pass coalesce
/// into a single re-run.
pub struct InboxWatcher {
    shared: Arc<WatcherShared>,
    handle: Option<JoinHandle<()>>,
}

impl InboxWatcher {
    /// Start watching `dir`, delivering through `handler`. If the OS watch
    /// cannot be opened, retries with exponential backoff in the
    /// background while `flush()` keeps messages flowing.
    pub fn start(dir: PathBuf, handler: Arc<dyn DeliveryHandler>) -> Self {
        let shared = Arc::new(WatcherShared {
            dir,
            handler,
            state: Mutex::new(GuardState::default()),
            shutdown: AtomicBool::new(false),
        });
        let thread_shared = Arc::clone(&shared);
        let handle = std::thread::spawn(move || watch_loop(thread_shared));
        Self {
            shared,
            handle: Some(handle),
        }
    }

    /// Drain pending messages now. Safe from any thread; overlapping calls
    /// coalesce into one re-run after the in-flight pass.
    pub fn flush(&self) {
        process(&self.shared);
    }

    pub fn stop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for InboxWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// One serialized processing pass. A call during an in-flight pass marks
/// it pending; the running pass loops until no arrivals remain.
fn process(shared: &WatcherShared) {
    {
        let mut st = shared.state.lock().unwrap();
        if st.processing {
            st.pending = true;
            return;
        }
        st.processing = true;
    }
    loop {
        let _ = inbox::drain_dir(&shared.dir, &*shared.handler);
        let mut st = shared.state.lock().unwrap();
        if st.pending {
            st.pending = false;
            drop(st);
            continue;
        }
        st.processing = false;
        return;
    }
}

fn watch_loop(shared: Arc<WatcherShared>) {
    let (tx, rx) = mpsc::channel::<()>();

    let mut watcher: Option<RecommendedWatcher> = None;
    let mut delay = WATCH_RETRY_BASE;
    for attempt in 0..MAX_WATCH_RETRIES {
        if shared.shutdown.load(Ordering::SeqCst) {
            return;
        }
        let event_tx = tx.clone();
        let opened = RecommendedWatcher::new(
            move |res: std::result::Result<notify::Event, notify::Error>| {
                if res.is_ok() {
                    let _ = event_tx.send(());
                }
            },
            notify::Config::default(),
        )
        .and_then(|mut w| w.watch(&shared.dir, RecursiveMode::NonRecursive).map(|()| w));
        match opened {
            Ok(w) => {
                watcher = Some(w);
                break;
            }
            Err(_) if attempt + 1 < MAX_WATCH_RETRIES => {
                sleep_interruptible(&shared, delay);
                delay = (delay * 2).min(WATCH_RETRY_CAP);
            }
            Err(_) => {}
        }
    }
    let Some(_watcher) = watcher else {
        shared
            .handler
            .notify("watcher", "inbox watch unavailable; relying on polling fallback");
        return;
    };

    // Sweep anything that arrived before the watch opened.
    process(&shared);

    while !shared.shutdown.load(Ordering::SeqCst) {
        match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(()) => {
                std::thread::sleep(DEBOUNCE);
                // Collapse the burst into one pass.
                while rx.try_recv().is_ok() {}
                process(&shared);
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

fn sleep_interruptible(shared: &WatcherShared, total: Duration) {
    let mut remaining = total;
    let step = Duration::from_millis(100);
    while remaining > Duration::ZERO {
        if shared.shutdown.load(Ordering::SeqCst) {
            return;
        }
        let chunk = remaining.min(step);
        std::thread::sleep(chunk);
        remaining -= chunk;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Message;
    use chrono::Utc;
    use std::fs;
    use std::sync::Mutex as StdMutex;
    use tempfile::tempdir;

    struct CountingHandler {
        delivered: StdMutex<Vec<String>>,
    }

    impl CountingHandler {
        fn new() -> Self {
            Self {
                delivered: StdMutex::new(vec![]),
            }
        }
        fn texts(&self) -> Vec<String> {
            self.delivered.lock().unwrap().clone()
        }
    }

    impl DeliveryHandler for CountingHandler {
        fn deliver(&self, message: &Message) {
            self.delivered.lock().unwrap().push(message.text.clone());
        }
        fn notify(&self, _kind: &str, _text: &str) {}
    }

    fn write_message(dir: &std::path::Path, seq: u32, text: &str) {
        let msg = Message {
            id: format!("id-{seq}"),
            from: "peer".into(),
            to: "me".into(),
            text: text.into(),
            timestamp: Utc::now(),
            reply_to: None,
        };
        fs::write(
            dir.join(format!("2026010100000{seq:04}-m.json")),
            serde_json::to_string(&msg).unwrap(),
        )
        .unwrap();
    }

    #[test]
    fn flush_drains_without_a_working_watch() {
        let dir = tempdir().unwrap();
        let inbox = dir.path().join("inbox").join("me");
        fs::create_dir_all(&inbox).unwrap();
        write_message(&inbox, 1, "hello");

        let handler = Arc::new(CountingHandler::new());
        let watcher = InboxWatcher::start(inbox.clone(), handler.clone());
        watcher.flush();
        assert_eq!(handler.texts(), vec!["hello"]);
    }

    #[test]
    fn concurrent_flushes_deliver_each_message_once() {
        let dir = tempdir().unwrap();
        let inbox = dir.path().join("inbox").join("me");
        fs::create_dir_all(&inbox).unwrap();
        for i in 0..20 {
            write_message(&inbox, i, &format!("m-{i}"));
        }

        let handler = Arc::new(CountingHandler::new());
        let shared = Arc::new(WatcherShared {
            dir: inbox,
            handler: handler.clone() as Arc<dyn DeliveryHandler>,
            state: Mutex::new(GuardState::default()),
            shutdown: AtomicBool::new(false),
        });

        let threads: Vec<_> = (0..4)
            .map(|_| {
                let shared = Arc::clone(&shared);
                std::thread::spawn(move || process(&shared))
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        // The guard serializes passes and drain deletes after delivery,
        // so nothing is double-delivered.
        let mut texts = handler.texts();
        texts.sort();
        texts.dedup();
        assert_eq!(texts.len(), 20);
        assert_eq!(handler.texts().len(), 20);
    }

    #[test]
    fn watch_event_triggers_delivery() {
        let dir = tempdir().unwrap();
        let inbox = dir.path().join("inbox").join("me");
        fs::create_dir_all(&inbox).unwrap();

        let handler = Arc::new(CountingHandler::new());
        let _watcher = InboxWatcher::start(inbox.clone(), handler.clone());
        // Give the watch time to open before producing the event.
        std::thread::sleep(Duration::from_millis(300));
        write_message(&inbox, 1, "via-watch");

        let deadline = std::time::Instant::now() + Duration::from_secs(3);
        while handler.texts().is_empty() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(50));
        }
        assert_eq!(handler.texts(), vec!["via-watch"]);
    }

    #[test]
    fn missing_dir_recovers_after_retry() {
        let dir = tempdir().unwrap();
        let inbox = dir.path().join("inbox").join("me");
        // Deliberately not created: first watch attempt fails.

        let handler = Arc::new(CountingHandler::new());
        let watcher = InboxWatcher::start(inbox.clone(), handler.clone());
        fs::create_dir_all(&inbox).unwrap();
        write_message(&inbox, 1, "late");

        // flush is the polling fallback while the watch retries
        watcher.flush();
        assert_eq!(handler.texts(), vec!["late"]);
    }
}
