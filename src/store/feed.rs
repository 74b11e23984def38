use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use crate::error::Result;
use crate::model::FeedEvent;
use crate::store::paths::write_atomic;

/// Append-only newline-delimited JSON activity feed.
///
/// The feed is advisory, not durable consensus: appends are best-effort
/// and concurrent writers may interleave lines, but each line is a
/// complete JSON record.
pub struct FeedStore {
    path: PathBuf,
}

impl FeedStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Append a single event. One open/append/close per event so
    /// concurrent appenders never share a file offset.
    pub fn append(&self, event: &FeedEvent) -> Result<()> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    /// Read feed events, skipping unparseable lines, optionally limited to
    /// the most recent N.
    pub fn read(&self, limit: Option<usize>) -> Result<Vec<FeedEvent>> {
        if !self.path.exists() {
            return Ok(vec![]);
        }
        let content = fs::read_to_string(&self.path)?;
        let mut events: Vec<FeedEvent> = content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect();
        if let Some(n) = limit {
            let len = events.len();
            if len > n {
                events = events.split_off(len - n);
            }
        }
        Ok(events)
    }

    /// Startup prune: rewrite the feed keeping only the most recent
    /// `retention` events. Atomic so a concurrent reader never sees a
    /// half-written file.
    pub fn prune(&self, retention: usize) -> Result<()> {
        if !self.path.exists() {
            return Ok(());
        }
        let events = self.read(Some(retention))?;
        let mut out = String::new();
        for event in &events {
            out.push_str(&serde_json::to_string(event)?);
            out.push('\n');
        }
        write_atomic(&self.path, out.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FeedEvent;
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, FeedStore) {
        let dir = tempdir().unwrap();
        let store = FeedStore::open(dir.path().join("feed.jsonl"));
        (dir, store)
    }

    fn event(agent: &str) -> FeedEvent {
        FeedEvent::new(agent, "join").preview("joined the mesh")
    }

    #[test]
    fn append_and_read() {
        let (_dir, store) = setup();
        store.append(&event("A")).unwrap();
        store.append(&event("B")).unwrap();

        let all = store.read(None).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].agent, "A");
        assert_eq!(all[1].agent, "B");

        let last = store.read(Some(1)).unwrap();
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].agent, "B");
    }

    #[test]
    fn read_missing_file_is_empty() {
        let (_dir, store) = setup();
        assert!(store.read(None).unwrap().is_empty());
    }

    #[test]
    fn corrupt_lines_are_skipped() {
        let (_dir, store) = setup();
        store.append(&event("A")).unwrap();
        {
            let mut file = OpenOptions::new().append(true).open(&store.path).unwrap();
            file.write_all(b"NOT JSON\n").unwrap();
        }
        store.append(&event("B")).unwrap();
        let all = store.read(None).unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn prune_keeps_most_recent() {
        let (_dir, store) = setup();
        for i in 0..10 {
            store.append(&event(&format!("agent-{i}"))).unwrap();
        }
        store.prune(3).unwrap();
        let all = store.read(None).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].agent, "agent-7");
        assert_eq!(all[2].agent, "agent-9");
    }

    #[test]
    fn prune_missing_file_is_noop() {
        let (_dir, store) = setup();
        store.prune(50).unwrap();
        assert!(!store.path.exists());
    }

    #[test]
    fn prune_is_idempotent() {
        let (_dir, store) = setup();
        for i in 0..5 {
            store.append(&event(&format!("agent-{i}"))).unwrap();
        }
        store.prune(3).unwrap();
        let first = store.read(None).unwrap();
        store.prune(3).unwrap();
        let second = store.read(None).unwrap();
        assert_eq!(first, second);
    }
}
