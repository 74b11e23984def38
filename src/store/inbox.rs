use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::agent;
use crate::error::{PimError, Result};
use crate::liveness;
use crate::model::Message;
use crate::store::paths::MessengerPaths;
use crate::store::registry::RegistryStore;

/// Receives messages and user-facing notifications from the inbox
/// machinery. Injected at construction; the watcher and rename pathways
/// invoke delivery only through this interface.
pub trait DeliveryHandler: Send + Sync {
    fn deliver(&self, message: &Message);
    fn notify(&self, kind: &str, text: &str);
}

/// Per-recipient message directories under `inbox/`.
///
/// Senders write one file per message; the owner reads and deletes.
/// Filenames are timestamp-prefixed so lexicographic order approximates
/// send order.
pub struct InboxStore {
    paths: MessengerPaths,
}

impl InboxStore {
    pub fn open(paths: MessengerPaths) -> Self {
        Self { paths }
    }

    pub fn agent_inbox_dir(&self, name: &str) -> PathBuf {
        self.paths.agent_inbox_dir(name)
    }

    /// Send a direct message. The recipient must be registered and its
    /// process alive.
    pub fn send(
        &self,
        registry: &RegistryStore,
        from: &str,
        to: &str,
        text: &str,
        reply_to: Option<&str>,
    ) -> Result<Message> {
        agent::validate_name(to).map_err(|_| PimError::InvalidTarget(to.to_string()))?;
        let target = registry
            .read(to)?
            .ok_or_else(|| PimError::TargetNotFound(to.to_string()))?;
        if !liveness::is_alive(target.pid) {
            return Err(PimError::TargetNotActive(to.to_string()));
        }

        let now = Utc::now();
        let msg = Message {
            id: uuid::Uuid::new_v4().to_string(),
            from: from.to_string(),
            to: to.to_string(),
            text: text.to_string(),
            timestamp: now,
            reply_to: reply_to.map(String::from),
        };

        let inbox = self.agent_inbox_dir(to);
        fs::create_dir_all(&inbox)?;
        // Nanosecond precision keeps rapid sequential sends in filename order.
        let ts = now.format("%Y%m%d%H%M%S%9f");
        let short_id = msg.id.get(..8).unwrap_or(&msg.id);
        let filename = format!("{ts}-{short_id}.json");
        fs::write(inbox.join(filename), serde_json::to_string_pretty(&msg)?)?;

        Ok(msg)
    }

    /// Read pending messages without consuming them (UI preview). Corrupt
    /// files are skipped, not deleted; only a drain consumes.
    pub fn peek(&self, name: &str) -> Result<Vec<Message>> {
        let dir = self.agent_inbox_dir(name);
        if !dir.exists() {
            return Ok(vec![]);
        }
        let mut files: Vec<PathBuf> = fs::read_dir(&dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
            .collect();
        files.sort();
        let mut messages = Vec::new();
        for path in files {
            let Ok(content) = fs::read_to_string(&path) else {
                continue;
            };
            if let Ok(msg) = serde_json::from_str::<Message>(&content) {
                messages.push(msg);
            }
        }
        Ok(messages)
    }

    /// Process every pending message in `name`'s inbox in filename order:
    /// read, deliver, delete.
    ///
    /// The file is deleted even when reading or delivery fails, so a
    /// poison message is dropped after one attempt instead of retrying
    /// forever. Returns the number of messages handed to the handler.
    pub fn drain(&self, name: &str, handler: &dyn DeliveryHandler) -> Result<usize> {
        drain_dir(&self.agent_inbox_dir(name), handler)
    }
}

/// Accumulates delivered messages for callers that render them after the
/// drain (CLI inbox/rename paths).
#[derive(Default)]
pub struct CollectingHandler {
    messages: std::sync::Mutex<Vec<Message>>,
}

impl CollectingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_messages(self) -> Vec<Message> {
        self.messages.into_inner().unwrap_or_default()
    }
}

impl DeliveryHandler for CollectingHandler {
    fn deliver(&self, message: &Message) {
        self.messages.lock().unwrap().push(message.clone());
    }
    fn notify(&self, _kind: &str, _text: &str) {}
}

/// Directory-level drain shared by the store and the watcher thread.
pub(crate) fn drain_dir(dir: &Path, handler: &dyn DeliveryHandler) -> Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
        .collect();
    files.sort();

    let mut delivered = 0;
    for path in files {
        match fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<Message>(&content) {
                Ok(msg) => {
                    handler.deliver(&msg);
                    delivered += 1;
                }
                Err(_) => handler.notify("inbox", "dropped unparseable message"),
            },
            Err(_) => handler.notify("inbox", "dropped unreadable message"),
        }
        let _ = fs::remove_file(&path);
    }
    Ok(delivered)
}
