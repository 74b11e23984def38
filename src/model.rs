use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Registry records
// ---------------------------------------------------------------------------

/// Cumulative per-session counters carried on a registration.
#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionStats {
    #[serde(default)]
    pub tool_calls: u64,
    #[serde(default)]
    pub tokens: u64,
    #[serde(default)]
    pub files_modified: u64,
}

/// A path-pattern reservation held by the owning agent.
///
/// A pattern matches a candidate path when they are equal or when the
/// pattern, treated as a directory, is a prefix component of the path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Reservation {
    pub pattern: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// A registered agent in the mesh. One `<name>.json` per live agent;
/// mutated only by the owning process, deleted by anyone once the pid dies.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Registration {
    pub name: String,
    pub pid: u32,
    pub session_id: String,
    pub cwd: String,
    pub model: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<String>,
    #[serde(default)]
    pub is_human: bool,
    #[serde(default)]
    pub session: SessionStats,
    pub activity: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reservations: Vec<Reservation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    /// Preserve unknown fields for forward compatibility.
    #[serde(flatten)]
    pub extensions: serde_json::Map<String, serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Messaging
// ---------------------------------------------------------------------------

/// A message between agents. One file per message in the recipient's inbox;
/// consumed-and-deleted by the recipient, no acknowledgement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    pub from: String,
    pub to: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

// ---------------------------------------------------------------------------
// Activity feed
// ---------------------------------------------------------------------------

/// A single event in the activity feed, one JSON record per line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedEvent {
    pub ts: DateTime<Utc>,
    pub agent: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
}

impl FeedEvent {
    pub fn new(agent: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            ts: Utc::now(),
            agent: agent.into(),
            kind: kind.into(),
            target: None,
            preview: None,
        }
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn preview(mut self, preview: impl Into<String>) -> Self {
        self.preview = Some(preview.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Swarm claims and completions
// ---------------------------------------------------------------------------

/// A non-durable assertion that an agent owns a task, keyed by
/// (spec path, task id) in `claims.json`.
///
/// Stale when the pid is dead, no matching registration exists, or the
/// registration's session id differs (the agent restarted).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claim {
    pub agent: String,
    pub session_id: String,
    pub pid: u32,
    pub claimed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// A durable record that a task has been finished. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Completion {
    pub completed_by: String,
    pub completed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Truncate a string to `max_len` chars, adding "..." if truncated.
pub fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() > max_len {
        let truncated: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{truncated}...")
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_registration() -> Registration {
        Registration {
            name: "agent-1".into(),
            pid: 4242,
            session_id: "sess-1".into(),
            cwd: "/repo".into(),
            model: "default".into(),
            started_at: Utc::now(),
            git_branch: Some("main".into()),
            spec: None,
            is_human: false,
            session: SessionStats::default(),
            activity: Utc::now(),
            reservations: vec![],
            status_message: None,
            extensions: serde_json::Map::new(),
        }
    }

    #[test]
    fn registration_round_trips() {
        let reg = sample_registration();
        let json = serde_json::to_string(&reg).unwrap();
        let parsed: Registration = serde_json::from_str(&json).unwrap();
        assert_eq!(reg, parsed);
        // Empty optionals omitted
        assert!(!json.contains("spec"));
        assert!(!json.contains("reservations"));
        assert!(!json.contains("status_message"));
    }

    #[test]
    fn registration_preserves_unknown_fields() {
        let mut reg = sample_registration();
        reg.extensions
            .insert("future_field".into(), serde_json::json!({"x": 1}));
        let json = serde_json::to_string(&reg).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["future_field"]["x"], 1);
    }

    #[test]
    fn message_round_trips() {
        let msg = Message {
            id: "abc-123".into(),
            from: "AgentA".into(),
            to: "AgentB".into(),
            text: "please take task 17".into(),
            timestamp: Utc::now(),
            reply_to: None,
        };
        let json = serde_json::to_string(&msg).unwrap();
        let parsed: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(msg, parsed);
        assert!(!json.contains("reply_to"));
    }

    #[test]
    fn feed_event_builder() {
        let evt = FeedEvent::new("A", "join").preview("joined the mesh");
        let json = serde_json::to_string(&evt).unwrap();
        let parsed: FeedEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(evt, parsed);
        assert!(!json.contains("target"));
    }

    #[test]
    fn claim_round_trips() {
        let claim = Claim {
            agent: "A".into(),
            session_id: "s".into(),
            pid: 1,
            claimed_at: Utc::now(),
            reason: Some("task-1".into()),
        };
        let json = serde_json::to_string(&claim).unwrap();
        let parsed: Claim = serde_json::from_str(&json).unwrap();
        assert_eq!(claim, parsed);
    }

    #[test]
    fn truncate_limits_length() {
        assert_eq!(truncate("short", 80), "short");
        let long = "x".repeat(100);
        let t = truncate(&long, 80);
        assert_eq!(t.chars().count(), 80);
        assert!(t.ends_with("..."));
    }
}
