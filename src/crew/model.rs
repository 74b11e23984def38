use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
#[clap(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Todo,
    InProgress,
    Done,
    Blocked,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Todo => write!(f, "todo"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Done => write!(f, "done"),
            Self::Blocked => write!(f, "blocked"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Ship,
    NeedsWork,
    MajorRethink,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ship => write!(f, "SHIP"),
            Self::NeedsWork => write!(f, "NEEDS_WORK"),
            Self::MajorRethink => write!(f, "MAJOR_RETHINK"),
        }
    }
}

/// A reviewer's structured judgment of a task attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReviewVerdict {
    pub verdict: Verdict,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
}

/// One node of the plan DAG. The markdown specification body lives in the
/// sibling `task-<N>.md` file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CrewTask {
    /// `task-<N>`, N >= 1, monotonically increasing per plan.
    pub id: String,
    pub title: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    #[serde(default)]
    pub attempt_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_review: Option<ReviewVerdict>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Preserve unknown fields for forward compatibility.
    #[serde(flatten)]
    pub extensions: serde_json::Map<String, serde_json::Value>,
}

impl CrewTask {
    pub fn new(id: impl Into<String>, title: impl Into<String>, depends_on: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: title.into(),
            status: TaskStatus::Todo,
            depends_on,
            assigned_to: None,
            attempt_count: 0,
            last_review: None,
            blocked_reason: None,
            summary: None,
            created_at: now,
            updated_at: now,
            extensions: serde_json::Map::new(),
        }
    }

    /// Numeric component of a `task-<N>` id; used for selection order.
    pub fn number(&self) -> u32 {
        task_number(&self.id).unwrap_or(u32::MAX)
    }
}

pub fn task_number(id: &str) -> Option<u32> {
    id.strip_prefix("task-")?.parse().ok()
}

/// The per-project plan header. The markdown body lives in `plan.md`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Plan {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prd_path: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub progress: String,
    #[serde(flatten)]
    pub extensions: serde_json::Map<String, serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_round_trips_and_omits_empty_fields() {
        let task = CrewTask::new("task-1", "Build the parser", vec![]);
        let json = serde_json::to_string(&task).unwrap();
        let parsed: CrewTask = serde_json::from_str(&json).unwrap();
        assert_eq!(task, parsed);
        assert!(!json.contains("depends_on"));
        assert!(!json.contains("assigned_to"));
        assert!(!json.contains("blocked_reason"));
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&TaskStatus::InProgress).unwrap();
        assert_eq!(json, r#""in_progress""#);
    }

    #[test]
    fn verdict_serializes_screaming_case() {
        let json = serde_json::to_string(&Verdict::NeedsWork).unwrap();
        assert_eq!(json, r#""NEEDS_WORK""#);
    }

    #[test]
    fn task_number_parses() {
        assert_eq!(task_number("task-1"), Some(1));
        assert_eq!(task_number("task-42"), Some(42));
        assert_eq!(task_number("task-"), None);
        assert_eq!(task_number("other-1"), None);
    }

    #[test]
    fn task_preserves_unknown_fields() {
        let json = r#"{
            "id": "task-1",
            "title": "Test",
            "status": "todo",
            "created_at": "2026-01-01T00:00:00Z",
            "updated_at": "2026-01-01T00:00:00Z",
            "custom_field": "preserved"
        }"#;
        let task: CrewTask = serde_json::from_str(json).unwrap();
        assert_eq!(task.extensions.get("custom_field").unwrap(), "preserved");
    }

    #[test]
    fn selection_order_is_numeric_not_lexicographic() {
        let mut tasks = vec![
            CrewTask::new("task-10", "ten", vec![]),
            CrewTask::new("task-2", "two", vec![]),
        ];
        tasks.sort_by_key(|t| t.number());
        assert_eq!(tasks[0].id, "task-2");
    }
}
