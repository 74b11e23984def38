use thiserror::Error;

#[derive(Debug, Error)]
pub enum PimError {
    #[error("agent name must be non-empty ASCII alphanumeric/hyphen/underscore (got '{0}')")]
    InvalidName(String),

    #[error("agent name '{0}' is already registered by a live agent")]
    NameTaken(String),

    #[error("lost registration race for '{0}'; another process owns the record")]
    RaceLost(String),

    #[error("already registered as '{0}'")]
    SameName(String),

    #[error("agent '{0}' is not registered")]
    NotRegistered(String),

    #[error("invalid message target '{0}'")]
    InvalidTarget(String),

    #[error("message target '{0}' not found in registry")]
    TargetNotFound(String),

    #[error("message target '{0}' is registered but its process is gone")]
    TargetNotActive(String),

    #[error("corrupt registration '{0}': {1}")]
    InvalidRegistration(String, String),

    #[error("path '{path}' conflicts with reservation '{pattern}' held by '{owner}' (cwd: {cwd})")]
    ReservationConflict {
        path: String,
        pattern: String,
        owner: String,
        cwd: String,
    },

    #[error("task '{task_id}' in '{spec}' is already claimed by '{by}'")]
    AlreadyClaimed {
        spec: String,
        task_id: String,
        by: String,
    },

    #[error("agent already holds a claim on '{task_id}' in '{spec}'; release it first")]
    AlreadyHaveClaim { spec: String, task_id: String },

    #[error("task '{task_id}' in '{spec}' is not claimed")]
    NotClaimed { spec: String, task_id: String },

    #[error("task '{task_id}' in '{spec}' is claimed by '{by}', not you")]
    NotYourClaim {
        spec: String,
        task_id: String,
        by: String,
    },

    #[error("task '{task_id}' in '{spec}' was already completed by '{by}'")]
    AlreadyCompleted {
        spec: String,
        task_id: String,
        by: String,
    },

    #[error("could not acquire swarm lock: {0}")]
    LockFailed(String),

    #[error("no crew plan in this project (run `pim crew plan` first)")]
    NoPlan,

    #[error("crew task '{0}' not found")]
    UnknownTask(String),

    #[error("task '{task}' has unfinished dependency '{unmet}'")]
    DependencyUnmet { task: String, unmet: String },

    #[error("task '{task}' exceeded the attempt budget ({attempts} attempts)")]
    AttemptsExceeded { task: String, attempts: u32 },

    #[error("dependency cycle: task '{0}' would depend on itself (directly or transitively)")]
    CycleDetected(String),

    #[error("invalid status transition for '{task}': {from} -> {to}")]
    InvalidTransition {
        task: String,
        from: String,
        to: String,
    },

    #[error("corrupt crew file '{0}': {1}")]
    CrewCorruptFile(String, String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PimError {
    /// Stable discriminant for scripting; rendered in JSON error output.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidName(_) => "invalid_name",
            Self::NameTaken(_) => "name_taken",
            Self::RaceLost(_) => "race_lost",
            Self::SameName(_) => "same_name",
            Self::NotRegistered(_) => "not_registered",
            Self::InvalidTarget(_) => "invalid_target",
            Self::TargetNotFound(_) => "target_not_found",
            Self::TargetNotActive(_) => "target_not_active",
            Self::InvalidRegistration(_, _) => "invalid_registration",
            Self::ReservationConflict { .. } => "conflict",
            Self::AlreadyClaimed { .. } => "already_claimed",
            Self::AlreadyHaveClaim { .. } => "already_have_claim",
            Self::NotClaimed { .. } => "not_claimed",
            Self::NotYourClaim { .. } => "not_your_claim",
            Self::AlreadyCompleted { .. } => "already_completed",
            Self::LockFailed(_) => "lock_failed",
            Self::NoPlan => "no_plan",
            Self::UnknownTask(_) => "unknown_task",
            Self::DependencyUnmet { .. } => "dependency_unmet",
            Self::AttemptsExceeded { .. } => "attempts_exceeded",
            Self::CycleDetected(_) => "cycle_detected",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::CrewCorruptFile(_, _) => "crew_corrupt_file",
            Self::Io(_) => "io_error",
            Self::Json(_) => "json_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, PimError>;
