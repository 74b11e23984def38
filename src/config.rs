use std::fs;
use std::path::Path;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// How much mesh context integrating tools inject into agent prompts.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
#[clap(rename_all = "snake_case")]
pub enum ContextMode {
    #[default]
    Full,
    Minimal,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReviewConfig {
    pub enabled: bool,
    pub max_iterations: u32,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_iterations: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlanningConfig {
    pub max_passes: u32,
}

impl Default for PlanningConfig {
    fn default() -> Self {
        Self { max_passes: 3 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkConfig {
    pub max_attempts_per_task: u32,
    pub max_waves: u32,
    pub stop_on_block: bool,
}

impl Default for WorkConfig {
    fn default() -> Self {
        Self {
            max_attempts_per_task: 5,
            max_waves: 50,
            stop_on_block: false,
        }
    }
}

/// Byte/line caps applied to collaborator output before storage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TruncationConfig {
    pub worker_output_bytes: usize,
    pub review_output_bytes: usize,
    pub block_context_lines: usize,
}

impl Default for TruncationConfig {
    fn default() -> Self {
        Self {
            worker_output_bytes: 16 * 1024,
            review_output_bytes: 8 * 1024,
            block_context_lines: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConcurrencyConfig {
    pub workers: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self { workers: 2 }
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CrewConfig {
    pub concurrency: ConcurrencyConfig,
    pub review: ReviewConfig,
    pub planning: PlanningConfig,
    pub work: WorkConfig,
    pub truncation: TruncationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub auto_register: bool,
    pub auto_register_paths: Vec<String>,
    pub scope_to_folder: bool,
    pub feed_retention: usize,
    /// Seconds of inactivity before an agent counts as stuck.
    pub stuck_threshold: u64,
    pub stuck_notify: bool,
    pub auto_status: bool,
    pub crew_events_in_feed: bool,
    pub context_mode: ContextMode,
    pub crew: CrewConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            auto_register: false,
            auto_register_paths: vec![],
            scope_to_folder: false,
            feed_retention: 50,
            stuck_threshold: 300,
            stuck_notify: false,
            auto_status: true,
            crew_events_in_feed: true,
            context_mode: ContextMode::Full,
            crew: CrewConfig::default(),
        }
    }
}

impl Config {
    /// Load the layered configuration: defaults <- user file <- project file.
    ///
    /// Malformed or missing layers are ignored; configuration failures must
    /// never break coordination.
    pub fn load(user_file: &Path, project_file: &Path) -> Self {
        let mut merged = serde_json::to_value(Config::default()).unwrap_or_default();
        for path in [user_file, project_file] {
            if let Some(layer) = read_layer(path) {
                merge_values(&mut merged, layer);
            }
        }
        serde_json::from_value(merged).unwrap_or_default()
    }

    /// Does `cwd` match any auto-register path? Patterns support a leading
    /// `~` (home directory) and a trailing `*` (prefix match).
    pub fn auto_register_matches(&self, cwd: &str) -> bool {
        if !self.auto_register {
            return false;
        }
        if self.auto_register_paths.is_empty() {
            return true;
        }
        let home = std::env::var("HOME").unwrap_or_default();
        self.auto_register_paths.iter().any(|pattern| {
            let expanded = if let Some(rest) = pattern.strip_prefix("~") {
                format!("{home}{rest}")
            } else {
                pattern.clone()
            };
            if let Some(prefix) = expanded.strip_suffix('*') {
                cwd.starts_with(prefix)
            } else {
                cwd == expanded.trim_end_matches('/')
            }
        })
    }
}

fn read_layer(path: &Path) -> Option<serde_json::Value> {
    let content = fs::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}

/// Recursively overlay `layer` onto `base`. Objects merge key-wise; any
/// other value replaces the base wholesale.
pub(crate) fn merge_values(base: &mut serde_json::Value, layer: serde_json::Value) {
    match (base, layer) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(layer_map)) => {
            for (key, value) in layer_map {
                match base_map.get_mut(&key) {
                    Some(slot) => merge_values(slot, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}
