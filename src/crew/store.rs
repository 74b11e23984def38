use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use regex::Regex;
use serde::Deserialize;
use std::sync::OnceLock;

use crate::config::CrewConfig;
use crate::crew::model::{CrewTask, Plan, TaskStatus};
use crate::error::{PimError, Result};
use crate::store::lock;
use crate::store::paths::write_atomic;

/// A task parsed out of planner output, before ids are assigned.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskDraft {
    pub title: String,
    pub depends_on: Vec<String>,
    pub body: String,
}

/// Plan, task, and block-context files under `<project>/.pi/messenger/crew/`.
///
/// ```text
/// crew/
///   plan.json, plan.md, planning-progress.md
///   tasks/task-<N>.{json,md}
///   blocks/task-<N>.md
///   config.json
/// ```
pub struct CrewStore {
    root: PathBuf,
}

impl CrewStore {
    pub fn open(project_root: &Path) -> Self {
        Self {
            root: project_root.join(".pi").join("messenger").join("crew"),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(self.tasks_dir())?;
        fs::create_dir_all(self.blocks_dir())?;
        if !self.counter_path().exists() {
            fs::write(self.counter_path(), r#"{"next_id": 1}"#)?;
        }
        Ok(())
    }

    fn tasks_dir(&self) -> PathBuf {
        self.root.join("tasks")
    }

    fn blocks_dir(&self) -> PathBuf {
        self.root.join("blocks")
    }

    fn plan_path(&self) -> PathBuf {
        self.root.join("plan.json")
    }

    fn plan_body_path(&self) -> PathBuf {
        self.root.join("plan.md")
    }

    fn progress_path(&self) -> PathBuf {
        self.root.join("planning-progress.md")
    }

    fn counter_path(&self) -> PathBuf {
        self.root.join("counter.json")
    }

    fn counter_lock_path(&self) -> PathBuf {
        self.root.join("counter.lock")
    }

    fn config_path(&self) -> PathBuf {
        self.root.join("config.json")
    }

    fn task_path(&self, id: &str) -> PathBuf {
        self.tasks_dir().join(format!("{id}.json"))
    }

    fn task_body_path(&self, id: &str) -> PathBuf {
        self.tasks_dir().join(format!("{id}.md"))
    }

    fn block_path(&self, id: &str) -> PathBuf {
        self.blocks_dir().join(format!("{id}.md"))
    }

    // -- plan ---------------------------------------------------------------

    pub fn write_plan(&self, plan: &Plan, body: &str) -> Result<()> {
        self.ensure_dirs()?;
        write_atomic(&self.plan_path(), serde_json::to_string_pretty(plan)?.as_bytes())?;
        fs::write(self.plan_body_path(), body)?;
        Ok(())
    }

    pub fn read_plan(&self) -> Result<Plan> {
        let path = self.plan_path();
        if !path.exists() {
            return Err(PimError::NoPlan);
        }
        let content = fs::read_to_string(&path)?;
        serde_json::from_str(&content)
            .map_err(|e| PimError::CrewCorruptFile(path.display().to_string(), e.to_string()))
    }

    pub fn write_progress(&self, text: &str) -> Result<()> {
        self.ensure_dirs()?;
        fs::write(self.progress_path(), text)?;
        Ok(())
    }

    /// Crew configuration: defaults overlaid with this project's
    /// `crew/config.json` when present. Malformed files fall back to the
    /// given base.
    pub fn load_config(&self, base: &CrewConfig) -> CrewConfig {
        let Ok(content) = fs::read_to_string(self.config_path()) else {
            return base.clone();
        };
        let Ok(layer) = serde_json::from_str::<serde_json::Value>(&content) else {
            return base.clone();
        };
        let mut merged = match serde_json::to_value(base) {
            Ok(v) => v,
            Err(_) => return base.clone(),
        };
        crate::config::merge_values(&mut merged, layer);
        serde_json::from_value(merged).unwrap_or_else(|_| base.clone())
    }

    // -- tasks --------------------------------------------------------------

    /// Allocate the next `task-<N>` id. Serialized by an advisory lock so
    /// concurrent creators never collide.
    fn next_id(&self) -> Result<String> {
        let lock_file = lock::acquire_file_lock(&self.counter_lock_path())?;

        #[derive(serde::Deserialize, serde::Serialize)]
        struct Counter {
            next_id: u32,
        }

        let data = fs::read_to_string(self.counter_path())?;
        let mut counter: Counter = serde_json::from_str(&data).map_err(|e| {
            PimError::CrewCorruptFile(self.counter_path().display().to_string(), e.to_string())
        })?;
        let id = counter.next_id;
        counter.next_id += 1;
        fs::write(self.counter_path(), serde_json::to_string(&counter)?)?;

        lock::release_file_lock(lock_file)?;
        Ok(format!("task-{id}"))
    }

    /// Create one task. Dependencies must name existing tasks.
    pub fn create_task(
        &self,
        title: &str,
        depends_on: Vec<String>,
        body: &str,
    ) -> Result<CrewTask> {
        self.ensure_dirs()?;
        for dep in &depends_on {
            if !self.task_path(dep).exists() {
                return Err(PimError::UnknownTask(dep.clone()));
            }
        }
        let id = self.next_id()?;
        let task = CrewTask::new(id, title, depends_on);
        self.write_task(&task)?;
        fs::write(self.task_body_path(&task.id), body)?;
        Ok(task)
    }

    /// Import a whole plan: assign ids in draft order, validate every
    /// dependency reference and reject cycles before anything is written.
    pub fn import_plan(
        &self,
        prd_path: Option<&str>,
        plan_body: &str,
        drafts: &[TaskDraft],
    ) -> Result<Vec<CrewTask>> {
        self.ensure_dirs()?;

        let existing = self.list_tasks()?;
        let start = existing.iter().map(|t| t.number()).max().unwrap_or(0) + 1;

        // Draft references may be positional ("1") or full ids ("task-1").
        let mut tasks: Vec<CrewTask> = Vec::with_capacity(drafts.len());
        let known: HashSet<String> = existing
            .iter()
            .map(|t| t.id.clone())
            .chain((0..drafts.len()).map(|i| format!("task-{}", start + i as u32)))
            .collect();
        for (i, draft) in drafts.iter().enumerate() {
            let id = format!("task-{}", start + i as u32);
            let deps: Vec<String> = draft
                .depends_on
                .iter()
                .map(|d| normalize_task_ref(d))
                .collect();
            for dep in &deps {
                if !known.contains(dep) {
                    return Err(PimError::UnknownTask(dep.clone()));
                }
            }
            tasks.push(CrewTask::new(id, draft.title.clone(), deps));
        }

        let mut graph: Vec<&CrewTask> = existing.iter().chain(tasks.iter()).collect();
        graph.sort_by_key(|t| t.number());
        check_cycles(&graph)?;

        let plan = Plan {
            prd_path: prd_path.map(String::from),
            created_at: Utc::now(),
            progress: String::new(),
            extensions: serde_json::Map::new(),
        };
        self.write_plan(&plan, plan_body)?;
        for (task, draft) in tasks.iter().zip(drafts) {
            self.write_task(task)?;
            fs::write(self.task_body_path(&task.id), &draft.body)?;
        }
        // Keep the counter ahead of imported ids.
        let _ = self.bump_counter_to(start + drafts.len() as u32);
        Ok(tasks)
    }

    fn bump_counter_to(&self, next: u32) -> Result<()> {
        let lock_file = lock::acquire_file_lock(&self.counter_lock_path())?;
        fs::write(
            self.counter_path(),
            serde_json::json!({ "next_id": next }).to_string(),
        )?;
        lock::release_file_lock(lock_file)?;
        Ok(())
    }

    pub fn read_task(&self, id: &str) -> Result<CrewTask> {
        let path = self.task_path(id);
        if !path.exists() {
            return Err(PimError::UnknownTask(id.to_string()));
        }
        let content = fs::read_to_string(&path)?;
        serde_json::from_str(&content)
            .map_err(|e| PimError::CrewCorruptFile(path.display().to_string(), e.to_string()))
    }

    pub fn read_task_body(&self, id: &str) -> Result<String> {
        let path = self.task_body_path(id);
        if !path.exists() {
            return Ok(String::new());
        }
        Ok(fs::read_to_string(&path)?)
    }

    /// Persist a task, enforcing the status invariants: `done` requires a
    /// summary, `blocked` requires a reason.
    pub fn write_task(&self, task: &CrewTask) -> Result<()> {
        match task.status {
            TaskStatus::Done if task.summary.is_none() => {
                return Err(PimError::InvalidTransition {
                    task: task.id.clone(),
                    from: task.status.to_string(),
                    to: "done without summary".into(),
                });
            }
            TaskStatus::Blocked if task.blocked_reason.is_none() => {
                return Err(PimError::InvalidTransition {
                    task: task.id.clone(),
                    from: task.status.to_string(),
                    to: "blocked without reason".into(),
                });
            }
            _ => {}
        }
        let mut task = task.clone();
        task.updated_at = Utc::now();
        write_atomic(
            &self.task_path(&task.id),
            serde_json::to_string_pretty(&task)?.as_bytes(),
        )
    }

    /// All tasks in ascending numeric id order, skipping corrupt files.
    pub fn list_tasks(&self) -> Result<Vec<CrewTask>> {
        let dir = self.tasks_dir();
        if !dir.exists() {
            return Ok(vec![]);
        }
        let mut tasks = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Ok(content) = fs::read_to_string(&path) else {
                continue;
            };
            if let Ok(task) = serde_json::from_str::<CrewTask>(&content) {
                tasks.push(task);
            }
        }
        tasks.sort_by_key(|t| t.number());
        Ok(tasks)
    }

    /// Record the context of a block for later unblocking.
    pub fn write_block_context(&self, id: &str, markdown: &str) -> Result<()> {
        self.ensure_dirs()?;
        fs::write(self.block_path(id), markdown)?;
        Ok(())
    }
}

fn normalize_task_ref(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.chars().all(|c| c.is_ascii_digit()) && !trimmed.is_empty() {
        format!("task-{trimmed}")
    } else {
        trimmed.to_string()
    }
}

/// Reject dependency cycles with a DFS over the combined graph.
pub fn check_cycles(tasks: &[&CrewTask]) -> Result<()> {
    let by_id: HashMap<&str, &CrewTask> = tasks.iter().map(|t| (t.id.as_str(), *t)).collect();
    let mut done: HashSet<&str> = HashSet::new();
    for task in tasks {
        let mut path: Vec<&str> = vec![];
        visit(task, &by_id, &mut done, &mut path)?;
    }
    Ok(())
}

fn visit<'a>(
    task: &'a CrewTask,
    by_id: &HashMap<&'a str, &'a CrewTask>,
    done: &mut HashSet<&'a str>,
    path: &mut Vec<&'a str>,
) -> Result<()> {
    if done.contains(task.id.as_str()) {
        return Ok(());
    }
    if path.contains(&task.id.as_str()) {
        return Err(PimError::CycleDetected(task.id.clone()));
    }
    path.push(&task.id);
    for dep in &task.depends_on {
        if let Some(dep_task) = by_id.get(dep.as_str()) {
            visit(dep_task, by_id, done, path)?;
        }
    }
    path.pop();
    done.insert(&task.id);
    Ok(())
}

// ---------------------------------------------------------------------------
// Planner output parsing
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct PlannedTasks {
    tasks: Vec<PlannedTask>,
}

#[derive(Deserialize)]
struct PlannedTask {
    title: String,
    #[serde(default, alias = "dependsOn")]
    depends_on: Vec<serde_json::Value>,
    #[serde(default, alias = "body")]
    spec: String,
}

fn json_block_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```json\s*(.*?)```").expect("valid regex"))
}

fn task_heading_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^#{2,4}\s*Task\s+(\d+)\s*[:\-—]\s*(.+)$").expect("valid regex")
    })
}

fn depends_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?im)^\**Depends\s+on\**:?\s*(.+)$").expect("valid regex"))
}

/// Parse planner output into task drafts.
///
/// A fenced ```json block with a `tasks` array is preferred; otherwise a
/// markdown fallback scans `## Task N: Title` headings with optional
/// `Depends on:` lines, so the planner format can evolve without breaking
/// downstream consumers.
pub fn parse_planner_output(markdown: &str) -> Vec<TaskDraft> {
    if let Some(captures) = json_block_re().captures(markdown) {
        if let Ok(planned) = serde_json::from_str::<PlannedTasks>(&captures[1]) {
            return planned
                .tasks
                .into_iter()
                .map(|t| TaskDraft {
                    title: t.title,
                    depends_on: t
                        .depends_on
                        .iter()
                        .filter_map(|v| match v {
                            serde_json::Value::String(s) => Some(normalize_task_ref(s)),
                            serde_json::Value::Number(n) => {
                                n.as_u64().map(|n| format!("task-{n}"))
                            }
                            _ => None,
                        })
                        .collect(),
                    body: t.spec,
                })
                .collect();
        }
    }

    // Markdown fallback
    let mut drafts = Vec::new();
    let headings: Vec<_> = task_heading_re().captures_iter(markdown).collect();
    for (i, captures) in headings.iter().enumerate() {
        let start = captures.get(0).map(|m| m.end()).unwrap_or(0);
        let end = headings
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map(|m| m.start())
            .unwrap_or(markdown.len());
        let section = &markdown[start..end];

        let depends_on = depends_line_re()
            .captures(section)
            .map(|c| {
                c[1].split(',')
                    .map(|d| normalize_task_ref(d.trim().trim_end_matches('.')))
                    .filter(|d| !d.is_empty() && d.as_str() != "none" && d.as_str() != "task-none")
                    .collect()
            })
            .unwrap_or_default();

        let body = depends_line_re().replace(section, "").trim().to_string();

        drafts.push(TaskDraft {
            title: captures[2].trim().to_string(),
            depends_on,
            body,
        });
    }
    drafts
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, CrewStore) {
        let dir = tempdir().unwrap();
        let store = CrewStore::open(dir.path());
        store.ensure_dirs().unwrap();
        (dir, store)
    }

    #[test]
    fn create_and_read_tasks_with_sequential_ids() {
        let (_dir, store) = setup();
        let t1 = store.create_task("First", vec![], "spec body").unwrap();
        let t2 = store.create_task("Second", vec![t1.id.clone()], "").unwrap();
        assert_eq!(t1.id, "task-1");
        assert_eq!(t2.id, "task-2");
        assert_eq!(store.read_task_body("task-1").unwrap(), "spec body");

        let all = store.list_tasks().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, "task-1");
    }

    #[test]
    fn create_task_rejects_unknown_dependency() {
        let (_dir, store) = setup();
        let err = store
            .create_task("Orphan", vec!["task-9".into()], "")
            .unwrap_err();
        assert!(matches!(err, PimError::UnknownTask(_)));
    }

    #[test]
    fn done_requires_summary_and_blocked_requires_reason() {
        let (_dir, store) = setup();
        let mut task = store.create_task("T", vec![], "").unwrap();

        task.status = TaskStatus::Done;
        assert!(matches!(
            store.write_task(&task).unwrap_err(),
            PimError::InvalidTransition { .. }
        ));
        task.summary = Some("did the thing".into());
        store.write_task(&task).unwrap();

        task.status = TaskStatus::Blocked;
        task.blocked_reason = None;
        assert!(matches!(
            store.write_task(&task).unwrap_err(),
            PimError::InvalidTransition { .. }
        ));
        task.blocked_reason = Some("missing dependency".into());
        store.write_task(&task).unwrap();
    }

    #[test]
    fn read_missing_task_is_unknown() {
        let (_dir, store) = setup();
        assert!(matches!(
            store.read_task("task-404").unwrap_err(),
            PimError::UnknownTask(_)
        ));
    }

    #[test]
    fn read_plan_missing_is_no_plan() {
        let (_dir, store) = setup();
        assert!(matches!(store.read_plan().unwrap_err(), PimError::NoPlan));
    }

    #[test]
    fn import_plan_assigns_ids_and_resolves_refs() {
        let (_dir, store) = setup();
        let drafts = vec![
            TaskDraft {
                title: "Parse config".into(),
                depends_on: vec![],
                body: "parse it".into(),
            },
            TaskDraft {
                title: "Wire CLI".into(),
                depends_on: vec!["1".into()],
                body: "wire it".into(),
            },
            TaskDraft {
                title: "Integration".into(),
                depends_on: vec!["task-1".into(), "task-2".into()],
                body: "test it".into(),
            },
        ];
        let tasks = store.import_plan(Some("prd.md"), "# Plan", &drafts).unwrap();
        assert_eq!(tasks.len(), 3);
        assert_eq!(tasks[1].depends_on, vec!["task-1"]);
        assert_eq!(tasks[2].depends_on, vec!["task-1", "task-2"]);

        let plan = store.read_plan().unwrap();
        assert_eq!(plan.prd_path.as_deref(), Some("prd.md"));

        // Subsequent creation continues the sequence
        let t4 = store.create_task("Extra", vec![], "").unwrap();
        assert_eq!(t4.id, "task-4");
    }

    #[test]
    fn import_plan_rejects_cycles_without_writing() {
        let (_dir, store) = setup();
        let drafts = vec![
            TaskDraft {
                title: "A".into(),
                depends_on: vec!["task-2".into()],
                body: String::new(),
            },
            TaskDraft {
                title: "B".into(),
                depends_on: vec!["task-1".into()],
                body: String::new(),
            },
        ];
        let err = store.import_plan(None, "", &drafts).unwrap_err();
        assert!(matches!(err, PimError::CycleDetected(_)));
        assert!(store.list_tasks().unwrap().is_empty());
        assert!(matches!(store.read_plan().unwrap_err(), PimError::NoPlan));
    }

    #[test]
    fn import_plan_rejects_unknown_reference() {
        let (_dir, store) = setup();
        let drafts = vec![TaskDraft {
            title: "A".into(),
            depends_on: vec!["task-7".into()],
            body: String::new(),
        }];
        let err = store.import_plan(None, "", &drafts).unwrap_err();
        assert!(matches!(err, PimError::UnknownTask(_)));
    }

    #[test]
    fn parse_planner_json_block() {
        let md = r#"
Some prose from the planner.

```json
{"tasks": [
  {"title": "Build store", "depends_on": [], "spec": "store body"},
  {"title": "Build scheduler", "dependsOn": [1], "spec": "sched body"}
]}
```
"#;
        let drafts = parse_planner_output(md);
        assert_eq!(drafts.len(), 2);
        assert_eq!(drafts[0].title, "Build store");
        assert_eq!(drafts[1].depends_on, vec!["task-1"]);
        assert_eq!(drafts[1].body, "sched body");
    }

    #[test]
    fn parse_planner_markdown_fallback() {
        let md = "\
# The plan

## Task 1: Build the store

Write the persistence layer.

## Task 2: Build the scheduler

Depends on: task-1

Wave execution over the DAG.

## Task 3: End-to-end

Depends on: 1, 2

Wire both together.
";
        let drafts = parse_planner_output(md);
        assert_eq!(drafts.len(), 3);
        assert_eq!(drafts[0].title, "Build the store");
        assert!(drafts[0].depends_on.is_empty());
        assert_eq!(drafts[1].depends_on, vec!["task-1"]);
        assert_eq!(drafts[2].depends_on, vec!["task-1", "task-2"]);
        assert!(drafts[1].body.contains("Wave execution"));
        assert!(!drafts[1].body.contains("Depends on"));
    }

    #[test]
    fn parse_planner_garbage_yields_nothing() {
        assert!(parse_planner_output("no tasks here").is_empty());
    }

    #[test]
    fn check_cycles_accepts_dag() {
        let a = CrewTask::new("task-1", "a", vec![]);
        let b = CrewTask::new("task-2", "b", vec!["task-1".into()]);
        let c = CrewTask::new("task-3", "c", vec!["task-1".into(), "task-2".into()]);
        check_cycles(&[&a, &b, &c]).unwrap();
    }

    #[test]
    fn check_cycles_rejects_self_reference() {
        let a = CrewTask::new("task-1", "a", vec!["task-1".into()]);
        assert!(matches!(
            check_cycles(&[&a]).unwrap_err(),
            PimError::CycleDetected(_)
        ));
    }

    #[test]
    fn project_config_overlay() {
        let (_dir, store) = setup();
        fs::write(
            store.config_path(),
            r#"{"concurrency": {"workers": 5}, "work": {"max_waves": 7}}"#,
        )
        .unwrap();
        let cfg = store.load_config(&CrewConfig::default());
        assert_eq!(cfg.concurrency.workers, 5);
        assert_eq!(cfg.work.max_waves, 7);
        assert_eq!(cfg.review.max_iterations, 3);
    }
}
