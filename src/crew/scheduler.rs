use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde::Serialize;

use crate::config::{CrewConfig, ReviewConfig, TruncationConfig};
use crate::crew::model::{CrewTask, ReviewVerdict, TaskStatus, Verdict};
use crate::crew::store::CrewStore;
use crate::crew::verdict::parse_verdict;
use crate::crew::worker::{Reviewer, Worker, WorkerOutcome};
use crate::error::{PimError, Result};

/// Sink for crew task transitions (feed events, UI notices). No-op by
/// default.
pub trait CrewEvents: Send + Sync {
    fn task_event(&self, kind: &str, task_id: &str, detail: &str);
}

struct NoEvents;

impl CrewEvents for NoEvents {
    fn task_event(&self, _kind: &str, _task_id: &str, _detail: &str) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    AllDone,
    NothingReady,
    MaxWaves,
    StoppedOnBlock,
    SingleWave,
}

#[derive(Debug, Serialize)]
pub struct WaveReport {
    pub wave: u32,
    pub started: Vec<String>,
    pub done: Vec<String>,
    pub retried: Vec<String>,
    pub blocked: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct RunReport {
    pub waves: Vec<WaveReport>,
    pub reason: StopReason,
}

/// How one attempt (worker plus optional review loop) resolved.
enum Resolution {
    Done {
        summary: String,
        review: Option<ReviewVerdict>,
    },
    NeedsWork {
        verdict: ReviewVerdict,
    },
    Blocked {
        reason: String,
        review: Option<ReviewVerdict>,
    },
    Failed {
        error: String,
    },
}

/// Drives the task DAG to completion in waves of bounded parallelism.
///
/// A wave selects up to `workers` ready tasks (ascending numeric id),
/// spawns one worker session each, and fully drains before the next wave
/// starts.
pub struct Scheduler<'a> {
    store: &'a CrewStore,
    config: CrewConfig,
    worker: Arc<dyn Worker>,
    reviewer: Option<Arc<dyn Reviewer>>,
    events: Arc<dyn CrewEvents>,
}

impl<'a> Scheduler<'a> {
    pub fn new(store: &'a CrewStore, config: CrewConfig, worker: Arc<dyn Worker>) -> Self {
        Self {
            store,
            config,
            worker,
            reviewer: None,
            events: Arc::new(NoEvents),
        }
    }

    pub fn with_reviewer(mut self, reviewer: Arc<dyn Reviewer>) -> Self {
        self.reviewer = Some(reviewer);
        self
    }

    pub fn with_events(mut self, events: Arc<dyn CrewEvents>) -> Self {
        self.events = events;
        self
    }

    /// Tasks whose status is `todo` and whose dependencies are all `done`.
    /// Unresolvable dependencies leave a task permanently gated.
    fn ready_tasks(tasks: &[CrewTask]) -> Vec<&CrewTask> {
        let by_id: HashMap<&str, &CrewTask> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();
        let mut ready: Vec<&CrewTask> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Todo)
            .filter(|t| {
                t.depends_on.iter().all(|dep| {
                    by_id
                        .get(dep.as_str())
                        .is_some_and(|d| d.status == TaskStatus::Done)
                })
            })
            .collect();
        ready.sort_by_key(|t| t.number());
        ready
    }

    /// Run waves until no todo tasks remain, nothing is ready, or
    /// `max_waves` is reached. Non-autonomous mode runs exactly one wave.
    pub fn run(&self, autonomous: bool) -> Result<RunReport> {
        let mut waves = Vec::new();
        let max_waves = if autonomous {
            self.config.work.max_waves
        } else {
            1
        };

        loop {
            let tasks = self.store.list_tasks()?;
            if !tasks.iter().any(|t| t.status == TaskStatus::Todo) {
                return Ok(RunReport {
                    waves,
                    reason: StopReason::AllDone,
                });
            }
            if Self::ready_tasks(&tasks).is_empty() {
                return Ok(RunReport {
                    waves,
                    reason: StopReason::NothingReady,
                });
            }
            if waves.len() as u32 >= max_waves {
                return Ok(RunReport {
                    waves,
                    reason: if autonomous {
                        StopReason::MaxWaves
                    } else {
                        StopReason::SingleWave
                    },
                });
            }

            let report = self.run_wave(waves.len() as u32 + 1)?;
            let blocked_this_wave = !report.blocked.is_empty();
            waves.push(report);

            if blocked_this_wave && self.config.work.stop_on_block {
                return Ok(RunReport {
                    waves,
                    reason: StopReason::StoppedOnBlock,
                });
            }
        }
    }

    /// One wave: select, spawn, drain, record.
    fn run_wave(&self, wave: u32) -> Result<WaveReport> {
        let tasks = self.store.list_tasks()?;
        let selected: Vec<CrewTask> = Self::ready_tasks(&tasks)
            .into_iter()
            .take(self.config.concurrency.workers.max(1))
            .cloned()
            .collect();

        let mut report = WaveReport {
            wave,
            started: vec![],
            done: vec![],
            retried: vec![],
            blocked: vec![],
        };

        let mut handles = Vec::new();
        for (slot, task) in selected.iter().enumerate() {
            let mut task = task.clone();
            let worker_name = format!("crew-worker-{}", slot + 1);
            task.status = TaskStatus::InProgress;
            task.assigned_to = Some(worker_name);
            task.attempt_count += 1;
            self.store.write_task(&task)?;
            report.started.push(task.id.clone());
            self.events
                .task_event("crew-task-start", &task.id, &task.title);

            let body = self.store.read_task_body(&task.id)?;
            let worker = Arc::clone(&self.worker);
            let reviewer = self.reviewer.clone();
            let review_cfg = self.config.review.clone();
            let truncation = self.config.truncation.clone();
            handles.push(std::thread::spawn(move || {
                let resolution = resolve(
                    &task,
                    &body,
                    worker.as_ref(),
                    reviewer.as_deref(),
                    &review_cfg,
                    &truncation,
                );
                (task.id.clone(), resolution)
            }));
        }

        // The wave ends only when every spawned worker has terminated.
        for handle in handles {
            let (task_id, resolution) = handle.join().map_err(|_| {
                PimError::CrewCorruptFile("(worker thread)".into(), "worker thread panicked".into())
            })?;
            self.apply(&task_id, resolution, &mut report)?;
        }
        Ok(report)
    }

    fn apply(&self, task_id: &str, resolution: Resolution, report: &mut WaveReport) -> Result<()> {
        let mut task = self.store.read_task(task_id)?;
        match resolution {
            Resolution::Done { summary, review } => {
                task.status = TaskStatus::Done;
                task.summary = Some(summary.clone());
                task.last_review = review;
                task.assigned_to = None;
                task.blocked_reason = None;
                self.store.write_task(&task)?;
                report.done.push(task.id.clone());
                self.events.task_event("crew-task-done", &task.id, &summary);
            }
            Resolution::NeedsWork { verdict } => {
                // Review budget exhausted: back to the pool with the
                // verdict attached for the next attempt.
                task.status = TaskStatus::Todo;
                task.last_review = Some(verdict);
                task.assigned_to = None;
                self.store.write_task(&task)?;
                report.retried.push(task.id.clone());
            }
            Resolution::Blocked { reason, review } => {
                self.block(&mut task, &reason, review)?;
                report.blocked.push(task.id.clone());
            }
            Resolution::Failed { error } => {
                if task.attempt_count < self.config.work.max_attempts_per_task {
                    task.status = TaskStatus::Todo;
                    task.assigned_to = None;
                    self.store.write_task(&task)?;
                    report.retried.push(task.id.clone());
                } else {
                    self.block(&mut task, "exceeded max attempts", None)?;
                    report.blocked.push(task.id.clone());
                }
                self.events.task_event("crew-task-fail", &task.id, &error);
            }
        }
        Ok(())
    }

    fn block(
        &self,
        task: &mut CrewTask,
        reason: &str,
        review: Option<ReviewVerdict>,
    ) -> Result<()> {
        task.status = TaskStatus::Blocked;
        task.blocked_reason = Some(reason.to_string());
        task.last_review = review.or(task.last_review.take());
        task.assigned_to = None;
        self.store.write_task(task)?;
        let context = format!(
            "# {} blocked\n\nReason: {}\n\nAttempts: {}\n",
            task.id, reason, task.attempt_count
        );
        let _ = self.store.write_block_context(&task.id, &context);
        self.events.task_event("crew-task-block", &task.id, reason);
        Ok(())
    }

    // -- manual operations --------------------------------------------------

    /// Manually start a task (human-driven flows). Enforces dependency
    /// satisfaction and the attempt budget.
    pub fn manual_start(&self, task_id: &str, assignee: &str) -> Result<CrewTask> {
        let tasks = self.store.list_tasks()?;
        let by_id: HashMap<&str, &CrewTask> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();
        let mut task = self.store.read_task(task_id)?;

        if task.status != TaskStatus::Todo {
            return Err(PimError::InvalidTransition {
                task: task.id,
                from: task.status.to_string(),
                to: "in_progress".into(),
            });
        }
        for dep in &task.depends_on {
            let satisfied = by_id
                .get(dep.as_str())
                .is_some_and(|d| d.status == TaskStatus::Done);
            if !satisfied {
                return Err(PimError::DependencyUnmet {
                    task: task.id.clone(),
                    unmet: dep.clone(),
                });
            }
        }
        if task.attempt_count >= self.config.work.max_attempts_per_task {
            return Err(PimError::AttemptsExceeded {
                task: task.id,
                attempts: task.attempt_count,
            });
        }

        task.status = TaskStatus::InProgress;
        task.assigned_to = Some(assignee.to_string());
        task.attempt_count += 1;
        self.store.write_task(&task)?;
        self.events
            .task_event("crew-task-start", &task.id, &task.title);
        Ok(task)
    }

    pub fn manual_done(&self, task_id: &str, summary: &str) -> Result<CrewTask> {
        let mut task = self.store.read_task(task_id)?;
        if task.status != TaskStatus::InProgress {
            return Err(PimError::InvalidTransition {
                task: task.id,
                from: task.status.to_string(),
                to: "done".into(),
            });
        }
        task.status = TaskStatus::Done;
        task.summary = Some(summary.to_string());
        task.assigned_to = None;
        self.store.write_task(&task)?;
        self.events.task_event("crew-task-done", &task.id, summary);
        Ok(task)
    }

    pub fn manual_block(&self, task_id: &str, reason: &str) -> Result<CrewTask> {
        let mut task = self.store.read_task(task_id)?;
        if task.status != TaskStatus::InProgress {
            return Err(PimError::InvalidTransition {
                task: task.id,
                from: task.status.to_string(),
                to: "blocked".into(),
            });
        }
        self.block(&mut task, reason, None)?;
        Ok(task)
    }

    /// Apply a reviewer's verdict to a done task: SHIP confirms,
    /// NEEDS_WORK reverts to todo, MAJOR_RETHINK blocks.
    pub fn apply_review(&self, task_id: &str, verdict: ReviewVerdict) -> Result<CrewTask> {
        let mut task = self.store.read_task(task_id)?;
        if task.status != TaskStatus::Done {
            return Err(PimError::InvalidTransition {
                task: task.id,
                from: task.status.to_string(),
                to: format!("review:{}", verdict.verdict),
            });
        }
        match verdict.verdict {
            Verdict::Ship => {
                task.last_review = Some(verdict);
                self.store.write_task(&task)?;
            }
            Verdict::NeedsWork => {
                task.status = TaskStatus::Todo;
                task.summary = None;
                task.last_review = Some(verdict);
                self.store.write_task(&task)?;
            }
            Verdict::MajorRethink => {
                let reason = if verdict.summary.is_empty() {
                    "major rethink required".to_string()
                } else {
                    verdict.summary.clone()
                };
                task.summary = None;
                self.block(&mut task, &reason, Some(verdict))?;
            }
        }
        Ok(task)
    }

    /// Unblock: blocked -> todo, clearing the reason.
    pub fn unblock(&self, task_id: &str) -> Result<CrewTask> {
        let mut task = self.store.read_task(task_id)?;
        if task.status != TaskStatus::Blocked {
            return Err(PimError::InvalidTransition {
                task: task.id,
                from: task.status.to_string(),
                to: "todo".into(),
            });
        }
        task.status = TaskStatus::Todo;
        task.blocked_reason = None;
        self.store.write_task(&task)?;
        Ok(task)
    }

    /// Reset a task to `todo`, clearing attempt/assignment/review state.
    /// With `cascade`, every transitive dependent is reset too; edges are
    /// preserved and no other task is touched.
    pub fn reset(&self, task_id: &str, cascade: bool) -> Result<Vec<String>> {
        let tasks = self.store.list_tasks()?;
        if !tasks.iter().any(|t| t.id == task_id) {
            return Err(PimError::UnknownTask(task_id.to_string()));
        }

        let mut targets: BTreeSet<String> = BTreeSet::new();
        targets.insert(task_id.to_string());
        if cascade {
            let mut frontier = vec![task_id.to_string()];
            while let Some(current) = frontier.pop() {
                for task in &tasks {
                    if task.depends_on.contains(&current) && targets.insert(task.id.clone()) {
                        frontier.push(task.id.clone());
                    }
                }
            }
        }

        let mut reset_ids: Vec<String> = targets.into_iter().collect();
        reset_ids.sort_by_key(|id| crate::crew::model::task_number(id).unwrap_or(u32::MAX));
        for id in &reset_ids {
            let mut task = self.store.read_task(id)?;
            task.status = TaskStatus::Todo;
            task.attempt_count = 0;
            task.assigned_to = None;
            task.summary = None;
            task.last_review = None;
            task.blocked_reason = None;
            self.store.write_task(&task)?;
        }
        Ok(reset_ids)
    }
}

/// Run the worker and the optional review loop for one attempt. Pure with
/// respect to the store; runs inside the wave's worker thread.
fn resolve(
    task: &CrewTask,
    body: &str,
    worker: &dyn Worker,
    reviewer: Option<&dyn Reviewer>,
    review_cfg: &ReviewConfig,
    truncation: &TruncationConfig,
) -> Resolution {
    let outcome = worker.run(task, body, task.last_review.as_ref());
    let mut summary = match outcome {
        WorkerOutcome::Failed { error } => return Resolution::Failed { error },
        WorkerOutcome::Blocked { reason } => {
            return Resolution::Blocked {
                reason,
                review: None,
            };
        }
        WorkerOutcome::Done { summary } => truncate_bytes(&summary, truncation.worker_output_bytes),
    };

    if !review_cfg.enabled {
        return Resolution::Done {
            summary,
            review: None,
        };
    }
    let Some(reviewer) = reviewer else {
        return Resolution::Done {
            summary,
            review: None,
        };
    };

    for iteration in 1..=review_cfg.max_iterations {
        let Some(markdown) = reviewer.review(task, &summary) else {
            // Reviewer unavailable: the attempt stands.
            return Resolution::Done {
                summary,
                review: None,
            };
        };
        let markdown = truncate_bytes(&markdown, truncation.review_output_bytes);
        let verdict = parse_verdict(&markdown);
        match verdict.verdict {
            Verdict::Ship => {
                return Resolution::Done {
                    summary,
                    review: Some(verdict),
                };
            }
            Verdict::MajorRethink => {
                let reason = if verdict.summary.is_empty() {
                    "major rethink required".to_string()
                } else {
                    verdict.summary.clone()
                };
                return Resolution::Blocked {
                    reason,
                    review: Some(verdict),
                };
            }
            Verdict::NeedsWork => {
                if iteration == review_cfg.max_iterations {
                    return Resolution::NeedsWork { verdict };
                }
                match worker.run(task, body, Some(&verdict)) {
                    WorkerOutcome::Done { summary: next } => {
                        summary = truncate_bytes(&next, truncation.worker_output_bytes);
                    }
                    WorkerOutcome::Blocked { reason } => {
                        return Resolution::Blocked {
                            reason,
                            review: Some(verdict),
                        };
                    }
                    WorkerOutcome::Failed { error } => return Resolution::Failed { error },
                }
            }
        }
    }
    Resolution::Done {
        summary,
        review: None,
    }
}

/// Byte-capped truncation on a char boundary.
fn truncate_bytes(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}
