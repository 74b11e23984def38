use std::io::{Read, Write};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use crate::crew::model::{CrewTask, ReviewVerdict};

/// How a worker session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
    Done { summary: String },
    Blocked { reason: String },
    Failed { error: String },
}

/// Executes one task attempt. Implementations spawn worker sessions; tests
/// inject scripted behavior.
pub trait Worker: Send + Sync {
    fn run(&self, task: &CrewTask, spec_body: &str, review: Option<&ReviewVerdict>)
    -> WorkerOutcome;
}

/// Produces review markdown for a completed attempt. `None` means review
/// is unavailable and the attempt stands.
pub trait Reviewer: Send + Sync {
    fn review(&self, task: &CrewTask, summary: &str) -> Option<String>;
}

/// Spawns a configured command per task: the task context goes to stdin,
/// the declaration comes back on stdout.
///
/// Expected declaration lines:
/// ```text
/// Declare: done
/// Summary: <one line>
/// ```
/// or `Declare: blocked` with a `Reason:` line. Anything else (including a
/// non-zero exit) is a failure the scheduler can retry.
pub struct CommandWorker {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
}

impl CommandWorker {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: vec![],
            timeout: Duration::from_secs(600),
        }
    }
}

impl Worker for CommandWorker {
    fn run(
        &self,
        task: &CrewTask,
        spec_body: &str,
        review: Option<&ReviewVerdict>,
    ) -> WorkerOutcome {
        let mut input = format!("# {} — {}\n\n{}\n", task.id, task.title, spec_body);
        if let Some(review) = review {
            input.push_str("\n## Review issues from the previous attempt\n");
            for issue in &review.issues {
                input.push_str(&format!("- {issue}\n"));
            }
        }

        match run_command(&self.program, &self.args, &task.id, &input, self.timeout) {
            Ok((true, stdout)) => parse_declaration(&stdout),
            Ok((false, stdout)) => WorkerOutcome::Failed {
                error: format!("worker exited non-zero: {}", tail(&stdout, 400)),
            },
            Err(err) => WorkerOutcome::Failed { error: err },
        }
    }
}

/// Spawns a review command: task id + summary on stdin, verdict markdown
/// on stdout.
pub struct CommandReviewer {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
}

impl CommandReviewer {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: vec![],
            timeout: Duration::from_secs(300),
        }
    }
}

impl Reviewer for CommandReviewer {
    fn review(&self, task: &CrewTask, summary: &str) -> Option<String> {
        let input = format!("# Review {}\n\nDeclared summary: {summary}\n", task.id);
        match run_command(&self.program, &self.args, &task.id, &input, self.timeout) {
            Ok((true, stdout)) => Some(stdout),
            _ => None,
        }
    }
}

fn run_command(
    program: &str,
    args: &[String],
    task_id: &str,
    input: &str,
    timeout: Duration,
) -> std::result::Result<(bool, String), String> {
    let mut child = Command::new(program)
        .args(args)
        .arg(task_id)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| format!("spawn {program}: {e}"))?;

    // Feed stdin and drain stdout off-thread so a chatty worker never
    // deadlocks against a full pipe while we wait for it to exit.
    let stdin_thread = child.stdin.take().map(|mut stdin| {
        let input = input.to_string();
        std::thread::spawn(move || {
            let _ = stdin.write_all(input.as_bytes());
        })
    });
    let stdout_thread = child.stdout.take().map(|mut out| {
        std::thread::spawn(move || {
            let mut buf = String::new();
            let _ = out.read_to_string(&mut buf);
            buf
        })
    });

    let status = wait_with_timeout(&mut child, timeout);
    if status.is_none() {
        terminate(&mut child);
    }

    let stdout = stdout_thread
        .and_then(|t| t.join().ok())
        .unwrap_or_default();
    if let Some(t) = stdin_thread {
        let _ = t.join();
    }

    match status {
        Some(status) => Ok((status, stdout)),
        None => Err(format!("worker timed out after {}s", timeout.as_secs())),
    }
}

fn wait_with_timeout(child: &mut Child, timeout: Duration) -> Option<bool> {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Some(status.success()),
            Ok(None) => {
                if Instant::now() >= deadline {
                    return None;
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(_) => return Some(false),
        }
    }
}

/// SIGTERM, a short grace period, then SIGKILL.
fn terminate(child: &mut Child) {
    #[cfg(unix)]
    unsafe {
        libc::kill(child.id() as i32, libc::SIGTERM);
    }
    let grace = Instant::now() + Duration::from_secs(2);
    while Instant::now() < grace {
        if matches!(child.try_wait(), Ok(Some(_))) {
            return;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    let _ = child.kill();
    let _ = child.wait();
}

/// Parse the worker's declaration out of its stdout.
pub fn parse_declaration(stdout: &str) -> WorkerOutcome {
    let mut declare: Option<&str> = None;
    let mut summary: Option<String> = None;
    let mut reason: Option<String> = None;
    for line in stdout.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("Declare:") {
            declare = Some(rest.trim());
        } else if let Some(rest) = trimmed.strip_prefix("Summary:") {
            summary = Some(rest.trim().to_string());
        } else if let Some(rest) = trimmed.strip_prefix("Reason:") {
            reason = Some(rest.trim().to_string());
        }
    }
    match declare {
        Some(d) if d.eq_ignore_ascii_case("done") => match summary.filter(|s| !s.is_empty()) {
            Some(summary) => WorkerOutcome::Done { summary },
            None => WorkerOutcome::Failed {
                error: "worker declared done without a summary".into(),
            },
        },
        Some(d) if d.eq_ignore_ascii_case("blocked") => WorkerOutcome::Blocked {
            reason: reason
                .filter(|r| !r.is_empty())
                .unwrap_or_else(|| "worker declared blocked without a reason".into()),
        },
        _ => WorkerOutcome::Failed {
            error: format!("no declaration in worker output: {}", tail(stdout, 200)),
        },
    }
}

fn tail(s: &str, max: usize) -> String {
    let trimmed = s.trim();
    if trimmed.len() <= max {
        trimmed.to_string()
    } else {
        let start = trimmed.len() - max;
        // Don't split a UTF-8 codepoint.
        let start = (start..trimmed.len())
            .find(|&i| trimmed.is_char_boundary(i))
            .unwrap_or(0);
        format!("...{}", &trimmed[start..])
    }
}
