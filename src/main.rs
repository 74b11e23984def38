use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use pim::config::Config;
use pim::crew::scheduler::Scheduler;
use pim::crew::store::{CrewStore, parse_planner_output};
use pim::crew::verdict::parse_verdict;
use pim::crew::worker::{CommandReviewer, CommandWorker};
use pim::error::Result;
use pim::messenger::{JoinOptions, Messenger};
use pim::output::{self, Format};
use pim::store::feed::FeedStore;
use pim::store::inbox::CollectingHandler;
use pim::store::paths::MessengerPaths;

#[derive(Parser)]
#[command(
    name = "pim",
    version,
    about = "Daemonless coordination mesh for agent processes sharing a working directory"
)]
struct Cli {
    /// Output format
    #[arg(long, global = true, value_enum, default_value = "json")]
    format: Format,
    /// Shorthand for --format pretty
    #[arg(long, global = true, hide = true)]
    pretty: bool,
    /// Coordination directory (default: $PI_MESSENGER_DIR or ~/.pi/agent/messenger)
    #[arg(long, global = true)]
    base: Option<PathBuf>,
    /// Act as this agent (default: $PI_AGENT_NAME)
    #[arg(long, global = true)]
    name: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register this agent in the mesh
    Join {
        /// Base for auto-generated names (probed as base, base2, ...)
        #[arg(long, default_value = "agent")]
        base_name: String,
        /// Session ID (auto-generated if omitted)
        #[arg(long)]
        session_id: Option<String>,
        /// Assigned model identifier
        #[arg(long)]
        model: Option<String>,
        /// Register as a human participant
        #[arg(long)]
        human: bool,
        /// Owning process id (default: $PI_AGENT_PID, then the parent process)
        #[arg(long)]
        pid: Option<u32>,
    },
    /// Unregister from the mesh
    Leave,
    /// Rename this agent, migrating its mailbox
    Rename {
        /// New agent name
        new_name: String,
    },
    /// List live agents (dead registrations are evicted)
    List {
        /// Only agents sharing this working directory
        #[arg(long)]
        cwd: bool,
    },
    /// Show a single agent's registration
    Whois {
        /// Agent name
        agent: String,
    },
    /// Show an agent's registration with liveness and stuckness
    Status {
        /// Agent name (default: the attached agent)
        agent: Option<String>,
    },
    /// Send a direct message
    Send {
        /// Recipient name
        to: String,
        /// Message text
        message: String,
        /// Message id this replies to
        #[arg(long)]
        reply_to: Option<String>,
    },
    /// Send a message to every live peer
    Broadcast {
        /// Message text
        message: String,
    },
    /// Read inbox messages
    Inbox {
        /// Consume (delete) messages after reading
        #[arg(long)]
        ack: bool,
    },
    /// Reserve path patterns for exclusive editing
    Reserve {
        /// Patterns to reserve (file path or directory prefix)
        #[arg(required = true)]
        patterns: Vec<String>,
        /// Reason shown to blocked peers
        #[arg(long)]
        reason: Option<String>,
    },
    /// Release reservations (all of them when no pattern is given)
    Release {
        /// Specific patterns to release
        patterns: Vec<String>,
    },
    /// Probe a path against peers' reservations
    Check {
        /// Candidate file path
        path: String,
    },
    /// Show the activity feed
    Feed {
        /// Show only the last N events
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Set or clear the custom status message
    SetStatus {
        /// Status text (omit to clear)
        text: Option<String>,
    },
    /// Shared-spec task claiming
    Swarm {
        #[command(subcommand)]
        action: SwarmAction,
    },
    /// Plan-driven task orchestration
    Crew {
        #[command(subcommand)]
        action: CrewAction,
    },
}

#[derive(Subcommand)]
enum SwarmAction {
    /// Claim a task (one non-stale claim per agent, everywhere)
    Claim {
        /// Spec path identifying the task list
        spec: String,
        /// Task id within the spec
        task: String,
        /// Why this task
        #[arg(long)]
        reason: Option<String>,
    },
    /// Release a claim
    Unclaim {
        spec: String,
        task: String,
    },
    /// Record a durable completion and release the claim
    Complete {
        spec: String,
        task: String,
        /// Completion notes
        #[arg(long)]
        notes: Option<String>,
    },
    /// Claims and completions for a spec (purges stale claims)
    Status {
        spec: String,
    },
}

#[derive(Subcommand)]
enum CrewAction {
    /// Import planner output (JSON block or markdown headings) as the plan
    Plan {
        /// Planner output file
        file: PathBuf,
        /// PRD document the plan was derived from
        #[arg(long)]
        prd: Option<String>,
    },
    /// Run the scheduler over the plan
    Work {
        /// Keep running waves until done, blocked, or max_waves
        #[arg(long)]
        autonomous: bool,
        /// Parallel worker sessions per wave (default from config)
        #[arg(long)]
        workers: Option<usize>,
        /// Worker command (task context on stdin, declaration on stdout)
        #[arg(long)]
        command: String,
        /// Reviewer command (verdict markdown on stdout)
        #[arg(long)]
        review_command: Option<String>,
        /// Per-worker timeout in seconds
        #[arg(long, default_value_t = 600)]
        timeout: u64,
    },
    /// List plan tasks
    Tasks,
    /// Show one task
    Task {
        id: String,
    },
    /// Manually start a ready task
    Start {
        id: String,
        /// Who is working on it
        #[arg(long)]
        assignee: Option<String>,
    },
    /// Manually finish an in-progress task
    Done {
        id: String,
        /// What was accomplished
        #[arg(long, required = true)]
        summary: String,
    },
    /// Manually block an in-progress task
    Block {
        id: String,
        /// Why it cannot proceed
        #[arg(long, required = true)]
        reason: String,
    },
    /// Reset a task to todo, optionally cascading to dependents
    Reset {
        id: String,
        /// Also reset every transitive dependent
        #[arg(long)]
        cascade: bool,
    },
    /// Return a blocked task to the pool
    Unblock {
        id: String,
    },
    /// Apply a reviewer's verdict file to a done task
    Review {
        id: String,
        /// Markdown verdict file
        file: PathBuf,
    },
}

fn open_messenger(cli: &Cli) -> Result<Messenger> {
    let base = cli
        .base
        .clone()
        .unwrap_or_else(MessengerPaths::default_base);
    let user_config = MessengerPaths::new(&base).user_config_path();
    let project_config = std::env::current_dir()
        .map(|cwd| cwd.join(".pi").join("messenger").join("config.json"))
        .unwrap_or_default();
    let config = Config::load(&user_config, &project_config);
    Messenger::open(base, config)
}

fn attach(messenger: &Messenger, cli: &Cli) -> Result<()> {
    let name = cli
        .name
        .clone()
        .or_else(pim::agent::requested_name)
        .ok_or_else(|| {
            pim::error::PimError::NotRegistered("(pass --name or set PI_AGENT_NAME)".into())
        })?;
    messenger.attach(&name)?;
    Ok(())
}

/// The registered pid should be the agent process, not this short-lived
/// CLI invocation: flag, then $PI_AGENT_PID, then our parent.
fn resolve_join_pid(flag: Option<u32>) -> u32 {
    if let Some(pid) = flag {
        return pid;
    }
    if let Some(pid) = std::env::var("PI_AGENT_PID")
        .ok()
        .and_then(|s| s.trim().parse().ok())
    {
        return pid;
    }
    #[cfg(unix)]
    {
        let ppid = unsafe { libc::getppid() };
        if ppid > 1 {
            return ppid as u32;
        }
    }
    std::process::id()
}

fn run(cli: Cli, format: Format) -> Result<()> {
    let messenger = open_messenger(&cli)?;

    match cli.command {
        Commands::Join {
            ref base_name,
            ref session_id,
            ref model,
            human,
            pid,
        } => {
            let reg = messenger.join(JoinOptions {
                name: cli.name.clone(),
                base: Some(base_name.clone()),
                session_id: session_id.clone(),
                model: model.clone(),
                is_human: human,
                pid: Some(resolve_join_pid(pid)),
            })?;
            output::print_registration(&reg, format)
        }
        Commands::Leave => {
            attach(&messenger, &cli)?;
            let name = messenger.leave()?;
            match format {
                Format::Json => println!("{}", serde_json::json!({"left": name})),
                Format::Pretty => println!("Left mesh: '{name}'"),
                Format::Minimal => println!("{name}"),
            }
            Ok(())
        }
        Commands::Rename { ref new_name } => {
            attach(&messenger, &cli)?;
            let handler = CollectingHandler::new();
            let reg = messenger.rename(new_name, &handler)?;
            let drained = handler.into_messages();
            match format {
                Format::Json => println!(
                    "{}",
                    serde_json::json!({"renamed": reg.name, "drained": drained})
                ),
                Format::Pretty => {
                    println!("Renamed to '{}'", reg.name);
                    if !drained.is_empty() {
                        println!("Delivered {} pending message(s) first:", drained.len());
                        output::print_messages(&drained, Format::Pretty)?;
                    }
                }
                Format::Minimal => println!("{}", reg.name),
            }
            Ok(())
        }
        Commands::List { cwd } => {
            let _ = attach(&messenger, &cli);
            let agents = messenger.list_active_agents(cwd)?;
            output::print_registrations(&agents, format)
        }
        Commands::Whois { ref agent } => {
            let reg = messenger.whois(agent)?;
            output::print_registration(&reg, format)
        }
        Commands::Status { ref agent } => {
            let name = match agent {
                Some(name) => name.clone(),
                None => {
                    attach(&messenger, &cli)?;
                    messenger.agent_name().unwrap_or_default()
                }
            };
            let report = messenger.status(&name)?;
            match format {
                Format::Json => println!("{}", serde_json::to_string(&report)?),
                Format::Pretty => {
                    output::print_registration(&report.registration, Format::Pretty)?;
                    println!(
                        "  alive: {} | stuck: {} | idle: {}s",
                        report.alive, report.stuck, report.idle_seconds
                    );
                }
                Format::Minimal => println!(
                    "{}\t{}",
                    report.registration.name,
                    if report.stuck { "stuck" } else { "ok" }
                ),
            }
            Ok(())
        }
        Commands::Send {
            ref to,
            ref message,
            ref reply_to,
        } => {
            attach(&messenger, &cli)?;
            let msg = messenger.send(to, message, reply_to.as_deref())?;
            match format {
                Format::Json => println!("{}", serde_json::to_string(&msg)?),
                Format::Pretty => println!("Sent to '{}': {}", to, message),
                Format::Minimal => println!("{}", msg.id),
            }
            Ok(())
        }
        Commands::Broadcast { ref message } => {
            attach(&messenger, &cli)?;
            let msgs = messenger.broadcast(message)?;
            match format {
                Format::Json => println!("{}", serde_json::to_string(&msgs)?),
                Format::Pretty => println!("Broadcast to {} agent(s)", msgs.len()),
                Format::Minimal => println!("{}", msgs.len()),
            }
            Ok(())
        }
        Commands::Inbox { ack } => {
            attach(&messenger, &cli)?;
            let msgs = if ack {
                let handler = CollectingHandler::new();
                messenger.flush_inbox(&handler)?;
                handler.into_messages()
            } else {
                messenger.peek_inbox()?
            };
            output::print_messages(&msgs, format)
        }
        Commands::Reserve {
            ref patterns,
            ref reason,
        } => {
            attach(&messenger, &cli)?;
            let reg = messenger.reserve(patterns.clone(), reason.as_deref())?;
            output::print_registration(&reg, format)
        }
        Commands::Release { ref patterns } => {
            attach(&messenger, &cli)?;
            let reg = messenger.release(patterns.clone())?;
            output::print_registration(&reg, format)
        }
        Commands::Check { ref path } => {
            let _ = attach(&messenger, &cli);
            let conflicts = messenger.check_conflict(path)?;
            match format {
                Format::Json => println!("{}", serde_json::to_string(&conflicts)?),
                Format::Pretty => {
                    if conflicts.is_empty() {
                        println!("No conflicts.");
                    } else {
                        for c in &conflicts {
                            let reason = c.reason.as_deref().unwrap_or("-");
                            println!(
                                "blocked by '{}' pattern '{}' (reason: {}, cwd: {})",
                                c.agent, c.pattern, reason, c.cwd
                            );
                        }
                    }
                }
                Format::Minimal => println!("{}", conflicts.len()),
            }
            Ok(())
        }
        Commands::Feed { limit } => {
            let events = messenger.feed_events(limit)?;
            output::print_feed(&events, format)
        }
        Commands::SetStatus { ref text } => {
            attach(&messenger, &cli)?;
            let reg = messenger.set_status(text.as_deref())?;
            output::print_registration(&reg, format)
        }
        Commands::Swarm { ref action } => {
            run_swarm(&messenger, &cli, action, format)
        }
        Commands::Crew { ref action } => run_crew(&messenger, &cli, action, format),
    }
}

fn run_swarm(
    messenger: &Messenger,
    cli: &Cli,
    action: &SwarmAction,
    format: Format,
) -> Result<()> {
    match action {
        SwarmAction::Claim { spec, task, reason } => {
            attach(messenger, cli)?;
            let claim = messenger.swarm_claim(spec, task, reason.as_deref())?;
            match format {
                Format::Json => println!("{}", serde_json::to_string(&claim)?),
                Format::Pretty => println!("Claimed {task} in {spec}"),
                Format::Minimal => println!("{task}"),
            }
            Ok(())
        }
        SwarmAction::Unclaim { spec, task } => {
            attach(messenger, cli)?;
            messenger.swarm_unclaim(spec, task)?;
            match format {
                Format::Json => println!("{}", serde_json::json!({"unclaimed": task})),
                Format::Pretty => println!("Unclaimed {task} in {spec}"),
                Format::Minimal => println!("{task}"),
            }
            Ok(())
        }
        SwarmAction::Complete { spec, task, notes } => {
            attach(messenger, cli)?;
            let completion = messenger.swarm_complete(spec, task, notes.as_deref())?;
            match format {
                Format::Json => println!("{}", serde_json::to_string(&completion)?),
                Format::Pretty => println!("Completed {task} in {spec}"),
                Format::Minimal => println!("{task}"),
            }
            Ok(())
        }
        SwarmAction::Status { spec } => {
            let status = messenger.swarm_status(spec)?;
            match format {
                Format::Json => println!("{}", serde_json::to_string(&status)?),
                Format::Pretty => {
                    println!("{spec}");
                    for (task, claim) in &status.claims {
                        println!("  claimed {task} by {} ({})", claim.agent, claim.claimed_at);
                    }
                    for (task, completion) in &status.completions {
                        println!(
                            "  done    {task} by {} ({})",
                            completion.completed_by, completion.completed_at
                        );
                    }
                }
                Format::Minimal => {
                    for task in status.claims.keys() {
                        println!("claimed\t{task}");
                    }
                    for task in status.completions.keys() {
                        println!("done\t{task}");
                    }
                }
            }
            Ok(())
        }
    }
}

fn run_crew(messenger: &Messenger, cli: &Cli, action: &CrewAction, format: Format) -> Result<()> {
    let cwd = std::env::current_dir()?;
    let store = CrewStore::open(&cwd);
    let config = store.load_config(&messenger.config().crew);

    match action {
        CrewAction::Plan { file, prd } => {
            let markdown = std::fs::read_to_string(file)?;
            let drafts = parse_planner_output(&markdown);
            let tasks = store.import_plan(prd.as_deref(), &markdown, &drafts)?;
            match format {
                Format::Json => println!("{}", serde_json::to_string(&tasks)?),
                Format::Pretty => {
                    println!("Imported {} task(s):", tasks.len());
                    for task in &tasks {
                        println!("  {} {}", task.id, task.title);
                    }
                }
                Format::Minimal => {
                    for task in &tasks {
                        println!("{}", task.id);
                    }
                }
            }
            Ok(())
        }
        CrewAction::Work {
            autonomous,
            workers,
            command,
            review_command,
            timeout,
        } => {
            store.read_plan()?;
            let mut config = config;
            if let Some(workers) = workers {
                config.concurrency.workers = *workers;
            }
            let mut worker = CommandWorker::new(command.clone());
            worker.timeout = Duration::from_secs(*timeout);

            let mut scheduler = Scheduler::new(&store, config, Arc::new(worker));
            if let Some(review_command) = review_command {
                scheduler = scheduler.with_reviewer(Arc::new(CommandReviewer::new(
                    review_command.clone(),
                )));
            }
            if messenger.config().crew_events_in_feed {
                let agent = if attach(messenger, cli).is_ok() {
                    messenger.agent_name().unwrap_or_else(|| "crew".into())
                } else {
                    "crew".into()
                };
                scheduler = scheduler.with_events(Arc::new(FeedEvents {
                    feed: FeedStore::open(messenger.paths().feed_path()),
                    agent,
                }));
            }

            let report = scheduler.run(*autonomous)?;
            match format {
                Format::Json => println!("{}", serde_json::to_string(&report)?),
                Format::Pretty => {
                    for wave in &report.waves {
                        println!(
                            "wave {}: started {:?} done {:?} retried {:?} blocked {:?}",
                            wave.wave, wave.started, wave.done, wave.retried, wave.blocked
                        );
                    }
                    println!("stopped: {:?}", report.reason);
                }
                Format::Minimal => println!("{:?}", report.reason),
            }
            Ok(())
        }
        CrewAction::Tasks => {
            let tasks = store.list_tasks()?;
            match format {
                Format::Json => println!("{}", serde_json::to_string(&tasks)?),
                Format::Pretty => {
                    for task in &tasks {
                        let assignee = task.assigned_to.as_deref().unwrap_or("-");
                        println!(
                            "{:>8} {:12} {:3} {} {}",
                            task.id, task.status.to_string(), task.attempt_count, assignee, task.title
                        );
                    }
                }
                Format::Minimal => {
                    for task in &tasks {
                        println!("{}\t{}", task.id, task.status);
                    }
                }
            }
            Ok(())
        }
        CrewAction::Task { id } => {
            let task = store.read_task(id)?;
            println!("{}", serde_json::to_string(&task)?);
            Ok(())
        }
        CrewAction::Start { id, assignee } => {
            let scheduler = Scheduler::new(&store, config, Arc::new(NeverRunWorker));
            let assignee = assignee
                .clone()
                .or_else(|| cli.name.clone())
                .or_else(pim::agent::requested_name)
                .unwrap_or_else(|| "manual".into());
            let task = scheduler.manual_start(id, &assignee)?;
            println!("{}", serde_json::to_string(&task)?);
            Ok(())
        }
        CrewAction::Done { id, summary } => {
            let scheduler = Scheduler::new(&store, config, Arc::new(NeverRunWorker));
            let task = scheduler.manual_done(id, summary)?;
            println!("{}", serde_json::to_string(&task)?);
            Ok(())
        }
        CrewAction::Block { id, reason } => {
            let scheduler = Scheduler::new(&store, config, Arc::new(NeverRunWorker));
            let task = scheduler.manual_block(id, reason)?;
            println!("{}", serde_json::to_string(&task)?);
            Ok(())
        }
        CrewAction::Reset { id, cascade } => {
            let scheduler = Scheduler::new(&store, config, Arc::new(NeverRunWorker));
            let reset = scheduler.reset(id, *cascade)?;
            println!("{}", serde_json::to_string(&reset)?);
            Ok(())
        }
        CrewAction::Unblock { id } => {
            let scheduler = Scheduler::new(&store, config, Arc::new(NeverRunWorker));
            let task = scheduler.unblock(id)?;
            println!("{}", serde_json::to_string(&task)?);
            Ok(())
        }
        CrewAction::Review { id, file } => {
            let markdown = std::fs::read_to_string(file)?;
            let verdict = parse_verdict(&markdown);
            let scheduler = Scheduler::new(&store, config, Arc::new(NeverRunWorker));
            let task = scheduler.apply_review(id, verdict)?;
            println!("{}", serde_json::to_string(&task)?);
            Ok(())
        }
    }
}

/// Placeholder worker for manual operations that never spawn sessions.
struct NeverRunWorker;

impl pim::crew::worker::Worker for NeverRunWorker {
    fn run(
        &self,
        _task: &pim::crew::model::CrewTask,
        _spec_body: &str,
        _review: Option<&pim::crew::model::ReviewVerdict>,
    ) -> pim::crew::worker::WorkerOutcome {
        pim::crew::worker::WorkerOutcome::Failed {
            error: "manual scheduler has no worker".into(),
        }
    }
}

/// Crew transitions land in the shared activity feed.
struct FeedEvents {
    feed: FeedStore,
    agent: String,
}

impl pim::crew::scheduler::CrewEvents for FeedEvents {
    fn task_event(&self, kind: &str, task_id: &str, detail: &str) {
        let _ = self.feed.append(
            &pim::model::FeedEvent::new(self.agent.clone(), kind)
                .target(task_id.to_string())
                .preview(pim::model::truncate(detail, 120)),
        );
    }
}

fn main() {
    let cli = Cli::parse();
    let format = if cli.pretty {
        Format::Pretty
    } else {
        cli.format
    };
    if let Err(e) = run(cli, format) {
        match format {
            Format::Json => {
                eprintln!(
                    "{}",
                    serde_json::json!({
                        "error": e.code(),
                        "message": e.to_string()
                    })
                );
            }
            _ => eprintln!("error: {e}"),
        }
        std::process::exit(1);
    }
}
