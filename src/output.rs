use clap::ValueEnum;
use colored::Colorize;

use crate::error::Result;
use crate::model::{FeedEvent, Message, Registration, truncate};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    Json,
    Pretty,
    Minimal,
}

pub fn print_registration(reg: &Registration, format: Format) -> Result<()> {
    match format {
        Format::Json => println!("{}", serde_json::to_string(reg)?),
        Format::Pretty => {
            println!("{} pid={} session={}", reg.name.cyan().bold(), reg.pid, reg.session_id);
            println!("  cwd: {}", reg.cwd);
            println!("  model: {}", reg.model);
            if let Some(ref branch) = reg.git_branch {
                println!("  branch: {}", branch);
            }
            if let Some(ref spec) = reg.spec {
                println!("  spec: {}", spec);
            }
            if let Some(ref status) = reg.status_message {
                println!("  status: {}", status);
            }
            for r in &reg.reservations {
                let reason = r.reason.as_deref().unwrap_or("-");
                println!("  reserved: {} ({})", r.pattern, reason);
            }
        }
        Format::Minimal => println!("{}", reg.name),
    }
    Ok(())
}

pub fn print_registrations(regs: &[Registration], format: Format) -> Result<()> {
    match format {
        Format::Json => println!("{}", serde_json::to_string(regs)?),
        Format::Pretty => {
            if regs.is_empty() {
                println!("No agents in mesh.");
            } else {
                for reg in regs {
                    print_registration(reg, Format::Pretty)?;
                }
            }
        }
        Format::Minimal => {
            for reg in regs {
                println!("{}", reg.name);
            }
        }
    }
    Ok(())
}

pub fn print_messages(msgs: &[Message], format: Format) -> Result<()> {
    match format {
        Format::Json => println!("{}", serde_json::to_string(msgs)?),
        Format::Pretty => {
            if msgs.is_empty() {
                println!("No messages.");
            } else {
                for m in msgs {
                    let short_id = m.id.get(..8).unwrap_or(&m.id);
                    println!("[{}] {} {}", short_id, format!("from={}", m.from).cyan(), m.text);
                }
            }
        }
        Format::Minimal => {
            for m in msgs {
                println!("{}: {}", m.from, m.text);
            }
        }
    }
    Ok(())
}

pub fn print_feed(events: &[FeedEvent], format: Format) -> Result<()> {
    match format {
        Format::Json => println!("{}", serde_json::to_string(events)?),
        Format::Pretty => {
            if events.is_empty() {
                println!("No feed events.");
            } else {
                for e in events {
                    let target = e.target.as_deref().unwrap_or("");
                    let preview = e.preview.as_deref().map(|p| truncate(p, 60)).unwrap_or_default();
                    println!(
                        "{} [{}] {} {} {}",
                        e.ts.format("%H:%M:%S"),
                        e.agent.cyan(),
                        e.kind.bold(),
                        target,
                        preview.dimmed()
                    );
                }
            }
        }
        Format::Minimal => {
            for e in events {
                println!("{} {}", e.agent, e.kind);
            }
        }
    }
    Ok(())
}
