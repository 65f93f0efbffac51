//! Line-oriented REPL: command parsing, stdin reading and dispatch.

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use crate::orchestrator::Orchestrator;

pub const HELP: &str = "Commands:
  /plan [query]   show the plan, or ask about it (status, priorities, summary)
  /summary        plan summary
  /context        refresh and show the combined context
  /run <command>  run a shell command
  /task <text>    add a plan item described by <text>
  /backup         back up plan and context
  /backups        list backups
  /restore <id>   restore a backup
  /pause, /resume pause or resume input handling
  /quit           shut down
Anything else is sent to the assistant.";

/// One parsed REPL line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliCommand {
    Input(String),
    Plan(Option<String>),
    Summary,
    Context,
    Run(String),
    Task(String),
    Backup,
    Backups,
    Restore(String),
    Pause,
    Resume,
    Help,
    Quit,
    /// A known command used without its required argument.
    Usage(&'static str),
}

impl CliCommand {
    pub fn parse(line: &str) -> Self {
        let trimmed = line.trim();
        let lower = trimmed.to_lowercase();

        match lower.as_str() {
            "/quit" | "/exit" => Self::Quit,
            "/help" | "/?" => Self::Help,
            "/plan" => Self::Plan(None),
            "/summary" => Self::Summary,
            "/context" => Self::Context,
            "/backup" => Self::Backup,
            "/backups" => Self::Backups,
            "/pause" => Self::Pause,
            "/resume" => Self::Resume,
            "/run" => Self::Usage("/run <command>"),
            "/task" => Self::Usage("/task <text>"),
            "/restore" => Self::Usage("/restore <id>"),
            _ => parse_with_argument(trimmed)
                .unwrap_or_else(|| Self::Input(trimmed.to_string())),
        }
    }
}

/// `/cmd <rest>` forms. The argument keeps its original case.
fn parse_with_argument(trimmed: &str) -> Option<CliCommand> {
    let (command, rest) = trimmed.split_once(char::is_whitespace)?;
    let rest = rest.trim().to_string();
    match command.to_lowercase().as_str() {
        "/plan" => Some(CliCommand::Plan(Some(rest))),
        "/run" => Some(CliCommand::Run(rest)),
        "/task" => Some(CliCommand::Task(rest)),
        "/restore" => Some(CliCommand::Restore(rest)),
        _ => None,
    }
}

/// What the REPL should do after a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Reply(String),
    Quit,
}

/// Execute one command against the running system.
pub async fn dispatch(orchestrator: &Orchestrator, command: CliCommand) -> Outcome {
    let reply = match command {
        CliCommand::Quit => return Outcome::Quit,
        CliCommand::Help => HELP.to_string(),
        CliCommand::Usage(usage) => format!("Usage: {usage}"),
        CliCommand::Input(text) => {
            if orchestrator.handle_user_input(&text).await {
                String::new()
            } else {
                format!(
                    "Not sent (system {}, session {}).",
                    orchestrator.state(),
                    orchestrator.session().state()
                )
            }
        }
        CliCommand::Context => orchestrator.combined_context().await,
        CliCommand::Pause => match orchestrator.pause().await {
            Ok(()) => "Paused.".to_string(),
            Err(e) => e.to_string(),
        },
        CliCommand::Resume => match orchestrator.resume().await {
            Ok(()) => "Resumed.".to_string(),
            Err(e) => e.to_string(),
        },
        CliCommand::Backup => match orchestrator.create_backup().await {
            Ok(info) => format!("Backup {} created ({} items).", info.id, info.item_count),
            Err(e) => format!("Backup failed: {e}"),
        },
        CliCommand::Backups => match orchestrator.list_backups().await {
            Ok(backups) if backups.is_empty() => "No backups.".to_string(),
            Ok(backups) => backups
                .iter()
                .map(|b| {
                    format!("{}  {}  {} items", b.id, b.created_at.to_rfc3339(), b.item_count)
                })
                .collect::<Vec<_>>()
                .join("\n"),
            Err(e) => format!("Could not list backups: {e}"),
        },
        CliCommand::Restore(id) => match orchestrator.restore_backup(&id).await {
            Ok(info) => format!("Restored {} ({} items).", info.id, info.item_count),
            Err(e) => format!("Restore failed: {e}"),
        },
        agent_command => {
            let Some(conversation) = orchestrator.conversation().await else {
                return Outcome::Reply("Agents are not running.".to_string());
            };
            let _task = orchestrator.pending().track();
            match agent_command {
                CliCommand::Plan(query) => conversation
                    .query_plan(query.as_deref().unwrap_or(""))
                    .await
                    .unwrap_or_else(|| "Plan query failed.".to_string()),
                CliCommand::Summary => conversation
                    .request_plan_summary()
                    .await
                    .unwrap_or_else(|| "Plan summary failed.".to_string()),
                CliCommand::Run(cmd) => conversation
                    .run_terminal_command(&cmd)
                    .await
                    .unwrap_or_else(|| format!("Command failed: {cmd}")),
                CliCommand::Task(text) => {
                    if conversation.request_plan_update(&text).await {
                        "Added to the plan.".to_string()
                    } else {
                        "Could not add that to the plan.".to_string()
                    }
                }
                _ => String::new(),
            }
        }
    };
    Outcome::Reply(reply)
}

/// Read non-empty stdin lines until EOF.
pub fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim().to_string();
                    if line.is_empty() {
                        continue;
                    }
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::error!("Error reading stdin: {}", e);
                    break;
                }
            }
        }
    });
    rx
}
