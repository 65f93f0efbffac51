use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use voice_pilot::agents::ShellExecutor;
use voice_pilot::cli::{self, CliCommand, Outcome};
use voice_pilot::config::{AppConfig, RuntimePaths};
use voice_pilot::message::MessageKind;
use voice_pilot::orchestrator::Orchestrator;
use voice_pilot::realtime::{RealtimeSession, SessionEvent, WebSocketTransport};
use voice_pilot::store::{FileStorage, Storage};

/// Stderr logging, plus a daily rolling file when `log_dir` is set.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "voice-pilot.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(file_layer)
        .init();
    guard
}

/// Print completed assistant replies.
fn spawn_reply_printer(mut events: broadcast::Receiver<SessionEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SessionEvent::MessageUpdated(envelope))
                    if envelope.kind() == MessageKind::AssistantOutput
                        && envelope.is_complete()
                        && !envelope.content().is_empty() =>
                {
                    println!("\n{}\n", envelope.content());
                    eprint!("> ");
                }
                Ok(SessionEvent::StateChanged(state)) => {
                    eprintln!("   [session {state}]");
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Reply printer lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    let _log_guard = init_tracing(RuntimePaths::from_env().log_dir.as_deref());

    let config = AppConfig::from_env().context("Failed to load configuration")?;

    eprintln!("🎙️  voice-pilot v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", config.realtime.model);
    eprintln!("   Data: {}", config.runtime.data_dir.display());
    eprintln!("   Shell: {}", config.runtime.shell);
    eprintln!("   Type a message and press Enter. /help for commands, /quit to exit.\n");

    let storage: Arc<dyn Storage> = Arc::new(FileStorage::new(config.runtime.data_dir.clone()));
    let session = Arc::new(RealtimeSession::new(
        config.realtime.clone(),
        Arc::new(WebSocketTransport::new()),
    ));
    let mut shell = ShellExecutor::new(config.runtime.shell.clone());
    if let Some(dir) = &config.runtime.working_dir {
        shell = shell.with_working_dir(dir.clone());
    }

    let orchestrator = Orchestrator::new(config, storage, session, Arc::new(shell));
    orchestrator
        .start_agents()
        .await
        .context("Failed to start agents")?;
    let printer = spawn_reply_printer(orchestrator.session().subscribe());
    orchestrator.run().await.context("Failed to start")?;

    let mut lines = cli::spawn_stdin_reader();
    eprint!("> ");
    loop {
        tokio::select! {
            line = lines.recv() => {
                let Some(line) = line else {
                    break;
                };
                match cli::dispatch(&orchestrator, CliCommand::parse(&line)).await {
                    Outcome::Quit => break,
                    Outcome::Reply(text) => {
                        if !text.is_empty() {
                            println!("\n{text}\n");
                        }
                        eprint!("> ");
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                eprintln!();
                info!("Interrupt received");
                break;
            }
        }
    }

    printer.abort();
    if !orchestrator.shutdown().await {
        warn!("Exited with pending tasks still running");
    }
    Ok(())
}
