//! CLI commands for TaskRelay using clap.

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::sync::Arc;

use crate::config::{get_settings_path, load_settings, save_settings_to, Settings};
use crate::core::{
    Dispatch, DispatchRequest, Dispatcher, ExecutionEvent, ExecutionId, ExecutionStatus, Interest,
    Source, StatePaths, Subscription, Target,
};
use crate::runner::{ClaudeRunner, CliRunner};
use crate::telegram::run_telegram_daemon;
use crate::web::{run_web_server, AppState, WebServerConfig};

/// TaskRelay - dispatch prompts to a coding CLI from the web, chat or terminal.
#[derive(Parser)]
#[command(name = "taskrelay")]
#[command(version)]
#[command(about = "TaskRelay - per-target execution queue for coding CLIs", long_about = None)]
pub struct Commands {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the web API and the Telegram bot
    Serve {
        /// Override web.port
        #[arg(short, long)]
        port: Option<u16>,

        /// Do not start the Telegram bot
        #[arg(long)]
        no_telegram: bool,
    },

    /// Run one prompt and stream its output
    Run {
        /// Target as type:name, e.g. project:website
        target: String,

        /// Prompt to send
        prompt: String,

        /// Model override
        #[arg(long)]
        model: Option<String>,

        /// Run in plan mode
        #[arg(long)]
        plan: bool,

        /// Resume a specific CLI session
        #[arg(long, conflicts_with = "continue_session")]
        resume: Option<String>,

        /// Resume the target's last session
        #[arg(short = 'c', long = "continue")]
        continue_session: bool,
    },

    /// Show settings
    Config {
        /// Write default settings if none exist
        #[arg(long)]
        init: bool,
    },
}

impl Commands {
    /// Run the command.
    pub async fn run(&self) -> Result<()> {
        match &self.command {
            Command::Serve { port, no_telegram } => cmd_serve(*port, *no_telegram).await,
            Command::Run {
                target,
                prompt,
                model,
                plan,
                resume,
                continue_session,
            } => {
                let target: Target = target.parse().map_err(anyhow::Error::msg)?;
                let mut request = DispatchRequest::new(Source::Cli, target, prompt.as_str());
                request.model = model.clone();
                request.plan_mode = *plan;
                request.resume_session_id = resume.clone();
                request.continue_session = *continue_session;
                cmd_run(request).await
            }
            Command::Config { init } => cmd_config(*init),
        }
    }
}

async fn build_dispatcher(settings: Settings, runner: Arc<dyn CliRunner>) -> Result<Arc<Dispatcher>> {
    let paths = StatePaths::from_home()?;
    Ok(Arc::new(Dispatcher::new(settings, runner, paths).await?))
}

async fn cmd_serve(port: Option<u16>, no_telegram: bool) -> Result<()> {
    let settings = load_settings()?;

    let runner = Arc::new(ClaudeRunner::from_config(&settings.cli));
    if !runner.is_available().await {
        tracing::warn!(
            "{} CLI ({}) not found; executions will fail to spawn",
            runner.name(),
            settings.cli.binary
        );
    }
    let dispatcher = build_dispatcher(settings.clone(), runner).await?;

    let mut web_config = WebServerConfig::from(&settings.web);
    if let Some(port) = port {
        web_config.port = port;
    }
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let state = AppState {
        dispatcher: Arc::clone(&dispatcher),
    };
    let mut web = tokio::spawn(run_web_server(web_config, state, async move {
        let _ = stop_rx.await;
    }));

    let telegram = if no_telegram {
        None
    } else if settings.telegram.bot_token.is_none() {
        tracing::info!("No telegram.bot_token configured, Telegram bot disabled");
        None
    } else {
        let dispatcher = Arc::clone(&dispatcher);
        let config = settings.telegram.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = run_telegram_daemon(dispatcher, config).await {
                tracing::error!("Telegram bot stopped: {}", e);
            }
        }))
    };

    println!("TaskRelay running. Press Ctrl+C to stop.");

    let web_result = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!("Shutting down...");
            None
        }
        result = &mut web => Some(result),
    };

    let _ = stop_tx.send(());
    if let Some(telegram) = telegram {
        telegram.abort();
    }
    dispatcher.shutdown().await?;

    let web_result = match web_result {
        Some(result) => result,
        None => web.await,
    };
    web_result??;
    Ok(())
}

async fn cmd_run(request: DispatchRequest) -> Result<()> {
    let settings = load_settings()?;
    let runner = Arc::new(ClaudeRunner::from_config(&settings.cli));
    let dispatcher = build_dispatcher(settings, runner).await?;

    let mut lifecycle = dispatcher.bus().subscribe(Interest::Lifecycle);
    let id = match dispatcher.dispatch(request).await? {
        Dispatch::Started { id, .. } => id,
        Dispatch::Queued { item, position } => {
            eprintln!("Queued #{} (position {})", item.seq_id, position);
            wait_for_promotion(&mut lifecycle, item.seq_id).await?
        }
    };
    drop(lifecycle);

    let status = stream_execution(&dispatcher, &id).await;
    dispatcher.shutdown().await?;

    match status? {
        ExecutionStatus::Completed => Ok(()),
        status => bail!("Execution {} ended with status {}", id, status),
    }
}

async fn wait_for_promotion(events: &mut Subscription, seq: u64) -> Result<ExecutionId> {
    while let Some(event) = events.recv().await {
        if let ExecutionEvent::Started { id, info } = event {
            if info.queue_seq == Some(seq) {
                return Ok(id);
            }
        }
    }
    bail!("Event bus closed before #{} started", seq)
}

/// Print catch-up and live output to stdout until the execution ends.
/// Ctrl+C cancels it.
async fn stream_execution(dispatcher: &Dispatcher, id: &str) -> Result<ExecutionStatus> {
    let Some(attachment) = dispatcher.attach(id) else {
        bail!("Execution {} not found", id);
    };
    let mut stdout = std::io::stdout();
    stdout.write_all(attachment.catch_up.as_bytes())?;
    stdout.flush()?;

    let mut execution = attachment.execution;
    if let Some(mut live) = attachment.live {
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);
        let mut cancelling = false;

        loop {
            tokio::select! {
                event = live.recv() => match event {
                    Some(ExecutionEvent::Output { chunk, .. }) => {
                        stdout.write_all(chunk.as_bytes())?;
                        stdout.flush()?;
                    }
                    Some(event) => {
                        if let Some(info) = event.info() {
                            execution = info.clone();
                        }
                        if event.is_terminal() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = &mut ctrl_c, if !cancelling => {
                    cancelling = true;
                    eprintln!("\nCancelling {}...", id);
                    dispatcher.cancel(id);
                }
            }
        }
    }

    match execution.status {
        ExecutionStatus::Completed => {
            let result = execution.result.as_ref();
            if let Some(session) = result.and_then(|r| r.session_id.as_deref()) {
                eprintln!("\nSession: {}", session);
            }
            if let Some(cost) = result.and_then(|r| r.cost_usd) {
                eprintln!("Cost: ${:.4}", cost);
            }
        }
        ExecutionStatus::Error => {
            eprintln!(
                "\nError: {}",
                execution.error.as_deref().unwrap_or("execution failed")
            );
        }
        ExecutionStatus::Cancelled => eprintln!("\nCancelled"),
        ExecutionStatus::Running => {}
    }
    Ok(execution.status)
}

fn cmd_config(init: bool) -> Result<()> {
    let path = get_settings_path()?;

    if init {
        if path.exists() {
            println!("Settings already exist at {}", path.display());
        } else {
            save_settings_to(&Settings::default(), &path)?;
            println!("Wrote default settings to {}", path.display());
        }
    }

    let settings = load_settings()?;
    println!("Settings: {}", path.display());
    if !path.exists() {
        println!("(file missing, showing defaults; run `taskrelay config --init` to create it)");
    }

    let mut shown = serde_json::to_value(&settings)?;
    if let Some(token) = shown.pointer_mut("/telegram/bot_token") {
        if !token.is_null() {
            *token = serde_json::Value::String("***".to_string());
        }
    }
    println!("{}", serde_json::to_string_pretty(&shown)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_parses_overrides() {
        let args = Commands::try_parse_from([
            "taskrelay", "run", "project:site", "fix it", "--model", "opus", "--plan", "-c",
        ])
        .unwrap();
        let Command::Run { target, model, plan, continue_session, resume, .. } = args.command else {
            panic!("expected run");
        };
        assert_eq!(target, "project:site");
        assert_eq!(model.as_deref(), Some("opus"));
        assert!(plan && continue_session);
        assert!(resume.is_none());
    }

    #[test]
    fn resume_and_continue_conflict() {
        assert!(Commands::try_parse_from([
            "taskrelay", "run", "agent:x", "hi", "--resume", "s-1", "--continue",
        ])
        .is_err());
    }

    #[test]
    fn serve_flags() {
        let args = Commands::try_parse_from(["taskrelay", "serve", "-p", "4000", "--no-telegram"]).unwrap();
        assert!(matches!(
            args.command,
            Command::Serve { port: Some(4000), no_telegram: true }
        ));
    }
}
