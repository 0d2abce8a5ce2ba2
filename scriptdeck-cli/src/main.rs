use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use directories::ProjectDirs;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use scriptdeck_core::config::load_layout;
use scriptdeck_core::{
    BlockConfig, BlockSession, EngineSettings, HostSink, ResourceLimits, RunStatus, ScriptEngine,
    SessionEvent, SessionState,
};

mod util;

#[derive(Parser)]
#[command(name = "scriptdeck")]
#[command(about = "Run scripts as supervised blocks with live output.", long_about = None)]
struct Cli {
    /// Engine settings (JSON). Defaults to the platform config directory.
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Do not install missing modules automatically.
    #[arg(long, global = true)]
    no_auto_install: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one script, streaming its output and forwarding stdin lines.
    Run {
        script: PathBuf,

        /// Re-run the script this many seconds after each run ends.
        #[arg(long = "loop", value_name = "SECS", value_parser = parse_interval)]
        loop_interval: Option<Duration>,

        /// CPU ceiling in percent of the machine (0 = default).
        #[arg(long, default_value_t = 0)]
        cpu: u32,

        /// Memory ceiling in MB (0 = default).
        #[arg(long, default_value_t = 0)]
        memory: u64,
    },

    /// Start every block of a saved layout (a JSON array of block records).
    Restore { layout: PathBuf },

    /// Check that the configured interpreter answers.
    Probe,
}

fn parse_interval(raw: &str) -> Result<Duration, String> {
    let secs: f64 = raw.parse().map_err(|e| format!("{e}"))?;
    if !secs.is_finite() || secs <= 0.0 {
        return Err("interval must be a positive number of seconds".to_string());
    }
    Duration::try_from_secs_f64(secs).map_err(|e| e.to_string())
}

fn default_settings_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", "scriptdeck").map(|dirs| dirs.config_dir().join("settings.json"))
}

#[tokio::main]
async fn main() -> ExitCode {
    util::init_tracing();
    util::install_panic_hook();

    match try_main().await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::from(2)
        }
    }
}

async fn try_main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let mut settings = match cli.settings.clone().or_else(default_settings_path) {
        Some(path) => EngineSettings::load(path),
        None => EngineSettings::default(),
    };
    if cli.no_auto_install {
        settings.auto_install_modules = false;
    }
    let engine = ScriptEngine::new(settings);

    match cli.command {
        Command::Probe => probe(&engine).await,
        Command::Run {
            script,
            loop_interval,
            cpu,
            memory,
        } => {
            let mut config = BlockConfig::for_script(script);
            if cpu > 0 || memory > 0 {
                config.limits = Some(ResourceLimits::new(cpu, memory));
            }
            host(&engine, vec![config], Launch::Run { loop_interval }).await
        }
        Command::Restore { layout } => {
            let configs = load_layout(&layout)?;
            if configs.is_empty() {
                eprintln!("layout {} has no blocks", layout.display());
                return Ok(ExitCode::SUCCESS);
            }
            host(&engine, configs, Launch::Restore).await
        }
    }
}

async fn probe(engine: &ScriptEngine) -> Result<ExitCode> {
    let program = &engine.settings().interpreter.program;
    match engine.probe_interpreter().await {
        Some(version) => {
            println!("{program}: {version}");
            println!("resource governor: {}", engine.governor_backend());
            Ok(ExitCode::SUCCESS)
        }
        None => {
            println!("{program}: not available");
            Ok(ExitCode::FAILURE)
        }
    }
}

// ════════════════════════════════════════════════════════════════════
// Terminal host
// ════════════════════════════════════════════════════════════════════

#[derive(Clone, Copy)]
enum Launch {
    Run { loop_interval: Option<Duration> },
    Restore,
}

async fn host(engine: &ScriptEngine, configs: Vec<BlockConfig>, launch: Launch) -> Result<ExitCode> {
    let (tx, mut rx) = mpsc::unbounded_channel::<SessionEvent>();
    let sink: Arc<dyn HostSink> = Arc::new(tx);

    let mut sessions: Vec<BlockSession> = Vec::with_capacity(configs.len());
    let mut start_failed = false;
    for config in configs {
        let session = match launch {
            Launch::Run { loop_interval } => {
                let session = engine.create_session(config, sink.clone());
                if let Some(interval) = loop_interval {
                    session.arm_loop(interval)?;
                }
                let status = session.run().await?;
                start_failed |= did_not_start(&status);
                session
            }
            Launch::Restore => {
                let session = engine.restore_session(config, sink.clone());
                if !session.is_looping() {
                    let status = session.run().await?;
                    if let RunStatus::ScriptMissing = status {
                        tracing::warn!(block = %session.id(), "script missing, block left idle");
                    }
                    start_failed |= did_not_start(&status);
                }
                session
            }
        };
        sessions.push(session);
    }
    // Only the sessions hold senders from here on.
    drop(sink);

    let mut stdin = Some(BufReader::new(tokio::io::stdin()).lines());
    let mut failed = false;
    let multi = sessions.len() > 1;

    while !all_settled(&sessions) {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                eprintln!("\n[scriptdeck] Ctrl+C received, stopping blocks…");
                break;
            }

            event = rx.recv() => {
                let Some(event) = event else { break };
                match event {
                    SessionEvent::Output { block, text } => {
                        print_output(&sessions, multi, block, &text);
                    }
                    // Runs we killed ourselves say nothing about the script.
                    SessionEvent::RunFinished { exit_code, killed: false, .. } => {
                        failed = exit_code != Some(0);
                    }
                    SessionEvent::RunFinished { killed: true, .. } => {}
                    SessionEvent::OutputCleared { .. }
                    | SessionEvent::StateChanged { .. }
                    | SessionEvent::RunStarted { .. } => {}
                }
            }

            line = next_line(&mut stdin) => {
                match line {
                    Some(line) => forward_input(&sessions, &line).await,
                    None => stdin = None,
                }
            }
        }
    }

    for session in &sessions {
        if let Err(e) = session.dispose().await {
            tracing::debug!("dispose: {}", e);
        }
    }
    // Drain what the last runs printed.
    while let Ok(event) = rx.try_recv() {
        if let SessionEvent::Output { block, text } = event {
            print_output(&sessions, multi, block, &text);
        }
    }

    Ok(if failed || start_failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

fn did_not_start(status: &RunStatus) -> bool {
    !matches!(status, RunStatus::Started { .. })
}

/// Nothing runs and nothing will run again.
fn all_settled(sessions: &[BlockSession]) -> bool {
    sessions
        .iter()
        .all(|s| s.state() == SessionState::Idle && !s.is_looping())
}

async fn next_line(
    stdin: &mut Option<tokio::io::Lines<BufReader<tokio::io::Stdin>>>,
) -> Option<String> {
    let Some(lines) = stdin.as_mut() else {
        return std::future::pending().await;
    };
    match lines.next_line().await.context("stdin read failed") {
        Ok(line) => line,
        Err(e) => {
            tracing::warn!("{:#}", e);
            None
        }
    }
}

async fn forward_input(sessions: &[BlockSession], line: &str) {
    for session in sessions.iter().filter(|s| s.is_running()) {
        if let Err(e) = session.send_input(line).await {
            tracing::debug!(block = %session.id(), "input not forwarded: {}", e);
        }
    }
}

fn print_output(sessions: &[BlockSession], multi: bool, block: scriptdeck_core::BlockId, text: &str) {
    let mut out = std::io::stdout().lock();
    if multi {
        let label = sessions
            .iter()
            .find(|s| s.id() == block)
            .and_then(|s| s.config().script_path)
            .and_then(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .unwrap_or_else(|| block.to_string());
        for line in text.split_inclusive('\n') {
            let _ = write!(out, "[{label}] {line}");
        }
    } else {
        let _ = out.write_all(text.as_bytes());
    }
    let _ = out.flush();
}
