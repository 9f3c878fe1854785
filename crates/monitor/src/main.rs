//! Deskwatch
//!
//! Watches remote desktop sessions on a set of machines.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use monitor::config::{default_config_path, Config};
use monitor::engine::{ControlHandle, MachineSnapshot, MonitorEvent, SessionAction};
use monitor::orchestrator::{MonitorOrchestrator, OrchestratorEvent};
use monitor::process::{run_once, TokioRunner, SIGNALLED_EXIT_CODE};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// File name prefix of the rotated log files.
const LOG_FILE_PREFIX: &str = "deskwatch.log";

/// Deskwatch - remote desktop session monitor.
#[derive(Parser, Debug)]
#[command(name = "deskwatch")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Monitor all configured machines until interrupted
    Run {
        /// Print events and snapshots as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Poll machines once and print their session ids
    List {
        /// Machines to poll (default: all configured)
        machines: Vec<String>,
    },

    /// Open a viewer on a session and wait for it to close
    Attach { machine: String, id: u32 },

    /// Disconnect viewers from a session
    Detach { machine: String, id: u32 },

    /// Stop a session
    Kill { machine: String, id: u32 },

    /// Inspect or create the configuration file
    #[command(subcommand)]
    Config(ConfigCommands),
}

/// Configuration subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Print the configuration file path
    Path,
    /// Print the effective configuration
    Show,
    /// Write the default configuration
    Init {
        /// Overwrite an existing file
        #[arg(long, short)]
        force: bool,
    },
}

/// A command read from stdin while monitoring.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ControlLine {
    List,
    Poll(Option<String>),
    Session {
        action: SessionAction,
        machine: String,
        id: u32,
    },
}

impl ControlLine {
    /// Parses one line. Blank lines and `#` comments yield `None`.
    fn parse(line: &str) -> Result<Option<Self>, String> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }

        let words: Vec<&str> = line.split_whitespace().collect();
        match words.as_slice() {
            ["list"] => Ok(Some(ControlLine::List)),
            ["poll"] => Ok(Some(ControlLine::Poll(None))),
            ["poll", machine] => Ok(Some(ControlLine::Poll(Some(machine.to_string())))),
            [action, machine, id] => {
                let action: SessionAction = action.parse()?;
                let id = id
                    .parse()
                    .map_err(|_| format!("invalid session id: {}", id))?;
                Ok(Some(ControlLine::Session {
                    action,
                    machine: machine.to_string(),
                    id,
                }))
            }
            _ => Err(format!(
                "unrecognized command: {} (expected: list | poll [MACHINE] | attach|detach|kill MACHINE ID)",
                line
            )),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);

    // Configuration commands run before logging is set up.
    if let Commands::Config(cmd) = &cli.command {
        return config_command(cmd, &config_path);
    }

    let mut config = if cli.config.is_some() {
        Config::load(&config_path)?
    } else {
        Config::load_or_init(&config_path)?
    };
    config.apply_env_overrides();
    config.validate()?;

    let _guard = init_tracing(&config, cli.verbose);
    tracing::debug!("Using config file: {:?}", config_path);

    match cli.command {
        Commands::Run { json } => run_monitor(config, json).await,
        Commands::List { machines } => list_sessions(&config, &machines).await,
        Commands::Attach { machine, id } => {
            dispatch_once(&config, SessionAction::Attach, &machine, id).await
        }
        Commands::Detach { machine, id } => {
            dispatch_once(&config, SessionAction::Detach, &machine, id).await
        }
        Commands::Kill { machine, id } => {
            dispatch_once(&config, SessionAction::Kill, &machine, id).await
        }
        Commands::Config(_) => Ok(()),
    }
}

/// Sets up stderr logging plus a daily-rotated log file.
///
/// The returned guard flushes the file writer when dropped.
fn init_tracing(config: &Config, verbose: bool) -> Option<WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.monitor.log_level.to_lowercase()))
    };

    let log_dir = &config.monitor.log_dir;
    let (file_layer, guard) = match std::fs::create_dir_all(log_dir) {
        Ok(()) => {
            let appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        Err(e) => {
            eprintln!(
                "warning: cannot create log directory {}: {}",
                log_dir.display(),
                e
            );
            (None, None)
        }
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    guard
}

fn config_command(cmd: &ConfigCommands, path: &Path) -> anyhow::Result<()> {
    match cmd {
        ConfigCommands::Path => {
            println!("{}", path.display());
        }
        ConfigCommands::Show => {
            let mut config = Config::load(path)?;
            config.apply_env_overrides();
            print!("{}", config.to_toml()?);
        }
        ConfigCommands::Init { force } => {
            if path.exists() && !force {
                anyhow::bail!(
                    "{} already exists (use --force to overwrite)",
                    path.display()
                );
            }
            Config::default().save(path)?;
            println!("Wrote default configuration to {}", path.display());
        }
    }
    Ok(())
}

/// Runs the monitor until SIGINT or SIGTERM.
async fn run_monitor(config: Config, json: bool) -> anyhow::Result<()> {
    let mut orchestrator = MonitorOrchestrator::new(config)?;
    let mut lifecycle = orchestrator.subscribe();
    let mut events = orchestrator.monitor_events();

    tokio::spawn(async move {
        while let Ok(event) = lifecycle.recv().await {
            match event {
                OrchestratorEvent::StateChanged(state) => {
                    tracing::info!("Orchestrator state: {:?}", state);
                }
                OrchestratorEvent::Error { message } => {
                    tracing::error!("Orchestrator error: {}", message);
                }
            }
        }
    });

    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => report_event(&event, json),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event output fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    orchestrator.start().await?;

    let control = orchestrator.control();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    let shutdown = wait_for_shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                result?;
                break;
            }
            line = lines.next_line(), if stdin_open => {
                match line {
                    Ok(Some(line)) => handle_control_line(&control, &line, json).await,
                    Ok(None) => {
                        tracing::debug!("stdin closed, control input disabled");
                        stdin_open = false;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to read stdin: {}", e);
                        stdin_open = false;
                    }
                }
            }
        }
    }

    orchestrator.stop().await?;
    Ok(())
}

async fn handle_control_line(control: &ControlHandle, line: &str, json: bool) {
    let request = match ControlLine::parse(line) {
        Ok(Some(request)) => request,
        Ok(None) => return,
        Err(e) => {
            eprintln!("{}", e);
            return;
        }
    };

    match request {
        ControlLine::List => match control.snapshot().await {
            Ok(snapshot) => print_snapshot(&snapshot, json),
            Err(e) => eprintln!("{}", e),
        },
        ControlLine::Poll(machine) => match control.poll_now(machine.as_deref()).await {
            Ok(started) => tracing::info!(started, "Poll requested"),
            Err(e) => eprintln!("{}", e),
        },
        ControlLine::Session {
            action,
            machine,
            id,
        } => match control.dispatch(action, &machine, id).await {
            Ok(handle) => {
                tracing::debug!(handle = %handle, "{} {}:{} dispatched", action, machine, id)
            }
            Err(e) => eprintln!("{} {}:{} failed: {}", action, machine, id, e),
        },
    }
}

fn report_event(event: &MonitorEvent, json: bool) {
    if json {
        match serde_json::to_string(event) {
            Ok(line) => println!("{}", line),
            Err(e) => tracing::warn!("Failed to encode event: {}", e),
        }
        return;
    }

    match event {
        MonitorEvent::SessionsChanged { machine, sessions } => {
            let ids: Vec<u32> = sessions.iter().map(|s| s.id).collect();
            tracing::info!(machine = %machine, sessions = ?ids, "Sessions changed");
        }
        MonitorEvent::PreviewUpdated { machine, id, path } => {
            tracing::debug!(machine = %machine, session_id = id, path = %path.display(), "Preview updated");
        }
        MonitorEvent::AttachChanged {
            machine,
            id,
            attach_pending,
        } => {
            tracing::info!(machine = %machine, session_id = id, attach_pending, "Attach state changed");
        }
        MonitorEvent::PollFailed {
            machine,
            exit_code,
            consecutive_failures,
        } => {
            tracing::debug!(
                machine = %machine,
                exit_code,
                consecutive_failures,
                "Poll failed"
            );
        }
    }
}

fn print_snapshot(snapshot: &[MachineSnapshot], json: bool) {
    if json {
        match serde_json::to_string(snapshot) {
            Ok(line) => println!("{}", line),
            Err(e) => tracing::warn!("Failed to encode snapshot: {}", e),
        }
        return;
    }

    for machine in snapshot {
        let mut status = Vec::new();
        if machine.poll_pending {
            status.push("polling".to_string());
        }
        if machine.consecutive_failures > 0 {
            status.push(format!("{} failed poll(s)", machine.consecutive_failures));
        }

        if status.is_empty() {
            println!("{}", machine.name);
        } else {
            println!("{} ({})", machine.name, status.join(", "));
        }

        if machine.sessions.is_empty() {
            println!("  no sessions");
        }
        for session in &machine.sessions {
            println!(
                "  {:>6}  preview: {:<3}  {}",
                session.id,
                if session.preview_available { "yes" } else { "no" },
                if session.attach_pending { "attached" } else { "" }
            );
        }
    }
}

/// Polls machines once, one after another.
async fn list_sessions(config: &Config, machines: &[String]) -> anyhow::Result<()> {
    let parser = config.commands.parser()?;
    let runner = TokioRunner::new();

    let targets: Vec<&str> = if machines.is_empty() {
        config.machines.names.iter().map(String::as_str).collect()
    } else {
        machines.iter().map(String::as_str).collect()
    };

    if targets.is_empty() {
        println!("No machines configured.");
        return Ok(());
    }

    let mut failures = 0;
    for machine in targets {
        let command = config.commands.list_sessions(machine)?;
        match run_once(&runner, &command).await {
            Ok((output, 0)) => {
                let ids = parser.parse(&output);
                if ids.is_empty() {
                    println!("{}: no sessions", machine);
                } else {
                    let ids: Vec<String> = ids.iter().map(u32::to_string).collect();
                    println!("{}: {}", machine, ids.join(" "));
                }
            }
            Ok((_, code)) => {
                eprintln!("{}: session list failed (exit code {})", machine, code);
                failures += 1;
            }
            Err(e) => {
                eprintln!("{}: {}", machine, e);
                failures += 1;
            }
        }
    }

    if failures > 0 {
        anyhow::bail!("{} machine(s) could not be listed", failures);
    }
    Ok(())
}

/// Runs one session command and waits for it.
async fn dispatch_once(
    config: &Config,
    action: SessionAction,
    machine: &str,
    id: u32,
) -> anyhow::Result<()> {
    let command = match action {
        SessionAction::Attach => config.commands.attach(machine, id)?,
        SessionAction::Detach => config.commands.detach(machine, id)?,
        SessionAction::Kill => config.commands.kill(machine, id)?,
    };

    tracing::info!(command = %command, "Running {}", action);
    let (output, code) = run_once(&TokioRunner::new(), &command)
        .await
        .with_context(|| format!("Failed to {} {}:{}", action, machine, id))?;

    if !output.is_empty() {
        std::io::stderr().write_all(&output)?;
    }

    match code {
        0 => {
            println!("{} {}:{} done", action, machine, id);
            Ok(())
        }
        SIGNALLED_EXIT_CODE => anyhow::bail!("{} was terminated by a signal", action),
        code => anyhow::bail!("{} exited with code {}", action, code),
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint =
        signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_debug_assert() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_command() {
        let cli = Cli::try_parse_from(["deskwatch", "run"]).unwrap();
        match cli.command {
            Commands::Run { json } => assert!(!json),
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_run_json() {
        let cli = Cli::try_parse_from(["deskwatch", "run", "--json"]).unwrap();
        match cli.command {
            Commands::Run { json } => assert!(json),
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_list_all_machines() {
        let cli = Cli::try_parse_from(["deskwatch", "list"]).unwrap();
        match cli.command {
            Commands::List { machines } => assert!(machines.is_empty()),
            _ => panic!("Expected List command"),
        }
    }

    #[test]
    fn test_list_named_machines() {
        let cli = Cli::try_parse_from(["deskwatch", "list", "MACH1", "MACH2"]).unwrap();
        match cli.command {
            Commands::List { machines } => assert_eq!(machines, vec!["MACH1", "MACH2"]),
            _ => panic!("Expected List command"),
        }
    }

    #[test]
    fn test_attach_command() {
        let cli = Cli::try_parse_from(["deskwatch", "attach", "MACH1", "17"]).unwrap();
        match cli.command {
            Commands::Attach { machine, id } => {
                assert_eq!(machine, "MACH1");
                assert_eq!(id, 17);
            }
            _ => panic!("Expected Attach command"),
        }
    }

    #[test]
    fn test_kill_requires_numeric_id() {
        assert!(Cli::try_parse_from(["deskwatch", "kill", "MACH1", "abc"]).is_err());
        assert!(Cli::try_parse_from(["deskwatch", "kill", "MACH1"]).is_err());
    }

    #[test]
    fn test_config_init_force() {
        let cli = Cli::try_parse_from(["deskwatch", "config", "init", "--force"]).unwrap();
        match cli.command {
            Commands::Config(ConfigCommands::Init { force }) => assert!(force),
            _ => panic!("Expected Config Init command"),
        }
    }

    #[test]
    fn test_global_flags() {
        let cli =
            Cli::try_parse_from(["deskwatch", "-v", "-c", "/path/to/config.toml", "list"]).unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("/path/to/config.toml")));
    }

    #[test]
    fn test_missing_subcommand_fails() {
        assert!(Cli::try_parse_from(["deskwatch"]).is_err());
    }

    #[test]
    fn test_control_line_session_commands() {
        assert_eq!(
            ControlLine::parse("attach MACH1 17"),
            Ok(Some(ControlLine::Session {
                action: SessionAction::Attach,
                machine: "MACH1".to_string(),
                id: 17,
            }))
        );
        assert_eq!(
            ControlLine::parse("  kill MACH2 3  "),
            Ok(Some(ControlLine::Session {
                action: SessionAction::Kill,
                machine: "MACH2".to_string(),
                id: 3,
            }))
        );
    }

    #[test]
    fn test_control_line_other_commands() {
        assert_eq!(ControlLine::parse("list"), Ok(Some(ControlLine::List)));
        assert_eq!(ControlLine::parse("poll"), Ok(Some(ControlLine::Poll(None))));
        assert_eq!(
            ControlLine::parse("poll MACH1"),
            Ok(Some(ControlLine::Poll(Some("MACH1".to_string()))))
        );
        assert_eq!(ControlLine::parse(""), Ok(None));
        assert_eq!(ControlLine::parse("# comment"), Ok(None));
    }

    #[test]
    fn test_control_line_errors() {
        assert!(ControlLine::parse("attach MACH1").is_err());
        assert!(ControlLine::parse("attach MACH1 x").is_err());
        assert!(ControlLine::parse("reboot MACH1 1").is_err());
    }

    #[test]
    fn test_config_path_command() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        config_command(&ConfigCommands::Path, &path).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_config_init_refuses_overwrite() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        config_command(&ConfigCommands::Init { force: false }, &path).unwrap();
        assert!(path.exists());
        assert!(config_command(&ConfigCommands::Init { force: false }, &path).is_err());
        assert!(config_command(&ConfigCommands::Init { force: true }, &path).is_ok());
    }
}
