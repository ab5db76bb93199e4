//! fleet-agent: the command-line entry point for the fleet agent.
//!
//! # Usage
//!
//! ```text
//! fleet-agent --config /etc/fleet-agent.yaml run
//! fleet-agent apply batch.json --family debian
//! fleet-agent encrypt 's3cret' --key-env AGENT_ENCRYPTION_KEY
//! fleet-agent diagnostics
//! fleet-agent reap
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use fleet_agent_core::command::{CommandBatch, CommandStatus};
use fleet_agent_core::config::encrypt_value;
use fleet_agent_core::context::AgentContext;
use fleet_agent_core::daemon::{self, Daemon, SpoolCoordinator};
use fleet_agent_core::logging::{self, SecretRegistry};
use fleet_agent_core::monitor::diagnostics::DIAGNOSTICS_FILE;
use fleet_agent_core::monitor::TcpProbe;
use fleet_agent_core::platform::OsFamily;
use fleet_agent_core::types::config::{AgentSettings, CONFIG_ENV};
use fleet_agent_core::{AgentError, Result};


#[derive(Parser)]
#[command(name = "fleet-agent", version, about = "Converges hosts to coordinator-supplied resource batches")]
struct Cli {
    /// Settings file (YAML)
    #[arg(long, global = true, env = CONFIG_ENV)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent daemon until SIGTERM/SIGINT
    Run,
    /// Converge one batch file locally and print the report
    Apply {
        /// Batch in the coordinator wire format
        batch: PathBuf,
        /// Override the detected OS family
        #[arg(long)]
        family: Option<OsFamily>,
    },
    /// Encrypt a value for use in configurations
    Encrypt {
        plaintext: String,
        /// Environment variable holding the passphrase
        #[arg(long)]
        key_env: Option<String>,
    },
    /// Ask the running daemon for a diagnostics dump and print it
    Diagnostics {
        /// Seconds to wait for the dump
        #[arg(long, default_value_t = 10)]
        wait: u64,
    },
    /// Kill processes left behind by a previous agent run
    Reap,
}


fn main() -> ExitCode {
    let cli = Cli::parse();
    let settings = match load_settings(cli.config.as_deref()) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("fleet-agent: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let secrets = Arc::new(SecretRegistry::new());
    if let Err(e) = logging::init(&settings.logging, Arc::clone(&secrets)) {
        eprintln!("fleet-agent: cannot initialise logging: {}", e);
        return ExitCode::FAILURE;
    }

    let result = match cli.command {
        Commands::Run => run_daemon(settings, secrets),
        Commands::Apply { batch, family } => apply(settings, secrets, &batch, family),
        Commands::Encrypt { plaintext, key_env } => encrypt(&settings, &plaintext, key_env),
        Commands::Diagnostics { wait } => diagnostics(&settings, Duration::from_secs(wait)),
        Commands::Reap => reap(settings, secrets),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "command failed");
            ExitCode::FAILURE
        }
    }
}


fn load_settings(path: Option<&Path>) -> Result<AgentSettings> {
    match path {
        Some(p) => AgentSettings::load(p),
        None => Ok(AgentSettings::default()),
    }
}


fn run_daemon(settings: AgentSettings, secrets: Arc<SecretRegistry>) -> Result<ExitCode> {
    let pid_path = settings.pid_file.clone();
    let mut coordinator = SpoolCoordinator::new(&settings.spool_dir);
    if let Some(url) = &settings.coordinator_url {
        coordinator = coordinator.with_upstream(TcpProbe::from_url(url)?);
    }

    let context = AgentContext::new(settings, secrets)?;
    // Signals must be blocked before any other thread starts.
    context.heartbeat.install_signal_routing()?;

    if let Some(parent) = pid_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| AgentError::path(parent, e))?;
    }
    std::fs::write(&pid_path, std::process::id().to_string())
        .map_err(|e| AgentError::path(&pid_path, e))?;

    let mut daemon = Daemon::new(context, Arc::new(coordinator));
    let result = daemon.run();
    let _ = std::fs::remove_file(&pid_path);
    result?;
    info!("agent stopped");
    Ok(ExitCode::SUCCESS)
}


fn apply(
    settings: AgentSettings,
    secrets: Arc<SecretRegistry>,
    path: &Path,
    family: Option<OsFamily>,
) -> Result<ExitCode> {
    let text = std::fs::read_to_string(path).map_err(|e| AgentError::path(path, e))?;
    let batch: CommandBatch = serde_json::from_str(&text)?;
    let mut context = AgentContext::new(settings, secrets)?;
    if let Some(family) = family {
        context = context.with_family(family);
    }

    let report = daemon::execute_batch(&context, &batch);
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(match report.status {
        CommandStatus::Completed => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    })
}


fn encrypt(settings: &AgentSettings, plaintext: &str, key_env: Option<String>) -> Result<ExitCode> {
    let key_env = key_env.unwrap_or_else(|| settings.encryption_key_env.clone());
    let passphrase = std::env::var(&key_env)
        .ok()
        .filter(|p| !p.is_empty())
        .ok_or_else(|| AgentError::config(format!("no passphrase in ${}", key_env)))?;
    println!("{}", encrypt_value(plaintext, &passphrase)?);
    Ok(ExitCode::SUCCESS)
}


fn diagnostics(settings: &AgentSettings, wait: Duration) -> Result<ExitCode> {
    let pid_text = std::fs::read_to_string(&settings.pid_file)
        .map_err(|e| AgentError::path(&settings.pid_file, e))?;
    let pid: i32 = pid_text
        .trim()
        .parse()
        .map_err(|_| AgentError::config(format!("bad pid file {}", settings.pid_file.display())))?;

    let dump = settings.run_dir.join(DIAGNOSTICS_FILE);
    let before = modified(&dump);
    // SAFETY: plain kill(2) on a pid read from our own pid file.
    if unsafe { libc::kill(pid, libc::SIGUSR1) } != 0 {
        return Err(std::io::Error::last_os_error().into());
    }

    let deadline = Instant::now() + wait;
    while Instant::now() < deadline {
        let now = modified(&dump);
        if now.is_some() && now != before {
            let text = std::fs::read_to_string(&dump).map_err(|e| AgentError::path(&dump, e))?;
            println!("{}", text);
            return Ok(ExitCode::SUCCESS);
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    warn!(pid, "no diagnostics dump before the deadline");
    Ok(ExitCode::FAILURE)
}


fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}


fn reap(settings: AgentSettings, secrets: Arc<SecretRegistry>) -> Result<ExitCode> {
    let context = AgentContext::new(settings, secrets)?;
    let killed = context.supervisor.reap_stale()?;
    for pid in &killed {
        println!("{}", pid);
    }
    info!(count = killed.len(), "stale processes reaped");
    Ok(ExitCode::SUCCESS)
}
