use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use gatehouse::admission::AdmissionGate;
use gatehouse::config::{GatehouseConfig, LogFormat, LoggingConfig};
use gatehouse::credentials::CredentialsManager;
use gatehouse::ratelimit::SystemClock;

/// Admission control and encrypted credential storage.
#[derive(Debug, Parser)]
#[command(name = "gatehouse", version, about)]
struct Cli {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Manage stored credentials
    #[command(subcommand)]
    Creds(CredsCommand),

    /// Exercise the configured rate limits
    #[command(subcommand)]
    Limit(LimitCommand),
}

#[derive(Debug, Subcommand)]
enum CredsCommand {
    /// Store or replace a credential
    Store {
        key: String,
        value: String,
        /// Store the value without encryption
        #[arg(long)]
        plain: bool,
    },
    /// Print a credential, checking the environment first
    Get {
        key: String,
        #[arg(long)]
        default: Option<String>,
    },
    /// Delete a credential
    Delete { key: String },
    /// List stored credential keys
    List,
    /// Exit successfully if the credential resolves
    Exists { key: String },
    /// Show the access log, newest first
    Log {
        #[arg(long)]
        key: Option<String>,
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
    /// Keep only the newest entries of the access log
    PruneLog {
        #[arg(long)]
        keep: usize,
    },
}

#[derive(Debug, Subcommand)]
enum LimitCommand {
    /// Send a series of requests through a policy and print each decision
    Simulate {
        #[arg(long, default_value = "default")]
        policy: String,
        #[arg(long)]
        key: String,
        #[arg(long, default_value_t = 10)]
        requests: u32,
        #[arg(long, default_value_t = 1)]
        cost: u32,
        /// Pause between requests
        #[arg(long, default_value_t = 0)]
        interval_ms: u64,
    },
}

fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let config = GatehouseConfig::load(cli.config.as_deref())?;
    init_tracing(&config.logging);
    debug!(version = env!("CARGO_PKG_VERSION"), "Gatehouse starting");

    match cli.command {
        Command::Creds(command) => run_creds(&config, command),
        Command::Limit(command) => run_limit(&config, command),
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

fn run_creds(config: &GatehouseConfig, command: CredsCommand) -> anyhow::Result<ExitCode> {
    let manager = CredentialsManager::open(&config.credentials)?;

    let ok = match command {
        CredsCommand::Store { key, value, plain } => manager.store(&key, &value, !plain),
        CredsCommand::Get { key, default } => match manager.get(&key, default.as_deref()) {
            Some(value) => {
                println!("{}", value);
                true
            }
            None => false,
        },
        CredsCommand::Delete { key } => manager.delete(&key),
        CredsCommand::List => {
            for key in manager.list_keys() {
                println!("{}", key);
            }
            true
        }
        CredsCommand::Exists { key } => manager.exists(&key),
        CredsCommand::Log { key, limit } => {
            for entry in manager.get_access_log(key.as_deref(), limit) {
                println!("{}", serde_json::to_string(&entry)?);
            }
            true
        }
        CredsCommand::PruneLog { keep } => {
            let removed = manager.prune_access_log(keep);
            println!("{}", removed);
            true
        }
    };

    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

fn run_limit(config: &GatehouseConfig, command: LimitCommand) -> anyhow::Result<ExitCode> {
    let LimitCommand::Simulate {
        policy,
        key,
        requests,
        cost,
        interval_ms,
    } = command;

    let policies = config.rate_limit.policy_set()?;
    let store = config.rate_limit.bucket_store()?;
    let gate = AdmissionGate::from_policies(&policies, Arc::new(SystemClock), store)?;
    info!(policy = %policy, key = %key, requests, "Simulating requests");

    for request in 1..=requests {
        let response = gate.check(&policy, &key, cost);
        let line = json!({
            "request": request,
            "status": response.status(),
            "allowed": response.allowed(),
            "remaining": response.decision.remaining,
            "retry_after": response.decision.retry_after.as_secs_f64(),
        });
        println!("{}", line);

        if interval_ms > 0 && request < requests {
            std::thread::sleep(Duration::from_millis(interval_ms));
        }
    }

    gate.cleanup_expired(config.rate_limit.cleanup_max_age());
    println!("{}", serde_json::to_string(&json!({ "stats": gate.stats() }))?);
    Ok(ExitCode::SUCCESS)
}
