//! Classync CLI
//!
//! Command-line front end for the Classync sync engine: sign in, record
//! attendance and marks offline, and keep them in sync with the school
//! backend.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use classync_core::store::shared;
use classync_core::{
    Config, EntityType, HttpBackend, LocalStore, MutationOp, Role, StaticToken, SyncService,
};

mod commands;
mod output;
mod prompt;

use output::{Output, OutputFormat};

/// Environment variable holding the log filter
const LOG_ENV: &str = "CLASSYNC_LOG";

#[derive(Parser)]
#[command(name = "classync")]
#[command(about = "Classync - offline attendance and marks with background sync")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Use this config file instead of the default
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in and download your classes
    Login {
        /// User ID
        #[arg(short, long)]
        user: String,
        /// teacher or principal
        #[arg(short, long)]
        role: Role,
        /// School ID
        #[arg(short, long)]
        school: String,
        /// Wipe another user's data left on this device
        #[arg(long, conflicts_with = "keep")]
        clear: bool,
        /// Keep another user's data (sync stays blocked until cleared)
        #[arg(long, conflicts_with = "clear")]
        keep: bool,
        /// Don't download the snapshot after signing in
        #[arg(long)]
        skip_hydration: bool,
    },
    /// Sign out (cached data stays on the device)
    Logout,
    /// Show session, queue and cache status
    Status,
    /// Record a local change
    Record {
        /// Entity type (classes, students, teachers, subjects, attendance, marks)
        entity_type: EntityType,
        /// Entity ID
        entity_id: String,
        /// create, update or delete
        operation: MutationOp,
        /// JSON payload
        #[arg(short, long)]
        payload: Option<String>,
    },
    /// List cached records of a type
    #[command(alias = "ls")]
    List {
        /// Entity type
        entity_type: EntityType,
    },
    /// Run one sync cycle now
    Sync,
    /// Show or act on mutations the server rejected
    Failures {
        #[command(subcommand)]
        command: Option<FailureCommands>,
    },
    /// Keep syncing in the foreground until Ctrl-C
    Run {
        /// Seconds between connectivity probes
        #[arg(long, default_value_t = 15)]
        probe_secs: u64,
    },
    /// Show or set configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
enum FailureCommands {
    /// List failed mutations
    List,
    /// Queue a failed mutation for another attempt
    Retry {
        /// Mutation ID
        id: String,
    },
    /// Drop a failed mutation and restore the server copy
    Discard {
        /// Mutation ID
        id: String,
    },
}

#[derive(Subcommand, Clone)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Set a configuration value
    Set {
        /// Configuration key (data_dir, api_url, api_token, sync_enabled, ...)
        key: String,
        /// Configuration value
        value: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));

    // Config commands work even when the config is unusable
    if let Commands::Config { command } = &cli.command {
        return match command {
            Some(ConfigCommands::Show) | None => commands::config::show(cli.config.as_ref(), &output),
            Some(ConfigCommands::Set { key, value }) => {
                commands::config::set(key, value, cli.config.as_ref(), &output)
            }
        };
    }

    let config = Config::load_with_cli_override(cli.config.as_ref())
        .context("Failed to load configuration")?;
    init_logging(&config)?;

    match cli.command {
        Commands::Config { .. } => unreachable!(), // Handled above
        Commands::Login {
            user,
            role,
            school,
            clear,
            keep,
            skip_hydration,
        } => {
            let service = open_service(&config)?;
            let args = commands::login::LoginArgs {
                user,
                role,
                school,
                clear,
                keep,
                skip_hydration,
            };
            commands::login::login(&service, args, &output).await
        }
        Commands::Logout => commands::status::logout(open_store(&config)?, &output),
        Commands::Status => commands::status::show(&open_store(&config)?, &config, &output),
        Commands::Record {
            entity_type,
            entity_id,
            operation,
            payload,
        } => commands::record::record(
            &mut open_store(&config)?,
            entity_type,
            &entity_id,
            operation,
            payload.as_deref(),
            &output,
        ),
        Commands::List { entity_type } => {
            commands::record::list(&open_store(&config)?, entity_type, &output)
        }
        Commands::Sync => commands::sync::sync(&open_service(&config)?, &output).await,
        Commands::Failures { command } => {
            let mut store = open_store(&config)?;
            match command {
                Some(FailureCommands::List) | None => commands::failures::list(&store, &output),
                Some(FailureCommands::Retry { id }) => {
                    commands::failures::retry(&mut store, &id, &output)
                }
                Some(FailureCommands::Discard { id }) => {
                    commands::failures::discard(&mut store, &id, &output)
                }
            }
        }
        Commands::Run { probe_secs } => {
            commands::sync::run(open_service(&config)?, probe_secs, &output).await
        }
    }
}

/// Open the local store, adding a recovery hint where one exists
fn open_store(config: &Config) -> Result<LocalStore> {
    LocalStore::open(config).map_err(|e| match e.recovery_suggestion() {
        Some(hint) => anyhow!("{}\n{}", e, hint),
        None => anyhow::Error::new(e).context("Failed to open local store"),
    })
}

/// Build the sync service against the configured backend
fn open_service(config: &Config) -> Result<SyncService> {
    let Some(ref api_url) = config.api_url else {
        bail!(
            "API URL not configured. Set it with:\n  \
             classync config set api_url https://your-school.example/api"
        );
    };

    let credentials = Arc::new(StaticToken(config.api_token.clone()));
    let backend = HttpBackend::new(api_url, credentials, config.request_timeout())
        .context("Failed to set up HTTP client")?;
    let store = open_store(config)?;

    Ok(SyncService::new(
        config.clone(),
        shared(store),
        Arc::new(backend),
    ))
}

/// Install the tracing subscriber
///
/// The filter comes from `CLASSYNC_LOG` (default `warn`). Output goes to
/// the configured log file, or stderr.
fn init_logging(config: &Config) -> Result<()> {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));

    match config.log_file {
        Some(ref path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file: {:?}", path))?;
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init();
        }
        None => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .try_init();
        }
    }

    Ok(())
}
