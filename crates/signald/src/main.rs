//! signald: the SignalGrid daemon.
//!
//! Single binary that assembles the scheduling core:
//! - State store (redb)
//! - Traffic observer (optionally fed by synthetic traffic)
//! - Scheduler + dispatcher
//!
//! # Usage
//!
//! ```text
//! signald init --config signald.toml
//! signald run --config signald.toml --data-dir /var/lib/signalgrid
//! signald status --data-dir /var/lib/signalgrid
//! ```

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;

use signal_core::epoch_millis;

const DEFAULT_FILTER: &str = "info,signald=debug,signalgrid=debug";

#[derive(Parser)]
#[command(name = "signald", about = "SignalGrid adaptive signal daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Provision from config and evaluate intersections until Ctrl-C.
    Run {
        #[arg(long, default_value = "signald.toml")]
        config: PathBuf,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/signalgrid")]
        data_dir: PathBuf,
    },

    /// Validate a config file and exit.
    Check {
        #[arg(long, default_value = "signald.toml")]
        config: PathBuf,
    },

    /// Write a starter config.
    Init {
        #[arg(long, default_value = "signald.toml")]
        config: PathBuf,

        /// Id of the scaffolded intersection.
        #[arg(long, default_value = "intersection-1")]
        id: String,

        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },

    /// Provision intersections from config and exit.
    Provision {
        #[arg(long, default_value = "signald.toml")]
        config: PathBuf,

        #[arg(long, default_value = "/var/lib/signalgrid")]
        data_dir: PathBuf,
    },

    /// Run a single evaluation pass and print the outcomes.
    Evaluate {
        #[arg(long, default_value = "signald.toml")]
        config: PathBuf,

        #[arg(long, default_value = "/var/lib/signalgrid")]
        data_dir: PathBuf,

        /// Evaluate only this intersection.
        #[arg(long)]
        id: Option<String>,
    },

    /// Print stored signal states and live leases.
    Status {
        #[arg(long, default_value = "/var/lib/signalgrid")]
        data_dir: PathBuf,

        #[arg(long)]
        id: Option<String>,
    },
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_FILTER));
    // Logs go to stderr so command output on stdout stays parseable.
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Run { config, data_dir } => commands::run(config, data_dir).await,
        Command::Check { config } => {
            let validated = commands::load_config(&config)?;
            info!(
                intersections = validated.intersections.len(),
                tick_ms = validated.daemon.tick.as_millis() as u64,
                "config ok"
            );
            Ok(())
        }
        Command::Init { config, id, force } => commands::init_config(&config, &id, force),
        Command::Provision { config, data_dir } => {
            let validated = commands::load_config(&config)?;
            let store = commands::open_store(&data_dir)?;
            let summary = commands::provision_all(&store, &validated, epoch_millis())?;
            info!(
                intersections = summary.provisioned,
                removed = summary.removed.len(),
                "provisioning complete"
            );
            Ok(())
        }
        Command::Evaluate {
            config,
            data_dir,
            id,
        } => {
            let validated = commands::load_config(&config)?;
            let store = commands::open_store(&data_dir)?;
            let reports = commands::evaluate_once(&store, &validated, id.as_deref()).await?;
            println!("{}", serde_json::to_string_pretty(&reports)?);
            Ok(())
        }
        Command::Status { data_dir, id } => {
            let store = commands::open_store(&data_dir)?;
            let report = commands::status_report(&store, id.as_deref(), epoch_millis())?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}
