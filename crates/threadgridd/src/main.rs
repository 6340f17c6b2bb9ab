//! threadgridd — the Threadgrid daemon.
//!
//! Assembles the thread pool subsystems in one process:
//! - Coordinator + ThreadSlots on the simulated runtime
//! - CPU prober
//! - Upscale and downscale loops
//!
//! # Usage
//!
//! ```text
//! threadgridd run --config threadgrid.toml --synthetic-stall-interval 250ms
//! threadgridd capacity --config threadgrid.toml --json
//! threadgridd init --min-threads 8 --output threadgrid.toml
//! ```

mod run;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tracing::info;

use threadgrid_autoscale::Capacity;
use threadgrid_core::config::{default_min_threads, parse_duration};
use threadgrid_core::{Settings, ThreadgridConfig};

#[derive(Parser)]
#[command(name = "threadgridd", about = "Threadgrid daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the pool and both scaling loops; drain on Ctrl-C.
    Run {
        /// Path to threadgrid.toml. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Push a stall signal at this interval (e.g. "250ms").
        #[arg(long, value_parser = duration_arg)]
        synthetic_stall_interval: Option<Duration>,

        /// Simulated runtime boot latency (e.g. "20ms").
        #[arg(long, value_parser = duration_arg)]
        boot_delay: Option<Duration>,
    },

    /// Print the planned min/max thread counts.
    Capacity {
        #[arg(long)]
        config: Option<PathBuf>,

        /// Print as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Write a config file with every default spelled out.
    Init {
        #[arg(long)]
        min_threads: Option<usize>,

        #[arg(long, default_value = "threadgrid.toml")]
        output: PathBuf,

        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Run {
            config,
            synthetic_stall_interval,
            boot_delay,
        } => {
            let settings = load_settings(config.as_deref())?;
            run::run_pool(settings, synthetic_stall_interval, boot_delay).await
        }
        Command::Capacity { config, json } => {
            let settings = load_settings(config.as_deref())?;
            println!("{}", render_capacity(&Capacity::planned(&settings.pool), json)?);
            Ok(())
        }
        Command::Init {
            min_threads,
            output,
            force,
        } => write_scaffold(&output, min_threads.unwrap_or_else(default_min_threads), force),
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new("info,threadgrid=debug,threadgridd=debug")
    });
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn duration_arg(s: &str) -> Result<Duration, String> {
    parse_duration(s).map_err(|e| e.to_string())
}

fn load_settings(path: Option<&Path>) -> anyhow::Result<Settings> {
    let config = match path {
        Some(path) => ThreadgridConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => ThreadgridConfig::default(),
    };
    let settings = config.resolve()?;
    info!(
        min_threads = settings.pool.min_threads,
        max_threads = ?settings.pool.max_threads,
        "configuration loaded"
    );
    Ok(settings)
}

fn render_capacity(capacity: &Capacity, json: bool) -> anyhow::Result<String> {
    if json {
        return Ok(serde_json::to_string_pretty(capacity)?);
    }
    Ok(format!(
        "min_threads: {}\nmax_threads: {}\nautoscaling: {}",
        capacity.min_threads,
        capacity.max_threads,
        if capacity.scales() { "enabled" } else { "disabled" },
    ))
}

fn write_scaffold(output: &Path, min_threads: usize, force: bool) -> anyhow::Result<()> {
    if output.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", output.display());
    }
    let content = ThreadgridConfig::scaffold(min_threads).to_toml_string()?;
    std::fs::write(output, content)
        .with_context(|| format!("failed to write {}", output.display()))?;
    info!(path = %output.display(), "config written");
    Ok(())
}
