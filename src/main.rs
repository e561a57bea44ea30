//! vmdisk CLI entry point.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use vmdisk::config::VmdiskConfig;

mod cli;

/// vmdisk - mount host disks inside a utility VM
#[derive(Parser, Debug)]
#[command(name = "vmdisk")]
#[command(about = "Attach host disks to a utility VM and mount them in the guest")]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to the user config directory)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    /// Human-readable lines
    Text,
    /// One JSON object per line
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Attach a disk without mounting it.
    Attach(cli::attach::AttachCmd),

    /// Attach a disk and mount a partition.
    Mount(cli::mount::MountCmd),

    /// Unmount and detach a disk, or all disks.
    Unmount(cli::unmount::UnmountCmd),

    /// List disks.
    #[command(alias = "ls")]
    List(cli::list::ListCmd),

    /// Forget every disk and stop the VM.
    Shutdown(cli::shutdown::ShutdownCmd),

    /// Start the HTTP API server.
    Serve(cli::serve::ServeCmd),

    /// Export the OpenAPI document.
    Openapi(cli::openapi::OpenapiCmd),

    /// Show or write the configuration.
    #[command(subcommand)]
    Config(cli::config::ConfigCmd),
}

fn main() {
    let cli = Cli::parse();

    // Initialize logging based on RUST_LOG or default to warn
    init_logging(cli.log_format);

    tracing::debug!(version = vmdisk::VERSION, "starting vmdisk");

    let loaded = match &cli.config {
        Some(path) => VmdiskConfig::load_from(path),
        None => VmdiskConfig::load(),
    };
    let config = match loaded {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(error = %e, "failed to load config, using defaults");
            VmdiskConfig::default()
        }
    };

    let ctx = cli::Context {
        config,
        config_path: cli.config,
    };

    let result = match cli.command {
        Commands::Attach(cmd) => cmd.run(&ctx),
        Commands::Mount(cmd) => cmd.run(&ctx),
        Commands::Unmount(cmd) => cmd.run(&ctx),
        Commands::List(cmd) => cmd.run(&ctx),
        Commands::Shutdown(cmd) => cmd.run(&ctx),
        Commands::Serve(cmd) => cmd.run(&ctx.config),
        Commands::Openapi(cmd) => cmd.run(),
        Commands::Config(cmd) => cmd.run(&ctx),
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "command failed");
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Initialize the tracing subscriber.
fn init_logging(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vmdisk=warn"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}
