use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use vmigrate::{
    BlockStatusResolver, BulkCopier, ChangeSet, CopyEngine, CopyProgress, Extent, MigrateConfig,
    logger::{self, LogFormat},
    nbd::NbdClient,
    preflight::LocalToolPreflight,
    target::FileTarget,
    transport::EndpointKind,
};

#[derive(Parser)]
#[command(name = "vmigrate")]
#[command(about = "Per-VM disk migration engine for VMware to OpenStack")]
#[command(version = "0.1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormatArg::Pretty)]
    log_format: LogFormatArg,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormatArg {
    Pretty,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(format: LogFormatArg) -> Self {
        match format {
            LogFormatArg::Pretty => LogFormat::Pretty,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum EndpointArg {
    Host,
    Vcenter,
}

impl From<EndpointArg> for EndpointKind {
    fn from(kind: EndpointArg) -> Self {
        match kind {
            EndpointArg::Host => EndpointKind::Host,
            EndpointArg::Vcenter => EndpointKind::VCenter,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Check local tooling before migrating
    Preflight,
    /// Print the effective configuration
    Config {
        /// Write the effective configuration to this file
        #[arg(long)]
        write: Option<PathBuf>,
    },
    /// Resolve a byte range against an NBD endpoint and print its blocks as JSON
    BlockMap {
        /// Unix socket of the NBD endpoint
        #[arg(long)]
        socket: PathBuf,
        #[arg(long, default_value_t = 0)]
        offset: u64,
        /// Defaults to the rest of the export
        #[arg(long)]
        length: Option<u64>,
    },
    /// Apply a JSON change set from an NBD endpoint to a destination
    CopyChanges {
        #[arg(long)]
        socket: PathBuf,
        /// JSON file holding a change set
        #[arg(long)]
        changes: PathBuf,
        /// Destination file or block device
        #[arg(long)]
        destination: PathBuf,
        /// Kind of endpoint the socket fronts; picks the chunk size
        #[arg(long, value_enum, default_value_t = EndpointArg::Host)]
        endpoint: EndpointArg,
    },
    /// Copy a whole disk from an NBD endpoint to a pre-zeroed destination
    BulkCopy {
        #[arg(long)]
        socket: PathBuf,
        #[arg(long)]
        destination: PathBuf,
        #[arg(long, value_enum, default_value_t = EndpointArg::Host)]
        endpoint: EndpointArg,
    },
}

fn load_config(path: Option<&Path>) -> Result<MigrateConfig> {
    let path = match path {
        Some(path) => Some(path.to_path_buf()),
        None => MigrateConfig::default_path().filter(|path| path.exists()),
    };
    match path {
        Some(path) => MigrateConfig::from_file(&path)
            .with_context(|| format!("failed to load configuration from {}", path.display())),
        None => {
            logger::debug!("no configuration file found, using defaults");
            Ok(MigrateConfig::default())
        }
    }
}

async fn connect(socket: &Path, config: &MigrateConfig) -> Result<NbdClient<tokio::net::UnixStream>> {
    let timeout = Duration::from_secs(config.transport.connect_timeout_secs);
    NbdClient::connect_with_timeout(socket, timeout)
        .await
        .with_context(|| format!("failed to connect to {}", socket.display()))
}

/// Cancel `token` on Ctrl-C so child processes are stopped cleanly.
fn cancel_on_interrupt(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            logger::warn!("interrupted, cancelling");
            token.cancel();
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        unsafe {
            std::env::set_var("RUST_LOG", "vmigrate=debug");
        }
    }
    logger::init_logger_with(cli.log_format.into());

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Preflight => {
            let report = LocalToolPreflight::new(&config).run();
            print!("{}", report);
            if !report.is_ready() {
                std::process::exit(1);
            }
        }
        Commands::Config { write } => {
            config.validate().context("configuration is invalid")?;
            match write {
                Some(path) => {
                    config
                        .save_to_file(&path)
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    println!("Configuration written to {}", path.display());
                }
                None => print!("{}", config.to_toml()?),
            }
        }
        Commands::BlockMap {
            socket,
            offset,
            length,
        } => {
            let limits = config.copy.limits()?;
            let mut client = connect(&socket, &config).await?;
            let size = client.negotiated().size;
            let length = length.unwrap_or_else(|| size.saturating_sub(offset));
            let resolver = BlockStatusResolver::new(&limits);
            let blocks = resolver
                .resolve(&mut client, Extent::new(offset, length))
                .await;
            client.disconnect().await?;
            println!("{}", serde_json::to_string_pretty(&blocks)?);
        }
        Commands::CopyChanges {
            socket,
            changes,
            destination,
            endpoint,
        } => {
            let limits = config.copy.limits()?;
            let contents = std::fs::read_to_string(&changes)
                .with_context(|| format!("failed to read {}", changes.display()))?;
            let changes: ChangeSet =
                serde_json::from_str(&contents).context("invalid change set")?;

            let mut client = connect(&socket, &config).await?;
            let mut target = FileTarget::open(&destination)
                .with_context(|| format!("failed to open {}", destination.display()))?;
            let engine = CopyEngine::new(endpoint.into(), &limits, CopyProgress::new());
            let stats = engine
                .copy_changes(&mut client, &mut target, &changes)
                .await?;
            client.disconnect().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Commands::BulkCopy {
            socket,
            destination,
            endpoint,
        } => {
            let limits = config.copy.limits()?;
            let copier = BulkCopier::new(
                &config.copy.nbdcopy_path,
                limits.chunk_for(endpoint.into()),
                config.copy.progress_queue_depth,
            )
            .with_grace(Duration::from_secs(config.transport.terminate_grace_secs));

            let cancel = CancellationToken::new();
            cancel_on_interrupt(cancel.clone());
            let progress = CopyProgress::new();
            copier
                .copy(&socket, &destination, &progress, &cancel)
                .await?;
            println!("Bulk copy to {} complete", destination.display());
        }
    }

    Ok(())
}
