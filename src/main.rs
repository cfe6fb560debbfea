//! sendstream - subvolume send-stream generator
//!
//! Entry point for the CLI application.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sendstream::stream::decode_stream;
use sendstream::{SendConfig, SendSession};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "sendstream", version, about = "Serialize a snapshot into a send stream")]
struct Cli {
    /// More output (repeat for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Image a directory and write its send stream
    Send {
        /// Directory to snapshot
        source: PathBuf,

        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Subvolume name written into the stream
        #[arg(long)]
        name: Option<String>,

        /// TOML file with send settings
        #[arg(long, env = "SENDSTREAM_CONFIG")]
        config: Option<PathBuf>,

        /// Buffered bytes before handing output to the writer
        #[arg(long, env = "SENDSTREAM_HIGH_WATER")]
        high_water: Option<usize>,

        /// Largest data payload per write command
        #[arg(long, env = "SENDSTREAM_MAX_WRITE")]
        max_write: Option<usize>,

        /// Send even if the subvolume is not flagged read-only
        #[arg(long)]
        writable: bool,

        /// Skip extended attributes
        #[arg(long)]
        no_xattrs: bool,

        /// Print statistics as JSON on stderr when done
        #[arg(long)]
        stats: bool,
    },

    /// Decode a stream, verify its checksums and list its commands
    Dump {
        /// Stream file
        stream: PathBuf,

        /// One JSON object per command
        #[arg(long)]
        json: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_logging(cli.verbose, cli.quiet);

    let result = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start runtime")
        .and_then(|runtime| runtime.block_on(run(cli.command)));

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn setup_logging(verbose: u8, quiet: bool) {
    let level = match (quiet, verbose) {
        (true, _) => "error",
        (false, 0) => "sendstream=info,warn",
        (false, 1) => "sendstream=debug,info",
        (false, _) => "sendstream=trace,debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Send {
            source,
            output,
            name,
            config,
            high_water,
            max_write,
            writable,
            no_xattrs,
            stats,
        } => {
            let mut send_config = match &config {
                Some(path) => SendConfig::load(path)
                    .with_context(|| format!("Failed to load config {}", path.display()))?,
                None => SendConfig::default(),
            };
            if let Some(bytes) = high_water {
                send_config.high_water = bytes;
            }
            if let Some(bytes) = max_write {
                send_config.max_write = bytes;
            }
            send_config.allow_writable |= writable;
            send_config.validate().context("Invalid configuration")?;
            run_send(source, output, name, send_config, !no_xattrs, stats).await
        }
        Commands::Dump { stream, json } => run_dump(stream, json).await,
    }
}

#[cfg(unix)]
async fn run_send(
    source: PathBuf,
    output: Option<PathBuf>,
    name: Option<String>,
    config: SendConfig,
    xattrs: bool,
    print_stats: bool,
) -> Result<()> {
    use sendstream::image::{image_directory, ImageOptions};

    let options = ImageOptions {
        name,
        xattrs,
        ..ImageOptions::default()
    };
    let tree = {
        let root = source.clone();
        tokio::task::spawn_blocking(move || image_directory(&root, &options))
            .await
            .context("Imaging task failed")?
            .with_context(|| format!("Failed to image {}", source.display()))?
    };

    let session = SendSession::new();
    let mut stream = session
        .start(Arc::new(tree), config)
        .context("Failed to start send")?;

    let stats = match &output {
        Some(path) => {
            let mut file = tokio::fs::File::create(path)
                .await
                .with_context(|| format!("Failed to create {}", path.display()))?;
            let stats = stream.copy_to(&mut file).await.context("Send failed")?;
            file.sync_all().await?;
            stats
        }
        None => {
            let mut stdout = tokio::io::stdout();
            let stats = stream.copy_to(&mut stdout).await.context("Send failed")?;
            stdout.flush().await?;
            stats
        }
    };

    info!(
        source = %source.display(),
        commands = stats.commands,
        bytes = stats.bytes,
        suspensions = stats.suspensions,
        "stream written"
    );
    if print_stats {
        eprintln!("{}", serde_json::to_string_pretty(&stats)?);
    }
    Ok(())
}

#[cfg(not(unix))]
async fn run_send(
    _source: PathBuf,
    _output: Option<PathBuf>,
    _name: Option<String>,
    _config: SendConfig,
    _xattrs: bool,
    _print_stats: bool,
) -> Result<()> {
    anyhow::bail!("directory imaging is only supported on unix")
}

async fn run_dump(path: PathBuf, json: bool) -> Result<()> {
    let data = tokio::fs::read(&path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let commands =
        decode_stream(&data).with_context(|| format!("Invalid stream {}", path.display()))?;

    let mut out = String::new();
    for command in &commands {
        if json {
            out.push_str(&serde_json::to_string(&command.to_json())?);
        } else {
            out.push_str(&command.to_string());
        }
        out.push('\n');
    }
    let mut stdout = tokio::io::stdout();
    stdout.write_all(out.as_bytes()).await?;
    stdout.flush().await?;

    info!(commands = commands.len(), bytes = data.len(), "stream verified");
    Ok(())
}
