//! blocksync - Incremental block-level sync of disks to S3
//!
//! Usage:
//!   blocksync upload <disk_path> <name>     - Upload changed blocks of a disk
//!   blocksync download <name> <disk_path>   - Restore a disk from the store
//!   blocksync list                          - List stored disks

use blocksync::{
    config::Config,
    store::open_store,
    sync::{list_disks, BlockSync, ProgressCallback, SyncOptions, SyncPhase, SyncReport},
    Error, Result,
};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "blocksync")]
#[command(author = "blocksync Contributors")]
#[command(version)]
#[command(about = "Incremental block-level sync of disks and disk images to S3")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "~/.config/blocksync/config.json")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Bucket to use instead of the configured one
    #[arg(long, global = true)]
    bucket: Option<String>,

    /// Key prefix to use instead of the configured one
    #[arg(long, global = true)]
    prefix: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload the blocks of a disk that differ from the stored copy
    Upload {
        /// Disk device or image file
        disk_path: PathBuf,

        /// Name to store the disk under
        name: String,

        /// Only report which blocks would be uploaded
        #[arg(long)]
        dry_run: bool,

        /// Fixed gzip level (0-9), skips level tuning
        #[arg(short, long, value_parser = clap::value_parser!(u32).range(0..=9))]
        level: Option<u32>,

        /// Allow running without superuser rights (for image files)
        #[arg(long)]
        allow_unprivileged: bool,
    },

    /// Bring a local disk or image up to date with the stored copy
    Download {
        /// Name the disk is stored under
        name: String,

        /// Destination device or image file
        disk_path: PathBuf,

        /// Only report which blocks would be downloaded
        #[arg(long)]
        dry_run: bool,
    },

    /// List disks in the store
    List,
}

fn main() {
    let cli = Cli::parse();

    // Setup logging
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config_path = expand_tilde(&cli.config);

    let is_root = nix::unistd::geteuid().is_root();
    if let Err(e) = run(cli, &config_path, is_root) {
        error!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

fn run(cli: Cli, config_path: &Path, is_root: bool) -> Result<()> {
    // Checked before any other work, config included
    require_privilege(&cli.command, is_root)?;

    let mut config = Config::load_or_default(config_path)?;
    if let Some(bucket) = cli.bucket {
        config.store.bucket = bucket;
    }
    if let Some(prefix) = cli.prefix {
        config.store.prefix = prefix.trim_matches('/').to_string();
    }
    config.validate()?;

    match cli.command {
        Commands::Upload {
            disk_path,
            name,
            dry_run,
            level,
            ..
        } => cmd_upload(&config, &disk_path, name, dry_run, level),

        Commands::Download {
            name,
            disk_path,
            dry_run,
        } => cmd_download(&config, name, &disk_path, dry_run),

        Commands::List => cmd_list(&config),
    }
}

/// Uploads read raw devices and need superuser rights unless waived
fn require_privilege(command: &Commands, is_root: bool) -> Result<()> {
    match command {
        Commands::Upload {
            allow_unprivileged: false,
            ..
        } if !is_root => Err(Error::PrivilegeRequired),
        _ => Ok(()),
    }
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new().map_err(|e| Error::Internal(e.to_string()))
}

fn cmd_upload(
    config: &Config,
    disk_path: &Path,
    name: String,
    dry_run: bool,
    level: Option<u32>,
) -> Result<()> {
    let mut options = SyncOptions::from_config(config, name);
    options.dry_run = dry_run;
    options.level = level;

    let bar = progress_bar();
    let runtime = runtime()?;
    let report = runtime.block_on(async {
        let store = open_store(&config.store).await?;
        BlockSync::new(store, options)
            .with_progress(progress_callback(bar.clone()))
            .upload(disk_path)
            .await
    });
    bar.finish_and_clear();

    print_report(&report?, dry_run);
    Ok(())
}

fn cmd_download(config: &Config, name: String, disk_path: &Path, dry_run: bool) -> Result<()> {
    if disk_path.exists() && !dry_run {
        warn!("{:?} exists and will be overwritten", disk_path);
        let stdin = std::io::stdin();
        confirm_overwrite(disk_path, &mut stdin.lock(), &mut std::io::stdout())?;

        if config.confirm_delay_secs > 0 {
            info!(
                "Starting in {} seconds, press Ctrl-C to abort",
                config.confirm_delay_secs
            );
            std::thread::sleep(Duration::from_secs(config.confirm_delay_secs));
        }
    }

    let mut options = SyncOptions::from_config(config, name);
    options.dry_run = dry_run;

    let bar = progress_bar();
    let runtime = runtime()?;
    let report = runtime.block_on(async {
        let store = open_store(&config.store).await?;
        BlockSync::new(store, options)
            .with_progress(progress_callback(bar.clone()))
            .download(disk_path)
            .await
    });
    bar.finish_and_clear();

    print_report(&report?, dry_run);
    Ok(())
}

fn cmd_list(config: &Config) -> Result<()> {
    let runtime = runtime()?;
    let names = runtime.block_on(async {
        let store = open_store(&config.store).await?;
        list_disks(store.as_ref(), &config.store.prefix).await
    })?;

    if names.is_empty() {
        println!("No disks stored under {:?}", config.store.prefix);
    }
    for name in names {
        println!("{}", name);
    }
    Ok(())
}

/// Ask the user to type `path` exactly before overwriting it
fn confirm_overwrite<R: BufRead, W: Write>(path: &Path, input: &mut R, output: &mut W) -> Result<()> {
    let expected = path.display().to_string();
    write!(
        output,
        "All data on {} will be replaced. Type the path to continue: ",
        expected
    )?;
    output.flush()?;

    let mut answer = String::new();
    input.read_line(&mut answer)?;
    if answer.trim_end_matches(['\r', '\n']) != expected {
        return Err(Error::ConfirmationDeclined);
    }
    Ok(())
}

fn progress_bar() -> ProgressBar {
    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} {msg:12} [{bar:40.cyan/blue}] {pos}/{len} blocks ({eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-"),
    );
    bar
}

fn progress_callback(bar: ProgressBar) -> ProgressCallback {
    Arc::new(move |progress| {
        let label = match progress.phase {
            SyncPhase::Diff => "diff".to_string(),
            SyncPhase::Tuning { level } => format!("tuning {}", level),
            SyncPhase::Transfer => "transfer".to_string(),
        };
        bar.set_length(progress.total);
        bar.set_position(progress.completed);
        bar.set_message(label);
    })
}

fn print_report(report: &SyncReport, dry_run: bool) {
    if dry_run {
        println!(
            "{} of {} blocks would be transferred",
            report.plan.len(),
            report.blocks_total
        );
        return;
    }

    println!(
        "Transferred {} of {} blocks in {:.1}s",
        report.blocks_transferred,
        report.blocks_total,
        report.elapsed.as_secs_f64()
    );
    if let Some(level) = report.level {
        println!("Compression level: {}", level);
    }
}

/// Expand ~ to home directory
fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
