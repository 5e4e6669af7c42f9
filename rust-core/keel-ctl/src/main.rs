// SPDX-License-Identifier: PMPL-1.0-or-later
//
// keelctl -- maintenance tool for Keel journaled block images
// Copyright (c) 2026 Keel contributors
//
// Subcommands:
// - `format`: lay down an empty journal (optionally creating the image)
// - `recover`: replay the log and leave a clean journal
// - `inspect`: show the header and the units replay would apply, read-only
// - `stat`: mount, report journal and device counters, unmount
//
// Results go to stdout as JSON; logs go to stderr.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use tracing::info;

use keel_block::{BlockDevice, FileDevice, MetricsDevice};
use keel_journal::{scan_log, CommitMode, Journal, JournalConfig, JournalGeometry};

const VERSION: &str = env!("CARGO_PKG_VERSION");

// ---------------------------------------------------------------------------
// CLI argument parsing
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "keelctl", version = VERSION, about = "Maintenance tool for Keel journaled block images")]
struct Cli {
    /// Log line format on stderr.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Where the image is and where its journal lives.
#[derive(Args, Debug, Clone)]
struct ImageArgs {
    /// Path of the block image.
    image: PathBuf,

    /// Block size in bytes.
    #[arg(long, default_value_t = 4096)]
    block_size: usize,

    /// Block holding the journal header.
    #[arg(long, default_value_t = 1)]
    header_block: u64,

    /// Size of the log region in blocks (it follows the header).
    #[arg(long, default_value_t = 1024)]
    log_blocks: u64,

    /// JSON journal configuration. Its geometry replaces the flags above.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write an empty journal onto the image.
    Format {
        #[command(flatten)]
        image: ImageArgs,

        /// Create (or truncate) the image with this many blocks first.
        #[arg(long)]
        blocks: Option<u64>,
    },
    /// Replay committed transactions and write a fresh header.
    Recover {
        #[command(flatten)]
        image: ImageArgs,
    },
    /// Print the header and the valid log run without writing anything.
    Inspect {
        #[command(flatten)]
        image: ImageArgs,
    },
    /// Mount, print journal and device statistics, unmount cleanly.
    Stat {
        #[command(flatten)]
        image: ImageArgs,
    },
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

impl ImageArgs {
    fn journal_config(&self) -> Result<JournalConfig> {
        let mut config = match &self.config {
            Some(path) => JournalConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => JournalConfig::for_geometry(JournalGeometry::contiguous(
                self.header_block,
                self.log_blocks,
            )),
        };
        // One-shot tool: no committer thread.
        config.commit_mode = CommitMode::Inline;
        Ok(config)
    }

    fn open_device(&self) -> Result<FileDevice> {
        FileDevice::open(&self.image, self.block_size)
            .with_context(|| format!("opening {}", self.image.display()))
    }
}

fn run_format(args: &ImageArgs, blocks: Option<u64>) -> Result<Value> {
    let config = args.journal_config()?;
    let device = match blocks {
        Some(count) => FileDevice::create(&args.image, args.block_size, count)
            .with_context(|| format!("creating {}", args.image.display()))?,
        None => args.open_device()?,
    };
    if !device.is_writable() {
        bail!("{} is read-only", device.path().display());
    }
    Journal::format(&device, &config.geometry)?;
    Ok(json!({
        "image": device.path(),
        "block_size": device.block_size(),
        "block_count": device.block_count(),
        "geometry": config.geometry,
    }))
}

fn run_recover(args: &ImageArgs) -> Result<Value> {
    let config = args.journal_config()?;
    let device: Arc<dyn BlockDevice> = Arc::new(args.open_device()?);
    let journal = Journal::new(device, config)?;
    let report = journal.mount_recover()?;
    journal.release()?;
    info!(
        replayed = report.transactions_replayed,
        mount_id = report.mount_id,
        "Recovery finished"
    );
    Ok(serde_json::to_value(report)?)
}

fn run_inspect(args: &ImageArgs) -> Result<Value> {
    let config = args.journal_config()?;
    let device = args.open_device()?;
    let scan = scan_log(&device, &config.geometry, config.trans_max)?;
    Ok(serde_json::to_value(scan)?)
}

fn run_stat(args: &ImageArgs) -> Result<Value> {
    let config = args.journal_config()?;
    let device = Arc::new(MetricsDevice::new(args.open_device()?));
    let journal = Journal::open(device.clone(), config)?;
    let stats = journal.stats();
    let report = journal.recovery_report();
    journal.release()?;
    Ok(json!({
        "journal": stats,
        "recovery": report,
        "device": device.stats(),
    }))
}

fn run(command: &Command) -> Result<Value> {
    match command {
        Command::Format { image, blocks } => run_format(image, *blocks),
        Command::Recover { image } => run_recover(image),
        Command::Inspect { image } => run_inspect(image),
        Command::Stat { image } => run_stat(image),
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn image_of(command: &Command) -> &Path {
    match command {
        Command::Format { image, .. }
        | Command::Recover { image }
        | Command::Inspect { image }
        | Command::Stat { image } => &image.image,
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let value = run(&cli.command)
        .with_context(|| format!("keelctl failed on {}", image_of(&cli.command).display()))?;
    print_json(&value)
}

#[cfg(test)]
mod tests {
    use super::*;

    use keel_journal::EndFlags;

    const BS: usize = 512;

    fn image_args(path: &Path) -> ImageArgs {
        ImageArgs {
            image: path.to_path_buf(),
            block_size: BS,
            header_block: 1,
            log_blocks: 32,
            config: None,
        }
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from([
            "keelctl",
            "format",
            "disk.img",
            "--block-size",
            "512",
            "--blocks",
            "128",
            "--log-format",
            "json",
        ])
        .unwrap();
        assert_eq!(cli.log_format, LogFormat::Json);
        match cli.command {
            Command::Format { image, blocks } => {
                assert_eq!(image.block_size, 512);
                assert_eq!(image.log_blocks, 1024);
                assert_eq!(blocks, Some(128));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_format_then_inspect_empty_log() {
        let dir = tempfile::tempdir().unwrap();
        let args = image_args(&dir.path().join("disk.img"));

        let formatted = run_format(&args, Some(128)).unwrap();
        assert_eq!(formatted["block_count"], 128);
        assert_eq!(formatted["geometry"]["log_start"], 2);

        let scan = run_inspect(&args).unwrap();
        assert_eq!(scan["header"]["last_flush_id"], 0);
        assert_eq!(scan["units"].as_array().unwrap().len(), 0);
        assert_eq!(scan["stop"]["kind"], "end_of_log");
    }

    #[test]
    fn test_recover_replays_unreleased_journal() {
        let dir = tempfile::tempdir().unwrap();
        let args = image_args(&dir.path().join("disk.img"));
        run_format(&args, Some(128)).unwrap();

        {
            let device: Arc<dyn BlockDevice> = Arc::new(args.open_device().unwrap());
            let journal = Journal::open(device, args.journal_config().unwrap()).unwrap();
            let mut txn = journal.begin(1).unwrap();
            journal.register_dirty(&txn, 100).unwrap().lock().fill(0x5A);
            journal.end(&mut txn, EndFlags::WAIT_FOR_DURABLE).unwrap();
            // Dropped without release: the unit stays in the log.
        }

        let scan = run_inspect(&args).unwrap();
        assert_eq!(scan["units"][0]["txn_id"], 1);
        assert_eq!(scan["units"][0]["addresses"], json!([100]));

        let report = run_recover(&args).unwrap();
        assert_eq!(report["transactions_replayed"], 1);
        assert_eq!(report["mount_id"], 2);

        let device = args.open_device().unwrap();
        assert_eq!(device.read_block_vec(100).unwrap(), vec![0x5A; BS]);
    }

    #[test]
    fn test_stat_reports_device_counters() {
        let dir = tempfile::tempdir().unwrap();
        let args = image_args(&dir.path().join("disk.img"));
        run_format(&args, Some(128)).unwrap();

        let stat = run_stat(&args).unwrap();
        assert_eq!(stat["journal"]["mount_id"], 1);
        assert_eq!(stat["recovery"]["transactions_replayed"], 0);
        assert!(stat["device"]["flush_count"].as_u64().unwrap() >= 1);
    }

    #[test]
    fn test_config_file_overrides_geometry() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("journal.json");
        std::fs::write(
            &config_path,
            r#"{"geometry": {"header_block": 0, "log_start": 1, "log_blocks": 16}, "trans_max": 2, "max_batch": 2}"#,
        )
        .unwrap();
        let mut args = image_args(&dir.path().join("disk.img"));
        args.config = Some(config_path);

        let config = args.journal_config().unwrap();
        assert_eq!(config.geometry.header_block, 0);
        assert_eq!(config.trans_max, 2);
        assert_eq!(config.commit_mode, CommitMode::Inline);

        let formatted = run_format(&args, Some(64)).unwrap();
        assert_eq!(formatted["geometry"]["log_blocks"], 16);
    }
}
