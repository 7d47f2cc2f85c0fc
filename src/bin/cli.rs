//! Binary entry point for the tandem administrative CLI.
#![forbid(unsafe_code)]

use std::error::Error;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use tandem::{
    admin::{checkpoint, run_concurrency_demo, stats, DemoOptions},
    Config, DurabilityMode,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "tandem",
    version,
    about = "Administrative CLI for tandem databases",
    disable_help_subcommand = true
)]
struct Cli {
    #[command(flatten)]
    open: OpenArgs,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for structured responses"
    )]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct OpenArgs {
    #[arg(
        long,
        global = true,
        env = "TANDEM_CONFIG",
        value_name = "FILE",
        help = "TOML file with database configuration"
    )]
    config: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        help = "Override page size (bytes) when creating a database"
    )]
    page_size: Option<u32>,

    #[arg(long, global = true, value_enum, help = "Commit durability override")]
    durability: Option<DurabilityArg>,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "Print store, WAL, and session statistics")]
    Stats {
        #[arg(value_name = "DB")]
        db_path: PathBuf,
    },

    #[command(about = "Fold committed WAL frames into the database file")]
    Checkpoint {
        #[arg(value_name = "DB")]
        db_path: PathBuf,
    },

    #[command(about = "Run a long write and a delayed read on two handles")]
    Demo(DemoCmd),
}

#[derive(Args, Debug)]
struct DemoCmd {
    #[arg(value_name = "DB")]
    db_path: PathBuf,

    #[arg(long, default_value_t = 2000, help = "Pages written by the long write")]
    write_pages: u32,

    #[arg(
        long,
        default_value_t = 100,
        help = "Milliseconds between starting the write and starting the read"
    )]
    read_delay_ms: u64,

    #[arg(
        long,
        default_value_t = 300,
        help = "Milliseconds the writer holds its transaction before committing"
    )]
    write_hold_ms: u64,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum DurabilityArg {
    Full,
    Batched,
}

impl From<DurabilityArg> for DurabilityMode {
    fn from(mode: DurabilityArg) -> Self {
        match mode {
            DurabilityArg::Full => DurabilityMode::FsyncPerCommit,
            DurabilityArg::Batched => DurabilityMode::Batched,
        }
    }
}

fn main() {
    init_tracing();
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tandem=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let config = build_config(&cli.open)?;

    match cli.command {
        Command::Stats { db_path } => {
            let report = stats(&db_path, &config)?;
            emit(&cli.format, &report, |fmt| print_stats_text(fmt, &report))?;
        }
        Command::Checkpoint { db_path } => {
            let report = checkpoint(&db_path, &config)?;
            emit(&cli.format, &report, |fmt| {
                print_checkpoint_text(fmt, &report)
            })?;
        }
        Command::Demo(cmd) => {
            let options = DemoOptions {
                write_pages: cmd.write_pages,
                read_delay: Duration::from_millis(cmd.read_delay_ms),
                write_hold: Duration::from_millis(cmd.write_hold_ms),
            };
            let report = run_concurrency_demo(&cmd.db_path, &config, &options)?;
            emit(&cli.format, &report, |fmt| print_demo_text(fmt, &report))?;
        }
    }

    Ok(())
}

fn build_config(args: &OpenArgs) -> Result<Config, Box<dyn Error>> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(page_size) = args.page_size {
        config.page_size = page_size;
    }
    if let Some(mode) = args.durability {
        config.durability = mode.into();
    }
    config.validate()?;
    Ok(config)
}

fn emit<T, F>(format: &OutputFormat, value: &T, printer: F) -> Result<(), Box<dyn Error>>
where
    T: serde::Serialize,
    F: Fn(OutputFormat),
{
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
        }
        OutputFormat::Text => printer(OutputFormat::Text),
    }
    Ok(())
}

fn print_stats_text(_: OutputFormat, report: &tandem::admin::StatsReport) {
    println!("Store:");
    println!(
        "  page_size={} page_count={} store_pages={} commit_seq={} checkpoint_seq={}",
        report.store.page_size,
        report.store.page_count,
        report.store.store_page_count,
        report.store.commit_seq,
        report.store.checkpoint_seq
    );
    if report.store.poisoned {
        println!("  POISONED: corruption detected");
    }
    println!();
    println!(
        "WAL: end={} live_from={} pending_frames={} index_entries={} resets={}",
        report.wal.end_offset,
        report.wal.live_from,
        report.wal.pending_frames,
        report.wal.index_entries,
        report.wal.resets
    );
    println!();
    println!(
        "Sessions: readers={} writer_active={} commits={} aborts={} checkpoints={}",
        report.sessions.active_readers,
        report.sessions.writer_active,
        report.sessions.commits,
        report.sessions.aborts,
        report.sessions.checkpoints
    );
    println!();
    println!(
        "Filesystem: db_size={} wal_size={} db_path={} wal_path={}",
        report.filesystem.db_size_bytes,
        report.filesystem.wal_size_bytes,
        report.filesystem.db_path,
        report.filesystem.wal_path
    );
}

fn print_checkpoint_text(_: OutputFormat, report: &tandem::admin::CheckpointReport) {
    println!(
        "Checkpoint flushed {} frames ({} pages) in {:.2} ms; checkpoint_seq={} truncated_before={} wal_reset={}",
        report.frames_flushed,
        report.pages_written,
        report.duration_ms,
        report.checkpoint_seq,
        report.truncated_before,
        report.wal_reset
    );
}

fn print_demo_text(_: OutputFormat, report: &tandem::admin::DemoReport) {
    println!(
        "Long write: {} pages committed as seq {} in {:.1} ms",
        report.write_pages, report.write_seq, report.write_duration_ms
    );
    println!(
        "Read: started at {:.1} ms, completed in {:.1} ms, saw seq {} ({} pages)",
        report.read_started_ms, report.read_duration_ms, report.read_seq, report.pages_read
    );
    if report.read_finished_first {
        println!("Read completed while the write was still running");
    } else {
        println!("Read finished after the write");
    }
}
