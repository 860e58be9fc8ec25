//! SegDB CLI
//!
//! Command-line interface for inspecting and editing a domain database.

use anyhow::{bail, Context, Result};
use chrono::DateTime;
use clap::{Parser, Subcommand};
use segdb_core::{Config, IteratorConfig, TimeRange, Timestamp, DB};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::PathBuf;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// SegDB CLI
#[derive(Parser, Debug)]
#[command(name = "segdb")]
#[command(about = "CLI for SegDB time-range storage", version)]
struct Args {
    /// Database directory [default: data]
    #[arg(short, long)]
    dir: Option<PathBuf>,

    /// JSON file with the database configuration
    #[arg(long)]
    config: Option<PathBuf>,

    /// Nominal data file size in bytes
    #[arg(long)]
    file_size: Option<u64>,

    /// Maximum number of open data file descriptors
    #[arg(long)]
    max_descriptors: Option<usize>,

    /// Share of the file size that must be deleted before a file is collected
    #[arg(long)]
    gc_threshold: Option<f32>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print database statistics as JSON
    Stats,

    /// List the domains overlapping a time range
    List {
        /// Range start (nanoseconds or RFC 3339)
        #[arg(long, value_parser = parse_timestamp)]
        start: Option<Timestamp>,

        /// Range end, exclusive
        #[arg(long, value_parser = parse_timestamp)]
        end: Option<Timestamp>,
    },

    /// Store the contents of a file as one domain
    Write {
        #[arg(long, value_parser = parse_timestamp)]
        start: Timestamp,

        #[arg(long, value_parser = parse_timestamp)]
        end: Timestamp,

        /// Input file, `-` for stdin
        input: PathBuf,
    },

    /// Dump the domain containing a timestamp
    Read {
        #[arg(value_parser = parse_timestamp)]
        ts: Timestamp,

        /// Output file, stdout when omitted
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Delete data between two index positions
    Delete {
        #[arg(long)]
        start_pos: usize,

        #[arg(long)]
        end_pos: usize,

        /// Bytes kept at the head of the first domain
        #[arg(long, default_value_t = 0)]
        start_offset: u64,

        /// Bytes removed from the head of the last domain
        #[arg(long, default_value_t = u64::MAX)]
        end_offset: u64,

        #[arg(long, value_parser = parse_timestamp)]
        start: Timestamp,

        #[arg(long, value_parser = parse_timestamp)]
        end: Timestamp,
    },

    /// Reclaim the space held by deleted data
    Gc,
}

/// Accept either integer nanoseconds or an RFC 3339 timestamp
fn parse_timestamp(s: &str) -> std::result::Result<Timestamp, String> {
    if let Ok(ns) = s.parse::<Timestamp>() {
        return Ok(ns);
    }
    DateTime::parse_from_rfc3339(s)
        .map_err(|e| format!("invalid timestamp {:?}: {}", s, e))?
        .timestamp_nanos_opt()
        .ok_or_else(|| format!("timestamp {:?} is out of range", s))
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed to read config {:?}", path))?;
            serde_json::from_str::<Config>(&raw)
                .with_context(|| format!("failed to parse config {:?}", path))?
        }
        None => Config::default(),
    };

    if let Some(dir) = &args.dir {
        config.dir = dir.clone();
    } else if config.dir.as_os_str().is_empty() {
        config.dir = PathBuf::from("data");
    }
    if let Some(file_size) = args.file_size {
        config.file_size = file_size;
    }
    if let Some(max_descriptors) = args.max_descriptors {
        config.max_descriptors = max_descriptors;
    }
    if let Some(gc_threshold) = args.gc_threshold {
        config.gc_threshold = gc_threshold;
    }
    Ok(config)
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.json_logs);

    let config = load_config(&args)?;
    debug!("Using configuration {:?}", config);
    let db = DB::open(config).context("failed to open database")?;

    let result = run(&db, args.command);
    db.close().context("failed to close database")?;
    result
}

fn run(db: &DB, command: Commands) -> Result<()> {
    match command {
        Commands::Stats => {
            println!("{}", serde_json::to_string_pretty(&db.stats()?)?);
        }

        Commands::List { start, end } => {
            let bounds = TimeRange::new(
                start.unwrap_or(TimeRange::MAX.start),
                end.unwrap_or(TimeRange::MAX.end),
            );
            let mut iter = db.open_iterator(IteratorConfig::new(bounds))?;
            let mut ok = iter.seek_first();
            while ok {
                if let (Some(pos), Some(pointer)) = (iter.position(), iter.pointer()) {
                    println!("{}\t{}", pos, serde_json::to_string(&pointer)?);
                }
                ok = iter.next();
            }
            iter.close()?;
        }

        Commands::Write { start, end, input } => {
            let mut data = Vec::new();
            if input.as_os_str() == "-" {
                io::stdin().read_to_end(&mut data)?;
            } else {
                File::open(&input)
                    .with_context(|| format!("failed to open {:?}", input))?
                    .read_to_end(&mut data)?;
            }
            let range = TimeRange::new(start, end);
            db.write(range, &data)?;
            info!("Wrote {} bytes to {}", data.len(), range);
        }

        Commands::Read { ts, out } => {
            let mut iter = db.open_iterator(IteratorConfig::new(TimeRange::point(ts)))?;
            if !iter.seek_first() {
                bail!("no domain contains timestamp {}", ts);
            }
            let mut reader = iter.open_reader()?;
            let copied = match out {
                Some(path) => {
                    let mut file = File::create(&path)
                        .with_context(|| format!("failed to create {:?}", path))?;
                    let copied = io::copy(&mut reader, &mut file)?;
                    file.sync_all()?;
                    copied
                }
                None => {
                    let mut stdout = io::stdout().lock();
                    let copied = io::copy(&mut reader, &mut stdout)?;
                    stdout.flush()?;
                    copied
                }
            };
            debug!("Read {} bytes from {}", copied, iter.time_range());
            reader.close()?;
            iter.close()?;
        }

        Commands::Delete {
            start_pos,
            end_pos,
            start_offset,
            end_offset,
            start,
            end,
        } => {
            let range = TimeRange::new(start, end);
            db.delete(start_pos, end_pos, start_offset, end_offset, range)?;
            info!("Deleted {} from positions {}..={}", range, start_pos, end_pos);
        }

        Commands::Gc => {
            let report = db.garbage_collect()?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(())
}
