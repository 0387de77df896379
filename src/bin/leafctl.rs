//! Command-line tool for inspecting and editing a single leaf block image.
#![forbid(unsafe_code)]

use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand, ValueEnum};
use leafnode::config::LeafConfig;
use leafnode::storage::btree::{
    dump_entries_since_time, fsck, strprint_leaf, AnySizer, EventLog, Leaf, LeafUsage,
    ReplicationEvent, ValueSizer,
};
use leafnode::types::{LeafError, Timestamp};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "leafctl",
    version,
    about = "Inspect and edit replicated B-tree leaf blocks",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        env = "LEAFCTL_CONFIG",
        value_name = "FILE",
        help = "TOML file with block size and value encoding"
    )]
    config: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for structured responses"
    )]
    format: OutputFormat,

    #[arg(
        long,
        global = true,
        help = "Read keys and values as hex and print them as hex"
    )]
    hex: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Writes an empty leaf block.
    Init {
        #[arg(value_name = "BLOCK")]
        block: PathBuf,
        #[arg(long, help = "Overwrite an existing file")]
        force: bool,
    },
    /// Inserts or overwrites a key.
    Put(PutCmd),
    /// Removes a key, recording the deletion for replicas.
    Del(KeyCmd),
    /// Drops a key without recording a deletion.
    Erase {
        #[arg(value_name = "BLOCK")]
        block: PathBuf,
        #[arg(value_name = "KEY")]
        key: String,
    },
    /// Prints the value stored under a key.
    Get {
        #[arg(value_name = "BLOCK")]
        block: PathBuf,
        #[arg(value_name = "KEY")]
        key: String,
    },
    /// Checks the block's structural invariants.
    Fsck {
        #[arg(value_name = "BLOCK")]
        block: PathBuf,
        #[arg(long, value_name = "KEY", help = "Smallest key the leaf may hold")]
        left: Option<String>,
        #[arg(long, value_name = "KEY", help = "Keys must sort before this one")]
        right: Option<String>,
    },
    /// Prints every pair and history record.
    Print {
        #[arg(value_name = "BLOCK")]
        block: PathBuf,
    },
    /// Prints the changes a replica at `--since` needs.
    Dump {
        #[arg(value_name = "BLOCK")]
        block: PathBuf,
        #[arg(long, default_value_t = 0, help = "Replica's last applied timestamp")]
        since: u64,
        #[arg(long, help = "Largest timestamp the block may contain")]
        max: Option<u64>,
    },
    /// Reports how the block's bytes are used.
    Usage {
        #[arg(value_name = "BLOCK")]
        block: PathBuf,
    },
}

#[derive(Args, Debug)]
struct PutCmd {
    #[arg(value_name = "BLOCK")]
    block: PathBuf,
    #[arg(value_name = "KEY")]
    key: String,
    #[arg(value_name = "VALUE")]
    value: String,
    #[arg(long, help = "Timestamp to stamp; defaults to one past the newest")]
    ts: Option<u64>,
}

#[derive(Args, Debug)]
struct KeyCmd {
    #[arg(value_name = "BLOCK")]
    block: PathBuf,
    #[arg(value_name = "KEY")]
    key: String,
    #[arg(long, help = "Timestamp to stamp; defaults to one past the newest")]
    ts: Option<u64>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Serialize)]
struct GetReport {
    key: String,
    value: Option<String>,
    timestamp: Option<u64>,
}

#[derive(Serialize)]
struct FsckReport {
    ok: bool,
    error: Option<String>,
}

#[derive(Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum DumpEvent {
    LostDeletions,
    Deletion { key: String, timestamp: u64 },
    Entry { key: String, value: String, timestamp: u64 },
}

#[derive(Serialize)]
struct DumpReport {
    since: u64,
    events: Vec<DumpEvent>,
}

fn main() {
    init_tracing();
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let config = LeafConfig::load(cli.config.as_deref())?;
    let sizer = config.sizer()?;
    let codec = Codec {
        hex: cli.hex,
        sizer,
    };

    match cli.command {
        Command::Init { block, force } => {
            if block.exists() && !force {
                return Err(format!("{} exists; pass --force to overwrite", block.display()).into());
            }
            let leaf = Leaf::init(&sizer, vec![0u8; sizer.block_size().value()])?;
            fs::write(&block, leaf.as_bytes())?;
            tracing::info!(
                path = %block.display(),
                block_size = %sizer.block_size(),
                "initialized leaf"
            );
        }
        Command::Put(cmd) => {
            let mut leaf = open_block(&sizer, &cmd.block)?;
            let key = codec.key(&cmd.key)?;
            let value = codec.value(&cmd.value)?;
            if leaf.is_full(&sizer, &key, Some(&value))? {
                return Err("leaf is full; split it before inserting".into());
            }
            let ts = stamp(&leaf, cmd.ts)?;
            leaf.insert(&sizer, &key, &value, ts)?;
            fs::write(&cmd.block, leaf.as_bytes())?;
        }
        Command::Del(cmd) => {
            let mut leaf = open_block(&sizer, &cmd.block)?;
            let key = codec.key(&cmd.key)?;
            if leaf.is_full(&sizer, &key, None)? {
                return Err("leaf has no room for the deletion record".into());
            }
            let ts = stamp(&leaf, cmd.ts)?;
            leaf.remove(&sizer, &key, ts)?;
            fs::write(&cmd.block, leaf.as_bytes())?;
        }
        Command::Erase { block, key } => {
            let mut leaf = open_block(&sizer, &block)?;
            let present = leaf.erase_presence(&sizer, &codec.key(&key)?)?;
            fs::write(&block, leaf.as_bytes())?;
            if !present {
                eprintln!("key was not present");
            }
        }
        Command::Get { block, key } => {
            let leaf = open_block(&sizer, &block)?;
            let raw_key = codec.key(&key)?;
            let found = leaf.lookup_entry(&sizer, &raw_key)?;
            let report = GetReport {
                key: codec.render(&raw_key),
                value: found
                    .map(|pair| codec.render_value(pair.value))
                    .transpose()?,
                timestamp: found.map(|pair| pair.timestamp.0),
            };
            emit(cli.format, &report, || match &report.value {
                Some(value) => println!("{value}"),
                None => println!("not found"),
            })?;
            if found.is_none() {
                std::process::exit(2);
            }
        }
        Command::Fsck { block, left, right } => {
            let leaf = open_block(&sizer, &block)?;
            let left = left.map(|key| codec.key(&key)).transpose()?;
            let right = right.map(|key| codec.key(&key)).transpose()?;
            let result = fsck(&sizer, left.as_deref(), right.as_deref(), &leaf, None);
            let report = FsckReport {
                ok: result.is_ok(),
                error: result.err(),
            };
            emit(cli.format, &report, || match &report.error {
                None => println!("ok"),
                Some(err) => println!("fsck failed: {err}"),
            })?;
            if !report.ok {
                std::process::exit(2);
            }
        }
        Command::Print { block } => {
            let leaf = open_block(&sizer, &block)?;
            print!("{}", strprint_leaf(&sizer, &leaf));
        }
        Command::Dump { block, since, max } => {
            let leaf = open_block(&sizer, &block)?;
            let maximum = Timestamp(max.unwrap_or(u64::MAX));
            let mut log = EventLog::default();
            dump_entries_since_time(&sizer, &leaf, Timestamp(since), maximum, &mut log)?;
            let events = log
                .events
                .iter()
                .map(|event| codec.dump_event(event))
                .collect::<Result<Vec<_>, LeafError>>()?;
            let report = DumpReport { since, events };
            emit(cli.format, &report, || print_dump_text(&report))?;
        }
        Command::Usage { block } => {
            let leaf = open_block(&sizer, &block)?;
            let usage = leaf.usage()?;
            usage.emit_tracing();
            emit(cli.format, &usage, || print_usage_text(&usage))?;
        }
    }
    Ok(())
}

fn open_block(sizer: &AnySizer, path: &Path) -> Result<Leaf<Vec<u8>>, Box<dyn Error>> {
    let bytes = fs::read(path).map_err(|err| format!("failed to read {}: {err}", path.display()))?;
    Ok(Leaf::open(sizer, bytes)?)
}

fn stamp(leaf: &Leaf<Vec<u8>>, explicit: Option<u64>) -> Result<Timestamp, Box<dyn Error>> {
    let newest = leaf.newest_timestamp();
    match explicit {
        Some(ts) if Timestamp(ts) < newest => {
            Err(format!("timestamp {ts} is older than the leaf's newest ({newest})").into())
        }
        Some(ts) => Ok(Timestamp(ts)),
        None => Ok(newest.next()),
    }
}

/// Translates between command-line text and stored bytes.
struct Codec {
    hex: bool,
    sizer: AnySizer,
}

impl Codec {
    fn key(&self, text: &str) -> Result<Vec<u8>, Box<dyn Error>> {
        self.bytes(text)
    }

    fn value(&self, text: &str) -> Result<Vec<u8>, Box<dyn Error>> {
        let payload = self.bytes(text)?;
        Ok(self.sizer.encode_value(&payload)?)
    }

    fn bytes(&self, text: &str) -> Result<Vec<u8>, Box<dyn Error>> {
        if self.hex {
            Ok(hex::decode(text)?)
        } else {
            Ok(text.as_bytes().to_vec())
        }
    }

    fn render(&self, bytes: &[u8]) -> String {
        if self.hex {
            hex::encode(bytes)
        } else {
            String::from_utf8_lossy(bytes).into_owned()
        }
    }

    fn render_value(&self, value: &[u8]) -> Result<String, LeafError> {
        Ok(self.render(self.sizer.decode_value(value)?))
    }

    fn dump_event(&self, event: &ReplicationEvent) -> Result<DumpEvent, LeafError> {
        Ok(match event {
            ReplicationEvent::LostDeletions => DumpEvent::LostDeletions,
            ReplicationEvent::Deletion { key, timestamp } => DumpEvent::Deletion {
                key: self.render(key),
                timestamp: timestamp.0,
            },
            ReplicationEvent::Entry {
                key,
                value,
                timestamp,
            } => DumpEvent::Entry {
                key: self.render(key),
                value: self.render_value(value)?,
                timestamp: timestamp.0,
            },
        })
    }
}

fn emit<T, F>(format: OutputFormat, value: &T, printer: F) -> Result<(), Box<dyn Error>>
where
    T: Serialize,
    F: Fn(),
{
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
        }
        OutputFormat::Text => printer(),
    }
    Ok(())
}

fn print_dump_text(report: &DumpReport) {
    println!("Changes since {}:", report.since);
    for event in &report.events {
        match event {
            DumpEvent::LostDeletions => println!("  lost-deletions"),
            DumpEvent::Deletion { key, timestamp } => println!("  delete {key} @{timestamp}"),
            DumpEvent::Entry {
                key,
                value,
                timestamp,
            } => println!("  entry {key} = {value} @{timestamp}"),
        }
    }
}

fn print_usage_text(usage: &LeafUsage) {
    println!(
        "block_size={} pairs={} live_bytes={} history_bytes={} history_records={} deletions={} free_bytes={}",
        usage.block_size,
        usage.num_pairs,
        usage.live_bytes(),
        usage.history_bytes,
        usage.history_records,
        usage.deletion_records,
        usage.free_bytes
    );
    println!("fill_ratio={:.3}", usage.fill_ratio());
}
