//! lobstore CLI - Admin Command Line Interface
//!
//! This binary formats store files and moves objects in and out of them.
//! Each object is addressed by an inode file: the 120-byte inode record a
//! table row would normally carry.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use lobstore_common::{StoreConfig, WritePolicy};
use lobstore_storage::{
    BlobReader, BlobWriter, ClobReader, ClobWriter, INLINE_SIZE, INODE_DIRECT_SLOTS, INODE_SIZE,
    Inode, Store,
};
use serde::Deserialize;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "lobstore-cli")]
#[command(about = "lobstore Admin CLI")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "LOBSTORE_CONFIG", default_value = "lobstore.toml")]
    config: String,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Format a new store file
    Init {
        /// Store file path
        store: PathBuf,
        /// Store size (e.g. "64M", "1G")
        #[arg(short, long)]
        size: Option<String>,
        /// Block size in bytes
        #[arg(long)]
        block_size: Option<u32>,
        /// Fragments per block
        #[arg(long)]
        fragments_per_block: Option<u32>,
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Show store geometry and usage
    Stat {
        /// Store file path
        store: PathBuf,
    },
    /// Write an object, replacing whatever the inode held
    Put {
        /// Store file path
        store: PathBuf,
        /// Inode file path (created if missing)
        inode: PathBuf,
        /// Input file (stdin if omitted)
        #[arg(short, long)]
        input: Option<PathBuf>,
        /// Store the input as UTF-16 text
        #[arg(long)]
        clob: bool,
    },
    /// Read an object
    Get {
        /// Store file path
        store: PathBuf,
        /// Inode file path
        inode: PathBuf,
        /// Output file (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Decode the object as UTF-16 text
        #[arg(long)]
        clob: bool,
    },
    /// Free an object's fragments and reset its inode
    Rm {
        /// Store file path
        store: PathBuf,
        /// Inode file path
        inode: PathBuf,
    },
    /// Decode an inode file
    Inspect {
        /// Inode file path
        inode: PathBuf,
    },
}

/// Configuration file structure
#[derive(Debug, Deserialize, Default)]
struct Config {
    #[serde(default)]
    store: StoreConfig,
    #[serde(default)]
    logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
struct LoggingConfig {
    #[serde(default = "default_log_level")]
    level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "warn".to_string()
}

fn load_config(path: &str) -> Result<Config> {
    if !Path::new(path).exists() {
        return Ok(Config::default());
    }
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
    let config: Config = toml::from_str(&text).with_context(|| format!("parsing {path}"))?;
    config.store.validate()?;
    Ok(config)
}

/// Parse a human-readable size string (e.g. "10G", "500M", "64K") into bytes.
fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim();
    let (num, multiplier) = if let Some(n) = s.strip_suffix('T') {
        (n, 1024 * 1024 * 1024 * 1024)
    } else if let Some(n) = s.strip_suffix('G') {
        (n, 1024 * 1024 * 1024)
    } else if let Some(n) = s.strip_suffix('M') {
        (n, 1024 * 1024)
    } else if let Some(n) = s.strip_suffix('K') {
        (n, 1024)
    } else {
        // Assume bytes if no suffix
        (s, 1)
    };
    let value: u64 = num
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid size: '{s}'"))?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| anyhow::anyhow!("Size too large: '{s}'"))
}

/// Format bytes as a human-readable size string.
fn format_size(bytes: u64) -> String {
    const GIB: u64 = 1024 * 1024 * 1024;
    const MIB: u64 = 1024 * 1024;
    const KIB: u64 = 1024;

    if bytes >= GIB && bytes.is_multiple_of(GIB) {
        format!("{} GiB", bytes / GIB)
    } else if bytes >= MIB && bytes.is_multiple_of(MIB) {
        format!("{} MiB", bytes / MIB)
    } else if bytes >= KIB && bytes.is_multiple_of(KIB) {
        format!("{} KiB", bytes / KIB)
    } else if bytes >= GIB {
        format!("{:.1} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.1} MiB", bytes as f64 / MIB as f64)
    } else {
        format!("{bytes} B")
    }
}

/// Read an inode file, or an empty record if it does not exist
fn read_inode_file(path: &Path, must_exist: bool) -> Result<[u8; INODE_SIZE]> {
    let mut record = [0u8; INODE_SIZE];
    if !path.exists() {
        if must_exist {
            bail!("inode file {} not found", path.display());
        }
        return Ok(record);
    }
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    if bytes.len() != INODE_SIZE {
        bail!(
            "inode file {} is {} bytes, expected {INODE_SIZE}",
            path.display(),
            bytes.len()
        );
    }
    record.copy_from_slice(&bytes);
    Ok(record)
}

fn write_inode_file(path: &Path, record: &[u8; INODE_SIZE]) -> Result<()> {
    std::fs::write(path, record).with_context(|| format!("writing {}", path.display()))
}

fn init(
    path: &Path,
    mut config: StoreConfig,
    size: Option<String>,
    block_size: Option<u32>,
    fragments_per_block: Option<u32>,
    force: bool,
) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists; pass --force to overwrite", path.display());
    }

    // CLI flags take precedence over the config file
    if let Some(block_size) = block_size {
        config.block_size = block_size;
    }
    if let Some(fragments_per_block) = fragments_per_block {
        config.fragments_per_block = fragments_per_block;
    }
    if let Some(size) = size {
        config.capacity_blocks = parse_size(&size)? / u64::from(config.block_size.max(1));
    }
    config.validate()?;

    let store = Store::create_file(path, &config)?;
    store.sync()?;
    println!(
        "Formatted {}: {} blocks of {}, {} fragments of {} per block",
        path.display(),
        store.total_blocks(),
        format_size(store.block_size() as u64),
        store.geometry().fragments_per_block(),
        format_size(store.fragment_size() as u64),
    );
    Ok(())
}

fn stat(path: &Path, config: &StoreConfig) -> Result<()> {
    let store = Store::open_file(path, config)?;
    let sb = store.superblock();
    let block_size = store.block_size() as u64;

    println!("Store: {}", path.display());
    println!("===========");
    println!("Format version:      {}", sb.version);
    println!("Block size:          {}", format_size(block_size));
    println!(
        "Fragment size:       {} ({} per block)",
        format_size(store.fragment_size() as u64),
        sb.fragments_per_block
    );
    println!(
        "Total blocks:        {} ({})",
        sb.total_blocks,
        format_size(sb.total_blocks * block_size)
    );
    println!("Metadata blocks:     {}", sb.meta_blocks);
    println!(
        "Free blocks:         {} ({})",
        store.free_blocks(),
        format_size(store.free_blocks() * block_size)
    );
    println!("Used fragments:      {}", store.used_fragments());
    println!(
        "Max object size:     {}",
        format_size(Inode::<&[u8]>::capacity(store.fragment_size()))
    );
    println!("Syncs:               {}", sb.sync_count);
    println!("Created:             {} (unix)", sb.created_at);
    Ok(())
}

fn put(
    store_path: &Path,
    inode_path: &Path,
    input: Option<&Path>,
    clob: bool,
    config: &StoreConfig,
) -> Result<()> {
    let store = Store::open_file(store_path, config)?;
    let mut record = read_inode_file(inode_path, false)?;

    let mut data = Vec::new();
    match input {
        Some(path) => {
            std::fs::File::open(path)
                .with_context(|| format!("opening {}", path.display()))?
                .read_to_end(&mut data)?;
        }
        None => {
            std::io::stdin().read_to_end(&mut data)?;
        }
    }

    let result = if clob {
        let text = String::from_utf8(data).context("CLOB input must be UTF-8")?;
        ClobWriter::create(&store, &mut record, 0).and_then(|mut writer| {
            writer.write_str(&text)?;
            Ok(writer.finish() * 2)
        })
    } else {
        BlobWriter::create(&store, &mut record, 0).and_then(|mut writer| {
            writer.write(&data)?;
            Ok(writer.finish())
        })
    };

    // The inode changes even on failure: create releases the old object
    write_inode_file(inode_path, &record)?;
    let len = result?;
    store.sync()?;

    info!(inode = %inode_path.display(), len, "stored object");
    println!("Stored {} in {}", format_size(len), inode_path.display());
    Ok(())
}

fn get(
    store_path: &Path,
    inode_path: &Path,
    output: Option<&Path>,
    clob: bool,
    config: &StoreConfig,
) -> Result<()> {
    let store = Store::open_file(store_path, config)?;
    let record = read_inode_file(inode_path, true)?;

    let data = if clob {
        ClobReader::open(&store, &record, 0)?.read_to_string()?.into_bytes()
    } else {
        let mut data = Vec::new();
        BlobReader::open(&store, &record, 0)?.read_to_end(&mut data)?;
        data
    };
    debug!(inode = %inode_path.display(), len = data.len(), "read object");

    match output {
        Some(path) => std::fs::write(path, &data)
            .with_context(|| format!("writing {}", path.display()))?,
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&data)?;
            stdout.flush()?;
        }
    }
    Ok(())
}

fn rm(store_path: &Path, inode_path: &Path, config: &StoreConfig) -> Result<()> {
    let store = Store::open_file(store_path, config)?;
    let mut record = read_inode_file(inode_path, true)?;

    let freed = Inode::new(&mut record[..], 0)?.free_fragments(&store)?;
    write_inode_file(inode_path, &record)?;
    store.sync()?;

    println!("Freed {freed} fragments");
    Ok(())
}

fn inspect(inode_path: &Path) -> Result<()> {
    let record = read_inode_file(inode_path, true)?;
    let inode = Inode::new(&record[..], 0)?;

    println!("Inode: {}", inode_path.display());
    println!("Length: {} bytes", inode.len());
    if inode.is_inline() {
        println!("Storage: inline ({} of {INLINE_SIZE} bytes)", inode.len());
        println!("Data: {}", hex::encode(inode.inline_data()));
    } else {
        println!("Storage: fragments");
        for slot in 0..INODE_DIRECT_SLOTS {
            let addr = inode.slot(slot)?;
            if addr.is_null() {
                println!("  slot {slot:2}: -");
            } else {
                println!("  slot {slot:2}: {addr}");
            }
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();
    let config = load_config(&args.config)?;

    let log_level = if args.log_level == "warn" {
        config.logging.level.clone()
    } else {
        args.log_level.clone()
    };

    // Initialize logging; stdout carries object data
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    debug!(config = %args.config, "loaded configuration");
    if config.store.write_policy == WritePolicy::WriteThrough {
        debug!("write-through cache policy");
    }

    match args.command {
        Commands::Init {
            store,
            size,
            block_size,
            fragments_per_block,
            force,
        } => init(
            &store,
            config.store,
            size,
            block_size,
            fragments_per_block,
            force,
        ),
        Commands::Stat { store } => stat(&store, &config.store),
        Commands::Put {
            store,
            inode,
            input,
            clob,
        } => put(&store, &inode, input.as_deref(), clob, &config.store),
        Commands::Get {
            store,
            inode,
            output,
            clob,
        } => get(&store, &inode, output.as_deref(), clob, &config.store),
        Commands::Rm { store, inode } => rm(&store, &inode, &config.store),
        Commands::Inspect { inode } => inspect(&inode),
    }
}
