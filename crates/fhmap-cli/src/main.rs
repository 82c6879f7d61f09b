//! # fhmapctl
//!
//! Operator tool for inspecting and editing an fhmap storage directory.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use fhmap::store::{dump_directory, shard_file_indices};
use fhmap::{fh4_hash, Digest, HandleMap, MapError};
use fhmap_config::logging::{init_logging, LogLevel};
use fhmap_config::{log_cli_debug, log_cli_info, Config};

/// Inspect and edit NFS handle mapping stores
#[derive(Parser)]
#[command(name = "fhmapctl")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Config file to use instead of ~/.fhmap/config.toml and ./fhmap.toml
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Storage directory holding the shard stores
    #[arg(long, global = true, env = "FHMAP_DB_DIR")]
    db_dir: Option<PathBuf>,

    /// Number of shards
    #[arg(long, global = true)]
    shards: Option<u32>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the effective configuration as TOML
    Config {
        /// Print built-in defaults instead
        #[arg(long)]
        defaults: bool,
    },

    /// Count shard store files in a directory
    Census {
        #[arg(value_name = "DIR")]
        dir: Option<PathBuf>,
    },

    /// Compute the digest of a handle
    Digest {
        #[arg(long)]
        object_id: u64,

        /// Handle bytes as hex
        #[arg(long)]
        handle: String,
    },

    /// Look up the handle mapped to a digest
    Get {
        #[arg(long)]
        object_id: u64,

        #[arg(long)]
        hash: u32,
    },

    /// Map a digest to a handle
    Set {
        #[arg(long)]
        object_id: u64,

        /// Defaults to the hash of the handle
        #[arg(long)]
        hash: Option<u32>,

        /// Handle bytes as hex
        #[arg(long)]
        handle: String,
    },

    /// Remove a mapping
    Del {
        #[arg(long)]
        object_id: u64,

        #[arg(long)]
        hash: u32,
    },

    /// List every stored row, flagging malformed ones
    Dump {
        #[arg(value_name = "DIR")]
        dir: Option<PathBuf>,
    },

    /// Open the map and print entry and shard counts
    Stats,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => Config::load().context("Failed to load config")?,
    };
    if let Some(dir) = &cli.db_dir {
        config.handle_map.storage_directory = dir.clone();
    }
    if let Some(n) = cli.shards {
        config.handle_map.shard_count = n;
    }

    let level = config
        .logging
        .level
        .parse::<LogLevel>()
        .unwrap_or(LogLevel::Warn);
    init_logging(level);
    log_cli_debug!(
        "Configuration loaded",
        storage = tracing::field::display(config.handle_map.storage_directory.display()),
        shards = config.handle_map.shard_count
    );

    match cli.command {
        Commands::Config { defaults } => {
            if defaults {
                print!("{}", Config::default_toml());
            } else {
                print!("{}", toml::to_string_pretty(&config)?);
            }
            Ok(())
        }
        Commands::Census { dir } => {
            let dir = dir.unwrap_or_else(|| config.handle_map.storage_directory.clone());
            cmd_census(&dir, config.handle_map.shard_count)
        }
        Commands::Digest { object_id, handle } => {
            let handle = parse_handle(&handle)?;
            let digest = Digest::for_handle(object_id, &handle);
            println!("object_id:   {}", digest.object_id);
            println!("handle_hash: {}", digest.handle_hash);
            println!("wire:        {}", hex::encode(digest.to_wire()));
            println!(
                "shard:       {}",
                fhmap::select_shard(&digest, config.handle_map.shard_count.max(1))
            );
            Ok(())
        }
        Commands::Get { object_id, hash } => {
            let map = open_map(&config)?;
            let digest = Digest::new(object_id, hash);
            match map.get_fh(&digest) {
                Ok(handle) => {
                    println!("{}", hex::encode(handle));
                    Ok(())
                }
                Err(MapError::Stale) => bail!("No mapping for {}", digest),
                Err(e) => Err(e.into()),
            }
        }
        Commands::Set {
            object_id,
            hash,
            handle,
        } => {
            let handle = parse_handle(&handle)?;
            let hash = hash.unwrap_or_else(|| fh4_hash(&handle, object_id as u32));
            let digest = Digest::new(object_id, hash);
            let map = open_map(&config)?;
            match map.set_fh(&digest, &handle) {
                Ok(()) => println!("Mapped {} ({} bytes)", digest, handle.len()),
                Err(MapError::Exists) => println!("Already mapped: {}", digest),
                Err(e) => return Err(e.into()),
            }
            map.flush();
            map.shutdown();
            Ok(())
        }
        Commands::Del { object_id, hash } => {
            let map = open_map(&config)?;
            let digest = Digest::new(object_id, hash);
            match map.del_fh(&digest) {
                Ok(()) => println!("Removed {}", digest),
                Err(MapError::Stale) => bail!("No mapping for {}", digest),
                Err(e) => return Err(e.into()),
            }
            map.flush();
            map.shutdown();
            Ok(())
        }
        Commands::Dump { dir } => {
            let dir = dir.unwrap_or_else(|| config.handle_map.storage_directory.clone());
            cmd_dump(&dir, &config)
        }
        Commands::Stats => {
            let map = open_map(&config)?;
            let stats = map.stats();
            println!("Storage:  {}", map.storage_directory().display());
            println!("Entries:  {}", stats.entries);
            println!("Shards:   {}", stats.shards.len());
            for shard in &stats.shards {
                println!(
                    "  [{}] status={} pending={}",
                    shard.index, shard.status, shard.pending
                );
            }
            Ok(())
        }
    }
}

fn open_map(config: &Config) -> Result<HandleMap> {
    log_cli_info!(
        "Opening handle map",
        dir = tracing::field::display(config.handle_map.storage_directory.display())
    );
    HandleMap::init(&config.handle_map).with_context(|| {
        format!(
            "Failed to open handle map at {}",
            config.handle_map.storage_directory.display()
        )
    })
}

fn parse_handle(text: &str) -> Result<Vec<u8>> {
    hex::decode(text.trim()).with_context(|| format!("Invalid hex handle: {}", text))
}

fn cmd_census(dir: &Path, configured: u32) -> Result<()> {
    let indices = shard_file_indices(dir)
        .with_context(|| format!("Failed to scan {}", dir.display()))?;
    println!("Directory:  {}", dir.display());
    println!("Shards:     {}", indices.len());
    println!("Configured: {}", configured);
    if !indices.is_empty() && indices.len() != configured as usize {
        println!("Mismatch: this directory will be refused at startup");
    }
    Ok(())
}

fn cmd_dump(dir: &Path, config: &Config) -> Result<()> {
    let shards = dump_directory(
        dir,
        config.handle_map.map_size_bytes(),
        config.handle_map.max_handle_size,
    )
    .with_context(|| format!("Failed to dump {}", dir.display()))?;

    let mut bad = 0usize;
    for (index, rows) in &shards {
        println!("# shard {} ({} rows)", index, rows.len());
        for row in rows {
            match &row.decoded {
                Ok((digest, handle)) => {
                    println!("{}\t{}", digest, hex::encode(handle));
                }
                Err(fault) => {
                    bad += 1;
                    println!("!{}\t{}", hex::encode(&row.key), fault);
                }
            }
        }
    }
    if bad > 0 {
        println!("{} malformed rows", bad);
    }
    Ok(())
}
