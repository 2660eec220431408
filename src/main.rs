//! Tierstore CLI
//!
//! Opens a persistent store, runs one command against it and disposes it,
//! so the index is written and the next invocation sees the same data.
//!
//! ```text
//! tierstore --dir /var/tmp/ts put user:1 alice --ttl 60
//! tierstore --dir /var/tmp/ts get user:1
//! tierstore --dir /var/tmp/ts stats --json
//! ```

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures::future::try_join_all;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tierstore::{
    AsyncTieredStore, DiskConfig, Element, PolicyKind, StoreConfig, TieredStore,
};

/// Writes issued concurrently by `fill`
const FILL_BATCH: usize = 64;

// =============================================================================
// CLI Arguments
// =============================================================================

/// Tierstore - tiered in-process element store
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory holding the data and index files
    #[arg(long, env = "TIERSTORE_DIR", default_value = "./tierstore-data")]
    dir: PathBuf,

    /// Store name (file prefix), default "cli"
    #[arg(long, env = "TIERSTORE_NAME")]
    name: Option<String>,

    /// JSON store configuration; flags below override it
    #[arg(long, env = "TIERSTORE_CONFIG")]
    config: Option<PathBuf>,

    /// Maximum elements held in memory (0 = unbounded)
    #[arg(long, env = "TIERSTORE_MAX_IN_MEMORY")]
    max_in_memory: Option<usize>,

    /// Maximum elements held on disk (0 = unbounded)
    #[arg(long, env = "TIERSTORE_MAX_ON_DISK")]
    max_on_disk: Option<usize>,

    /// Eviction policy (lru, lfu, fifo, clock)
    #[arg(long, env = "TIERSTORE_POLICY")]
    policy: Option<PolicyKind>,

    /// Do not keep data between invocations
    #[arg(long)]
    no_persist: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "warn")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Store a value
    Put {
        key: String,
        value: String,
        /// Time to live in seconds
        #[arg(long)]
        ttl: Option<u32>,
        /// Time to idle in seconds
        #[arg(long)]
        tti: Option<u32>,
        /// Keep the element in memory
        #[arg(long)]
        pin: bool,
    },
    /// Print a value and its metadata
    Get { key: String },
    /// Remove a key
    Remove { key: String },
    /// List keys
    Keys,
    /// Print store statistics
    Stats {
        #[arg(long)]
        json: bool,
    },
    /// Write generated elements
    Fill {
        #[arg(long, default_value = "1000")]
        count: usize,
        #[arg(long, default_value = "256")]
        value_size: usize,
    },
    /// Remove every element
    Clear,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let config = build_config(&args)?;
    let store: TieredStore<String> =
        TieredStore::open(config).context("failed to open store")?;
    let store = AsyncTieredStore::from(store);

    let outcome = run(&store, args.command).await;
    store.dispose().await.context("failed to dispose store")?;
    outcome
}

fn build_config(args: &Args) -> Result<StoreConfig> {
    let mut config = match &args.config {
        Some(path) => StoreConfig::from_file(path)?,
        None => StoreConfig::new("cli", 10_000),
    };
    if let Some(name) = &args.name {
        config.name = name.clone();
    }
    if let Some(max) = args.max_in_memory {
        config.max_elements_in_memory = max;
    }
    if let Some(policy) = args.policy {
        config.eviction_policy = policy;
    }

    let mut disk = config
        .disk
        .take()
        .unwrap_or_else(|| DiskConfig::new(&args.dir));
    disk.persistent = !args.no_persist;
    if let Some(max) = args.max_on_disk {
        disk.max_elements_on_disk = max;
    }
    config.disk = Some(disk);

    config.validate()?;
    Ok(config)
}

async fn run(store: &AsyncTieredStore<String>, command: Command) -> Result<()> {
    match command {
        Command::Put {
            key,
            value,
            ttl,
            tti,
            pin,
        } => {
            let mut element = Element::new(key.clone(), value.into_bytes());
            if let Some(ttl) = ttl {
                element = element.with_ttl(ttl);
            }
            if let Some(tti) = tti {
                element = element.with_tti(tti);
            }
            let created = if pin {
                store.put_pinned(element).await?
            } else {
                store.put(element).await?
            };
            println!("{} {}", if created { "created" } else { "updated" }, key);
        }
        Command::Get { key } => match store.get(key.clone()).await? {
            Some(element) => {
                println!("{}", String::from_utf8_lossy(element.value()));
                println!(
                    "  version={} hits={} ttl={} tti={} expires={}",
                    element.version(),
                    element.hit_count(),
                    element.time_to_live(),
                    element.time_to_idle(),
                    match element.expiration_time() {
                        u64::MAX => "never".to_string(),
                        millis => millis.to_string(),
                    }
                );
            }
            None => bail!("key not found: {}", key),
        },
        Command::Remove { key } => match store.remove(key.clone()).await? {
            Some(_) => println!("removed {}", key),
            None => bail!("key not found: {}", key),
        },
        Command::Keys => {
            let mut keys = store.inner().keys()?;
            keys.sort();
            for key in keys {
                println!("{}", key);
            }
        }
        Command::Stats { json } => {
            let stats = store.statistics();
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("{}", stats);
            }
        }
        Command::Fill { count, value_size } => {
            let started = Instant::now();
            let keys: Vec<usize> = (0..count).collect();
            for batch in keys.chunks(FILL_BATCH) {
                let puts = batch.iter().map(|i| {
                    let value = vec![(i % 251) as u8; value_size];
                    store.put(Element::new(format!("fill-{}", i), value))
                });
                try_join_all(puts).await?;
            }
            let elapsed = started.elapsed();
            info!(count, value_size, elapsed_ms = elapsed.as_millis() as u64, "fill complete");
            println!(
                "wrote {} elements of {} bytes in {:.2?} ({} in memory, {} on disk)",
                count,
                value_size,
                elapsed,
                store.inner().in_memory_size(),
                store.inner().on_disk_size()
            );
        }
        Command::Clear => {
            store.remove_all().await?;
            println!("cleared");
        }
    }
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::WARN,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
