//! evalrun: generation cache management CLI

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use evalrun::cache::{CacheEntryInfo, CacheFilter, CacheStore};
use evalrun::RunConfig;

/// evalrun CLI
#[derive(Parser)]
#[command(name = "evalrun")]
#[command(version = evalrun::PKG_VERSION)]
#[command(about = "Evaluation runner tooling")]
struct Cli {
    /// Config file (default: ~/.evalrun/config.toml, then /etc/evalrun/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Cache directory (overrides the config file)
    #[arg(long, global = true, env = "EVALRUN_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Manage the generation cache
    #[command(subcommand)]
    Cache(CacheCommand),
}

#[derive(Subcommand)]
enum CacheCommand {
    /// List cached generations
    List {
        /// Only expired entries
        #[arg(long)]
        expired: bool,
        #[command(flatten)]
        filter: FilterArgs,
    },

    /// Remove expired entries
    Prune {
        #[command(flatten)]
        filter: FilterArgs,
    },

    /// Remove entries, expired or not
    Clear {
        #[command(flatten)]
        filter: FilterArgs,
        /// Required to clear without a filter
        #[arg(long)]
        all: bool,
    },

    /// Print the cache directory
    Path,
}

#[derive(Args)]
struct FilterArgs {
    /// Only entries for this model
    #[arg(short, long)]
    model: Option<String>,

    /// Only entries with this scope label (repeatable)
    #[arg(long = "scope", value_name = "NAME=VALUE", value_parser = parse_scope)]
    scopes: Vec<(String, String)>,
}

impl FilterArgs {
    fn into_filter(self) -> CacheFilter {
        let mut filter = CacheFilter::new();
        if let Some(model) = self.model {
            filter = filter.model(model);
        }
        for (name, value) in self.scopes {
            filter = filter.scope(name, value);
        }
        filter
    }
}

fn parse_scope(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
        _ => Err(format!("expected NAME=VALUE, got '{raw}'")),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialise tracing (default: warn for CLI; override with RUST_LOG).
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = RunConfig::load(cli.config.as_deref())?;
    let mut cache_config = config.cache_config();
    if let Some(dir) = cli.cache_dir {
        cache_config = cache_config.dir(dir);
    }
    let store = CacheStore::new(&cache_config);

    match cli.command {
        Command::Cache(CacheCommand::List { expired, filter }) => {
            let mut filter = filter.into_filter();
            if expired {
                filter = filter.expired_only();
            }
            let entries = store.list(&filter).await?;
            if entries.is_empty() {
                println!("no cached generations");
            } else {
                for entry in &entries {
                    print_entry(entry);
                }
                let bytes: u64 = entries.iter().map(|e| e.size_bytes).sum();
                println!("{} entries, {}", entries.len(), human_bytes(bytes));
            }
        }

        Command::Cache(CacheCommand::Prune { filter }) => {
            let removed = store.prune(&filter.into_filter()).await?;
            println!("pruned {removed} expired entries");
        }

        Command::Cache(CacheCommand::Clear { filter, all }) => {
            let filter = filter.into_filter();
            if filter == CacheFilter::default() && !all {
                return Err("refusing to clear the whole cache without --all".into());
            }
            let removed = store.clear(&filter).await?;
            println!("cleared {removed} entries");
        }

        Command::Cache(CacheCommand::Path) => {
            println!("{}", store.dir().display());
        }
    }

    Ok(())
}

fn print_entry(entry: &CacheEntryInfo) {
    let expiry = match entry.expires_at {
        Some(at) if entry.expired => format!("expired {}", at.format("%Y-%m-%d %H:%M")),
        Some(at) => format!("expires {}", at.format("%Y-%m-%d %H:%M")),
        None => "never expires".to_string(),
    };
    let scopes = entry
        .scopes
        .iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join(",");
    println!(
        "{}  {}  {}  {}{}",
        &entry.key[..12.min(entry.key.len())],
        entry.model,
        expiry,
        human_bytes(entry.size_bytes),
        if scopes.is_empty() {
            String::new()
        } else {
            format!("  [{scopes}]")
        }
    );
}

fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
