use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use mirror_index::{
    ChangeCompactor, IndexMaintainer, MirrorStore, NotificationSource, Snapshot,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;

use config::Config;

#[derive(Parser)]
#[command(name = "fsmirror")]
#[command(about = "Filesystem change tracking for directory mirroring", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Increase logging verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Configuration file (defaults to ~/.fsmirror/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Configure a root and build its initial index
    Init {
        /// Directory to mirror
        root: PathBuf,

        /// Database location
        #[arg(long)]
        database: Option<PathBuf>,

        /// Only index base names matching these globs
        #[arg(long = "include")]
        includes: Vec<String>,

        /// Skip base names matching these globs (replaces the defaults)
        #[arg(long = "exclude")]
        excludes: Vec<String>,
    },

    /// Follow filesystem notifications until interrupted
    Watch,

    /// Rescan the root and fix up the index
    Reconcile,

    /// Print compacted changes
    Changes {
        /// Changes after this sequence number
        #[arg(long, conflicts_with = "consumer")]
        since: Option<i64>,

        /// Changes this consumer has not acknowledged
        #[arg(long)]
        consumer: Option<String>,

        /// Acknowledge the printed changes for the consumer
        #[arg(long, conflicts_with = "since")]
        ack: bool,
    },

    /// Advance a consumer's checkpoint
    Ack {
        consumer: String,
        seq: i64,
    },

    /// Print the digest of a path under the root
    Digest {
        path: PathBuf,
    },

    /// Save the indexed state to a JSON file
    Snapshot {
        out: PathBuf,
    },

    /// Compare the indexed state with a saved snapshot
    Diff {
        older: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config_path = match cli.config {
        Some(path) => path,
        None => config::get_config_path()?,
    };

    match cli.command {
        Commands::Init {
            root,
            database,
            includes,
            excludes,
        } => {
            let root = root
                .canonicalize()
                .with_context(|| format!("Cannot resolve root: {}", root.display()))?;

            let mut config = Config::new(root)?;
            if let Some(database) = database {
                config.database = database;
            }
            config.includes = includes;
            if !excludes.is_empty() {
                config.excludes = excludes;
            }
            config.save(&config_path)?;
            info!("Configuration saved to {}", config_path.display());

            let maintainer = open_maintainer(&config)?;
            let diff = maintainer.reconcile().await?;
            print_json(&serde_json::json!({
                "config": config_path,
                "root": config.root,
                "database": config.database,
                "indexed": maintainer.index().count().await?,
                "created": diff.created.len(),
            }))?;
        }
        Commands::Watch => {
            let config = Config::load(&config_path)?;
            let store = open_store(&config)?;
            let maintainer = IndexMaintainer::new(
                store.clone(),
                config.root.clone(),
                &config.maintainer_config(),
            )?;

            let mut source = NotificationSource::new(&config.root)?;
            source.watch()?;
            let receiver = source
                .take_receiver()
                .context("Notification receiver already taken")?;

            // Catch up on anything that changed while nobody was watching
            maintainer.reconcile().await?;

            let (connections, idle) = store.pool_stats();
            info!(
                "Watching {} ({} database connections, {} idle)",
                config.root.display(),
                connections,
                idle
            );

            tokio::select! {
                result = maintainer.run(receiver) => result?,
                signal = tokio::signal::ctrl_c() => {
                    signal.context("Failed to listen for interrupt")?;
                    info!("Interrupted, stopping watch");
                }
            }
        }
        Commands::Reconcile => {
            let config = Config::load(&config_path)?;
            let diff = open_maintainer(&config)?.reconcile().await?;
            print_json(&diff)?;
        }
        Commands::Changes {
            since,
            consumer,
            ack,
        } => {
            let config = Config::load(&config_path)?;
            let compactor = ChangeCompactor::new(open_store(&config)?);

            let compacted = match since {
                Some(since) => compactor.get_changes(since).await?,
                None => {
                    let consumer = consumer.as_deref().unwrap_or(&config.consumer);
                    let compacted = compactor.changes_for(consumer).await?;
                    if ack {
                        compactor.acknowledge(consumer, compacted.last_seq).await?;
                    }
                    compacted
                }
            };
            print_json(&compacted)?;
        }
        Commands::Ack { consumer, seq } => {
            let config = Config::load(&config_path)?;
            let compactor = ChangeCompactor::new(open_store(&config)?);
            let stored = compactor.acknowledge(&consumer, seq).await?;
            print_json(&serde_json::json!({ "consumer": consumer, "seq": stored }))?;
        }
        Commands::Digest { path } => {
            let config = Config::load(&config_path)?;
            let maintainer = open_maintainer(&config)?;
            let relative = relative_to_root(&config.root, &path)?;
            let digest = maintainer.lookup_digest(&relative).await?;
            print_json(&serde_json::json!({ "path": relative, "digest": digest }))?;
        }
        Commands::Snapshot { out } => {
            let config = Config::load(&config_path)?;
            let maintainer = open_maintainer(&config)?;
            let snapshot = Snapshot::load(maintainer.index()).await?;

            let content = serde_json::to_string_pretty(&snapshot)?;
            std::fs::write(&out, content)
                .with_context(|| format!("Failed to write snapshot: {}", out.display()))?;
            info!("Saved {} entries to {}", snapshot.len(), out.display());
        }
        Commands::Diff { older } => {
            let config = Config::load(&config_path)?;
            let maintainer = open_maintainer(&config)?;

            let content = std::fs::read_to_string(&older)
                .with_context(|| format!("Failed to read snapshot: {}", older.display()))?;
            let older: Snapshot = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse snapshot: {}", older.display()))?;

            let current = Snapshot::load(maintainer.index()).await?;
            print_json(&current.diff(&older))?;
        }
    }

    Ok(())
}

fn open_store(config: &Config) -> Result<MirrorStore> {
    MirrorStore::open(&config.database)
        .with_context(|| format!("Failed to open database: {}", config.database.display()))
}

fn open_maintainer(config: &Config) -> Result<IndexMaintainer> {
    let store = open_store(config)?;
    Ok(IndexMaintainer::new(
        store,
        config.root.clone(),
        &config.maintainer_config(),
    )?)
}

/// Index path for a user-supplied path, absolute or relative to the root
fn relative_to_root(root: &Path, path: &Path) -> Result<String> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    };

    match mirror_index::paths::to_relative(root, &absolute)? {
        Some(relative) => Ok(relative),
        None => bail!("{} is not under {}", path.display(), root.display()),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_to_root() {
        let root = Path::new("/srv/mirror");
        assert_eq!(
            relative_to_root(root, Path::new("docs/a.txt")).unwrap(),
            "docs/a.txt"
        );
        assert_eq!(
            relative_to_root(root, Path::new("/srv/mirror/docs")).unwrap(),
            "docs"
        );
        assert!(relative_to_root(root, Path::new("/srv/other/a.txt")).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_relative_to_root_rejects_non_utf8() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let path = Path::new(OsStr::from_bytes(b"bad\xff.txt"));
        assert!(relative_to_root(Path::new("/srv/mirror"), path).is_err());
    }
}
