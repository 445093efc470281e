//! workq - queue runner and admin tool

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use workq_core::application::{shutdown_channel, QueueManager};
use workq_core::domain::BaseConfig;
use workq_core::port::{BackendFactory, BaseQueue, Handler};
use workq_daemon::{init_logging, DaemonConfig, DefaultBackendFactory, LogFormat};
use workq_infra_level::{list_level_queue_keys, remove_level_queue_keys, LevelStore};

#[derive(Parser)]
#[command(name = "workq")]
#[command(about = "Persistent work queue runner and admin tool", long_about = None)]
#[command(version)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, env = "WORKQ_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run worker pools for the named queues until Ctrl+C
    Serve {
        #[arg(required = true)]
        queues: Vec<String>,

        /// Deduplicate pushes
        #[arg(long)]
        unique: bool,
    },

    /// Push one JSON item
    Push {
        queue: String,
        item: String,
        #[arg(long)]
        unique: bool,
    },

    /// Print the number of queued items
    Len {
        queue: String,
        #[arg(long)]
        unique: bool,
    },

    /// Delete every item of a queue and its dedup set
    RemoveAll {
        queue: String,
        #[arg(long)]
        unique: bool,
    },

    /// Pop every queued item and print it as a JSON line
    Drain {
        queue: String,
        #[arg(long)]
        unique: bool,
    },

    /// List every key of a level store
    ListKeys { datadir: PathBuf },

    /// Remove all keys under the given prefixes from a level store
    Repair {
        datadir: PathBuf,
        #[arg(required = true)]
        prefixes: Vec<String>,
    },
}

/// Logs every item; stands in for a real business handler
struct LogHandler {
    queue: String,
}

#[async_trait]
impl Handler<Value> for LogHandler {
    async fn handle(&self, items: Vec<Value>) -> Vec<Value> {
        for item in &items {
            info!(queue = %self.queue, item = %item, "Handled queue item");
        }
        Vec::new()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging(LogFormat::from_env())?;

    let cli = Cli::parse();
    let cfg = DaemonConfig::load(cli.config.as_deref())?;
    let factory = Arc::new(DefaultBackendFactory::new());

    match cli.command {
        Commands::Serve { queues, unique } => serve(cfg, factory, queues, unique).await?,
        Commands::Push {
            queue,
            item,
            unique,
        } => {
            let value: Value = serde_json::from_str(&item).context("Invalid JSON item")?;
            let base = open_base(&cfg, factory.as_ref(), &queue, unique).await?;
            let pushed = base
                .push_item(&CancellationToken::new(), &serde_json::to_vec(&value)?)
                .await;
            base.close().await?;
            match pushed {
                Ok(()) => println!("pushed to {queue}"),
                Err(e) if e.is_already_in_queue() => println!("already in {queue}"),
                Err(e) => return Err(e).context("Push failed"),
            }
        }
        Commands::Len { queue, unique } => {
            let base = open_base(&cfg, factory.as_ref(), &queue, unique).await?;
            let len = base.len().await;
            base.close().await?;
            println!("{}", len?);
        }
        Commands::RemoveAll { queue, unique } => {
            let base = open_base(&cfg, factory.as_ref(), &queue, unique).await?;
            let removed = base.remove_all().await;
            base.close().await?;
            removed.context("Remove failed")?;
            println!("cleared {queue}");
        }
        Commands::Drain { queue, unique } => {
            let base = open_base(&cfg, factory.as_ref(), &queue, unique).await?;
            let drained = drain(base.as_ref()).await;
            base.close().await?;
            println!("drained {} items from {queue}", drained?);
        }
        Commands::ListKeys { datadir } => {
            let store = LevelStore::open(&datadir).await?;
            let keys = list_level_queue_keys(&store).await;
            store.close().await;
            for key in keys? {
                println!("{}", String::from_utf8_lossy(&key).escape_debug());
            }
        }
        Commands::Repair { datadir, prefixes } => {
            let store = LevelStore::open(&datadir).await?;
            for prefix in &prefixes {
                match remove_level_queue_keys(&store, prefix.as_bytes()).await {
                    Ok(removed) => println!("{prefix}: removed {removed} keys"),
                    Err(e) => {
                        store.close().await;
                        return Err(e).with_context(|| format!("Failed to repair {prefix}"));
                    }
                }
            }
            store.close().await;
        }
    }

    Ok(())
}

async fn serve(
    cfg: DaemonConfig,
    factory: Arc<DefaultBackendFactory>,
    queues: Vec<String>,
    unique: bool,
) -> Result<()> {
    info!("workq v{} starting...", workq_core::VERSION);

    let (shutdown_tx, shutdown) = shutdown_channel();
    let manager = QueueManager::new(cfg.queue_settings(), factory, shutdown);

    for name in &queues {
        let handler: Arc<dyn Handler<Value>> = Arc::new(LogHandler {
            queue: name.clone(),
        });
        let created = if unique {
            manager.create_unique_queue(name, handler).await
        } else {
            manager.create_simple_queue(name, handler).await
        };
        created.with_context(|| format!("Failed to start queue {name}"))?;
    }

    for (qid, queue) in manager.managed_queues() {
        info!(
            qid,
            queue = %queue.name(),
            queue_type = %queue.queue_type(),
            workers = queue.worker_max_number(),
            "Queue ready"
        );
    }
    info!("Press Ctrl+C to shutdown");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received. Draining queues...");

    if !shutdown_tx.shutdown_and_wait(cfg.shutdown_grace()).await {
        warn!("Some batches were abandoned at shutdown");
    }
    info!("Shutdown complete.");
    Ok(())
}

async fn open_base(
    cfg: &DaemonConfig,
    factory: &DefaultBackendFactory,
    name: &str,
    unique: bool,
) -> Result<Arc<dyn BaseQueue>> {
    let settings = cfg.queue_settings().get_queue_settings(name)?;
    let config = BaseConfig::from_settings(name, &settings);
    factory
        .create(settings.queue_type, &config, unique)
        .await
        .with_context(|| format!("Failed to open queue {name}"))
}

async fn drain(base: &dyn BaseQueue) -> Result<usize> {
    let cancel = CancellationToken::new();
    let mut drained = 0;
    while base.len().await? > 0 {
        let Some(data) = base.pop_item(&cancel).await? else {
            break;
        };
        println!("{}", String::from_utf8_lossy(&data));
        drained += 1;
    }
    Ok(drained)
}
