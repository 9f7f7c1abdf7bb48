use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};

use livesync::config::{self, Config};
use livesync::db;
use livesync::model::{Agent, BackendKind, ChangeType, EntryType, LiveObject, ObjectRef};
use livesync::sync;

#[derive(Debug, Parser)]
#[command(author, version, about = "Sync queued catalog changes to a record repository")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List sync agents
    Agents,
    /// Register a new sync agent
    CreateAgent {
        #[arg(long)]
        name: String,
        #[arg(long, value_enum)]
        backend: BackendKind,
    },
    /// Remove an agent and its queue
    DeleteAgent { id: i64 },
    /// Load catalog objects from a JSON array and enqueue their changes
    Import { file: PathBuf },
    /// Remove an object from the catalog and enqueue its deletion
    DeleteObject {
        #[arg(long = "type", value_enum)]
        entry_type: EntryType,
        /// Object ids, outermost first (e.g. `--ids 4 2` for contribution 2 of event 4)
        #[arg(long, num_args = 1..=3, required = true)]
        ids: Vec<i64>,
    },
    /// Enqueue a change for an object without touching the catalog
    Touch {
        #[arg(long, value_enum)]
        change: ChangeType,
        #[arg(long = "type", value_enum)]
        entry_type: EntryType,
        #[arg(long, num_args = 1..=3, required = true)]
        ids: Vec<i64>,
    },
    /// Upload the whole catalog for an agent
    InitialExport { agent: i64 },
    /// Drain pending queue entries once
    Run {
        /// Only run this agent
        #[arg(long)]
        agent: Option<i64>,
    },
    /// Drain queues periodically until interrupted
    Watch,
    /// Show queue counters per agent
    Status,
    /// Purge old processed queue entries
    Clean,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    match args.command {
        Command::Agents => {
            for agent in db::list_agents(&pool).await? {
                println!(
                    "{}\t{}\t{}\texported={}\tlast_run={}",
                    agent.id,
                    agent.name,
                    agent.backend.as_str(),
                    agent.initial_data_exported,
                    agent
                        .last_run_at
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "never".into())
                );
            }
        }
        Command::CreateAgent { name, backend } => {
            let id = db::create_agent(&pool, &name, backend).await?;
            info!(id, name = %name, backend = backend.as_str(), "agent created");
        }
        Command::DeleteAgent { id } => {
            if !db::delete_agent(&pool, id).await? {
                return Err(anyhow!("agent {} not found", id));
            }
            info!(id, "agent deleted");
        }
        Command::Import { file } => {
            let content = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("failed to read {}", file.display()))?;
            let objects: Vec<LiveObject> = serde_json::from_str(&content)
                .with_context(|| format!("invalid object list in {}", file.display()))?;
            let mut created = 0usize;
            for object in &objects {
                if db::upsert_object(&pool, object).await? {
                    created += 1;
                }
            }
            info!(
                total = objects.len(),
                created,
                updated = objects.len() - created,
                "catalog import finished"
            );
        }
        Command::DeleteObject { entry_type, ids } => {
            let object = object_ref(entry_type, &ids)?;
            if db::delete_object(&pool, object).await? {
                info!(object = %object, "object deleted");
            } else {
                return Err(anyhow!("object {} not in catalog", object));
            }
        }
        Command::Touch {
            change,
            entry_type,
            ids,
        } => {
            let object = object_ref(entry_type, &ids)?;
            let queued = db::enqueue_change(&pool, change, object).await?;
            info!(object = %object, change = change.as_str(), agents = queued.len(), "change enqueued");
        }
        Command::InitialExport { agent } => {
            let agent = find_agent(&pool, agent).await?;
            let uploader = sync::build_uploader(&agent, &pool, &cfg)?;
            sync::initial_export(&pool, &agent, uploader.as_ref(), cfg.batch_sizes()).await?;
        }
        Command::Run { agent: Some(id) } => {
            let agent = find_agent(&pool, id).await?;
            let uploader = sync::build_uploader(&agent, &pool, &cfg)?;
            let report = sync::run_agent(&pool, &agent, uploader.as_ref(), cfg.batch_sizes()).await?;
            if let Some(err) = report.error {
                return Err(anyhow!("agent {} stopped: {}", agent.id, err));
            }
        }
        Command::Run { agent: None } => {
            let reports = sync::run_all(&pool, &cfg).await?;
            sync::check_reports(&reports)?;
        }
        Command::Watch => watch(&pool, &cfg).await,
        Command::Status => {
            for s in db::queue_stats(&pool).await? {
                println!(
                    "{}\t{}\tpending={}\tprocessed={}",
                    s.agent_id, s.agent_name, s.pending, s.processed
                );
            }
        }
        Command::Clean => {
            sync::clean_queue(&pool, cfg.livesync.queue_entry_ttl_days).await?;
        }
    }

    Ok(())
}

fn object_ref(entry_type: EntryType, ids: &[i64]) -> Result<ObjectRef> {
    ObjectRef::from_ids(entry_type, ids).ok_or_else(|| {
        anyhow!(
            "wrong number of ids for {}: {:?}",
            entry_type.as_str(),
            ids
        )
    })
}

async fn find_agent(pool: &db::Pool, id: i64) -> Result<Agent> {
    db::get_agent(pool, id)
        .await?
        .ok_or_else(|| anyhow!("agent {} not found", id))
}

async fn watch(pool: &db::Pool, cfg: &Config) {
    let poll_sleep = Duration::from_millis(cfg.app.poll_interval_ms);
    info!(interval_ms = cfg.app.poll_interval_ms, "watching queues");
    loop {
        match sync::run_all(pool, cfg).await {
            Ok(reports) => {
                let processed: usize = reports.iter().map(|(_, r)| r.processed).sum();
                if processed > 0 {
                    info!(processed, agents = reports.len(), "sync round finished");
                }
            }
            Err(err) => error!(?err, "sync round failed"),
        }
        tokio::time::sleep(poll_sleep).await;
    }
}
