use crate::config::Config;
use crate::db;
use crate::marcxml::{CatalogMarcXml, MarcXmlUploader};
use crate::model::{Agent, BackendKind};
use crate::repository::RepositoryClient;
use crate::uploader::{BatchRunner, BatchSizes, LogUploader, RunReport, Uploader};
use anyhow::{bail, Result};
use chrono::{Duration, Utc};
use sqlx::SqlitePool;
use tracing::{error, info, instrument, warn};

/// Uploader for an agent's configured backend.
pub fn build_uploader(agent: &Agent, pool: &SqlitePool, cfg: &Config) -> Result<Box<dyn Uploader>> {
    Ok(match agent.backend {
        BackendKind::Debug => Box::new(LogUploader),
        BackendKind::Marcxml => Box::new(MarcXmlUploader::new(
            CatalogMarcXml::new(pool.clone()),
            RepositoryClient::from_config(cfg)?,
        )),
    })
}

/// Export the whole catalog through `uploader` and flag the agent as exported.
#[instrument(skip_all, fields(agent = agent.id, run = %uuid::Uuid::new_v4()))]
pub async fn initial_export(
    pool: &SqlitePool,
    agent: &Agent,
    uploader: &dyn Uploader,
    sizes: BatchSizes,
) -> Result<RunReport> {
    let objects = db::all_objects(pool).await?;
    info!(objects = objects.len(), "starting initial export");
    let report = BatchRunner::new(uploader, sizes).run_initial(&objects).await?;
    db::mark_initial_exported(pool, agent.id).await?;
    info!(batches = report.batches, uploaded = report.uploaded, "initial export finished");
    Ok(report)
}

/// Drain the agent's pending queue entries through `uploader`.
#[instrument(skip_all, fields(agent = agent.id, run = %uuid::Uuid::new_v4()))]
pub async fn run_agent(
    pool: &SqlitePool,
    agent: &Agent,
    uploader: &dyn Uploader,
    sizes: BatchSizes,
) -> Result<RunReport> {
    if !agent.initial_data_exported {
        bail!(
            "agent {} ({}) has not done its initial export yet",
            agent.id,
            agent.name
        );
    }
    let mut entries = db::pending_entries(pool, agent.id).await?;
    if entries.is_empty() {
        info!("queue empty");
        db::touch_agent_run(pool, agent.id).await?;
        return Ok(RunReport::default());
    }

    let report = BatchRunner::new(uploader, sizes).run(pool, &mut entries).await?;
    db::touch_agent_run(pool, agent.id).await?;
    if report.succeeded() {
        info!(processed = report.processed, batches = report.batches, "queue run finished");
    } else {
        warn!(
            processed = report.processed,
            failed_batch = ?report.failed_batch,
            "queue run stopped at failed batch"
        );
    }
    Ok(report)
}

/// Run every agent that finished its initial export. Agents still waiting for
/// one are skipped with a warning. An agent whose run errors is logged and
/// reported with its error; the remaining agents still run.
pub async fn run_all(pool: &SqlitePool, cfg: &Config) -> Result<Vec<(Agent, RunReport)>> {
    let mut out = Vec::new();
    for agent in db::list_agents(pool).await? {
        if !agent.initial_data_exported {
            warn!(agent = agent.id, name = %agent.name, "skipping agent without initial export");
            continue;
        }
        let result = match build_uploader(&agent, pool, cfg) {
            Ok(uploader) => run_agent(pool, &agent, uploader.as_ref(), cfg.batch_sizes()).await,
            Err(err) => Err(err),
        };
        let report = match result {
            Ok(report) => report,
            Err(err) => {
                error!(?err, agent = agent.id, name = %agent.name, "agent run failed");
                RunReport {
                    error: Some(format!("{:#}", err)),
                    ..Default::default()
                }
            }
        };
        out.push((agent, report));
    }
    Ok(out)
}

/// Fail with one line per agent whose run did not finish cleanly.
pub fn check_reports(reports: &[(Agent, RunReport)]) -> Result<()> {
    let failures: Vec<String> = reports
        .iter()
        .filter(|(_, report)| !report.succeeded())
        .map(|(agent, report)| {
            format!(
                "agent {} ({}): {}",
                agent.id,
                agent.name,
                report.error.as_deref().unwrap_or("unknown error")
            )
        })
        .collect();
    if !failures.is_empty() {
        bail!("{} agent(s) failed:\n{}", failures.len(), failures.join("\n"));
    }
    Ok(())
}

/// Purge processed queue entries older than `ttl_days`.
#[instrument(skip_all)]
pub async fn clean_queue(pool: &SqlitePool, ttl_days: u32) -> Result<u64> {
    let cutoff = Utc::now() - Duration::days(i64::from(ttl_days));
    let removed = db::clean_old_entries(pool, cutoff).await?;
    info!(removed, %cutoff, "cleaned processed queue entries");
    Ok(removed)
}
