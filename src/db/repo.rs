use super::model::QueueStats;
use crate::model::{Agent, BackendKind, ChangeType, EntryType, LiveObject, ObjectRef, QueueEntry, RefColumns};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized)
        .await
        .with_context(|| format!("failed to open database {}", normalized))?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Adds `mode=rwc` so a fresh database file gets created.
/// Leaves in-memory and non-sqlite URLs untouched.
fn prepare_sqlite_url(url: &str) -> String {
    let Some(rest) = url.strip_prefix("sqlite:") else {
        return url.to_string();
    };
    if rest.starts_with(":memory") {
        return url.to_string();
    }
    let rest = rest.strip_prefix("//").unwrap_or(rest);

    let (path_part, query_part) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(tail), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), tail),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let query = match query_part {
        Some(q) if q.contains("mode=") => q.to_string(),
        Some(q) => format!("{}&mode=rwc", q),
        None => "mode=rwc".to_string(),
    };
    format!("sqlite://{}?{}", expanded_path, query)
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

fn agent_from_row(row: &SqliteRow) -> Result<Agent> {
    let backend: String = row.get("backend");
    let id: i64 = row.get("id");
    Ok(Agent {
        id,
        name: row.get("name"),
        backend: BackendKind::parse(&backend)
            .ok_or_else(|| anyhow!("agent {} has unknown backend {}", id, backend))?,
        initial_data_exported: row.get("initial_data_exported"),
        last_run_at: row.try_get::<Option<DateTime<Utc>>, _>("last_run_at")?,
    })
}

fn ref_columns_from_row(row: &SqliteRow) -> Result<RefColumns> {
    Ok(RefColumns {
        category_id: row.try_get("category_id")?,
        event_id: row.try_get("event_id")?,
        contrib_id: row.try_get("contrib_id")?,
        subcontrib_id: row.try_get("subcontrib_id")?,
        session_id: row.try_get("session_id")?,
    })
}

fn object_ref_from_row(row: &SqliteRow) -> Result<ObjectRef> {
    let kind: String = row.get("type");
    let entry_type =
        EntryType::parse(&kind).ok_or_else(|| anyhow!("unknown object type {}", kind))?;
    let cols = ref_columns_from_row(row)?;
    ObjectRef::from_parts(entry_type, cols)
        .ok_or_else(|| anyhow!("{} row is missing ids: {:?}", kind, cols))
}

fn queue_entry_from_row(row: &SqliteRow) -> Result<QueueEntry> {
    let id: i64 = row.get("id");
    let change: String = row.get("change");
    Ok(QueueEntry {
        id,
        agent_id: row.get("agent_id"),
        created_at: row.get("created_at"),
        processed: row.get("processed"),
        change: ChangeType::parse(&change)
            .ok_or_else(|| anyhow!("queue entry {} has unknown change {}", id, change))?,
        object_ref: object_ref_from_row(row).with_context(|| format!("queue entry {}", id))?,
    })
}

fn live_object_from_row(row: &SqliteRow) -> Result<LiveObject> {
    Ok(LiveObject {
        object_ref: object_ref_from_row(row)?,
        title: row.get("title"),
        description: row.try_get("description")?,
        location: row.try_get("location")?,
        url: row.try_get("url")?,
        start_dt: row.try_get("start_dt")?,
        end_dt: row.try_get("end_dt")?,
        updated_at: row.get("updated_at"),
    })
}

#[instrument(skip_all)]
pub async fn create_agent(pool: &Pool, name: &str, backend: BackendKind) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO agents (name, backend, initial_data_exported, created_at) VALUES (?, ?, 0, ?) RETURNING id",
    )
    .bind(name)
    .bind(backend.as_str())
    .bind(Utc::now())
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to create agent {}", name))?;
    Ok(rec.get("id"))
}

#[instrument(skip_all)]
pub async fn list_agents(pool: &Pool) -> Result<Vec<Agent>> {
    let rows = sqlx::query(
        "SELECT id, name, backend, initial_data_exported, last_run_at FROM agents ORDER BY id",
    )
    .fetch_all(pool)
    .await?;
    rows.iter().map(agent_from_row).collect()
}

#[instrument(skip_all)]
pub async fn get_agent(pool: &Pool, agent_id: i64) -> Result<Option<Agent>> {
    let row = sqlx::query(
        "SELECT id, name, backend, initial_data_exported, last_run_at FROM agents WHERE id = ?",
    )
    .bind(agent_id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(agent_from_row).transpose()
}

/// Remove an agent; its queue entries go with it.
#[instrument(skip_all)]
pub async fn delete_agent(pool: &Pool, agent_id: i64) -> Result<bool> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM queue_entries WHERE agent_id = ?")
        .bind(agent_id)
        .execute(&mut *tx)
        .await?;
    let res = sqlx::query("DELETE FROM agents WHERE id = ?")
        .bind(agent_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(res.rows_affected() > 0)
}

#[instrument(skip_all)]
pub async fn mark_initial_exported(pool: &Pool, agent_id: i64) -> Result<()> {
    sqlx::query("UPDATE agents SET initial_data_exported = 1 WHERE id = ?")
        .bind(agent_id)
        .execute(pool)
        .await
        .context("failed to flag initial export")?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn touch_agent_run(pool: &Pool, agent_id: i64) -> Result<()> {
    sqlx::query("UPDATE agents SET last_run_at = ? WHERE id = ?")
        .bind(Utc::now())
        .bind(agent_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Record `change` on `object` in the queue of every agent.
#[instrument(skip_all, fields(change = change.as_str(), object = %object))]
pub async fn enqueue_change(pool: &Pool, change: ChangeType, object: ObjectRef) -> Result<Vec<i64>> {
    let mut tx = pool.begin().await?;
    let ids = enqueue_change_tx(&mut tx, change, object).await?;
    tx.commit().await?;
    Ok(ids)
}

async fn enqueue_change_tx(
    tx: &mut Transaction<'_, Sqlite>,
    change: ChangeType,
    object: ObjectRef,
) -> Result<Vec<i64>> {
    let agent_ids: Vec<i64> = sqlx::query_scalar("SELECT id FROM agents ORDER BY id")
        .fetch_all(&mut **tx)
        .await?;
    let cols = object.columns();
    let now = Utc::now();
    let mut ids = Vec::with_capacity(agent_ids.len());
    for agent_id in agent_ids {
        let rec = sqlx::query(
            "INSERT INTO queue_entries (agent_id, created_at, processed, change, type, category_id, event_id, contrib_id, subcontrib_id, session_id) \
             VALUES (?, ?, 0, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(agent_id)
        .bind(now)
        .bind(change.as_str())
        .bind(object.entry_type().as_str())
        .bind(cols.category_id)
        .bind(cols.event_id)
        .bind(cols.contrib_id)
        .bind(cols.subcontrib_id)
        .bind(cols.session_id)
        .fetch_one(&mut **tx)
        .await?;
        ids.push(rec.get("id"));
    }
    Ok(ids)
}

/// Unprocessed entries of an agent in the order they were recorded.
#[instrument(skip_all)]
pub async fn pending_entries(pool: &Pool, agent_id: i64) -> Result<Vec<QueueEntry>> {
    let rows = sqlx::query(
        "SELECT id, agent_id, created_at, processed, change, type, category_id, event_id, contrib_id, subcontrib_id, session_id \
         FROM queue_entries WHERE agent_id = ? AND processed = 0 ORDER BY id",
    )
    .bind(agent_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(queue_entry_from_row).collect()
}

#[instrument(skip_all)]
pub async fn count_pending(pool: &Pool, agent_id: i64) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM queue_entries WHERE agent_id = ? AND processed = 0",
    )
    .bind(agent_id)
    .fetch_one(pool)
    .await?;
    Ok(count)
}

#[instrument(skip_all)]
pub async fn queue_stats(pool: &Pool) -> Result<Vec<QueueStats>> {
    let rows = sqlx::query(
        "SELECT a.id, a.name, \
                COALESCE(SUM(CASE WHEN q.processed = 0 THEN 1 ELSE 0 END), 0) AS pending, \
                COALESCE(SUM(CASE WHEN q.processed = 1 THEN 1 ELSE 0 END), 0) AS processed \
         FROM agents a LEFT JOIN queue_entries q ON q.agent_id = a.id \
         GROUP BY a.id, a.name ORDER BY a.id",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|row| QueueStats {
            agent_id: row.get("id"),
            agent_name: row.get("name"),
            pending: row.get("pending"),
            processed: row.get("processed"),
        })
        .collect())
}

/// Flag entries as processed and commit. Either all ids are flagged or none.
#[instrument(skip_all, fields(count = ids.len()))]
pub async fn mark_processed(pool: &Pool, ids: &[i64]) -> Result<()> {
    let mut tx = pool.begin().await?;
    for id in ids {
        sqlx::query("UPDATE queue_entries SET processed = 1 WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit()
        .await
        .context("failed to commit processed queue entries")?;
    Ok(())
}

/// Delete processed entries recorded before `before`. Returns the number removed.
#[instrument(skip_all)]
pub async fn clean_old_entries(pool: &Pool, before: DateTime<Utc>) -> Result<u64> {
    let res = sqlx::query("DELETE FROM queue_entries WHERE processed = 1 AND created_at < ?")
        .bind(before)
        .execute(pool)
        .await?;
    Ok(res.rows_affected())
}

/// Insert or replace a catalog object and enqueue `created` or `data_changed`
/// for every agent in the same transaction. Returns true for new objects.
#[instrument(skip_all, fields(object = %object.object_ref))]
pub async fn upsert_object(pool: &Pool, object: &LiveObject) -> Result<bool> {
    let mut tx = pool.begin().await?;
    let key = object.object_ref.key();
    let exists = sqlx::query_scalar::<_, i64>("SELECT id FROM objects WHERE object_key = ?")
        .bind(&key)
        .fetch_optional(&mut *tx)
        .await?
        .is_some();

    let cols = object.object_ref.columns();
    sqlx::query(
        "INSERT INTO objects (object_key, type, category_id, event_id, contrib_id, subcontrib_id, session_id, title, description, location, url, start_dt, end_dt, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(object_key) DO UPDATE SET title = excluded.title, description = excluded.description, \
             location = excluded.location, url = excluded.url, start_dt = excluded.start_dt, \
             end_dt = excluded.end_dt, updated_at = excluded.updated_at",
    )
    .bind(&key)
    .bind(object.object_ref.entry_type().as_str())
    .bind(cols.category_id)
    .bind(cols.event_id)
    .bind(cols.contrib_id)
    .bind(cols.subcontrib_id)
    .bind(cols.session_id)
    .bind(&object.title)
    .bind(&object.description)
    .bind(&object.location)
    .bind(&object.url)
    .bind(object.start_dt)
    .bind(object.end_dt)
    .bind(object.updated_at)
    .execute(&mut *tx)
    .await?;

    let change = if exists {
        ChangeType::DataChanged
    } else {
        ChangeType::Created
    };
    enqueue_change_tx(&mut tx, change, object.object_ref).await?;
    tx.commit().await?;
    Ok(!exists)
}

/// Remove a catalog object and enqueue `deleted`. Returns false when the
/// object was not in the catalog (nothing is enqueued then).
#[instrument(skip_all, fields(object = %object))]
pub async fn delete_object(pool: &Pool, object: ObjectRef) -> Result<bool> {
    let mut tx = pool.begin().await?;
    let res = sqlx::query("DELETE FROM objects WHERE object_key = ?")
        .bind(object.key())
        .execute(&mut *tx)
        .await?;
    if res.rows_affected() == 0 {
        return Ok(false);
    }
    enqueue_change_tx(&mut tx, ChangeType::Deleted, object).await?;
    tx.commit().await?;
    Ok(true)
}

#[instrument(skip_all)]
pub async fn fetch_object(pool: &Pool, object: ObjectRef) -> Result<Option<LiveObject>> {
    let row = sqlx::query(
        "SELECT type, category_id, event_id, contrib_id, subcontrib_id, session_id, title, description, location, url, start_dt, end_dt, updated_at \
         FROM objects WHERE object_key = ?",
    )
    .bind(object.key())
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(live_object_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn all_objects(pool: &Pool) -> Result<Vec<LiveObject>> {
    let rows = sqlx::query(
        "SELECT type, category_id, event_id, contrib_id, subcontrib_id, session_id, title, description, location, url, start_dt, end_dt, updated_at \
         FROM objects ORDER BY id",
    )
    .fetch_all(pool)
    .await?;
    rows.iter().map(live_object_from_row).collect()
}
