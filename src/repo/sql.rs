//! SQL repository over the sqlx `Any` driver.
//!
//! One adapter serves both SQLite and PostgreSQL. The schema sticks to a
//! driver-portable subset: BIGINT/TEXT columns, RFC3339 text timestamps,
//! JSON as text, booleans as 0/1. Row ids are allocated in-process (the
//! orchestrator is the only writer), seeded from `MAX(id)` at connect time.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use uuid::Uuid;

use crate::config::DbConfig;
use crate::error::{DispatchError, Result};
use crate::model::{
    Job, JobSpec, JobStatus, Queue, Session, User, Worker, WorkerState, WorkerStatus,
};

use super::{JobStatistics, NewQueue, NewSpec, Page, QueuePatch, Repository, SpecPatch};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS specs (
        id BIGINT PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        description TEXT,
        command TEXT NOT NULL,
        created_by TEXT,
        is_active BIGINT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS jobs (
        id TEXT PRIMARY KEY,
        spec_name TEXT NOT NULL,
        status TEXT NOT NULL,
        progress BIGINT NOT NULL,
        created_by TEXT,
        queue_name TEXT NOT NULL,
        assigned_worker TEXT,
        runtime_args TEXT NOT NULL,
        result TEXT,
        error_message TEXT,
        created_at TEXT NOT NULL,
        started_at TEXT,
        completed_at TEXT
    )",
    "CREATE TABLE IF NOT EXISTS queues (
        id BIGINT PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        description TEXT,
        priority TEXT NOT NULL,
        strategy TEXT NOT NULL,
        state TEXT NOT NULL,
        is_default BIGINT NOT NULL,
        time_limit_secs BIGINT NOT NULL,
        rr_cursor BIGINT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS workers (
        id BIGINT PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        kind TEXT NOT NULL,
        hostname TEXT,
        ip_address TEXT,
        port BIGINT NOT NULL,
        ssh_user TEXT,
        auth_method TEXT,
        ssh_private_key TEXT,
        password TEXT,
        provision BIGINT NOT NULL,
        max_jobs BIGINT NOT NULL,
        status TEXT NOT NULL,
        state TEXT NOT NULL,
        last_seen TEXT,
        error_message TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS queue_workers (
        queue_id BIGINT NOT NULL,
        worker_id BIGINT NOT NULL,
        created_at TEXT NOT NULL,
        PRIMARY KEY (queue_id, worker_id)
    )",
    "CREATE TABLE IF NOT EXISTS users (
        id BIGINT PRIMARY KEY,
        username TEXT NOT NULL UNIQUE,
        password_hash TEXT NOT NULL,
        full_name TEXT,
        role TEXT NOT NULL,
        auth_source TEXT NOT NULL,
        is_active BIGINT NOT NULL,
        last_login TEXT,
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS sessions (
        id BIGINT PRIMARY KEY,
        user_id BIGINT NOT NULL,
        token TEXT NOT NULL UNIQUE,
        expires_at TEXT NOT NULL,
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS config (
        category TEXT NOT NULL,
        name TEXT NOT NULL,
        value TEXT NOT NULL,
        PRIMARY KEY (category, name)
    )",
];

pub struct SqlRepository {
    pool: AnyPool,
    spec_ids: AtomicI64,
    queue_ids: AtomicI64,
    worker_ids: AtomicI64,
    user_ids: AtomicI64,
    session_ids: AtomicI64,
}

impl SqlRepository {
    /// Connect, create the schema, and seed the id allocators.
    pub async fn connect(config: &DbConfig) -> Result<Self> {
        sqlx::any::install_default_drivers();
        let url = config.url()?;
        let pool = AnyPoolOptions::new()
            .max_connections(8)
            .connect(&url)
            .await
            .map_err(|e| DispatchError::Fatal(format!("storage unreachable: {e}")))?;
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        let repo = Self {
            spec_ids: AtomicI64::new(Self::max_id(&pool, "specs").await?),
            queue_ids: AtomicI64::new(Self::max_id(&pool, "queues").await?),
            worker_ids: AtomicI64::new(Self::max_id(&pool, "workers").await?),
            user_ids: AtomicI64::new(Self::max_id(&pool, "users").await?),
            session_ids: AtomicI64::new(Self::max_id(&pool, "sessions").await?),
            pool,
        };
        Ok(repo)
    }

    async fn max_id(pool: &AnyPool, table: &str) -> Result<i64> {
        let row = sqlx::query(&format!("SELECT COALESCE(MAX(id), 0) AS max_id FROM {table}"))
            .fetch_one(pool)
            .await?;
        Ok(row.try_get::<i64, _>("max_id")?)
    }

    fn next_id(counter: &AtomicI64) -> i64 {
        counter.fetch_add(1, Ordering::SeqCst) + 1
    }
}

fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

fn fmt_opt_ts(ts: Option<DateTime<Utc>>) -> Option<String> {
    ts.map(fmt_ts)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| DispatchError::Storage(format!("bad timestamp '{raw}': {e}")))
}

fn parse_opt_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_ts).transpose()
}

fn parse_enum<T: FromStr<Err = String>>(raw: &str) -> Result<T> {
    raw.parse().map_err(DispatchError::Storage)
}

fn parse_json_map(raw: &str) -> Result<Map<String, Value>> {
    serde_json::from_str(raw).map_err(|e| DispatchError::Storage(format!("bad JSON column: {e}")))
}

fn spec_from_row(row: &AnyRow) -> Result<JobSpec> {
    Ok(JobSpec {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        command: row.try_get("command")?,
        created_by: row.try_get("created_by")?,
        is_active: row.try_get::<i64, _>("is_active")? != 0,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_ts(&row.try_get::<String, _>("updated_at")?)?,
    })
}

fn job_from_row(row: &AnyRow) -> Result<Job> {
    let id: String = row.try_get("id")?;
    Ok(Job {
        id: Uuid::parse_str(&id).map_err(|e| DispatchError::Storage(e.to_string()))?,
        spec_name: row.try_get("spec_name")?,
        status: parse_enum(&row.try_get::<String, _>("status")?)?,
        progress: row.try_get::<i64, _>("progress")? as u8,
        created_by: row.try_get("created_by")?,
        queue_name: row.try_get("queue_name")?,
        assigned_worker: row.try_get("assigned_worker")?,
        runtime_args: parse_json_map(&row.try_get::<String, _>("runtime_args")?)?,
        result: row
            .try_get::<Option<String>, _>("result")?
            .as_deref()
            .map(parse_json_map)
            .transpose()?,
        error_message: row.try_get("error_message")?,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
        started_at: parse_opt_ts(row.try_get("started_at")?)?,
        completed_at: parse_opt_ts(row.try_get("completed_at")?)?,
    })
}

fn queue_from_row(row: &AnyRow) -> Result<Queue> {
    Ok(Queue {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        priority: parse_enum(&row.try_get::<String, _>("priority")?)?,
        strategy: parse_enum(&row.try_get::<String, _>("strategy")?)?,
        state: parse_enum(&row.try_get::<String, _>("state")?)?,
        is_default: row.try_get::<i64, _>("is_default")? != 0,
        time_limit_secs: row.try_get("time_limit_secs")?,
        rr_cursor: row.try_get::<i64, _>("rr_cursor")? as u32,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_ts(&row.try_get::<String, _>("updated_at")?)?,
    })
}

fn worker_from_row(row: &AnyRow) -> Result<Worker> {
    Ok(Worker {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        kind: parse_enum(&row.try_get::<String, _>("kind")?)?,
        hostname: row.try_get("hostname")?,
        ip_address: row.try_get("ip_address")?,
        port: row.try_get::<i64, _>("port")? as u16,
        ssh_user: row.try_get("ssh_user")?,
        auth_method: row
            .try_get::<Option<String>, _>("auth_method")?
            .as_deref()
            .map(parse_enum)
            .transpose()?,
        ssh_private_key: row.try_get("ssh_private_key")?,
        password: row.try_get("password")?,
        provision: row.try_get::<i64, _>("provision")? != 0,
        max_jobs: row.try_get::<i64, _>("max_jobs")? as u32,
        status: parse_enum(&row.try_get::<String, _>("status")?)?,
        state: parse_enum(&row.try_get::<String, _>("state")?)?,
        last_seen: parse_opt_ts(row.try_get("last_seen")?)?,
        error_message: row.try_get("error_message")?,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_ts(&row.try_get::<String, _>("updated_at")?)?,
    })
}

fn user_from_row(row: &AnyRow) -> Result<User> {
    Ok(User {
        id: row.try_get("id")?,
        username: row.try_get("username")?,
        password_hash: row.try_get("password_hash")?,
        full_name: row.try_get("full_name")?,
        role: row.try_get("role")?,
        auth_source: row.try_get("auth_source")?,
        is_active: row.try_get::<i64, _>("is_active")? != 0,
        last_login: parse_opt_ts(row.try_get("last_login")?)?,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
    })
}

fn session_from_row(row: &AnyRow) -> Result<Session> {
    Ok(Session {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        token: row.try_get("token")?,
        expires_at: parse_ts(&row.try_get::<String, _>("expires_at")?)?,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
    })
}

#[async_trait]
impl Repository for SqlRepository {
    async fn create_spec(&self, spec: NewSpec) -> Result<JobSpec> {
        let existing = sqlx::query("SELECT id FROM specs WHERE name = $1")
            .bind(&spec.name)
            .fetch_optional(&self.pool)
            .await?;
        if existing.is_some() {
            return Err(DispatchError::conflict(format!(
                "spec with name '{}' already exists",
                spec.name
            )));
        }
        let id = Self::next_id(&self.spec_ids);
        let now = Utc::now();
        let command = JobSpec::normalize_command(&spec.command);
        sqlx::query(
            "INSERT INTO specs (id, name, description, command, created_by, is_active, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, 1, $6, $7)",
        )
        .bind(id)
        .bind(&spec.name)
        .bind(&spec.description)
        .bind(&command)
        .bind(&spec.created_by)
        .bind(fmt_ts(now))
        .bind(fmt_ts(now))
        .execute(&self.pool)
        .await?;
        Ok(JobSpec {
            id,
            name: spec.name,
            description: spec.description,
            command,
            created_by: spec.created_by,
            is_active: true,
            created_at: now,
            updated_at: now,
        })
    }

    async fn get_spec(&self, id: i64) -> Result<Option<JobSpec>> {
        sqlx::query("SELECT * FROM specs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| spec_from_row(&row))
            .transpose()
    }

    async fn get_spec_by_name(&self, name: &str) -> Result<Option<JobSpec>> {
        sqlx::query("SELECT * FROM specs WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| spec_from_row(&row))
            .transpose()
    }

    async fn list_specs(&self, page: Page) -> Result<(Vec<JobSpec>, u64)> {
        let total: i64 = sqlx::query("SELECT COUNT(*) AS n FROM specs")
            .fetch_one(&self.pool)
            .await?
            .try_get("n")?;
        let rows = sqlx::query(
            "SELECT * FROM specs ORDER BY created_at DESC, id ASC LIMIT $1 OFFSET $2",
        )
        .bind(page.limit() as i64)
        .bind(page.offset() as i64)
        .fetch_all(&self.pool)
        .await?;
        let specs = rows
            .iter()
            .map(spec_from_row)
            .collect::<Result<Vec<_>>>()?;
        Ok((specs, total as u64))
    }

    async fn update_spec(&self, id: i64, patch: SpecPatch) -> Result<JobSpec> {
        let current = self
            .get_spec(id)
            .await?
            .ok_or_else(|| DispatchError::not_found("spec", id))?;
        if let Some(new_name) = &patch.name {
            let taken = sqlx::query("SELECT id FROM specs WHERE name = $1 AND id <> $2")
                .bind(new_name)
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
            if taken.is_some() {
                return Err(DispatchError::conflict(format!(
                    "spec with name '{new_name}' already exists"
                )));
            }
        }
        let name = patch.name.unwrap_or(current.name);
        let description = patch.description.or(current.description);
        let command = patch
            .command
            .map(|c| JobSpec::normalize_command(&c))
            .unwrap_or(current.command);
        let is_active = patch.is_active.unwrap_or(current.is_active);
        let now = Utc::now();
        sqlx::query(
            "UPDATE specs SET name = $1, description = $2, command = $3, is_active = $4, updated_at = $5
             WHERE id = $6",
        )
        .bind(&name)
        .bind(&description)
        .bind(&command)
        .bind(is_active as i64)
        .bind(fmt_ts(now))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(JobSpec {
            id,
            name,
            description,
            command,
            created_by: current.created_by,
            is_active,
            created_at: current.created_at,
            updated_at: now,
        })
    }

    async fn delete_spec(&self, id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM specs WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DispatchError::not_found("spec", id));
        }
        Ok(())
    }

    async fn insert_job(&self, job: &Job) -> Result<()> {
        sqlx::query(
            "INSERT INTO jobs (id, spec_name, status, progress, created_by, queue_name,
                               assigned_worker, runtime_args, result, error_message,
                               created_at, started_at, completed_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
        )
        .bind(job.id.to_string())
        .bind(&job.spec_name)
        .bind(job.status.to_string())
        .bind(job.progress as i64)
        .bind(&job.created_by)
        .bind(&job.queue_name)
        .bind(&job.assigned_worker)
        .bind(serde_json::to_string(&job.runtime_args)?)
        .bind(
            job.result
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(&job.error_message)
        .bind(fmt_ts(job.created_at))
        .bind(fmt_opt_ts(job.started_at))
        .bind(fmt_opt_ts(job.completed_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
        sqlx::query("SELECT * FROM jobs WHERE id = $1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .map(|row| job_from_row(&row))
            .transpose()
    }

    async fn list_jobs(&self, page: Page, exclude: &[JobStatus]) -> Result<(Vec<Job>, u64)> {
        let mut filter = String::new();
        if !exclude.is_empty() {
            let placeholders: Vec<String> =
                (1..=exclude.len()).map(|i| format!("${i}")).collect();
            filter = format!("WHERE status NOT IN ({})", placeholders.join(", "));
        }
        let count_sql = format!("SELECT COUNT(*) AS n FROM jobs {filter}");
        let mut count_query = sqlx::query(&count_sql);
        for status in exclude {
            count_query = count_query.bind(status.to_string());
        }
        let total: i64 = count_query.fetch_one(&self.pool).await?.try_get("n")?;

        let limit_pos = exclude.len() + 1;
        let offset_pos = exclude.len() + 2;
        let sql = format!(
            "SELECT * FROM jobs {filter} ORDER BY created_at DESC, id ASC LIMIT ${limit_pos} OFFSET ${offset_pos}"
        );
        let mut query = sqlx::query(&sql);
        for status in exclude {
            query = query.bind(status.to_string());
        }
        let rows = query
            .bind(page.limit() as i64)
            .bind(page.offset() as i64)
            .fetch_all(&self.pool)
            .await?;
        let jobs = rows.iter().map(job_from_row).collect::<Result<Vec<_>>>()?;
        Ok((jobs, total as u64))
    }

    async fn jobs_with_status(&self, status: JobStatus) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            "SELECT * FROM jobs WHERE status = $1 ORDER BY created_at ASC, id ASC",
        )
        .bind(status.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn running_jobs_for_worker(&self, worker_name: &str) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            "SELECT * FROM jobs WHERE status = 'Running' AND assigned_worker = $1",
        )
        .bind(worker_name)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn count_running_for_worker(&self, worker_name: &str) -> Result<u32> {
        let n: i64 = sqlx::query(
            "SELECT COUNT(*) AS n FROM jobs WHERE status = 'Running' AND assigned_worker = $1",
        )
        .bind(worker_name)
        .fetch_one(&self.pool)
        .await?
        .try_get("n")?;
        Ok(n as u32)
    }

    async fn oldest_pending_job(&self, queue_name: &str) -> Result<Option<Job>> {
        sqlx::query(
            "SELECT * FROM jobs WHERE status = 'Pending' AND queue_name = $1
             ORDER BY created_at ASC, id ASC LIMIT 1",
        )
        .bind(queue_name)
        .fetch_optional(&self.pool)
        .await?
        .map(|row| job_from_row(&row))
        .transpose()
    }

    async fn count_pending_for_queue(&self, queue_name: &str) -> Result<u64> {
        let n: i64 = sqlx::query(
            "SELECT COUNT(*) AS n FROM jobs WHERE status = 'Pending' AND queue_name = $1",
        )
        .bind(queue_name)
        .fetch_one(&self.pool)
        .await?
        .try_get("n")?;
        Ok(n as u64)
    }

    async fn count_jobs_for_spec(&self, spec_name: &str, status: JobStatus) -> Result<u64> {
        let n: i64 = sqlx::query(
            "SELECT COUNT(*) AS n FROM jobs WHERE spec_name = $1 AND status = $2",
        )
        .bind(spec_name)
        .bind(status.to_string())
        .fetch_one(&self.pool)
        .await?
        .try_get("n")?;
        Ok(n as u64)
    }

    async fn reserve_job(&self, job_id: Uuid, worker: &Worker) -> Result<Option<Job>> {
        // Single-statement compare-and-set: the capacity subquery and the
        // Pending check are evaluated under the same write.
        let result = sqlx::query(
            "UPDATE jobs SET status = 'Running', assigned_worker = $1, started_at = $2
             WHERE id = $3 AND status = 'Pending'
               AND (SELECT COUNT(*) FROM jobs r
                    WHERE r.assigned_worker = $1 AND r.status = 'Running') < $4",
        )
        .bind(&worker.name)
        .bind(fmt_ts(Utc::now()))
        .bind(job_id.to_string())
        .bind(worker.max_jobs as i64)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_job(job_id).await
    }

    async fn release_job(&self, job_id: Uuid) -> Result<Option<Job>> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'Pending', assigned_worker = NULL,
                             started_at = NULL, progress = 0
             WHERE id = $1 AND status = 'Running'",
        )
        .bind(job_id.to_string())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_job(job_id).await
    }

    async fn move_job(&self, job_id: Uuid, queue_name: &str) -> Result<Option<Job>> {
        let result = sqlx::query(
            "UPDATE jobs SET queue_name = $1 WHERE id = $2 AND status = 'Pending'",
        )
        .bind(queue_name)
        .bind(job_id.to_string())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_job(job_id).await
    }

    async fn set_job_progress(&self, job_id: Uuid, progress: u8) -> Result<Option<Job>> {
        let progress = progress.min(100) as i64;
        let result = sqlx::query(
            "UPDATE jobs SET progress = $1
             WHERE id = $2 AND status = 'Running' AND progress < $1",
        )
        .bind(progress)
        .bind(job_id.to_string())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_job(job_id).await
    }

    async fn finish_job(
        &self,
        job_id: Uuid,
        status: JobStatus,
        result: Option<Map<String, Value>>,
        error_message: Option<String>,
    ) -> Result<Option<Job>> {
        if !status.is_terminal() {
            return Ok(None);
        }
        let outcome = sqlx::query(
            "UPDATE jobs SET status = $1, result = $2, error_message = $3, completed_at = $4,
                             progress = CASE WHEN $1 = 'Completed' THEN 100 ELSE progress END
             WHERE id = $5
               AND (status = 'Running' OR (status = 'Pending' AND $1 = 'Cancelled'))",
        )
        .bind(status.to_string())
        .bind(result.as_ref().map(serde_json::to_string).transpose()?)
        .bind(&error_message)
        .bind(fmt_ts(Utc::now()))
        .bind(job_id.to_string())
        .execute(&self.pool)
        .await?;
        if outcome.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_job(job_id).await
    }

    async fn delete_job(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DispatchError::not_found("job", id));
        }
        Ok(())
    }

    async fn job_statistics(&self) -> Result<JobStatistics> {
        let status_rows =
            sqlx::query("SELECT status, COUNT(*) AS n FROM jobs GROUP BY status")
                .fetch_all(&self.pool)
                .await?;
        let mut by_status = HashMap::new();
        let mut total = 0u64;
        for row in &status_rows {
            let status: String = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            total += n as u64;
            by_status.insert(status, n as u64);
        }
        let spec_rows = sqlx::query(
            "SELECT spec_name, COUNT(*) AS n FROM jobs GROUP BY spec_name
             ORDER BY n DESC, spec_name ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        let by_spec = spec_rows
            .iter()
            .map(|row| {
                Ok((
                    row.try_get::<String, _>("spec_name")?,
                    row.try_get::<i64, _>("n")? as u64,
                ))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(JobStatistics {
            total,
            by_status,
            by_spec,
        })
    }

    async fn recover_interrupted_jobs(&self, reason: &str) -> Result<Vec<Job>> {
        let interrupted = self.jobs_with_status(JobStatus::Running).await?;
        if interrupted.is_empty() {
            return Ok(Vec::new());
        }
        sqlx::query(
            "UPDATE jobs SET status = 'Failed', error_message = $1, completed_at = $2
             WHERE status = 'Running'",
        )
        .bind(reason)
        .bind(fmt_ts(Utc::now()))
        .execute(&self.pool)
        .await?;
        let mut recovered = Vec::with_capacity(interrupted.len());
        for job in interrupted {
            if let Some(updated) = self.get_job(job.id).await? {
                recovered.push(updated);
            }
        }
        Ok(recovered)
    }

    async fn terminal_jobs_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            "SELECT * FROM jobs
             WHERE status IN ('Completed', 'Failed', 'Cancelled') AND completed_at < $1",
        )
        .bind(fmt_ts(cutoff))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn create_queue(&self, queue: NewQueue) -> Result<Queue> {
        let taken = sqlx::query("SELECT id FROM queues WHERE name = $1")
            .bind(&queue.name)
            .fetch_optional(&self.pool)
            .await?;
        if taken.is_some() {
            return Err(DispatchError::conflict(format!(
                "queue with name '{}' already exists",
                queue.name
            )));
        }
        if queue.is_default {
            sqlx::query("UPDATE queues SET is_default = 0")
                .execute(&self.pool)
                .await?;
        }
        let id = Self::next_id(&self.queue_ids);
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO queues (id, name, description, priority, strategy, state, is_default,
                                 time_limit_secs, rr_cursor, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 0, $9, $10)",
        )
        .bind(id)
        .bind(&queue.name)
        .bind(&queue.description)
        .bind(queue.priority.to_string())
        .bind(queue.strategy.to_string())
        .bind(queue.state.to_string())
        .bind(queue.is_default as i64)
        .bind(queue.time_limit_secs)
        .bind(fmt_ts(now))
        .bind(fmt_ts(now))
        .execute(&self.pool)
        .await?;
        Ok(Queue {
            id,
            name: queue.name,
            description: queue.description,
            priority: queue.priority,
            strategy: queue.strategy,
            state: queue.state,
            is_default: queue.is_default,
            time_limit_secs: queue.time_limit_secs,
            rr_cursor: 0,
            created_at: now,
            updated_at: now,
        })
    }

    async fn get_queue(&self, id: i64) -> Result<Option<Queue>> {
        sqlx::query("SELECT * FROM queues WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| queue_from_row(&row))
            .transpose()
    }

    async fn get_queue_by_name(&self, name: &str) -> Result<Option<Queue>> {
        sqlx::query("SELECT * FROM queues WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| queue_from_row(&row))
            .transpose()
    }

    async fn default_queue(&self) -> Result<Option<Queue>> {
        sqlx::query("SELECT * FROM queues WHERE is_default = 1 LIMIT 1")
            .fetch_optional(&self.pool)
            .await?
            .map(|row| queue_from_row(&row))
            .transpose()
    }

    async fn list_queues(&self, page: Page) -> Result<(Vec<Queue>, u64)> {
        let total: i64 = sqlx::query("SELECT COUNT(*) AS n FROM queues")
            .fetch_one(&self.pool)
            .await?
            .try_get("n")?;
        let rows = sqlx::query(
            "SELECT * FROM queues ORDER BY created_at DESC, id ASC LIMIT $1 OFFSET $2",
        )
        .bind(page.limit() as i64)
        .bind(page.offset() as i64)
        .fetch_all(&self.pool)
        .await?;
        let queues = rows
            .iter()
            .map(queue_from_row)
            .collect::<Result<Vec<_>>>()?;
        Ok((queues, total as u64))
    }

    async fn update_queue(&self, id: i64, patch: QueuePatch) -> Result<Queue> {
        let current = self
            .get_queue(id)
            .await?
            .ok_or_else(|| DispatchError::not_found("queue", id))?;
        if let Some(new_name) = &patch.name {
            let taken = sqlx::query("SELECT id FROM queues WHERE name = $1 AND id <> $2")
                .bind(new_name)
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
            if taken.is_some() {
                return Err(DispatchError::conflict(format!(
                    "queue with name '{new_name}' already exists"
                )));
            }
        }
        if patch.is_default == Some(true) {
            sqlx::query("UPDATE queues SET is_default = 0 WHERE id <> $1")
                .bind(id)
                .execute(&self.pool)
                .await?;
        }
        let name = patch.name.unwrap_or(current.name);
        let description = patch.description.or(current.description);
        let priority = patch.priority.unwrap_or(current.priority);
        let strategy = patch.strategy.unwrap_or(current.strategy);
        let is_default = patch.is_default.unwrap_or(current.is_default);
        let time_limit_secs = patch.time_limit_secs.unwrap_or(current.time_limit_secs);
        let now = Utc::now();
        sqlx::query(
            "UPDATE queues SET name = $1, description = $2, priority = $3, strategy = $4,
                               is_default = $5, time_limit_secs = $6, updated_at = $7
             WHERE id = $8",
        )
        .bind(&name)
        .bind(&description)
        .bind(priority.to_string())
        .bind(strategy.to_string())
        .bind(is_default as i64)
        .bind(time_limit_secs)
        .bind(fmt_ts(now))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(Queue {
            id,
            name,
            description,
            priority,
            strategy,
            state: current.state,
            is_default,
            time_limit_secs,
            rr_cursor: current.rr_cursor,
            created_at: current.created_at,
            updated_at: now,
        })
    }

    async fn set_queue_state(&self, id: i64, state: crate::model::QueueState) -> Result<Queue> {
        let result = sqlx::query("UPDATE queues SET state = $1, updated_at = $2 WHERE id = $3")
            .bind(state.to_string())
            .bind(fmt_ts(Utc::now()))
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DispatchError::not_found("queue", id));
        }
        self.get_queue(id)
            .await?
            .ok_or_else(|| DispatchError::not_found("queue", id))
    }

    async fn advance_rr_cursor(&self, id: i64) -> Result<u32> {
        let queue = self
            .get_queue(id)
            .await?
            .ok_or_else(|| DispatchError::not_found("queue", id))?;
        sqlx::query("UPDATE queues SET rr_cursor = rr_cursor + 1 WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(queue.rr_cursor)
    }

    async fn delete_queue(&self, id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM queues WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DispatchError::not_found("queue", id));
        }
        sqlx::query("DELETE FROM queue_workers WHERE queue_id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn assign_worker_to_queue(&self, queue_id: i64, worker_id: i64) -> Result<bool> {
        if self.get_queue(queue_id).await?.is_none() {
            return Err(DispatchError::not_found("queue", queue_id));
        }
        if self.get_worker(worker_id).await?.is_none() {
            return Err(DispatchError::not_found("worker", worker_id));
        }
        let existing = sqlx::query(
            "SELECT queue_id FROM queue_workers WHERE queue_id = $1 AND worker_id = $2",
        )
        .bind(queue_id)
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await?;
        if existing.is_some() {
            return Ok(false);
        }
        sqlx::query(
            "INSERT INTO queue_workers (queue_id, worker_id, created_at) VALUES ($1, $2, $3)",
        )
        .bind(queue_id)
        .bind(worker_id)
        .bind(fmt_ts(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(true)
    }

    async fn unassign_worker_from_queue(&self, queue_id: i64, worker_id: i64) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM queue_workers WHERE queue_id = $1 AND worker_id = $2",
        )
        .bind(queue_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn queue_workers(&self, queue_id: i64) -> Result<Vec<Worker>> {
        let rows = sqlx::query(
            "SELECT w.* FROM workers w
             JOIN queue_workers qw ON qw.worker_id = w.id
             WHERE qw.queue_id = $1 ORDER BY w.id ASC",
        )
        .bind(queue_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(worker_from_row).collect()
    }

    async fn unassigned_workers(&self, queue_id: i64) -> Result<Vec<Worker>> {
        let rows = sqlx::query(
            "SELECT * FROM workers
             WHERE id NOT IN (SELECT worker_id FROM queue_workers WHERE queue_id = $1)
             ORDER BY id ASC",
        )
        .bind(queue_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(worker_from_row).collect()
    }

    async fn create_worker(&self, mut worker: Worker) -> Result<Worker> {
        let taken = sqlx::query("SELECT id FROM workers WHERE name = $1")
            .bind(&worker.name)
            .fetch_optional(&self.pool)
            .await?;
        if taken.is_some() {
            return Err(DispatchError::conflict(format!(
                "worker with name '{}' already exists",
                worker.name
            )));
        }
        worker.id = Self::next_id(&self.worker_ids);
        sqlx::query(
            "INSERT INTO workers (id, name, kind, hostname, ip_address, port, ssh_user,
                                  auth_method, ssh_private_key, password, provision, max_jobs,
                                  status, state, last_seen, error_message, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)",
        )
        .bind(worker.id)
        .bind(&worker.name)
        .bind(worker.kind.to_string())
        .bind(&worker.hostname)
        .bind(&worker.ip_address)
        .bind(worker.port as i64)
        .bind(&worker.ssh_user)
        .bind(worker.auth_method.map(|m| m.to_string()))
        .bind(&worker.ssh_private_key)
        .bind(&worker.password)
        .bind(worker.provision as i64)
        .bind(worker.max_jobs as i64)
        .bind(worker.status.to_string())
        .bind(worker.state.to_string())
        .bind(fmt_opt_ts(worker.last_seen))
        .bind(&worker.error_message)
        .bind(fmt_ts(worker.created_at))
        .bind(fmt_ts(worker.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(worker)
    }

    async fn get_worker(&self, id: i64) -> Result<Option<Worker>> {
        sqlx::query("SELECT * FROM workers WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| worker_from_row(&row))
            .transpose()
    }

    async fn get_worker_by_name(&self, name: &str) -> Result<Option<Worker>> {
        sqlx::query("SELECT * FROM workers WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| worker_from_row(&row))
            .transpose()
    }

    async fn list_workers(&self, page: Page) -> Result<(Vec<Worker>, u64)> {
        let total: i64 = sqlx::query("SELECT COUNT(*) AS n FROM workers")
            .fetch_one(&self.pool)
            .await?
            .try_get("n")?;
        let rows = sqlx::query("SELECT * FROM workers ORDER BY id ASC LIMIT $1 OFFSET $2")
            .bind(page.limit() as i64)
            .bind(page.offset() as i64)
            .fetch_all(&self.pool)
            .await?;
        let workers = rows
            .iter()
            .map(worker_from_row)
            .collect::<Result<Vec<_>>>()?;
        Ok((workers, total as u64))
    }

    async fn update_worker(&self, worker: &Worker) -> Result<()> {
        let taken = sqlx::query("SELECT id FROM workers WHERE name = $1 AND id <> $2")
            .bind(&worker.name)
            .bind(worker.id)
            .fetch_optional(&self.pool)
            .await?;
        if taken.is_some() {
            return Err(DispatchError::conflict(format!(
                "worker with name '{}' already exists",
                worker.name
            )));
        }
        let result = sqlx::query(
            "UPDATE workers SET name = $1, kind = $2, hostname = $3, ip_address = $4, port = $5,
                                ssh_user = $6, auth_method = $7, ssh_private_key = $8,
                                password = $9, provision = $10, max_jobs = $11, status = $12,
                                state = $13, last_seen = $14, error_message = $15, updated_at = $16
             WHERE id = $17",
        )
        .bind(&worker.name)
        .bind(worker.kind.to_string())
        .bind(&worker.hostname)
        .bind(&worker.ip_address)
        .bind(worker.port as i64)
        .bind(&worker.ssh_user)
        .bind(worker.auth_method.map(|m| m.to_string()))
        .bind(&worker.ssh_private_key)
        .bind(&worker.password)
        .bind(worker.provision as i64)
        .bind(worker.max_jobs as i64)
        .bind(worker.status.to_string())
        .bind(worker.state.to_string())
        .bind(fmt_opt_ts(worker.last_seen))
        .bind(&worker.error_message)
        .bind(fmt_ts(Utc::now()))
        .bind(worker.id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DispatchError::not_found("worker", worker.id));
        }
        Ok(())
    }

    async fn set_worker_state(&self, id: i64, state: WorkerState) -> Result<Worker> {
        let result = sqlx::query("UPDATE workers SET state = $1, updated_at = $2 WHERE id = $3")
            .bind(state.to_string())
            .bind(fmt_ts(Utc::now()))
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DispatchError::not_found("worker", id));
        }
        self.get_worker(id)
            .await?
            .ok_or_else(|| DispatchError::not_found("worker", id))
    }

    async fn set_worker_status(
        &self,
        id: i64,
        status: WorkerStatus,
        error_message: Option<String>,
        last_seen: Option<DateTime<Utc>>,
    ) -> Result<Worker> {
        let result = if let Some(seen) = last_seen {
            sqlx::query(
                "UPDATE workers SET status = $1, error_message = $2, last_seen = $3, updated_at = $4
                 WHERE id = $5",
            )
            .bind(status.to_string())
            .bind(&error_message)
            .bind(fmt_ts(seen))
            .bind(fmt_ts(Utc::now()))
            .bind(id)
            .execute(&self.pool)
            .await?
        } else {
            sqlx::query(
                "UPDATE workers SET status = $1, error_message = $2, updated_at = $3 WHERE id = $4",
            )
            .bind(status.to_string())
            .bind(&error_message)
            .bind(fmt_ts(Utc::now()))
            .bind(id)
            .execute(&self.pool)
            .await?
        };
        if result.rows_affected() == 0 {
            return Err(DispatchError::not_found("worker", id));
        }
        self.get_worker(id)
            .await?
            .ok_or_else(|| DispatchError::not_found("worker", id))
    }

    async fn delete_worker(&self, id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM workers WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DispatchError::not_found("worker", id));
        }
        sqlx::query("DELETE FROM queue_workers WHERE worker_id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn create_user(&self, mut user: User) -> Result<User> {
        let taken = sqlx::query("SELECT id FROM users WHERE username = $1")
            .bind(&user.username)
            .fetch_optional(&self.pool)
            .await?;
        if taken.is_some() {
            return Err(DispatchError::conflict(format!(
                "user '{}' already exists",
                user.username
            )));
        }
        user.id = Self::next_id(&self.user_ids);
        sqlx::query(
            "INSERT INTO users (id, username, password_hash, full_name, role, auth_source,
                                is_active, last_login, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(user.id)
        .bind(&user.username)
        .bind(&user.password_hash)
        .bind(&user.full_name)
        .bind(&user.role)
        .bind(&user.auth_source)
        .bind(user.is_active as i64)
        .bind(fmt_opt_ts(user.last_login))
        .bind(fmt_ts(user.created_at))
        .execute(&self.pool)
        .await?;
        Ok(user)
    }

    async fn get_user_by_username(&self, username: &str) -> Result<Option<User>> {
        sqlx::query("SELECT * FROM users WHERE username = $1")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| user_from_row(&row))
            .transpose()
    }

    async fn count_users(&self) -> Result<u64> {
        let n: i64 = sqlx::query("SELECT COUNT(*) AS n FROM users")
            .fetch_one(&self.pool)
            .await?
            .try_get("n")?;
        Ok(n as u64)
    }

    async fn touch_last_login(&self, user_id: i64) -> Result<()> {
        sqlx::query("UPDATE users SET last_login = $1 WHERE id = $2")
            .bind(fmt_ts(Utc::now()))
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn create_session(
        &self,
        user_id: i64,
        token: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<Session> {
        let id = Self::next_id(&self.session_ids);
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO sessions (id, user_id, token, expires_at, created_at)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(id)
        .bind(user_id)
        .bind(token)
        .bind(fmt_ts(expires_at))
        .bind(fmt_ts(now))
        .execute(&self.pool)
        .await?;
        Ok(Session {
            id,
            user_id,
            token: token.to_string(),
            expires_at,
            created_at: now,
        })
    }

    async fn get_session(&self, token: &str) -> Result<Option<Session>> {
        sqlx::query("SELECT * FROM sessions WHERE token = $1")
            .bind(token)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| session_from_row(&row))
            .transpose()
    }

    async fn delete_session(&self, token: &str) -> Result<()> {
        sqlx::query("DELETE FROM sessions WHERE token = $1")
            .bind(token)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn purge_expired_sessions(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM sessions WHERE expires_at <= $1")
            .bind(fmt_ts(Utc::now()))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn get_config(&self, category: &str) -> Result<HashMap<String, String>> {
        let rows = sqlx::query("SELECT name, value FROM config WHERE category = $1")
            .bind(category)
            .fetch_all(&self.pool)
            .await?;
        let mut values = HashMap::new();
        for row in &rows {
            values.insert(
                row.try_get::<String, _>("name")?,
                row.try_get::<String, _>("value")?,
            );
        }
        Ok(values)
    }

    async fn set_config(&self, category: &str, values: &HashMap<String, String>) -> Result<()> {
        for (name, value) in values {
            sqlx::query("DELETE FROM config WHERE category = $1 AND name = $2")
                .bind(category)
                .bind(name)
                .execute(&self.pool)
                .await?;
            sqlx::query("INSERT INTO config (category, name, value) VALUES ($1, $2, $3)")
                .bind(category)
                .bind(name)
                .bind(value)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }
}
