use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use tracing::{debug, instrument, warn};

use super::models::{BrewJob, Order};
use super::{JobFilter, JobStore};
use crate::error::{BaristaError, Result};

const JOB_COLUMNS: &str = "id, machine_job_id, order_id, product, order_received, machine, \
                           started, ready, retrieved, version";

const ORDER_COLUMNS: &str = "id, received, ready, retrieved, size, brewed";

// Optimistic retries for the order counter before giving up on the cycle.
const MAX_ORDER_ATTEMPTS: usize = 5;

/// [`JobStore`] backed by SQLite.
#[derive(Debug, Clone)]
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Opens (creating if needed) the database at `database_url`.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        Ok(Self::new(pool))
    }

    /// A private database that lives as long as the store.
    #[cfg(test)]
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let store = Self::new(pool);
        store.init_schema().await?;
        Ok(store)
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS orders (
                id TEXT PRIMARY KEY,
                received TEXT NOT NULL,
                ready TEXT,
                retrieved TEXT,
                size INTEGER NOT NULL CHECK (size >= 0),
                brewed INTEGER NOT NULL DEFAULT 0 CHECK (brewed >= 0 AND brewed <= size)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS brew_jobs (
                id TEXT PRIMARY KEY,
                machine_job_id TEXT,
                order_id TEXT NOT NULL,
                product TEXT NOT NULL,
                order_received TEXT NOT NULL,
                machine TEXT,
                started TEXT,
                ready TEXT,
                retrieved TEXT,
                version INTEGER NOT NULL DEFAULT 0,
                CHECK (retrieved IS NULL OR machine IS NOT NULL)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_brew_jobs_machine ON brew_jobs (machine, retrieved)")
            .execute(&self.pool)
            .await?;

        debug!("schema ready");
        Ok(())
    }

    async fn fetch_job(&self, id: &str) -> Result<BrewJob> {
        self.get_job(id)
            .await?
            .ok_or_else(|| BaristaError::Store(sqlx::Error::RowNotFound))
    }
}

impl JobStore for SqliteJobStore {
    async fn get_order(&self, id: &str) -> Result<Option<Order>> {
        let order = sqlx::query_as::<_, Order>(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(order)
    }

    async fn get_job(&self, id: &str) -> Result<Option<BrewJob>> {
        let job = sqlx::query_as::<_, BrewJob>(&format!(
            "SELECT {JOB_COLUMNS} FROM brew_jobs WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }

    async fn find_jobs(&self, filter: JobFilter, limit: Option<u32>) -> Result<Vec<BrewJob>> {
        let predicate = match filter {
            JobFilter::Pending => "machine IS NULL",
            JobFilter::Claimed => {
                "machine IS NOT NULL AND machine_job_id IS NULL AND retrieved IS NULL"
            }
            JobFilter::Outstanding => {
                "machine IS NOT NULL AND machine_job_id IS NOT NULL AND retrieved IS NULL"
            }
        };
        // SQLite treats a negative limit as "no limit".
        let limit = limit.map(i64::from).unwrap_or(-1);
        let jobs = sqlx::query_as::<_, BrewJob>(&format!(
            "SELECT {JOB_COLUMNS} FROM brew_jobs WHERE {predicate} \
             ORDER BY order_received, id LIMIT ?"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    async fn open_orders(&self) -> Result<Vec<Order>> {
        let orders = sqlx::query_as::<_, Order>(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE ready IS NULL ORDER BY received, id"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(orders)
    }

    #[instrument(skip(self, order), fields(order_id = %order.id))]
    async fn save_order(&self, order: &Order) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO orders (id, received, ready, retrieved, size, brewed)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                received = excluded.received,
                ready = excluded.ready,
                retrieved = excluded.retrieved,
                size = excluded.size,
                brewed = excluded.brewed
            "#,
        )
        .bind(&order.id)
        .bind(order.received)
        .bind(order.ready)
        .bind(order.retrieved)
        .bind(order.size)
        .bind(order.brewed)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self, job), fields(job_id = %job.id))]
    async fn save_job(&self, job: &BrewJob) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO brew_jobs (id, machine_job_id, order_id, product, order_received,
                                   machine, started, ready, retrieved, version)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                machine_job_id = excluded.machine_job_id,
                order_id = excluded.order_id,
                product = excluded.product,
                order_received = excluded.order_received,
                machine = excluded.machine,
                started = excluded.started,
                ready = excluded.ready,
                retrieved = excluded.retrieved,
                version = excluded.version
            "#,
        )
        .bind(&job.id)
        .bind(&job.machine_job_id)
        .bind(&job.order_id)
        .bind(&job.product)
        .bind(job.order_received)
        .bind(&job.machine)
        .bind(job.started)
        .bind(job.ready)
        .bind(job.retrieved)
        .bind(job.version)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, version = job.version))]
    async fn claim_job(
        &self,
        job: &BrewJob,
        machine: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<BrewJob>> {
        let result = sqlx::query(
            r#"
            UPDATE brew_jobs
            SET machine = ?, machine_job_id = NULL, started = ?, version = version + 1
            WHERE id = ? AND machine IS NULL AND version = ?
            "#,
        )
        .bind(machine)
        .bind(at)
        .bind(&job.id)
        .bind(job.version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            debug!("claim lost");
            return Ok(None);
        }
        Ok(Some(self.fetch_job(&job.id).await?))
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, version = job.version))]
    async fn record_submission(
        &self,
        job: &BrewJob,
        machine_job_id: &str,
        started: DateTime<Utc>,
        ready: DateTime<Utc>,
    ) -> Result<Option<BrewJob>> {
        let result = sqlx::query(
            r#"
            UPDATE brew_jobs
            SET machine_job_id = ?, started = ?, ready = ?, version = version + 1
            WHERE id = ? AND machine = ? AND machine_job_id IS NULL AND version = ?
            "#,
        )
        .bind(machine_job_id)
        .bind(started)
        .bind(ready)
        .bind(&job.id)
        .bind(&job.machine)
        .bind(job.version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            warn!("claim vanished before the submission was recorded");
            return Ok(None);
        }
        Ok(Some(self.fetch_job(&job.id).await?))
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, version = job.version))]
    async fn release_claim(&self, job: &BrewJob) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE brew_jobs
            SET machine = NULL, machine_job_id = NULL, started = NULL, ready = NULL,
                version = version + 1
            WHERE id = ? AND machine_job_id IS NULL AND retrieved IS NULL AND version = ?
            "#,
        )
        .bind(&job.id)
        .bind(job.version)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, job), fields(job_id = %job.id))]
    async fn mark_retrieved(&self, job: &BrewJob, at: DateTime<Utc>) -> Result<Option<BrewJob>> {
        let result = sqlx::query(
            r#"
            UPDATE brew_jobs
            SET retrieved = ?, version = version + 1
            WHERE id = ? AND machine IS NOT NULL AND retrieved IS NULL
            "#,
        )
        .bind(at)
        .bind(&job.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        Ok(Some(self.fetch_job(&job.id).await?))
    }

    #[instrument(skip(self))]
    async fn record_brewed(&self, order_id: &str, at: DateTime<Utc>) -> Result<Order> {
        for _ in 0..MAX_ORDER_ATTEMPTS {
            let mut order = self
                .get_order(order_id)
                .await?
                .ok_or_else(|| BaristaError::OrderNotFound(order_id.to_string()))?;
            let before = order.brewed;
            if !order.record_brewed(at) {
                warn!(size = order.size, "order already complete, not counting brew");
                return Ok(order);
            }

            let result = sqlx::query(
                "UPDATE orders SET brewed = ?, ready = ? WHERE id = ? AND brewed = ?",
            )
            .bind(order.brewed)
            .bind(order.ready)
            .bind(&order.id)
            .bind(before)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 1 {
                return Ok(order);
            }
            debug!("order changed underneath, retrying");
        }
        Err(BaristaError::Conflict(format!("order {order_id}")))
    }
}
