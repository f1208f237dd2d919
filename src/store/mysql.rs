//! [`JobStore`] over the MySQL tables shared with the order intake service.
//!
//! | model field              | column                              |
//! |--------------------------|-------------------------------------|
//! | `Order::id`              | `orders.id`                         |
//! | `Order::received`        | `orders.order_received`             |
//! | `Order::ready`           | `orders.order_ready`                |
//! | `Order::retrieved`       | `orders.order_retrieved`            |
//! | `Order::size`            | `orders.order_size`                 |
//! | `Order::brewed`          | `orders.order_brewed`               |
//! | `BrewJob::id`            | `coffee_list_items.job_id`          |
//! | `BrewJob::machine_job_id`| `coffee_list_items.machine_job_id`  |
//! | `BrewJob::started`       | `coffee_list_items.job_started`     |
//! | `BrewJob::ready`         | `coffee_list_items.job_ready`       |
//! | `BrewJob::retrieved`     | `coffee_list_items.job_retrieved`   |
//! | `BrewJob::version`       | `coffee_list_items.version`         |
//!
//! `order_id`, `product`, `order_received` and `machine` keep their names.
//! Timestamps are text: naive UTC ISO-8601 at second precision, the way
//! intake writes them.

use chrono::{DateTime, Utc};
use sqlx::MySqlPool;
use sqlx::mysql::MySqlPoolOptions;
use tracing::{debug, info, instrument, warn};

use super::models::{BrewJob, Order};
use super::{JobFilter, JobStore};
use crate::error::{BaristaError, Result};
use crate::machine::types::parse_timestamp;

const JOB_COLUMNS: &str = "job_id, machine_job_id, order_id, product, order_received, machine, \
                           job_started, job_ready, job_retrieved, version";

const ORDER_COLUMNS: &str =
    "id, order_received, order_ready, order_retrieved, order_size, order_brewed";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

// Optimistic retries for the order counter before giving up on the cycle.
const MAX_ORDER_ATTEMPTS: usize = 5;

#[derive(Debug, sqlx::FromRow)]
struct OrderRow {
    id: String,
    order_received: Option<String>,
    order_ready: Option<String>,
    order_retrieved: Option<String>,
    order_size: i64,
    order_brewed: i64,
}

impl TryFrom<OrderRow> for Order {
    type Error = sqlx::Error;

    fn try_from(row: OrderRow) -> std::result::Result<Self, Self::Error> {
        let received = decode_time("order_received", row.order_received)?
            .ok_or_else(|| missing("order_received"))?;
        Ok(Order {
            id: row.id,
            received,
            ready: decode_time("order_ready", row.order_ready)?,
            retrieved: decode_time("order_retrieved", row.order_retrieved)?,
            size: row.order_size,
            brewed: row.order_brewed,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    job_id: String,
    machine_job_id: Option<String>,
    order_id: String,
    product: String,
    order_received: String,
    machine: Option<String>,
    job_started: Option<String>,
    job_ready: Option<String>,
    job_retrieved: Option<String>,
    version: i64,
}

impl TryFrom<JobRow> for BrewJob {
    type Error = sqlx::Error;

    fn try_from(row: JobRow) -> std::result::Result<Self, Self::Error> {
        let order_received = decode_time("order_received", Some(row.order_received))?
            .ok_or_else(|| missing("order_received"))?;
        Ok(BrewJob {
            id: row.job_id,
            machine_job_id: row.machine_job_id,
            order_id: row.order_id,
            product: row.product,
            order_received,
            machine: row.machine,
            started: decode_time("job_started", row.job_started)?,
            ready: decode_time("job_ready", row.job_ready)?,
            retrieved: decode_time("job_retrieved", row.job_retrieved)?,
            version: row.version,
        })
    }
}

/// Empty text counts as unset.
fn decode_time(
    column: &str,
    raw: Option<String>,
) -> std::result::Result<Option<DateTime<Utc>>, sqlx::Error> {
    raw.filter(|value| !value.trim().is_empty())
        .map(|value| {
            parse_timestamp(&value).map_err(|e| sqlx::Error::ColumnDecode {
                index: column.to_string(),
                source: Box::new(e),
            })
        })
        .transpose()
}

fn missing(column: &str) -> sqlx::Error {
    sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: "unexpected NULL".into(),
    }
}

fn encode_time(at: DateTime<Utc>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

/// [`JobStore`] backed by MySQL.
#[derive(Debug, Clone)]
pub struct MySqlJobStore {
    pool: MySqlPool,
}

impl MySqlJobStore {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Creates the tables if they are missing and adds the dispatcher's own
    /// columns to tables created by an older deployment.
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS orders (
                id VARCHAR(255) NOT NULL PRIMARY KEY,
                order_received VARCHAR(255) NULL,
                order_ready VARCHAR(255) NULL,
                order_retrieved VARCHAR(255) NULL,
                order_size INT NOT NULL,
                order_brewed INT NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS coffee_list_items (
                id INT NOT NULL AUTO_INCREMENT PRIMARY KEY,
                product VARCHAR(255) NOT NULL,
                order_id VARCHAR(255) NOT NULL,
                order_received VARCHAR(255) NOT NULL,
                machine VARCHAR(255) NULL,
                job_id VARCHAR(255) NOT NULL,
                job_started VARCHAR(255) NULL,
                job_ready VARCHAR(255) NULL,
                job_retrieved VARCHAR(255) NULL,
                machine_job_id VARCHAR(255) NULL,
                version BIGINT NOT NULL DEFAULT 0,
                UNIQUE KEY uq_coffee_list_items_job_id (job_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        let has_handle_column: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM information_schema.COLUMNS
            WHERE TABLE_SCHEMA = DATABASE()
              AND TABLE_NAME = 'coffee_list_items'
              AND COLUMN_NAME = 'machine_job_id'
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        if has_handle_column == 0 {
            sqlx::query(
                "ALTER TABLE coffee_list_items \
                 ADD COLUMN machine_job_id VARCHAR(255) NULL, \
                 ADD COLUMN version BIGINT NOT NULL DEFAULT 0",
            )
            .execute(&self.pool)
            .await?;

            // Dispatched rows of the old layout hold the machine's handle in job_id.
            let migrated = sqlx::query(
                "UPDATE coffee_list_items SET machine_job_id = job_id WHERE machine IS NOT NULL",
            )
            .execute(&self.pool)
            .await?;
            info!(rows = migrated.rows_affected(), "added dispatcher columns to coffee_list_items");
        }

        debug!("schema ready");
        Ok(())
    }

    async fn fetch_job(&self, id: &str) -> Result<BrewJob> {
        self.get_job(id)
            .await?
            .ok_or_else(|| BaristaError::Store(sqlx::Error::RowNotFound))
    }
}

impl JobStore for MySqlJobStore {
    async fn get_order(&self, id: &str) -> Result<Option<Order>> {
        let row = sqlx::query_as::<_, OrderRow>(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Order::try_from).transpose()?)
    }

    async fn get_job(&self, id: &str) -> Result<Option<BrewJob>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM coffee_list_items WHERE job_id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(BrewJob::try_from).transpose()?)
    }

    async fn find_jobs(&self, filter: JobFilter, limit: Option<u32>) -> Result<Vec<BrewJob>> {
        let predicate = match filter {
            JobFilter::Pending => "machine IS NULL",
            JobFilter::Claimed => {
                "machine IS NOT NULL AND machine_job_id IS NULL AND job_retrieved IS NULL"
            }
            JobFilter::Outstanding => {
                "machine IS NOT NULL AND machine_job_id IS NOT NULL AND job_retrieved IS NULL"
            }
        };
        let limit = limit.map(|n| format!(" LIMIT {n}")).unwrap_or_default();
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM coffee_list_items WHERE {predicate} \
             ORDER BY order_received, job_id{limit}"
        ))
        .fetch_all(&self.pool)
        .await?;
        let jobs = rows
            .into_iter()
            .map(BrewJob::try_from)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    async fn open_orders(&self) -> Result<Vec<Order>> {
        let rows = sqlx::query_as::<_, OrderRow>(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE order_ready IS NULL \
             ORDER BY order_received, id"
        ))
        .fetch_all(&self.pool)
        .await?;
        let orders = rows
            .into_iter()
            .map(Order::try_from)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(orders)
    }

    #[instrument(skip(self, order), fields(order_id = %order.id))]
    async fn save_order(&self, order: &Order) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE orders
            SET order_received = ?, order_ready = ?, order_retrieved = ?,
                order_size = ?, order_brewed = ?
            WHERE id = ?
            "#,
        )
        .bind(encode_time(order.received))
        .bind(order.ready.map(encode_time))
        .bind(order.retrieved.map(encode_time))
        .bind(order.size)
        .bind(order.brewed)
        .bind(&order.id)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() > 0 {
            return Ok(());
        }

        sqlx::query(
            r#"
            INSERT INTO orders (id, order_received, order_ready, order_retrieved,
                                order_size, order_brewed)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&order.id)
        .bind(encode_time(order.received))
        .bind(order.ready.map(encode_time))
        .bind(order.retrieved.map(encode_time))
        .bind(order.size)
        .bind(order.brewed)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self, job), fields(job_id = %job.id))]
    async fn save_job(&self, job: &BrewJob) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE coffee_list_items
            SET machine_job_id = ?, order_id = ?, product = ?, order_received = ?,
                machine = ?, job_started = ?, job_ready = ?, job_retrieved = ?, version = ?
            WHERE job_id = ?
            "#,
        )
        .bind(&job.machine_job_id)
        .bind(&job.order_id)
        .bind(&job.product)
        .bind(encode_time(job.order_received))
        .bind(&job.machine)
        .bind(job.started.map(encode_time))
        .bind(job.ready.map(encode_time))
        .bind(job.retrieved.map(encode_time))
        .bind(job.version)
        .bind(&job.id)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() > 0 {
            return Ok(());
        }

        sqlx::query(
            r#"
            INSERT INTO coffee_list_items (job_id, machine_job_id, order_id, product,
                                           order_received, machine, job_started, job_ready,
                                           job_retrieved, version)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(&job.machine_job_id)
        .bind(&job.order_id)
        .bind(&job.product)
        .bind(encode_time(job.order_received))
        .bind(&job.machine)
        .bind(job.started.map(encode_time))
        .bind(job.ready.map(encode_time))
        .bind(job.retrieved.map(encode_time))
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
            UPDATE coffee_list_items
            SET machine = ?, machine_job_id = NULL, job_started = ?, version = version + 1
            WHERE job_id = ? AND machine IS NULL AND version = ?
            "#,
        )
        .bind(machine)
        .bind(encode_time(at))
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
            UPDATE coffee_list_items
            SET machine_job_id = ?, job_started = ?, job_ready = ?, version = version + 1
            WHERE job_id = ? AND machine = ? AND machine_job_id IS NULL AND version = ?
            "#,
        )
        .bind(machine_job_id)
        .bind(encode_time(started))
        .bind(encode_time(ready))
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
            UPDATE coffee_list_items
            SET machine = NULL, machine_job_id = NULL, job_started = NULL, job_ready = NULL,
                version = version + 1
            WHERE job_id = ? AND machine_job_id IS NULL AND job_retrieved IS NULL
              AND version = ?
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
            UPDATE coffee_list_items
            SET job_retrieved = ?, version = version + 1
            WHERE job_id = ? AND machine IS NOT NULL AND job_retrieved IS NULL
            "#,
        )
        .bind(encode_time(at))
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
                "UPDATE orders SET order_brewed = ?, order_ready = ? \
                 WHERE id = ? AND order_brewed = ?",
            )
            .bind(order.brewed)
            .bind(order.ready.map(encode_time))
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
