//! Durable orders and brew jobs.
//!
//! [`JobStore`] is the narrow interface the passes depend on. Every write
//! touches a single record. The state transitions that can race between
//! overlapping cycles (claiming a job, marking it retrieved, counting a
//! brew) are conditional writes that report whether they took effect.

mod models;
mod mysql;
mod sqlite;

#[cfg(test)]
pub use models::JobState;
pub use models::{BrewJob, Order};
pub use mysql::MySqlJobStore;
pub use sqlite::SqliteJobStore;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::Result;

/// Predicates the passes select jobs by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobFilter {
    /// `machine` unset.
    Pending,
    /// Claimed by a pass but never accepted by a machine.
    Claimed,
    /// `machine` set and `retrieved` unset, accepted by the machine.
    Outstanding,
}

#[allow(async_fn_in_trait)]
pub trait JobStore {
    async fn get_order(&self, id: &str) -> Result<Option<Order>>;

    async fn get_job(&self, id: &str) -> Result<Option<BrewJob>>;

    async fn find_jobs(&self, filter: JobFilter, limit: Option<u32>) -> Result<Vec<BrewJob>>;

    /// Orders whose `ready` is still unset.
    async fn open_orders(&self) -> Result<Vec<Order>>;

    /// Inserts or fully replaces an order.
    async fn save_order(&self, order: &Order) -> Result<()>;

    /// Inserts or fully replaces a job.
    async fn save_job(&self, job: &BrewJob) -> Result<()>;

    /// Assigns `job` to `machine` if nobody else has touched it since it was
    /// read. Returns the updated job, or `None` when the claim was lost.
    async fn claim_job(&self, job: &BrewJob, machine: &str, at: DateTime<Utc>)
    -> Result<Option<BrewJob>>;

    /// Records the machine's acceptance of a claimed job.
    async fn record_submission(
        &self,
        job: &BrewJob,
        machine_job_id: &str,
        started: DateTime<Utc>,
        ready: DateTime<Utc>,
    ) -> Result<Option<BrewJob>>;

    /// Returns a claimed job to the pending pool.
    async fn release_claim(&self, job: &BrewJob) -> Result<bool>;

    /// Sets `retrieved` unless it already is.
    async fn mark_retrieved(&self, job: &BrewJob, at: DateTime<Utc>) -> Result<Option<BrewJob>>;

    /// Counts one finished job against its order, stamping `ready` with `at`
    /// when it was the last one.
    async fn record_brewed(&self, order_id: &str, at: DateTime<Utc>) -> Result<Order>;
}

/// Backend named by a database URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseKind {
    MySql,
    Sqlite,
}

impl DatabaseKind {
    pub fn from_url(url: &str) -> Self {
        if url.starts_with("mysql://") {
            DatabaseKind::MySql
        } else {
            DatabaseKind::Sqlite
        }
    }
}

/// The store the binary runs against, chosen by `database_url`.
#[derive(Debug, Clone)]
pub enum Store {
    MySql(MySqlJobStore),
    Sqlite(SqliteJobStore),
}

impl Store {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let kind = DatabaseKind::from_url(database_url);
        debug!(?kind, "connecting to job store");
        match kind {
            DatabaseKind::MySql => Ok(Store::MySql(MySqlJobStore::connect(database_url).await?)),
            DatabaseKind::Sqlite => Ok(Store::Sqlite(SqliteJobStore::connect(database_url).await?)),
        }
    }

    pub async fn init_schema(&self) -> Result<()> {
        match self {
            Store::MySql(store) => store.init_schema().await,
            Store::Sqlite(store) => store.init_schema().await,
        }
    }
}

impl JobStore for Store {
    async fn get_order(&self, id: &str) -> Result<Option<Order>> {
        match self {
            Store::MySql(store) => store.get_order(id).await,
            Store::Sqlite(store) => store.get_order(id).await,
        }
    }

    async fn get_job(&self, id: &str) -> Result<Option<BrewJob>> {
        match self {
            Store::MySql(store) => store.get_job(id).await,
            Store::Sqlite(store) => store.get_job(id).await,
        }
    }

    async fn find_jobs(&self, filter: JobFilter, limit: Option<u32>) -> Result<Vec<BrewJob>> {
        match self {
            Store::MySql(store) => store.find_jobs(filter, limit).await,
            Store::Sqlite(store) => store.find_jobs(filter, limit).await,
        }
    }

    async fn open_orders(&self) -> Result<Vec<Order>> {
        match self {
            Store::MySql(store) => store.open_orders().await,
            Store::Sqlite(store) => store.open_orders().await,
        }
    }

    async fn save_order(&self, order: &Order) -> Result<()> {
        match self {
            Store::MySql(store) => store.save_order(order).await,
            Store::Sqlite(store) => store.save_order(order).await,
        }
    }

    async fn save_job(&self, job: &BrewJob) -> Result<()> {
        match self {
            Store::MySql(store) => store.save_job(job).await,
            Store::Sqlite(store) => store.save_job(job).await,
        }
    }

    async fn claim_job(
        &self,
        job: &BrewJob,
        machine: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<BrewJob>> {
        match self {
            Store::MySql(store) => store.claim_job(job, machine, at).await,
            Store::Sqlite(store) => store.claim_job(job, machine, at).await,
        }
    }

    async fn record_submission(
        &self,
        job: &BrewJob,
        machine_job_id: &str,
        started: DateTime<Utc>,
        ready: DateTime<Utc>,
    ) -> Result<Option<BrewJob>> {
        match self {
            Store::MySql(store) => {
                store
                    .record_submission(job, machine_job_id, started, ready)
                    .await
            }
            Store::Sqlite(store) => {
                store
                    .record_submission(job, machine_job_id, started, ready)
                    .await
            }
        }
    }

    async fn release_claim(&self, job: &BrewJob) -> Result<bool> {
        match self {
            Store::MySql(store) => store.release_claim(job).await,
            Store::Sqlite(store) => store.release_claim(job).await,
        }
    }

    async fn mark_retrieved(&self, job: &BrewJob, at: DateTime<Utc>) -> Result<Option<BrewJob>> {
        match self {
            Store::MySql(store) => store.mark_retrieved(job, at).await,
            Store::Sqlite(store) => store.mark_retrieved(job, at).await,
        }
    }

    async fn record_brewed(&self, order_id: &str, at: DateTime<Utc>) -> Result<Order> {
        match self {
            Store::MySql(store) => store.record_brewed(order_id, at).await,
            Store::Sqlite(store) => store.record_brewed(order_id, at).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_kind_from_url() {
        assert_eq!(
            DatabaseKind::from_url("mysql://barista:secret@db:3306/cafe"),
            DatabaseKind::MySql
        );
        assert_eq!(DatabaseKind::from_url("sqlite://barista.db"), DatabaseKind::Sqlite);
        assert_eq!(DatabaseKind::from_url("sqlite::memory:"), DatabaseKind::Sqlite);
    }

    #[tokio::test]
    async fn sqlite_url_opens_a_sqlite_store() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("barista.db").display());
        let store = Store::connect(&url).await.unwrap();
        assert!(matches!(store, Store::Sqlite(_)));

        store.init_schema().await.unwrap();
        let order = Order::new(Utc::now(), 1);
        store.save_order(&order).await.unwrap();
        assert_eq!(store.open_orders().await.unwrap(), vec![order]);
    }
}
