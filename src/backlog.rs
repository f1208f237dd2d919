//! Order intake and a snapshot of outstanding work.
//!
//! Orders normally arrive through the customer-facing service. `place_order`
//! writes the same records it would, for local runs against a test machine.

use chrono::Utc;
use serde::Serialize;

use crate::error::{BaristaError, Result};
use crate::store::{BrewJob, JobFilter, JobStore, Order};

pub async fn place_order<S: JobStore>(
    store: &S,
    products: &[String],
) -> Result<(Order, Vec<BrewJob>)> {
    if products.is_empty() {
        return Err(BaristaError::EmptyOrder);
    }
    let order = Order::new(Utc::now(), products.len() as i64);
    store.save_order(&order).await?;

    let mut jobs = Vec::with_capacity(products.len());
    for product in products {
        let job = BrewJob::new(&order, product.as_str());
        store.save_job(&job).await?;
        jobs.push(job);
    }
    tracing::info!(order_id = %order.id, size = order.size, "order placed");
    Ok((order, jobs))
}

/// Counts of jobs and orders by lifecycle stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Backlog {
    pub pending: usize,
    pub claimed: usize,
    pub brewing: usize,
    /// Brewing jobs whose ready time has passed.
    pub due: usize,
    pub open_orders: usize,
}

impl Backlog {
    pub async fn collect<S: JobStore>(store: &S) -> Result<Self> {
        let now = Utc::now();
        let outstanding = store.find_jobs(JobFilter::Outstanding, None).await?;
        Ok(Self {
            pending: store.find_jobs(JobFilter::Pending, None).await?.len(),
            claimed: store.find_jobs(JobFilter::Claimed, None).await?.len(),
            brewing: outstanding.len(),
            due: outstanding.iter().filter(|job| job.is_due(now)).count(),
            open_orders: store.open_orders().await?.len(),
        })
    }
}
