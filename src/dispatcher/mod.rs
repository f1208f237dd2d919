//! One dispatch cycle: resolve machines, retrieve finished work, hand out
//! new work.

pub mod dispatch;
pub mod report;
pub mod retrieval;

pub use report::CycleReport;

use chrono::{DateTime, Utc};
use tokio::time::timeout;
use tracing::{debug, info};

use crate::config::BaristaConfig;
use crate::error::{BaristaError, Result};
use crate::machine::MachineApi;
use crate::resolver::resolve_endpoints;
use crate::store::JobStore;

/// Runs cycles against a store and a set of machines.
pub struct Dispatcher<S, M> {
    store: S,
    machines: M,
    config: BaristaConfig,
}

impl<S: JobStore, M: MachineApi> Dispatcher<S, M> {
    pub fn new(store: S, machines: M, config: BaristaConfig) -> Self {
        Self {
            store,
            machines,
            config,
        }
    }

    /// Runs one cycle within the configured deadline.
    ///
    /// Per-machine failures are in the returned report; an `Err` means the
    /// cycle itself failed (store, strict resolution, deadline).
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let deadline = self.config.cycle_timeout();
        timeout(deadline, self.cycle())
            .await
            .map_err(|_| BaristaError::CycleTimeout(self.config.cycle_timeout_secs))?
    }

    async fn cycle(&self) -> Result<CycleReport> {
        let mut report = CycleReport::start();
        debug!(started_at = %report.started_at, "cycle started");

        let resolution =
            resolve_endpoints(&self.config.machines, self.config.strict_resolution).await?;
        report.endpoints = resolution.endpoints;
        report.resolve_failures = resolution.failures;

        retrieval::run(&self.store, &self.machines, &mut report).await?;

        // A claim older than one cycle deadline cannot belong to a live cycle.
        let cutoff = chrono::Duration::from_std(self.config.cycle_timeout())
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        dispatch::release_stale_claims(&self.store, cutoff, &mut report).await?;

        let endpoints = report.endpoints.clone();
        dispatch::run(&self.store, &self.machines, &endpoints, &mut report).await?;

        let report = report.finish();
        info!(
            endpoints = report.endpoints.len(),
            retrieved = report.retrieved.len(),
            dispatched = report.dispatched.len(),
            failures = report.failures.len(),
            duration_ms = report.duration_ms,
            "cycle finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::{MachineClient, MachineError, StartJobResponse};
    use crate::store::{BrewJob, JobFilter, Order, SqliteJobStore};
    use chrono::Duration;
    use std::time::Duration as StdDuration;
    use wiremock::matchers::{method, path, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(machines: Vec<String>) -> BaristaConfig {
        BaristaConfig {
            machines,
            ..Default::default()
        }
    }

    async fn coffee_machine() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/status"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/start-job"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "jobId": "brew-1",
                // Already done, so the next cycle can collect it.
                "jobReady": "2020-01-01T00:00:00Z"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/retrieve-job/.+$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "product": "espresso"
            })))
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn two_cycles_brew_an_order() {
        let store = SqliteJobStore::in_memory().await.unwrap();
        let order = Order::new(Utc::now(), 1);
        store.save_order(&order).await.unwrap();
        let job = BrewJob::new(&order, "espresso");
        store.save_job(&job).await.unwrap();

        let server = coffee_machine().await;
        let dispatcher = Dispatcher::new(
            store.clone(),
            MachineClient::new(StdDuration::from_secs(5)).unwrap(),
            config(vec![server.uri()]),
        );

        let first = dispatcher.run_cycle().await.unwrap();
        assert_eq!(first.dispatched.len(), 1);
        assert!(first.retrieved.is_empty());

        let second = dispatcher.run_cycle().await.unwrap();
        assert_eq!(second.retrieved.len(), 1);
        assert!(second.retrieved[0].order_ready);
        assert!(second.dispatched.is_empty());

        let order = store.get_order(&order.id).await.unwrap().unwrap();
        let job = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(order.brewed, 1);
        assert_eq!(order.ready, job.retrieved);
        assert_eq!(job.machine_job_id.as_deref(), Some("brew-1"));
    }

    #[tokio::test]
    async fn unresolvable_machine_is_reported_not_fatal() {
        let store = SqliteJobStore::in_memory().await.unwrap();
        let dispatcher = Dispatcher::new(
            store,
            MachineClient::new(StdDuration::from_secs(5)).unwrap(),
            config(vec!["::nonsense::".into()]),
        );
        let report = dispatcher.run_cycle().await.unwrap();
        assert!(report.endpoints.is_empty());
        assert_eq!(report.resolve_failures.len(), 1);
        assert!(!report.is_clean());
    }

    #[tokio::test]
    async fn strict_resolution_fails_the_cycle() {
        let store = SqliteJobStore::in_memory().await.unwrap();
        let mut cfg = config(vec!["::nonsense::".into()]);
        cfg.strict_resolution = true;
        let dispatcher = Dispatcher::new(
            store,
            MachineClient::new(StdDuration::from_secs(5)).unwrap(),
            cfg,
        );
        let err = dispatcher.run_cycle().await.unwrap_err();
        assert!(matches!(err, BaristaError::Resolve { .. }));
    }

    /// A machine that never answers.
    struct Stalled;

    impl MachineApi for Stalled {
        async fn probe(&self, _base: &str) -> std::result::Result<(), MachineError> {
            std::future::pending().await
        }

        async fn start_job(
            &self,
            _base: &str,
            _product: &str,
        ) -> std::result::Result<StartJobResponse, MachineError> {
            std::future::pending().await
        }

        async fn retrieve_job(
            &self,
            _base: &str,
            _job_id: &str,
        ) -> std::result::Result<serde_json::Value, MachineError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn cycle_deadline_is_enforced() {
        let store = SqliteJobStore::in_memory().await.unwrap();
        let mut cfg = config(vec!["http://10.0.0.1:1337".into()]);
        cfg.cycle_timeout_secs = 1;
        let dispatcher = Dispatcher::new(store, Stalled, cfg);

        let err = dispatcher.run_cycle().await.unwrap_err();
        assert!(matches!(err, BaristaError::CycleTimeout(1)));
    }

    #[tokio::test]
    async fn abandoned_claims_are_redispatched() {
        let store = SqliteJobStore::in_memory().await.unwrap();
        let order = Order::new(Utc::now(), 1);
        store.save_order(&order).await.unwrap();
        let job = BrewJob::new(&order, "espresso");
        store.save_job(&job).await.unwrap();
        store
            .claim_job(&job, "http://10.9.9.9:1337", Utc::now() - Duration::hours(2))
            .await
            .unwrap()
            .unwrap();

        let server = coffee_machine().await;
        let dispatcher = Dispatcher::new(
            store.clone(),
            MachineClient::new(StdDuration::from_secs(5)).unwrap(),
            config(vec![server.uri()]),
        );
        let report = dispatcher.run_cycle().await.unwrap();

        assert_eq!(report.released_claims, 1);
        assert_eq!(report.dispatched.len(), 1);
        assert!(store.find_jobs(JobFilter::Claimed, None).await.unwrap().is_empty());
    }
}
