//! Collects finished jobs from machines and counts them against their
//! orders.

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use super::report::{CycleReport, JobFailure, RetrievedJob, Stage};
use crate::error::Result;
use crate::machine::MachineApi;
use crate::store::{BrewJob, JobFilter, JobStore};

/// Retrieves every outstanding job whose ready time has passed.
///
/// A machine failure leaves the job untouched so the next cycle retries it.
/// Store failures end the pass.
pub async fn run<S: JobStore, M: MachineApi>(
    store: &S,
    machines: &M,
    report: &mut CycleReport,
) -> Result<()> {
    let outstanding = store.find_jobs(JobFilter::Outstanding, None).await?;
    debug!(count = outstanding.len(), "checking outstanding jobs");

    for job in outstanding {
        let Some(ready) = job.ready else {
            warn!(job_id = %job.id, machine = ?job.machine, "outstanding job has no ready time");
            report.without_ready += 1;
            continue;
        };
        if !job.is_due(Utc::now()) {
            debug!(job_id = %job.id, %ready, "not due yet");
            report.not_due += 1;
            continue;
        }
        retrieve(store, machines, job, report).await?;
    }
    Ok(())
}

#[instrument(skip_all, fields(job_id = %job.id, machine = ?job.machine, order_id = %job.order_id))]
async fn retrieve<S: JobStore, M: MachineApi>(
    store: &S,
    machines: &M,
    job: BrewJob,
    report: &mut CycleReport,
) -> Result<()> {
    let (Some(machine), Some(handle)) = (job.machine.clone(), job.machine_job_id.clone()) else {
        return Ok(());
    };

    debug!(%handle, "trying to retrieve job");
    if let Err(err) = machines.retrieve_job(&machine, &handle).await {
        warn!(error = %err, "retrieval failed, will retry next cycle");
        report
            .failures
            .push(JobFailure::new(&job.id, &machine, Stage::Retrieve, &err));
        return Ok(());
    }

    let Some(job) = store.mark_retrieved(&job, Utc::now()).await? else {
        info!("job already retrieved by another cycle");
        return Ok(());
    };
    let Some(retrieved_at) = job.retrieved else {
        return Ok(());
    };
    info!(%retrieved_at, "job retrieved");

    let order = store.record_brewed(&job.order_id, retrieved_at).await?;
    let order_ready = order.is_complete() && order.ready == Some(retrieved_at);
    if order_ready {
        info!(size = order.size, "order ready");
    } else {
        debug!(brewed = order.brewed, size = order.size, "order progress");
    }

    report.retrieved.push(RetrievedJob {
        job_id: job.id,
        machine,
        order_id: order.id,
        retrieved_at,
        order_ready,
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::MachineClient;
    use crate::store::{Order, SqliteJobStore};
    use chrono::{DateTime, Duration};
    use std::time::Duration as StdDuration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client() -> MachineClient {
        MachineClient::new(StdDuration::from_secs(5)).unwrap()
    }

    /// Stores an order with `size` jobs, `brewed` of them already retrieved,
    /// and one more brewing on `machine` with the given ready time.
    async fn brewing_order(
        store: &SqliteJobStore,
        size: i64,
        brewed: i64,
        machine: &str,
        ready: DateTime<Utc>,
    ) -> (Order, BrewJob) {
        let mut order = Order::new(Utc::now(), size);
        order.brewed = brewed;
        store.save_order(&order).await.unwrap();

        let mut job = BrewJob::new(&order, "cappuccino");
        job.machine = Some(machine.to_string());
        job.machine_job_id = Some("m-7".into());
        job.started = Some(ready - Duration::seconds(30));
        job.ready = Some(ready);
        store.save_job(&job).await.unwrap();
        (order, job)
    }

    async fn machine_with_job(handle: &str, status: u16) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("/retrieve-job/{handle}")))
            .respond_with(
                ResponseTemplate::new(status).set_body_json(serde_json::json!({"product": "cappuccino"})),
            )
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn last_job_completes_order() {
        let store = SqliteJobStore::in_memory().await.unwrap();
        let server = machine_with_job("m-7", 200).await;
        let (order, job) =
            brewing_order(&store, 3, 2, &server.uri(), Utc::now() - Duration::seconds(5)).await;

        let mut report = CycleReport::start();
        run(&store, &client(), &mut report).await.unwrap();

        let job = store.get_job(&job.id).await.unwrap().unwrap();
        let order = store.get_order(&order.id).await.unwrap().unwrap();
        assert!(job.retrieved.is_some());
        assert_eq!(order.brewed, 3);
        assert_eq!(order.ready, job.retrieved);
        assert_eq!(report.retrieved.len(), 1);
        assert!(report.retrieved[0].order_ready);
    }

    #[tokio::test]
    async fn partial_order_stays_open() {
        let store = SqliteJobStore::in_memory().await.unwrap();
        let server = machine_with_job("m-7", 200).await;
        let (order, _) =
            brewing_order(&store, 3, 0, &server.uri(), Utc::now() - Duration::seconds(5)).await;

        let mut report = CycleReport::start();
        run(&store, &client(), &mut report).await.unwrap();

        let order = store.get_order(&order.id).await.unwrap().unwrap();
        assert_eq!(order.brewed, 1);
        assert!(order.ready.is_none());
        assert!(!report.retrieved[0].order_ready);
    }

    #[tokio::test]
    async fn future_job_is_not_retrieved() {
        let store = SqliteJobStore::in_memory().await.unwrap();
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .expect(0)
            .mount(&server)
            .await;
        let (order, job) =
            brewing_order(&store, 1, 0, &server.uri(), Utc::now() + Duration::minutes(5)).await;

        let mut report = CycleReport::start();
        run(&store, &client(), &mut report).await.unwrap();

        assert!(store.get_job(&job.id).await.unwrap().unwrap().retrieved.is_none());
        assert_eq!(store.get_order(&order.id).await.unwrap().unwrap().brewed, 0);
        assert_eq!(report.not_due, 1);
    }

    #[tokio::test]
    async fn job_without_ready_time_is_skipped() {
        let store = SqliteJobStore::in_memory().await.unwrap();
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .expect(0)
            .mount(&server)
            .await;
        let (order, mut job) =
            brewing_order(&store, 1, 0, &server.uri(), Utc::now() - Duration::seconds(5)).await;
        job.ready = None;
        store.save_job(&job).await.unwrap();

        let mut report = CycleReport::start();
        run(&store, &client(), &mut report).await.unwrap();

        assert!(store.get_job(&job.id).await.unwrap().unwrap().retrieved.is_none());
        assert_eq!(store.get_order(&order.id).await.unwrap().unwrap().brewed, 0);
        assert_eq!(report.without_ready, 1);
        assert_eq!(report.not_due, 0);
        assert!(report.failures.is_empty());
    }

    #[tokio::test]
    async fn rerun_does_not_count_twice() {
        let store = SqliteJobStore::in_memory().await.unwrap();
        let server = machine_with_job("m-7", 200).await;
        let (order, _) =
            brewing_order(&store, 2, 0, &server.uri(), Utc::now() - Duration::seconds(5)).await;

        let mut report = CycleReport::start();
        run(&store, &client(), &mut report).await.unwrap();
        run(&store, &client(), &mut report).await.unwrap();

        let order = store.get_order(&order.id).await.unwrap().unwrap();
        assert_eq!(order.brewed, 1);
        assert_eq!(report.retrieved.len(), 1);
    }

    #[tokio::test]
    async fn machine_error_leaves_job_for_next_cycle() {
        let store = SqliteJobStore::in_memory().await.unwrap();
        let server = machine_with_job("m-7", 500).await;
        let (order, job) =
            brewing_order(&store, 1, 0, &server.uri(), Utc::now() - Duration::seconds(5)).await;

        let mut report = CycleReport::start();
        run(&store, &client(), &mut report).await.unwrap();

        let stored = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored, job);
        assert_eq!(store.get_order(&order.id).await.unwrap().unwrap().brewed, 0);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].stage, Stage::Retrieve);
    }

    #[tokio::test]
    async fn one_bad_machine_does_not_block_others() {
        let store = SqliteJobStore::in_memory().await.unwrap();
        let broken = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&broken)
            .await;
        let healthy = machine_with_job("m-7", 200).await;

        let due = Utc::now() - Duration::seconds(5);
        brewing_order(&store, 1, 0, &broken.uri(), due).await;
        let (order, _) = brewing_order(&store, 1, 0, &healthy.uri(), due).await;

        let mut report = CycleReport::start();
        run(&store, &client(), &mut report).await.unwrap();

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.retrieved.len(), 1);
        assert!(store.get_order(&order.id).await.unwrap().unwrap().is_complete());
    }
}
