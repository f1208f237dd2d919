//! Hands pending jobs to machines that report themselves available.
//!
//! Each machine gets at most one job per pass. A job is claimed with a
//! conditional write before the machine is asked to brew it, so two
//! overlapping cycles can never send the same job twice.

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use super::report::{CycleReport, DispatchedJob, JobFailure, SkippedMachine, Stage};
use crate::error::Result;
use crate::machine::{MachineApi, MachineError};
use crate::store::{BrewJob, JobFilter, JobStore};

// Lost claims to tolerate before leaving a machine idle for this pass.
const MAX_CLAIM_ATTEMPTS: usize = 3;

pub async fn run<S: JobStore, M: MachineApi>(
    store: &S,
    machines: &M,
    endpoints: &[String],
    report: &mut CycleReport,
) -> Result<()> {
    for endpoint in endpoints {
        debug!(machine = %endpoint, "getting machine status");
        if let Err(err) = machines.probe(endpoint).await {
            debug!(machine = %endpoint, error = %err, "machine not available");
            report.skipped_machines.push(SkippedMachine {
                machine: endpoint.clone(),
                reason: err.to_string(),
            });
            continue;
        }

        debug!(machine = %endpoint, "looking for a job to submit");
        let Some(job) = claim_next(store, endpoint).await? else {
            debug!(machine = %endpoint, "no pending jobs");
            continue;
        };
        debug!(job_id = %job.id, state = %job.state(), "claimed");
        submit(store, machines, endpoint, job, report).await?;
    }
    Ok(())
}

/// Claims one pending job for `machine`, moving on to another candidate if
/// a concurrent cycle wins the race.
async fn claim_next<S: JobStore>(store: &S, machine: &str) -> Result<Option<BrewJob>> {
    for _ in 0..MAX_CLAIM_ATTEMPTS {
        let Some(candidate) = store
            .find_jobs(JobFilter::Pending, Some(1))
            .await?
            .into_iter()
            .next()
        else {
            return Ok(None);
        };
        if let Some(claimed) = store.claim_job(&candidate, machine, Utc::now()).await? {
            return Ok(Some(claimed));
        }
        debug!(job_id = %candidate.id, "lost claim to another cycle");
    }
    Ok(None)
}

#[instrument(skip_all, fields(job_id = %job.id, machine = %machine, product = %job.product))]
async fn submit<S: JobStore, M: MachineApi>(
    store: &S,
    machines: &M,
    machine: &str,
    job: BrewJob,
    report: &mut CycleReport,
) -> Result<()> {
    debug!("trying to start job");
    let accepted = match start(machines, machine, &job.product).await {
        Ok(accepted) => accepted,
        Err(err) => {
            warn!(error = %err, "submission failed, returning job to the queue");
            if !store.release_claim(&job).await? {
                warn!("claim was already released");
            }
            report
                .failures
                .push(JobFailure::new(&job.id, machine, Stage::Submit, &err));
            return Ok(());
        }
    };
    let (machine_job_id, ready_at) = accepted;

    let started = Utc::now();
    let Some(job) = store
        .record_submission(&job, &machine_job_id, started, ready_at)
        .await?
    else {
        let err = MachineError::InvalidResponse(format!(
            "machine accepted job as {machine_job_id} but the claim was lost"
        ));
        warn!(%machine_job_id, "machine brewing a job we no longer hold");
        report
            .failures
            .push(JobFailure::new(&job.id, machine, Stage::Record, &err));
        return Ok(());
    };

    info!(%machine_job_id, %ready_at, "job sent to machine");
    report.dispatched.push(DispatchedJob {
        job_id: job.id,
        machine: machine.to_string(),
        machine_job_id,
        product: job.product,
        ready_at,
    });
    Ok(())
}

async fn start<M: MachineApi>(
    machines: &M,
    machine: &str,
    product: &str,
) -> std::result::Result<(String, DateTime<Utc>), MachineError> {
    let response = machines.start_job(machine, product).await?;
    if response.job_id.trim().is_empty() {
        return Err(MachineError::InvalidResponse("empty jobId".into()));
    }
    let ready_at = response.ready_at()?;
    Ok((response.job_id, ready_at))
}

/// Returns claims older than `older_than` to the pending pool. Such claims
/// belong to cycles that died between claiming and recording the machine's
/// answer.
pub async fn release_stale_claims<S: JobStore>(
    store: &S,
    older_than: DateTime<Utc>,
    report: &mut CycleReport,
) -> Result<()> {
    for job in store.find_jobs(JobFilter::Claimed, None).await? {
        if job.started.is_some_and(|claimed_at| claimed_at >= older_than) {
            continue;
        }
        if store.release_claim(&job).await? {
            warn!(job_id = %job.id, machine = ?job.machine, "released stale claim");
            report.released_claims += 1;
        }
    }
    Ok(())
}
