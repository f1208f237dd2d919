use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::FailureKind;
use crate::machine::MachineError;
use crate::resolver::ResolveFailure;

/// Which machine call a failure happened on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Retrieve,
    Submit,
    Record,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetrievedJob {
    pub job_id: String,
    pub machine: String,
    pub order_id: String,
    pub retrieved_at: DateTime<Utc>,
    /// This brew completed its order.
    pub order_ready: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchedJob {
    pub job_id: String,
    pub machine: String,
    pub machine_job_id: String,
    pub product: String,
    pub ready_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedMachine {
    pub machine: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobFailure {
    pub job_id: String,
    pub machine: String,
    pub stage: Stage,
    pub kind: FailureKind,
    pub message: String,
}

impl JobFailure {
    pub fn new(job_id: &str, machine: &str, stage: Stage, err: &MachineError) -> Self {
        Self {
            job_id: job_id.to_string(),
            machine: machine.to_string(),
            stage,
            kind: FailureKind::from(err),
            message: err.to_string(),
        }
    }
}

/// Everything one cycle did, for logs and `--json` output.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: i64,
    pub endpoints: Vec<String>,
    pub resolve_failures: Vec<ResolveFailure>,
    pub retrieved: Vec<RetrievedJob>,
    /// Outstanding jobs whose ready time has not come yet.
    pub not_due: usize,
    /// Outstanding jobs with no ready time recorded.
    pub without_ready: usize,
    pub dispatched: Vec<DispatchedJob>,
    pub skipped_machines: Vec<SkippedMachine>,
    /// Claims left behind by an earlier, interrupted cycle.
    pub released_claims: usize,
    pub failures: Vec<JobFailure>,
}

impl CycleReport {
    pub fn start() -> Self {
        Self {
            started_at: Utc::now(),
            finished_at: None,
            duration_ms: 0,
            endpoints: Vec::new(),
            resolve_failures: Vec::new(),
            retrieved: Vec::new(),
            not_due: 0,
            without_ready: 0,
            dispatched: Vec::new(),
            skipped_machines: Vec::new(),
            released_claims: 0,
            failures: Vec::new(),
        }
    }

    pub fn finish(mut self) -> Self {
        let now = Utc::now();
        self.duration_ms = (now - self.started_at).num_milliseconds();
        self.finished_at = Some(now);
        self
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.resolve_failures.is_empty()
    }
}
