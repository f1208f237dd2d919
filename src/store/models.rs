use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A customer's request, made of `size` brew jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Order {
    pub id: String,
    pub received: DateTime<Utc>,
    /// Set exactly once, when the last job of the order is retrieved.
    pub ready: Option<DateTime<Utc>>,
    /// Set by the customer-facing side when the order is collected.
    pub retrieved: Option<DateTime<Utc>>,
    pub size: i64,
    pub brewed: i64,
}

impl Order {
    pub fn new(received: DateTime<Utc>, size: i64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            received,
            ready: None,
            retrieved: None,
            size,
            brewed: 0,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.brewed == self.size
    }

    /// Counts one more finished job. The last one stamps `ready` with `at`.
    ///
    /// Returns `false` and leaves the order untouched if it is already
    /// complete.
    pub fn record_brewed(&mut self, at: DateTime<Utc>) -> bool {
        if self.brewed >= self.size {
            return false;
        }
        self.brewed += 1;
        if self.brewed == self.size {
            self.ready = Some(at);
        }
        true
    }
}

/// Where a job is in its lifecycle, derived from which fields are set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    /// No machine yet.
    Pending,
    /// Held by a dispatch pass, not yet accepted by the machine.
    Claimed,
    /// Accepted by a machine, not yet collected.
    Brewing,
    Retrieved,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Pending => write!(f, "PENDING"),
            JobState::Claimed => write!(f, "CLAIMED"),
            JobState::Brewing => write!(f, "BREWING"),
            JobState::Retrieved => write!(f, "RETRIEVED"),
        }
    }
}

/// One product of an order, brewed by one machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct BrewJob {
    /// Our key. Never changes.
    pub id: String,
    /// The machine's handle for the job, known once it accepted it.
    pub machine_job_id: Option<String>,
    pub order_id: String,
    pub product: String,
    pub order_received: DateTime<Utc>,
    /// Base address of the machine brewing this job. Unset means pending.
    pub machine: Option<String>,
    pub started: Option<DateTime<Utc>>,
    /// Completion time promised by the machine.
    pub ready: Option<DateTime<Utc>>,
    pub retrieved: Option<DateTime<Utc>>,
    /// Bumped by every conditional write; guards claims.
    pub version: i64,
}

impl BrewJob {
    pub fn new(order: &Order, product: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            machine_job_id: None,
            order_id: order.id.clone(),
            product: product.into(),
            order_received: order.received,
            machine: None,
            started: None,
            ready: None,
            retrieved: None,
            version: 0,
        }
    }

    pub fn state(&self) -> JobState {
        match (&self.machine, &self.machine_job_id, &self.retrieved) {
            (None, _, _) => JobState::Pending,
            (Some(_), _, Some(_)) => JobState::Retrieved,
            (Some(_), None, None) => JobState::Claimed,
            (Some(_), Some(_), None) => JobState::Brewing,
        }
    }

    /// Dispatched, not yet retrieved, and its promised time has come.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.state() == JobState::Brewing && self.ready.is_some_and(|ready| ready <= now)
    }
}
