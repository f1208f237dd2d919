//! Wire types for the machine HTTP contract.
//!
//! Machines speak camelCase JSON. Timestamps arrive as ISO-8601 strings,
//! with or without an offset; offset-less values are taken as UTC.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::MachineError;

/// Body of `POST /start-job`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartJobRequest {
    pub product: String,
}

/// Body returned by `POST /start-job`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartJobResponse {
    /// Handle the machine assigned to the job.
    pub job_id: String,
    /// When the machine promises the job to be done.
    pub job_ready: String,
}

impl StartJobResponse {
    /// Parses the promised ready time.
    pub fn ready_at(&self) -> Result<DateTime<Utc>, MachineError> {
        parse_timestamp(&self.job_ready)
    }
}

/// Accepts RFC 3339 (`2023-05-01T10:00:00Z`, `...+02:00`) as well as naive
/// ISO-8601 (`2023-05-01T10:00:00`, `2023-05-01T10:00:00.123456`).
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, MachineError> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
        .map(|naive| naive.and_utc())
        .map_err(|e| MachineError::InvalidResponse(format!("bad timestamp {raw:?}: {e}")))
}
