pub mod client;
pub mod error;
pub mod types;

pub use client::MachineClient;
pub use error::MachineError;
pub use types::StartJobResponse;

/// The three calls a coffee machine answers. Implemented over HTTP by
/// [`MachineClient`]; tests substitute their own.
#[allow(async_fn_in_trait)]
pub trait MachineApi {
    /// `GET /status`. `Ok` means the machine will take one job.
    async fn probe(&self, base: &str) -> Result<(), MachineError>;

    /// `POST /start-job` with the product to brew.
    async fn start_job(&self, base: &str, product: &str) -> Result<StartJobResponse, MachineError>;

    /// `GET /retrieve-job/{job_id}`. The body is opaque to the dispatcher.
    async fn retrieve_job(&self, base: &str, job_id: &str)
    -> Result<serde_json::Value, MachineError>;
}
