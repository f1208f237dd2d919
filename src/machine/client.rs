use std::time::Duration;

use reqwest::{Client, StatusCode, Url};

use super::MachineApi;
use super::error::MachineError;
use super::types::{StartJobRequest, StartJobResponse};

/// HTTP client for the machine contract. One instance serves every machine;
/// the base address is passed per call.
#[derive(Debug, Clone)]
pub struct MachineClient {
    client: Client,
}

impl MachineClient {
    pub fn new(timeout: Duration) -> Result<Self, MachineError> {
        let client = Client::builder()
            .connect_timeout(timeout.min(Duration::from_secs(10)))
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }
}

fn endpoint(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path)
}

/// `{base}/retrieve-job/{job_id}` with the handle as one escaped segment.
fn retrieve_endpoint(base: &str, job_id: &str) -> Result<Url, MachineError> {
    let invalid = |reason: &str| MachineError::InvalidAddress {
        address: base.to_string(),
        reason: reason.to_string(),
    };
    let mut url =
        Url::parse(&endpoint(base, "retrieve-job")).map_err(|e| invalid(&e.to_string()))?;
    url.path_segments_mut()
        .map_err(|()| invalid("cannot be a base URL"))?
        .push(job_id);
    Ok(url)
}

async fn error_for_status(response: reqwest::Response) -> MachineError {
    let status = response.status().as_u16();
    let message = response
        .text()
        .await
        .unwrap_or_else(|_| "unknown error".to_string());
    MachineError::ApiError { status, message }
}

impl MachineApi for MachineClient {
    async fn probe(&self, base: &str) -> Result<(), MachineError> {
        let response = self.client.get(endpoint(base, "status")).send().await?;
        if response.status() != StatusCode::OK {
            return Err(MachineError::Unavailable {
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }

    async fn start_job(&self, base: &str, product: &str) -> Result<StartJobResponse, MachineError> {
        let response = self
            .client
            .post(endpoint(base, "start-job"))
            .json(&StartJobRequest {
                product: product.to_string(),
            })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_for_status(response).await);
        }

        let body = response.bytes().await?;
        serde_json::from_slice(&body)
            .map_err(|e| MachineError::InvalidResponse(format!("start-job: {e}")))
    }

    async fn retrieve_job(
        &self,
        base: &str,
        job_id: &str,
    ) -> Result<serde_json::Value, MachineError> {
        let response = self
            .client
            .get(retrieve_endpoint(base, job_id)?)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_for_status(response).await);
        }

        let body = response.bytes().await?;
        serde_json::from_slice(&body)
            .map_err(|e| MachineError::InvalidResponse(format!("retrieve-job: {e}")))
    }
}
