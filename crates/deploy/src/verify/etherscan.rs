//! [`VerificationService`] for Etherscan-compatible explorer APIs.

use std::{path::PathBuf, time::Duration};

use serde::Deserialize;
use url::Url;

use super::{ServiceError, Submission, VerificationRequest, VerificationService};

/// Connection settings for an Etherscan-compatible API.
#[derive(Debug, Clone)]
pub struct EtherscanConfig {
    /// API endpoint, e.g. `https://api.etherscan.io/v2/api`.
    pub api_url: Url,
    pub api_key: String,
    pub chain_id: u64,
    /// Full solc version, e.g. `v0.8.24+commit.e11b9ed9`.
    pub compiler_version: String,
    pub status_poll_interval: Duration,
    pub status_poll_attempts: u32,
    /// Directory source references are resolved against.
    pub base_dir: PathBuf,
}

#[derive(Debug, Deserialize)]
struct EtherscanResponse {
    status: String,
    #[serde(default)]
    message: String,
    result: String,
}

/// What to do after a `verifysourcecode` response.
#[derive(Debug, PartialEq, Eq)]
enum Step {
    /// Submission queued under this GUID.
    Poll(String),
    Done(Submission),
}

fn contains(haystack: &str, needle: &str) -> bool {
    haystack.to_ascii_lowercase().contains(needle)
}

fn is_rate_limited(result: &str) -> bool {
    contains(result, "rate limit") || contains(result, "max calls per sec")
}

fn classify_submission(response: EtherscanResponse) -> Result<Step, ServiceError> {
    let result = response.result;
    if response.status == "1" {
        return Ok(Step::Poll(result));
    }
    if contains(&result, "already verified") {
        return Ok(Step::Done(Submission::Accepted));
    }
    if is_rate_limited(&result) {
        return Err(ServiceError::RateLimited(result));
    }
    // The explorer has not indexed the deployment yet.
    if contains(&result, "unable to locate contractcode") {
        return Err(ServiceError::Unavailable(result));
    }
    if contains(&result, "invalid api key") || contains(&response.message, "invalid api key") {
        return Err(ServiceError::Invalid(result));
    }
    Ok(Step::Done(Submission::Rejected { reason: result }))
}

/// `None` while the submission is still queued.
fn classify_status(response: EtherscanResponse) -> Result<Option<Submission>, ServiceError> {
    let result = response.result;
    if contains(&result, "pending in queue") {
        return Ok(None);
    }
    if response.status == "1" || contains(&result, "already verified") {
        return Ok(Some(Submission::Accepted));
    }
    if is_rate_limited(&result) {
        return Err(ServiceError::RateLimited(result));
    }
    Ok(Some(Submission::Rejected { reason: result }))
}

fn check_http_status(status: reqwest::StatusCode) -> Result<(), ServiceError> {
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        Err(ServiceError::RateLimited(status.to_string()))
    } else if status.is_server_error() {
        Err(ServiceError::Unavailable(status.to_string()))
    } else if !status.is_success() {
        Err(ServiceError::Invalid(status.to_string()))
    } else {
        Ok(())
    }
}

/// Etherscan API client submitting standard JSON input.
#[derive(Debug, Clone)]
pub struct EtherscanClient {
    client: reqwest::Client,
    config: EtherscanConfig,
}

impl EtherscanClient {
    pub fn new(config: EtherscanConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: crate::rpc::create_client()?,
            config,
        })
    }

    async fn read(&self, response: reqwest::Response) -> Result<EtherscanResponse, ServiceError> {
        check_http_status(response.status())?;
        response
            .json()
            .await
            .map_err(|e| ServiceError::Unavailable(format!("unreadable explorer response: {e}")))
    }

    async fn submit(&self, request: &VerificationRequest) -> Result<Step, ServiceError> {
        let source = request.source.as_ref().ok_or_else(|| {
            ServiceError::Invalid(format!("no source reference for `{}`", request.contract))
        })?;
        let path = self.config.base_dir.join(&source.standard_json);
        let input = tokio::fs::read_to_string(&path).await.map_err(|e| {
            ServiceError::Invalid(format!("failed to read {}: {e}", path.display()))
        })?;

        let address = request.address.to_string();
        let constructor_args = hex::encode(&request.constructor_args);
        let form = [
            ("apikey", self.config.api_key.as_str()),
            ("module", "contract"),
            ("action", "verifysourcecode"),
            ("contractaddress", address.as_str()),
            ("sourceCode", input.as_str()),
            ("codeformat", "solidity-standard-json-input"),
            ("contractname", source.contract.as_str()),
            ("compilerversion", self.config.compiler_version.as_str()),
            // Misspelled by the API.
            ("constructorArguements", constructor_args.as_str()),
        ];

        let response = self
            .client
            .post(self.config.api_url.clone())
            .query(&[("chainid", self.config.chain_id)])
            .form(&form)
            .send()
            .await
            .map_err(|e| ServiceError::Unavailable(e.to_string()))?;

        classify_submission(self.read(response).await?)
    }

    async fn check_status(&self, guid: &str) -> Result<Option<Submission>, ServiceError> {
        let chain_id = self.config.chain_id.to_string();
        let response = self
            .client
            .get(self.config.api_url.clone())
            .query(&[
                ("chainid", chain_id.as_str()),
                ("module", "contract"),
                ("action", "checkverifystatus"),
                ("guid", guid),
                ("apikey", self.config.api_key.as_str()),
            ])
            .send()
            .await
            .map_err(|e| ServiceError::Unavailable(e.to_string()))?;

        classify_status(self.read(response).await?)
    }
}

impl VerificationService for EtherscanClient {
    async fn submit_verification(
        &self,
        request: &VerificationRequest,
    ) -> Result<Submission, ServiceError> {
        let guid = match self.submit(request).await? {
            Step::Done(submission) => return Ok(submission),
            Step::Poll(guid) => guid,
        };
        tracing::debug!(contract = %request.contract, guid = %guid, "Verification queued");

        for _ in 0..self.config.status_poll_attempts {
            tokio::time::sleep(self.config.status_poll_interval).await;
            if let Some(submission) = self.check_status(&guid).await? {
                return Ok(submission);
            }
        }

        Err(ServiceError::Unavailable(format!(
            "verification {guid} still pending after {} checks",
            self.config.status_poll_attempts
        )))
    }
}
