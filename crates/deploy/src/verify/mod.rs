//! Source verification of deployed contracts against an explorer service.
//!
//! Each contract is submitted independently. Transient service failures are retried with
//! exponential backoff; a contract that still fails is recorded as failed without affecting
//! the others.

use std::{
    future::Future,
    sync::atomic::{AtomicU32, Ordering},
    time::Duration,
};

use alloy_core::primitives::{Address, Bytes};
use backon::{ExponentialBuilder, Retryable};
use futures::{StreamExt, stream};

use crate::{
    CancelSignal, DeploymentGraph, DeploymentRecord, RecordError, RecordStore, SourceRef,
    VerificationStatus, encode_constructor_args,
};

mod etherscan;
pub use etherscan::{EtherscanClient, EtherscanConfig};

/// Retry and concurrency settings for verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifierConfig {
    /// Retries after the first attempt, for transient failures only.
    pub retries: u32,
    /// Delay before the first retry. Doubles on every following retry.
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Contracts verified at the same time.
    pub concurrency: usize,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            retries: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            concurrency: 4,
        }
    }
}

impl VerifierConfig {
    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.base_delay)
            .with_max_delay(self.max_delay)
            .with_factor(2.0)
            .with_max_times(self.retries as usize)
    }
}

/// One contract to verify.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationRequest {
    pub contract: String,
    pub address: Address,
    pub source: Option<SourceRef>,
    /// ABI-encoded constructor arguments, as appended to the creation code.
    pub constructor_args: Bytes,
}

/// Answer of the verification service to a well-formed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    Accepted,
    Rejected { reason: String },
}

/// Failures talking to the verification service.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    #[error("verification service unavailable: {0}")]
    Unavailable(String),
    #[error("verification service rate limited: {0}")]
    RateLimited(String),
    #[error("invalid verification request: {0}")]
    Invalid(String),
}

impl ServiceError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::RateLimited(_))
    }
}

/// An external service checking deployed bytecode against its source.
pub trait VerificationService {
    fn submit_verification(
        &self,
        request: &VerificationRequest,
    ) -> impl Future<Output = Result<Submission, ServiceError>> + Send;
}

/// A contract the service accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationReceipt {
    pub contract: String,
    pub address: Address,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerificationError {
    #[error("verification of `{contract}` rejected: {reason}")]
    Rejected { contract: String, reason: String },
    #[error("verification of `{contract}` failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        contract: String,
        attempts: u32,
        /// Delays slept between attempts, in order.
        backoff: Vec<Duration>,
        last_error: ServiceError,
    },
    #[error("verification of `{contract}` cannot be submitted: {source}")]
    Invalid {
        contract: String,
        #[source]
        source: ServiceError,
    },
}

/// Outcome of verifying every contract of a record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerificationSummary {
    pub verified: Vec<String>,
    /// Contract name and failure message.
    pub failed: Vec<(String, String)>,
    /// Contracts not attempted, because they were already verified or the run was cancelled.
    pub skipped: Vec<String>,
}

impl VerificationSummary {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Drives a [`VerificationService`] with retries.
#[derive(Debug, Clone)]
pub struct Verifier<S> {
    service: S,
    config: VerifierConfig,
}

impl<S: VerificationService> Verifier<S> {
    pub fn new(service: S, config: VerifierConfig) -> Self {
        Self { service, config }
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    /// Submit one contract, retrying transient failures with exponential backoff.
    pub async fn verify(
        &self,
        request: &VerificationRequest,
    ) -> Result<VerificationReceipt, VerificationError> {
        let attempts = AtomicU32::new(0);
        let mut backoff = Vec::new();

        let service = &self.service;
        let counter = &attempts;
        let result = (move || {
            counter.fetch_add(1, Ordering::Relaxed);
            service.submit_verification(request)
        })
        .retry(self.config.backoff())
        .when(ServiceError::is_transient)
        .notify(|err: &ServiceError, delay: Duration| {
            backoff.push(delay);
            tracing::warn!(
                contract = %request.contract,
                error = %err,
                delay_ms = delay.as_millis() as u64,
                "Verification attempt failed, retrying"
            );
        })
        .await;

        let attempts = attempts.load(Ordering::Relaxed);
        match result {
            Ok(Submission::Accepted) => {
                tracing::info!(
                    contract = %request.contract,
                    address = %request.address,
                    attempts,
                    "Contract verified"
                );
                Ok(VerificationReceipt {
                    contract: request.contract.clone(),
                    address: request.address,
                    attempts,
                })
            }
            Ok(Submission::Rejected { reason }) => Err(VerificationError::Rejected {
                contract: request.contract.clone(),
                reason,
            }),
            Err(last_error) if last_error.is_transient() => {
                Err(VerificationError::RetriesExhausted {
                    contract: request.contract.clone(),
                    attempts,
                    backoff,
                    last_error,
                })
            }
            Err(source) => Err(VerificationError::Invalid {
                contract: request.contract.clone(),
                source,
            }),
        }
    }

    /// Verify the recorded contracts of `graph`, concurrently.
    ///
    /// Contracts already verified are skipped unless `all` is set. Each outcome is written to
    /// the record and saved as soon as it is known.
    pub async fn verify_record<R: RecordStore>(
        &self,
        graph: &DeploymentGraph,
        record: &mut DeploymentRecord,
        store: &R,
        all: bool,
        cancel: &CancelSignal,
    ) -> Result<VerificationSummary, RecordError> {
        let mut summary = VerificationSummary::default();

        let mut requests = Vec::new();
        for node in &graph.contracts {
            let Some(entry) = record.entry(&node.name) else {
                continue;
            };
            if !all && entry.verification == VerificationStatus::Verified {
                tracing::debug!(contract = %node.name, "Already verified, skipping");
                summary.skipped.push(node.name.clone());
                continue;
            }
            requests.push(VerificationRequest {
                contract: node.name.clone(),
                address: entry.address,
                source: node.source.clone(),
                constructor_args: encode_constructor_args(&entry.constructor_args),
            });
        }

        tracing::info!(
            contracts = requests.len(),
            concurrency = self.config.concurrency,
            "Verifying contracts"
        );

        let mut outcomes = stream::iter(requests)
            .map(|request| async move {
                if cancel.is_cancelled() {
                    return (request.contract, None);
                }
                let outcome = self.verify(&request).await;
                (request.contract, Some(outcome))
            })
            .buffer_unordered(self.config.concurrency.max(1));

        while let Some((contract, outcome)) = outcomes.next().await {
            match outcome {
                None => {
                    tracing::info!(contract = %contract, "Verification cancelled");
                    summary.skipped.push(contract);
                    continue;
                }
                Some(Ok(_)) => {
                    record.set_verification(&contract, VerificationStatus::Verified, None);
                    summary.verified.push(contract);
                }
                Some(Err(e)) => {
                    tracing::error!(contract = %contract, error = %e, "Verification failed");
                    record.set_verification(
                        &contract,
                        VerificationStatus::Failed,
                        Some(e.to_string()),
                    );
                    summary.failed.push((contract, e.to_string()));
                }
            }
            store.save(record)?;
        }

        Ok(summary)
    }
}
