//! Wait for an account to be funded before deploying.
//!
//! The monitor polls the balance at a fixed interval until it reaches a threshold or the
//! deadline passes. Query failures are soft: they are counted and only escalate once too many
//! happen in a row, so a caller can tell "never funded" apart from "could not observe".

use std::time::Duration;

use alloy_core::primitives::{Address, U256, utils::format_ether};
use tokio::time::Instant;

use crate::chain::ChainClient;

/// Consecutive query failures tolerated before giving up on the probe.
pub const DEFAULT_MAX_SOFT_FAILURES: u32 = 3;

/// Terminal funding failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FundingError {
    #[error(
        "{address} did not reach {} ETH before the deadline after {attempts} polls (last observed: {})",
        ether(.min_balance),
        describe_balance(.last_observed)
    )]
    Timeout {
        address: Address,
        min_balance: U256,
        last_observed: Option<U256>,
        attempts: u32,
    },
    #[error("could not read the balance of {address}: {failures} consecutive failures, last: {last_error}")]
    ProbeExhausted {
        address: Address,
        failures: u32,
        last_error: String,
    },
}

fn ether(amount: &U256) -> String {
    format_ether(*amount)
}

fn describe_balance(balance: &Option<U256>) -> String {
    match balance {
        Some(balance) => format!("{} ETH", ether(balance)),
        None => "nothing".to_string(),
    }
}

/// Where a probe is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum FundingState {
    Idle,
    Polling,
    Funded,
    TimedOut,
    Errored,
}

/// A successful funding wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Funded {
    /// The first balance observed at or above the threshold.
    pub balance: U256,
    /// Balance queries issued, failed ones included.
    pub attempts: u32,
}

/// State of one funding wait. Discarded once it reaches a terminal state.
#[derive(Debug, Clone)]
pub struct FundingProbe {
    pub address: Address,
    pub min_balance: U256,
    pub poll_interval: Duration,
    pub deadline: Instant,
    pub max_soft_failures: u32,
    attempts: u32,
    consecutive_failures: u32,
    last_observed: Option<U256>,
    last_error: Option<String>,
    state: FundingState,
}

impl FundingProbe {
    pub fn new(address: Address, min_balance: U256, poll_interval: Duration, deadline: Instant) -> Self {
        Self {
            address,
            min_balance,
            poll_interval,
            deadline,
            max_soft_failures: DEFAULT_MAX_SOFT_FAILURES,
            attempts: 0,
            consecutive_failures: 0,
            last_observed: None,
            last_error: None,
            state: FundingState::Idle,
        }
    }

    pub fn with_max_soft_failures(mut self, max_soft_failures: u32) -> Self {
        self.max_soft_failures = max_soft_failures;
        self
    }

    pub fn state(&self) -> FundingState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn last_observed(&self) -> Option<U256> {
        self.last_observed
    }

    /// Poll until funded, timed out or unable to observe the balance.
    ///
    /// The first query is issued immediately. Each following query starts `poll_interval` after
    /// the previous one completed. A query that would start after the deadline is not issued.
    pub async fn run<C: ChainClient>(&mut self, client: &C) -> Result<Funded, FundingError> {
        self.state = FundingState::Polling;
        tracing::info!(
            address = %self.address,
            min_balance = %format_ether(self.min_balance),
            "Waiting for funding"
        );

        loop {
            self.attempts += 1;
            match client.get_balance(self.address).await {
                Ok(balance) => {
                    self.consecutive_failures = 0;
                    self.last_observed = Some(balance);
                    tracing::debug!(
                        address = %self.address,
                        balance = %format_ether(balance),
                        attempt = self.attempts,
                        "Balance polled"
                    );

                    if balance >= self.min_balance {
                        self.state = FundingState::Funded;
                        tracing::info!(
                            address = %self.address,
                            balance = %format_ether(balance),
                            attempts = self.attempts,
                            "Account funded"
                        );
                        return Ok(Funded {
                            balance,
                            attempts: self.attempts,
                        });
                    }
                }
                Err(e) => {
                    self.consecutive_failures += 1;
                    self.last_error = Some(e.to_string());
                    tracing::warn!(
                        address = %self.address,
                        error = %e,
                        consecutive_failures = self.consecutive_failures,
                        max_soft_failures = self.max_soft_failures,
                        "Balance query failed"
                    );

                    if self.consecutive_failures > self.max_soft_failures {
                        self.state = FundingState::Errored;
                        return Err(FundingError::ProbeExhausted {
                            address: self.address,
                            failures: self.consecutive_failures,
                            last_error: self.last_error.clone().unwrap_or_default(),
                        });
                    }
                }
            }

            let next = Instant::now() + self.poll_interval;
            if next > self.deadline {
                self.state = FundingState::TimedOut;
                return Err(FundingError::Timeout {
                    address: self.address,
                    min_balance: self.min_balance,
                    last_observed: self.last_observed,
                    attempts: self.attempts,
                });
            }
            tokio::time::sleep_until(next).await;
        }
    }
}

/// Wait until `address` holds at least `min_balance`, polling every `poll_interval`.
pub async fn wait_for_funding<C: ChainClient>(
    client: &C,
    address: Address,
    min_balance: U256,
    poll_interval: Duration,
    deadline: Instant,
) -> Result<Funded, FundingError> {
    FundingProbe::new(address, min_balance, poll_interval, deadline)
        .run(client)
        .await
}
