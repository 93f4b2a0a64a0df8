//! The chain client boundary: deploy, confirm, read balances, call and transact.

use std::{future::Future, time::Duration};

use alloy_core::{
    primitives::{Address, B256, Bytes, U256},
    sol_types::{SolCall, SolValue},
};

mod json_rpc;
pub use json_rpc::JsonRpcChainClient;

/// Calls understood by every ownable contract in the graph.
pub mod ownable {
    alloy_core::sol! {
        function transferOwnership(address newOwner);
        function owner() external view returns (address);
    }
}

/// Errors surfaced by a [`ChainClient`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainError {
    #[error("RPC error: {0}")]
    Rpc(String),
    #[error("transaction {tx_hash} reverted")]
    Reverted { tx_hash: B256 },
    #[error("transaction {tx_hash} not confirmed after {attempts} attempts")]
    ConfirmationTimeout { tx_hash: B256, attempts: u32 },
    #[error("transaction {tx_hash} created {actual} but {expected} was expected")]
    UnexpectedAddress {
        tx_hash: B256,
        expected: Address,
        actual: Address,
    },
    #[error("owner of {contract} is {actual} after transfer, expected {expected}")]
    UnexpectedOwner {
        contract: Address,
        expected: Address,
        actual: Address,
    },
}

/// How long to wait for a transaction, and how deep it must be before it counts as done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfirmationPolicy {
    /// Blocks, including the inclusion block, that must exist on top of the transaction.
    pub confirmations: u64,
    /// Delay between receipt polls.
    pub poll_interval: Duration,
    /// Receipt polls before giving up.
    pub max_attempts: u32,
}

impl Default for ConfirmationPolicy {
    fn default() -> Self {
        Self {
            confirmations: 1,
            poll_interval: Duration::from_secs(2),
            max_attempts: 150,
        }
    }
}

/// A submitted, not yet confirmed, contract creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingDeployment {
    /// Address the contract will live at once the transaction is mined.
    pub address: Address,
    pub tx_hash: B256,
}

/// A confirmed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Receipt {
    pub tx_hash: B256,
    pub block_number: u64,
    /// Address of the created contract, for creation transactions.
    pub contract_address: Option<Address>,
    pub confirmations: u64,
}

/// The primitives the orchestration needs from a chain, signing with a single identity.
pub trait ChainClient {
    /// Submit a contract creation with ABI-encoded constructor arguments appended.
    fn deploy_contract(
        &self,
        bytecode: &Bytes,
        constructor_args: &Bytes,
    ) -> impl Future<Output = Result<PendingDeployment, ChainError>> + Send;

    /// Wait until the transaction is confirmed according to `policy`.
    fn confirm_transaction(
        &self,
        tx_hash: B256,
        policy: &ConfirmationPolicy,
    ) -> impl Future<Output = Result<Receipt, ChainError>> + Send;

    fn get_balance(&self, address: Address)
    -> impl Future<Output = Result<U256, ChainError>> + Send;

    /// Read-only call.
    fn call(&self, to: Address, data: Bytes)
    -> impl Future<Output = Result<Bytes, ChainError>> + Send;

    /// Submit a state-changing call and return its transaction hash.
    fn send_transaction(
        &self,
        to: Address,
        data: Bytes,
    ) -> impl Future<Output = Result<B256, ChainError>> + Send;
}

/// Calldata for `transferOwnership(new_owner)`.
pub fn transfer_ownership_calldata(new_owner: Address) -> Bytes {
    ownable::transferOwnershipCall {
        newOwner: new_owner,
    }
    .abi_encode()
    .into()
}

/// Calldata for `owner()`.
pub fn owner_calldata() -> Bytes {
    ownable::ownerCall {}.abi_encode().into()
}

/// Decode the return data of `owner()`.
pub fn decode_owner(data: &[u8]) -> Result<Address, ChainError> {
    Address::abi_decode(data, true)
        .map_err(|e| ChainError::Rpc(format!("invalid owner() return data: {e}")))
}
