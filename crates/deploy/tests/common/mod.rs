//! In-memory chain and verification service shared by the integration tests.

#![allow(dead_code)]

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Mutex,
};

use alloy_core::{
    primitives::{Address, B256, Bytes, U256},
    sol_types::{SolCall, SolValue},
};
use keystone_deploy::{
    ChainClient, ChainError, ConfirmationPolicy, PendingDeployment, Receipt, ServiceError,
    Submission, VerificationRequest, VerificationService, chain::ownable,
};

/// Initialize tracing for tests (idempotent).
pub fn init_test_tracing() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init()
        .ok();
}

/// A transaction observed by the mock chain, in submission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainEvent {
    Deploy {
        address: Address,
        bytecode: Bytes,
        args: Bytes,
    },
    Transfer {
        contract: Address,
        new_owner: Address,
    },
}

#[derive(Debug, Default)]
struct ChainState {
    nonce: u64,
    tx_count: u8,
    events: Vec<ChainEvent>,
    created: HashMap<B256, Address>,
    reverted: HashSet<B256>,
    stalled: HashSet<B256>,
    owners: HashMap<Address, Address>,
    deploy_calls: usize,
    fail_deploys: HashSet<usize>,
    stall_deploys: HashSet<usize>,
    balances: VecDeque<Result<U256, ChainError>>,
    balance_calls: u32,
    final_balance: U256,
}

/// Single-account chain executing every transaction instantly.
///
/// Deployed contracts are owned by the sender, and `transferOwnership` only succeeds when sent
/// by the current owner.
#[derive(Debug)]
pub struct MockChain {
    sender: Address,
    state: Mutex<ChainState>,
}

impl MockChain {
    pub fn new() -> Self {
        Self {
            sender: Address::repeat_byte(0xde),
            state: Mutex::new(ChainState::default()),
        }
    }

    pub fn sender(&self) -> Address {
        self.sender
    }

    /// Revert the deployment submitted as the `index`-th `deploy_contract` call (0-based).
    pub fn fail_deploy(self, index: usize) -> Self {
        self.state.lock().unwrap().fail_deploys.insert(index);
        self
    }

    /// Never mine the deployment submitted as the `index`-th `deploy_contract` call, so its
    /// confirmation times out.
    pub fn stall_deploy(self, index: usize) -> Self {
        self.state.lock().unwrap().stall_deploys.insert(index);
        self
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock().unwrap();
        state.fail_deploys.clear();
        state.stall_deploys.clear();
    }

    /// Balances returned by successive `get_balance` calls. Once exhausted the last balance
    /// returned keeps being returned.
    pub fn with_balances(self, balances: impl IntoIterator<Item = Result<U256, ChainError>>) -> Self {
        self.state.lock().unwrap().balances = balances.into_iter().collect();
        self
    }

    pub fn events(&self) -> Vec<ChainEvent> {
        self.state.lock().unwrap().events.clone()
    }

    pub fn deployments(&self) -> Vec<Address> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                ChainEvent::Deploy { address, .. } => Some(address),
                ChainEvent::Transfer { .. } => None,
            })
            .collect()
    }

    pub fn transfers(&self) -> Vec<(Address, Address)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                ChainEvent::Transfer { contract, new_owner } => Some((contract, new_owner)),
                ChainEvent::Deploy { .. } => None,
            })
            .collect()
    }

    pub fn deploy_calls(&self) -> usize {
        self.state.lock().unwrap().deploy_calls
    }

    pub fn balance_calls(&self) -> u32 {
        self.state.lock().unwrap().balance_calls
    }

    pub fn owner_of(&self, contract: Address) -> Option<Address> {
        self.state.lock().unwrap().owners.get(&contract).copied()
    }

    /// Address the `nonce`-th creation of the sender lands at.
    pub fn address_at(&self, nonce: u64) -> Address {
        self.sender.create(nonce)
    }
}

impl ChainState {
    fn next_tx_hash(&mut self) -> B256 {
        self.tx_count += 1;
        B256::with_last_byte(self.tx_count)
    }
}

impl ChainClient for MockChain {
    async fn deploy_contract(
        &self,
        bytecode: &Bytes,
        constructor_args: &Bytes,
    ) -> Result<PendingDeployment, ChainError> {
        let mut state = self.state.lock().unwrap();
        let call = state.deploy_calls;
        state.deploy_calls += 1;

        let address = self.sender.create(state.nonce);
        state.nonce += 1;
        let tx_hash = state.next_tx_hash();

        if state.fail_deploys.contains(&call) {
            state.reverted.insert(tx_hash);
        } else if state.stall_deploys.contains(&call) {
            state.stalled.insert(tx_hash);
        } else {
            state.created.insert(tx_hash, address);
            state.owners.insert(address, self.sender);
            state.events.push(ChainEvent::Deploy {
                address,
                bytecode: bytecode.clone(),
                args: constructor_args.clone(),
            });
        }

        Ok(PendingDeployment { address, tx_hash })
    }

    async fn confirm_transaction(
        &self,
        tx_hash: B256,
        policy: &ConfirmationPolicy,
    ) -> Result<Receipt, ChainError> {
        let state = self.state.lock().unwrap();
        if state.reverted.contains(&tx_hash) {
            return Err(ChainError::Reverted { tx_hash });
        }
        if state.stalled.contains(&tx_hash) {
            return Err(ChainError::ConfirmationTimeout {
                tx_hash,
                attempts: policy.max_attempts,
            });
        }
        Ok(Receipt {
            tx_hash,
            block_number: u64::from(state.tx_count),
            contract_address: state.created.get(&tx_hash).copied(),
            confirmations: policy.confirmations,
        })
    }

    async fn get_balance(&self, _address: Address) -> Result<U256, ChainError> {
        let mut state = self.state.lock().unwrap();
        state.balance_calls += 1;
        match state.balances.pop_front() {
            Some(Ok(balance)) => {
                state.final_balance = balance;
                Ok(balance)
            }
            Some(Err(e)) => Err(e),
            None => Ok(state.final_balance),
        }
    }

    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes, ChainError> {
        let state = self.state.lock().unwrap();
        if data[..] != ownable::ownerCall::SELECTOR[..] {
            return Err(ChainError::Rpc(format!("unsupported call {data}")));
        }
        let owner = state
            .owners
            .get(&to)
            .copied()
            .ok_or_else(|| ChainError::Rpc(format!("no contract at {to}")))?;
        Ok(owner.abi_encode().into())
    }

    async fn send_transaction(&self, to: Address, data: Bytes) -> Result<B256, ChainError> {
        let mut state = self.state.lock().unwrap();
        let tx_hash = state.next_tx_hash();

        let call = ownable::transferOwnershipCall::abi_decode(&data, true)
            .map_err(|e| ChainError::Rpc(format!("unsupported transaction: {e}")))?;
        if state.owners.get(&to) != Some(&self.sender) {
            state.reverted.insert(tx_hash);
            return Ok(tx_hash);
        }

        state.owners.insert(to, call.newOwner);
        state.events.push(ChainEvent::Transfer {
            contract: to,
            new_owner: call.newOwner,
        });
        Ok(tx_hash)
    }
}

/// Verification service answering from a per-contract script. Unscripted submissions are
/// accepted.
#[derive(Debug, Default)]
pub struct MockVerifier {
    responses: Mutex<HashMap<String, VecDeque<Result<Submission, ServiceError>>>>,
    calls: Mutex<Vec<String>>,
}

impl MockVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(
        self,
        contract: &str,
        responses: impl IntoIterator<Item = Result<Submission, ServiceError>>,
    ) -> Self {
        self.responses
            .lock()
            .unwrap()
            .insert(contract.to_string(), responses.into_iter().collect());
        self
    }

    /// Always fail `contract` with the same error.
    pub fn always(self, contract: &str, error: ServiceError) -> Self {
        self.script(contract, std::iter::repeat_n(Err(error), 64))
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, contract: &str) -> usize {
        self.calls().iter().filter(|c| *c == contract).count()
    }
}

impl VerificationService for MockVerifier {
    async fn submit_verification(
        &self,
        request: &VerificationRequest,
    ) -> Result<Submission, ServiceError> {
        self.calls.lock().unwrap().push(request.contract.clone());
        self.responses
            .lock()
            .unwrap()
            .get_mut(&request.contract)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Ok(Submission::Accepted))
    }
}
