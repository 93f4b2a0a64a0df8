//! Deploys a [`DeploymentGraph`] in dependency order, then applies its ownership edges.
//!
//! Every confirmed step is persisted before the next one starts. A run that fails or is
//! cancelled leaves a record that a later run resumes from: recorded contracts are never
//! deployed again and applied transfers are never sent again.

use alloy_core::primitives::{Address, B256};

use crate::{
    ArgValue, CancelSignal, ContractArtifacts, ContractNode, DeploymentGraph, DeploymentRecord,
    GraphError, OwnershipEdge, RecordEntry, RecordError, RecordStore,
    chain::{
        ChainClient, ChainError, ConfirmationPolicy, decode_owner, owner_calldata,
        transfer_ownership_calldata,
    },
    encode_constructor_args,
};

/// Errors that stop a deployment run.
#[derive(Debug, thiserror::Error)]
pub enum OrchestrationError {
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error("no bytecode available for contract `{node}`")]
    MissingArtifact { node: String },
    #[error("deployment record is inconsistent for `{node}`: {detail}")]
    RecordInconsistency { node: String, detail: String },
    #[error("transaction for `{node}` failed: {cause}")]
    Deployment {
        node: String,
        #[source]
        cause: ChainError,
    },
    #[error("transaction {tx_hash} for `{node}` was not confirmed after {attempts} attempts")]
    ConfirmationTimeout {
        node: String,
        tx_hash: B256,
        attempts: u32,
    },
    #[error("failed to persist deployment record: {0}")]
    Persistence(#[from] RecordError),
    #[error("run cancelled before `{pending}`")]
    Cancelled { pending: String },
}

impl OrchestrationError {
    fn chain(node: &str, cause: ChainError) -> Self {
        match cause {
            ChainError::ConfirmationTimeout { tx_hash, attempts } => Self::ConfirmationTimeout {
                node: node.to_string(),
                tx_hash,
                attempts,
            },
            cause => Self::Deployment {
                node: node.to_string(),
                cause,
            },
        }
    }

    fn inconsistent(node: &str, detail: impl Into<String>) -> Self {
        Self::RecordInconsistency {
            node: node.to_string(),
            detail: detail.into(),
        }
    }
}

/// What a successful run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    /// The complete record, as persisted.
    pub record: DeploymentRecord,
    /// Contracts deployed by this run, in deployment order.
    pub deployed: Vec<String>,
    /// Contracts found in the existing record.
    pub skipped: Vec<String>,
    pub transfers_applied: Vec<OwnershipEdge>,
    pub transfers_skipped: Vec<OwnershipEdge>,
}

/// Sequential deployment driver for a single signing identity.
#[derive(Debug)]
pub struct Orchestrator<C, S> {
    client: C,
    store: S,
    artifacts: ContractArtifacts,
    policy: ConfirmationPolicy,
    cancel: CancelSignal,
}

impl<C: ChainClient, S: RecordStore> Orchestrator<C, S> {
    pub fn new(client: C, store: S, artifacts: ContractArtifacts) -> Self {
        Self {
            client,
            store,
            artifacts,
            policy: ConfirmationPolicy::default(),
            cancel: CancelSignal::never(),
        }
    }

    pub fn with_policy(mut self, policy: ConfirmationPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Deploy every node missing from `existing`, then apply every edge not applied yet.
    ///
    /// Graph errors, artifact errors and record inconsistencies are reported before any
    /// transaction is sent.
    pub async fn run(
        &self,
        graph: &DeploymentGraph,
        existing: Option<DeploymentRecord>,
    ) -> Result<RunReport, OrchestrationError> {
        let order = graph.topological_order()?;
        let fingerprint = graph.fingerprint();

        let mut record = existing.unwrap_or_default();
        if let Some(previous) = record.graph_hash.as_deref().filter(|h| *h != fingerprint) {
            tracing::warn!(
                previous = %previous,
                current = %fingerprint,
                "Deployment graph changed since the record was written"
            );
        }

        check_resume(graph, &order, &record)?;
        for node in order.iter().filter(|node| !record.is_deployed(&node.name)) {
            if self.artifacts.get(&node.name).is_none() {
                return Err(OrchestrationError::MissingArtifact {
                    node: node.name.clone(),
                });
            }
        }

        record.graph_hash = Some(fingerprint);
        let mut report = RunReport::default();

        for node in &order {
            if record.is_deployed(&node.name) {
                tracing::info!(node = %node.name, "Already deployed, skipping");
                report.skipped.push(node.name.clone());
                continue;
            }
            if self.cancel.is_cancelled() {
                return Err(OrchestrationError::Cancelled {
                    pending: node.name.clone(),
                });
            }

            let entry = self.deploy_node(node, &record).await?;
            record.record_deployment(node.name.clone(), entry);
            self.store.save(&record)?;
            report.deployed.push(node.name.clone());
        }

        for edge in &graph.ownership {
            if let Some(applied) = record.transfer(edge) {
                tracing::info!(edge = %edge, tx_hash = ?applied.tx_hash, "Ownership already transferred, skipping");
                report.transfers_skipped.push(edge.clone());
                continue;
            }
            if self.cancel.is_cancelled() {
                return Err(OrchestrationError::Cancelled {
                    pending: edge.to_string(),
                });
            }

            let tx_hash = self.transfer_ownership(edge, &record).await?;
            record.record_transfer(edge, tx_hash);
            self.store.save(&record)?;
            report.transfers_applied.push(edge.clone());
        }

        tracing::info!(
            deployed = report.deployed.len(),
            skipped = report.skipped.len(),
            transfers = report.transfers_applied.len(),
            "Deployment complete"
        );

        report.record = record;
        Ok(report)
    }

    async fn deploy_node(
        &self,
        node: &ContractNode,
        record: &DeploymentRecord,
    ) -> Result<RecordEntry, OrchestrationError> {
        let name = node.name.as_str();
        let args = resolve_args(node, record)?;
        let bytecode = self
            .artifacts
            .get(name)
            .ok_or_else(|| OrchestrationError::MissingArtifact {
                node: name.to_string(),
            })?;

        tracing::info!(node = %name, args = args.len(), "Deploying contract");
        let pending = self
            .client
            .deploy_contract(bytecode, &encode_constructor_args(&args))
            .await
            .map_err(|e| OrchestrationError::chain(name, e))?;

        let receipt = self
            .client
            .confirm_transaction(pending.tx_hash, &self.policy)
            .await
            .map_err(|e| OrchestrationError::chain(name, e))?;

        let address = match receipt.contract_address {
            Some(actual) if actual != pending.address => {
                return Err(OrchestrationError::chain(
                    name,
                    ChainError::UnexpectedAddress {
                        tx_hash: pending.tx_hash,
                        expected: pending.address,
                        actual,
                    },
                ));
            }
            Some(actual) => actual,
            None => {
                tracing::warn!(node = %name, tx_hash = %pending.tx_hash, "Receipt has no contract address");
                pending.address
            }
        };

        tracing::info!(
            node = %name,
            address = %address,
            tx_hash = %pending.tx_hash,
            block = receipt.block_number,
            "Contract deployed"
        );
        Ok(RecordEntry::new(address, pending.tx_hash, args))
    }

    /// Apply one edge. Returns `None` when the contract already belongs to the new owner, which
    /// happens when a previous run stopped between confirming the transfer and recording it.
    async fn transfer_ownership(
        &self,
        edge: &OwnershipEdge,
        record: &DeploymentRecord,
    ) -> Result<Option<B256>, OrchestrationError> {
        let label = edge.to_string();
        let contract = recorded_address(record, &edge.contract)?;
        let new_owner = recorded_address(record, &edge.new_owner)?;

        let owner = self.owner_of(contract, &label).await?;
        if owner == new_owner {
            tracing::info!(edge = %edge, contract = %contract, "Ownership already held by the new owner on chain");
            return Ok(None);
        }

        tracing::info!(edge = %edge, contract = %contract, new_owner = %new_owner, "Transferring ownership");
        let tx_hash = self
            .client
            .send_transaction(contract, transfer_ownership_calldata(new_owner))
            .await
            .map_err(|e| OrchestrationError::chain(&label, e))?;

        self.client
            .confirm_transaction(tx_hash, &self.policy)
            .await
            .map_err(|e| OrchestrationError::chain(&label, e))?;

        let owner = self.owner_of(contract, &label).await?;
        if owner != new_owner {
            return Err(OrchestrationError::chain(
                &label,
                ChainError::UnexpectedOwner {
                    contract,
                    expected: new_owner,
                    actual: owner,
                },
            ));
        }

        tracing::info!(edge = %edge, tx_hash = %tx_hash, "Ownership transferred");
        Ok(Some(tx_hash))
    }

    async fn owner_of(&self, contract: Address, label: &str) -> Result<Address, OrchestrationError> {
        let data = self
            .client
            .call(contract, owner_calldata())
            .await
            .map_err(|e| OrchestrationError::chain(label, e))?;
        decode_owner(&data).map_err(|e| OrchestrationError::chain(label, e))
    }
}

fn recorded_address(record: &DeploymentRecord, name: &str) -> Result<Address, OrchestrationError> {
    record
        .address_of(name)
        .ok_or_else(|| OrchestrationError::inconsistent(name, "contract is not deployed"))
}

fn resolve_args(
    node: &ContractNode,
    record: &DeploymentRecord,
) -> Result<Vec<ArgValue>, OrchestrationError> {
    node.args
        .iter()
        .map(|arg| {
            arg.resolve(|name| record.address_of(name)).ok_or_else(|| {
                OrchestrationError::inconsistent(
                    &node.name,
                    format!(
                        "dependency `{}` has no recorded address",
                        arg.dependency().unwrap_or_default()
                    ),
                )
            })
        })
        .collect()
}

/// Check that every recorded contract still matches what the graph would deploy today.
///
/// A recorded contract must have all its dependencies recorded, and its recorded constructor
/// arguments must equal the arguments resolved from the record.
fn check_resume(
    graph: &DeploymentGraph,
    order: &[&ContractNode],
    record: &DeploymentRecord,
) -> Result<(), OrchestrationError> {
    for name in record.contracts.keys() {
        if graph.node(name).is_none() {
            tracing::warn!(node = %name, "Recorded contract is not part of the graph");
        }
    }

    for node in order {
        let Some(entry) = record.entry(&node.name) else {
            continue;
        };

        if let Some(dep) = node.dependencies().find(|dep| !record.is_deployed(dep)) {
            return Err(OrchestrationError::inconsistent(
                &node.name,
                format!("recorded as deployed but its dependency `{dep}` is not"),
            ));
        }

        let expected = resolve_args(node, record)?;
        if expected.len() != entry.constructor_args.len() {
            return Err(OrchestrationError::inconsistent(
                &node.name,
                format!(
                    "recorded with {} constructor arguments but the graph declares {}",
                    entry.constructor_args.len(),
                    expected.len()
                ),
            ));
        }

        let mismatch = expected
            .iter()
            .zip(&entry.constructor_args)
            .enumerate()
            .find(|(_, (expected, recorded))| expected != recorded);
        if let Some((index, (expected, recorded))) = mismatch {
            return Err(OrchestrationError::inconsistent(
                &node.name,
                format!("constructor argument {index} was recorded as {recorded} but now resolves to {expected}"),
            ));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ConstructorArg;
    use alloy_core::primitives::U256;

    fn graph() -> DeploymentGraph {
        DeploymentGraph::new()
            .add_node(ContractNode::new("A", "A.json"))
            .add_node(
                ContractNode::new("B", "B.json")
                    .arg(ConstructorArg::node("A"))
                    .arg(ConstructorArg::Uint(U256::from(7))),
            )
    }

    fn check(graph: &DeploymentGraph, record: &DeploymentRecord) -> Result<(), OrchestrationError> {
        let order = graph.topological_order().unwrap();
        check_resume(graph, &order, record)
    }

    #[test]
    fn test_consistent_record_passes() {
        let mut record = DeploymentRecord::new();
        record.record_deployment("A", RecordEntry::new(Address::repeat_byte(1), B256::ZERO, vec![]));
        record.record_deployment(
            "B",
            RecordEntry::new(
                Address::repeat_byte(2),
                B256::ZERO,
                vec![
                    ArgValue::Address(Address::repeat_byte(1)),
                    ArgValue::Uint(U256::from(7)),
                ],
            ),
        );
        check(&graph(), &record).unwrap();
    }

    #[test]
    fn test_dependency_missing_from_record() {
        let mut record = DeploymentRecord::new();
        record.record_deployment(
            "B",
            RecordEntry::new(Address::repeat_byte(2), B256::ZERO, vec![]),
        );

        let err = check(&graph(), &record).unwrap_err();
        assert!(matches!(
            err,
            OrchestrationError::RecordInconsistency { ref node, .. } if node == "B"
        ));
    }

    #[test]
    fn test_changed_literal_is_inconsistent() {
        let mut record = DeploymentRecord::new();
        record.record_deployment("A", RecordEntry::new(Address::repeat_byte(1), B256::ZERO, vec![]));
        record.record_deployment(
            "B",
            RecordEntry::new(
                Address::repeat_byte(2),
                B256::ZERO,
                vec![
                    ArgValue::Address(Address::repeat_byte(1)),
                    ArgValue::Uint(U256::from(8)),
                ],
            ),
        );

        let err = check(&graph(), &record).unwrap_err();
        assert_eq!(
            err.to_string(),
            "deployment record is inconsistent for `B`: constructor argument 1 was recorded as 8 but now resolves to 7"
        );
    }

    #[test]
    fn test_chain_errors_name_the_node() {
        let timeout = OrchestrationError::chain(
            "Hub",
            ChainError::ConfirmationTimeout {
                tx_hash: B256::ZERO,
                attempts: 3,
            },
        );
        assert!(matches!(timeout, OrchestrationError::ConfirmationTimeout { ref node, attempts: 3, .. } if node == "Hub"));

        let reverted = OrchestrationError::chain("Hub", ChainError::Reverted { tx_hash: B256::ZERO });
        assert!(reverted.to_string().starts_with("transaction for `Hub` failed: transaction 0x"));
    }
}
