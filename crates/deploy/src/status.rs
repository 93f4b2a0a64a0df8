//! Deployment status derived from a graph and a record.

use std::fmt;

use alloy_core::primitives::{Address, B256};
use comfy_table::{Table, presets::UTF8_FULL};

use crate::{DeploymentGraph, DeploymentRecord, OwnershipEdge, VerificationStatus};

/// State of one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub name: String,
    /// Present once deployed.
    pub address: Option<Address>,
    pub tx_hash: Option<B256>,
    pub verification: Option<VerificationStatus>,
}

impl NodeStatus {
    pub fn is_deployed(&self) -> bool {
        self.address.is_some()
    }
}

/// State of one ownership edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferStatus {
    pub edge: OwnershipEdge,
    pub applied: bool,
    pub tx_hash: Option<B256>,
}

/// Which nodes are deployed and verified, and which edges are applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub nodes: Vec<NodeStatus>,
    pub transfers: Vec<TransferStatus>,
    /// Recorded contracts the graph does not declare.
    pub unknown: Vec<String>,
}

impl StatusReport {
    pub fn new(graph: &DeploymentGraph, record: &DeploymentRecord) -> Self {
        let nodes = graph
            .contracts
            .iter()
            .map(|node| {
                let entry = record.entry(&node.name);
                NodeStatus {
                    name: node.name.clone(),
                    address: entry.map(|e| e.address),
                    tx_hash: entry.map(|e| e.tx_hash),
                    verification: entry.map(|e| e.verification),
                }
            })
            .collect();

        let transfers = graph
            .ownership
            .iter()
            .map(|edge| {
                let applied = record.transfer(edge);
                TransferStatus {
                    edge: edge.clone(),
                    applied: applied.is_some(),
                    tx_hash: applied.and_then(|applied| applied.tx_hash),
                }
            })
            .collect();

        let unknown = record
            .contracts
            .keys()
            .filter(|name| graph.node(name).is_none())
            .cloned()
            .collect();

        Self {
            nodes,
            transfers,
            unknown,
        }
    }

    /// Every node deployed and every edge applied.
    pub fn is_complete(&self) -> bool {
        self.nodes.iter().all(NodeStatus::is_deployed)
            && self.transfers.iter().all(|t| t.applied)
    }

    pub fn pending(&self) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|node| !node.is_deployed())
            .map(|node| node.name.as_str())
            .collect()
    }

    pub fn to_table(&self) -> Table {
        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL)
            .set_header(vec!["Contract", "Address", "Transaction", "Verification"]);

        for node in &self.nodes {
            table.add_row(vec![
                node.name.clone(),
                node.address
                    .map_or_else(|| "pending".to_string(), |a| a.to_string()),
                node.tx_hash.map_or_else(String::new, |h| h.to_string()),
                node.verification
                    .map_or_else(|| "-".to_string(), |v| v.to_string()),
            ]);
        }

        table
    }
}

fn status_icon(done: bool) -> &'static str {
    if done { "[ok]" } else { "[--]" }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = if self.is_complete() { "COMPLETE" } else { "INCOMPLETE" };
        writeln!(f, "Deployment Status: {}", status)?;
        writeln!(f)?;

        writeln!(f, "=== Contracts ===")?;
        for node in &self.nodes {
            write!(f, "  {} {}", status_icon(node.is_deployed()), node.name)?;
            if let Some(address) = node.address {
                write!(f, " {}", address)?;
            }
            if let Some(verification) = node.verification {
                write!(f, " verification={}", verification)?;
            }
            writeln!(f)?;
        }

        if !self.transfers.is_empty() {
            writeln!(f, "=== Ownership ===")?;
            for transfer in &self.transfers {
                write!(f, "  {} {}", status_icon(transfer.applied), transfer.edge)?;
                if transfer.applied && transfer.tx_hash.is_none() {
                    write!(f, " (found on chain)")?;
                }
                writeln!(f)?;
            }
        }

        if !self.unknown.is_empty() {
            writeln!(f, "=== Not in graph ===")?;
            for name in &self.unknown {
                writeln!(f, "  {}", name)?;
            }
        }

        Ok(())
    }
}
