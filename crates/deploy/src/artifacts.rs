//! Creation bytecode loaded from compiler artifacts.

use std::{collections::BTreeMap, path::Path};

use alloy_core::primitives::Bytes;
use anyhow::{Context, Result};
use serde_json::Value;

use crate::{DeploymentGraph, DeploymentRecord};

/// Creation bytecode of every contract in a graph, keyed by node name.
#[derive(Debug, Clone, Default, PartialEq, Eq, derive_more::From)]
pub struct ContractArtifacts(BTreeMap<String, Bytes>);

impl ContractArtifacts {
    /// Load the artifact of every node in `graph`, resolving relative paths against `base_dir`.
    pub fn load(graph: &DeploymentGraph, base_dir: &Path) -> Result<Self> {
        Self::load_pending(graph, None, base_dir)
    }

    /// Load the artifacts of the nodes `record` does not hold a deployment for yet.
    pub fn load_pending(
        graph: &DeploymentGraph,
        record: Option<&DeploymentRecord>,
        base_dir: &Path,
    ) -> Result<Self> {
        let mut artifacts = Self::default();

        for node in &graph.contracts {
            if record.is_some_and(|record| record.is_deployed(&node.name)) {
                continue;
            }
            let path = base_dir.join(&node.artifact);
            let bytecode = read_bytecode(&path)
                .with_context(|| format!("Failed to load artifact for contract `{}`", node.name))?;

            tracing::debug!(
                contract = %node.name,
                path = %path.display(),
                size = bytecode.len(),
                "Loaded contract artifact"
            );
            artifacts.insert(node.name.clone(), bytecode);
        }

        Ok(artifacts)
    }

    pub fn insert(&mut self, name: impl Into<String>, bytecode: Bytes) {
        self.0.insert(name.into(), bytecode);
    }

    pub fn get(&self, name: &str) -> Option<&Bytes> {
        self.0.get(name)
    }
}

/// Read creation bytecode from a Foundry (`bytecode.object`) or Hardhat (`bytecode`) artifact.
fn read_bytecode(path: &Path) -> Result<Bytes> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let artifact: Value = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))?;

    let hex = match &artifact["bytecode"] {
        Value::String(hex) => hex.as_str(),
        other => other["object"]
            .as_str()
            .with_context(|| format!("No creation bytecode in {}", path.display()))?,
    };

    if hex.contains("__$") {
        anyhow::bail!(
            "Bytecode in {} has unlinked library placeholders",
            path.display()
        );
    }

    let bytecode: Bytes = hex
        .parse()
        .with_context(|| format!("Invalid bytecode hex in {}", path.display()))?;

    if bytecode.is_empty() {
        anyhow::bail!(
            "Empty bytecode in {} (abstract contract or interface?)",
            path.display()
        );
    }

    Ok(bytecode)
}
