//! Static description of the contracts to deploy and the ownership edges between them.
//!
//! The graph is pure data. Constructor arguments either carry a literal value or reference
//! another node, in which case they resolve to that node's deployed address. Ownership edges
//! are applied once every node has been deployed.

use std::{
    collections::HashSet,
    fmt,
    path::{Path, PathBuf},
};

use alloy_core::{
    dyn_abi::DynSolValue,
    primitives::{Address, Bytes, U256},
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Errors detected while validating or ordering a [`DeploymentGraph`].
///
/// These are pre-flight errors: none of them can occur after a chain call was made.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("dependency cycle detected: {}", .cycle.join(" -> "))]
    Cycle { cycle: Vec<String> },
    #[error("contract `{node}` references unknown contract `{reference}`")]
    MissingReference { node: String, reference: String },
    #[error("contract `{0}` is declared more than once")]
    DuplicateNode(String),
    #[error("invalid ownership edge {contract} -> {new_owner}: {reason}")]
    InvalidEdge {
        contract: String,
        new_owner: String,
        reason: String,
    },
}

/// A constructor argument as declared in the graph.
///
/// In TOML this reads as `{ node = "Token" }`, `{ uint = "1000" }`, `{ bool = true }`, ...
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstructorArg {
    /// The deployed address of another node.
    Node(String),
    Address(Address),
    Uint(U256),
    Bool(bool),
    String(String),
    Bytes(Bytes),
}

impl ConstructorArg {
    /// Reference to another node's deployed address.
    pub fn node(name: impl Into<String>) -> Self {
        Self::Node(name.into())
    }

    /// Name of the referenced node, if this argument is a node reference.
    pub fn dependency(&self) -> Option<&str> {
        match self {
            Self::Node(name) => Some(name.as_str()),
            _ => None,
        }
    }

    /// Resolve this argument to a concrete value.
    ///
    /// Literals pass through. Node references are looked up with `address_of` and resolve to
    /// `None` when the referenced node has no known address.
    pub fn resolve(&self, address_of: impl Fn(&str) -> Option<Address>) -> Option<ArgValue> {
        let value = match self {
            Self::Node(name) => ArgValue::Address(address_of(name.as_str())?),
            Self::Address(address) => ArgValue::Address(*address),
            Self::Uint(value) => ArgValue::Uint(*value),
            Self::Bool(value) => ArgValue::Bool(*value),
            Self::String(value) => ArgValue::String(value.clone()),
            Self::Bytes(value) => ArgValue::Bytes(value.clone()),
        };
        Some(value)
    }
}

/// A resolved constructor argument, as submitted on-chain and stored in the record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgValue {
    Address(Address),
    Uint(U256),
    Bool(bool),
    String(String),
    Bytes(Bytes),
}

impl ArgValue {
    fn to_sol(&self) -> DynSolValue {
        match self {
            Self::Address(address) => DynSolValue::Address(*address),
            Self::Uint(value) => DynSolValue::Uint(*value, 256),
            Self::Bool(value) => DynSolValue::Bool(*value),
            Self::String(value) => DynSolValue::String(value.clone()),
            Self::Bytes(value) => DynSolValue::Bytes(value.to_vec()),
        }
    }
}

impl fmt::Display for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Address(address) => write!(f, "{address}"),
            Self::Uint(value) => write!(f, "{value}"),
            Self::Bool(value) => write!(f, "{value}"),
            Self::String(value) => write!(f, "{value:?}"),
            Self::Bytes(value) => write!(f, "{value}"),
        }
    }
}

/// ABI-encode resolved constructor arguments, ready to be appended to creation bytecode.
pub fn encode_constructor_args(args: &[ArgValue]) -> Bytes {
    if args.is_empty() {
        return Bytes::new();
    }

    DynSolValue::Tuple(args.iter().map(ArgValue::to_sol).collect())
        .abi_encode_params()
        .into()
}

/// Where to find the verifiable source of a contract.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceRef {
    /// Fully qualified contract name, e.g. `src/Token.sol:Token`.
    pub contract: String,
    /// Path to the solc standard JSON input used to compile the contract.
    pub standard_json: PathBuf,
}

impl SourceRef {
    pub fn new(contract: impl Into<String>, standard_json: impl Into<PathBuf>) -> Self {
        Self {
            contract: contract.into(),
            standard_json: standard_json.into(),
        }
    }
}

/// One contract to deploy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContractNode {
    /// Unique symbolic name.
    pub name: String,
    /// Path to the compiled artifact holding the creation bytecode.
    pub artifact: PathBuf,
    /// Ordered constructor arguments.
    #[serde(default)]
    pub args: Vec<ConstructorArg>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceRef>,
}

impl ContractNode {
    pub fn new(name: impl Into<String>, artifact: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            artifact: artifact.into(),
            args: Vec::new(),
            source: None,
        }
    }

    /// A node laid out the way Foundry lays out a `src/<Name>.sol` contract.
    pub fn foundry(name: &str) -> Self {
        let file = format!("{name}.sol");
        Self::new(name, Path::new("out").join(&file).join(format!("{name}.json"))).source(
            SourceRef::new(
                format!("src/{file}:{name}"),
                Path::new("standard-json").join(format!("{name}.json")),
            ),
        )
    }

    /// Append a constructor argument.
    pub fn arg(mut self, arg: ConstructorArg) -> Self {
        self.args.push(arg);
        self
    }

    pub fn source(mut self, source: SourceRef) -> Self {
        self.source = Some(source);
        self
    }

    /// Names of the nodes this node's constructor references, in argument order.
    pub fn dependencies(&self) -> impl Iterator<Item = &str> {
        self.args.iter().filter_map(ConstructorArg::dependency)
    }
}

/// Transfer of `contract`'s ownership to the deployed address of `new_owner`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::Display)]
#[display("{contract} -> {new_owner}")]
pub struct OwnershipEdge {
    /// The ownable node.
    pub contract: String,
    /// The node receiving ownership.
    pub new_owner: String,
}

impl OwnershipEdge {
    pub fn new(contract: impl Into<String>, new_owner: impl Into<String>) -> Self {
        Self {
            contract: contract.into(),
            new_owner: new_owner.into(),
        }
    }
}

/// The contracts to deploy and the ownership transfers to apply afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentGraph {
    #[serde(default)]
    pub contracts: Vec<ContractNode>,
    #[serde(default)]
    pub ownership: Vec<OwnershipEdge>,
}

impl DeploymentGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard deployment: three satellite contracts whose ownership is handed to the hub.
    pub fn standard() -> Self {
        Self::new()
            .add_node(ContractNode::foundry("Token"))
            .add_node(ContractNode::foundry("PriceFeed"))
            .add_node(ContractNode::foundry("Treasury").arg(ConstructorArg::node("Token")))
            .add_node(
                ContractNode::foundry("Hub")
                    .arg(ConstructorArg::node("Token"))
                    .arg(ConstructorArg::node("PriceFeed"))
                    .arg(ConstructorArg::node("Treasury")),
            )
            .add_edge(OwnershipEdge::new("Token", "Hub"))
            .add_edge(OwnershipEdge::new("PriceFeed", "Hub"))
            .add_edge(OwnershipEdge::new("Treasury", "Hub"))
    }

    pub fn add_node(mut self, node: ContractNode) -> Self {
        self.contracts.push(node);
        self
    }

    pub fn add_edge(mut self, edge: OwnershipEdge) -> Self {
        self.ownership.push(edge);
        self
    }

    pub fn node(&self, name: &str) -> Option<&ContractNode> {
        self.contracts.iter().find(|node| node.name == name)
    }

    /// Check names are unique and every reference, in arguments and edges, is known.
    pub fn validate(&self) -> Result<(), GraphError> {
        let mut names = HashSet::with_capacity(self.contracts.len());
        for node in &self.contracts {
            if !names.insert(node.name.as_str()) {
                return Err(GraphError::DuplicateNode(node.name.clone()));
            }
        }

        for node in &self.contracts {
            if let Some(reference) = node.dependencies().find(|dep| !names.contains(dep)) {
                return Err(GraphError::MissingReference {
                    node: node.name.clone(),
                    reference: reference.to_string(),
                });
            }
        }

        let mut edges = HashSet::with_capacity(self.ownership.len());
        for edge in &self.ownership {
            let invalid = |reason: String| GraphError::InvalidEdge {
                contract: edge.contract.clone(),
                new_owner: edge.new_owner.clone(),
                reason,
            };

            for end in [&edge.contract, &edge.new_owner] {
                if !names.contains(end.as_str()) {
                    return Err(invalid(format!("unknown contract `{end}`")));
                }
            }
            if edge.contract == edge.new_owner {
                return Err(invalid("a contract cannot own itself".to_string()));
            }
            if !edges.insert(edge) {
                return Err(invalid("edge is declared more than once".to_string()));
            }
        }

        Ok(())
    }

    /// Order the nodes so that every node comes after all the nodes it references.
    ///
    /// Among nodes that do not depend on each other, declaration order is kept, so the same
    /// graph always yields the same order.
    pub fn topological_order(&self) -> Result<Vec<&ContractNode>, GraphError> {
        self.validate()?;

        let mut placed: HashSet<&str> = HashSet::with_capacity(self.contracts.len());
        let mut order = Vec::with_capacity(self.contracts.len());

        while order.len() < self.contracts.len() {
            let ready = self.contracts.iter().find(|node| {
                !placed.contains(node.name.as_str())
                    && node.dependencies().all(|dep| placed.contains(dep))
            });

            match ready {
                Some(node) => {
                    placed.insert(node.name.as_str());
                    order.push(node);
                }
                None => {
                    return Err(GraphError::Cycle {
                        cycle: self.find_cycle(&placed),
                    });
                }
            }
        }

        Ok(order)
    }

    /// Walk unplaced dependencies until a node repeats.
    ///
    /// Every unplaced node has at least one unplaced dependency, so the walk always closes.
    fn find_cycle(&self, placed: &HashSet<&str>) -> Vec<String> {
        let Some(start) = self
            .contracts
            .iter()
            .find(|node| !placed.contains(node.name.as_str()))
        else {
            return Vec::new();
        };

        let mut path = vec![start.name.as_str()];
        while let Some(next) = path
            .last()
            .and_then(|current| self.unplaced_dependency(current, placed))
        {
            if let Some(pos) = path.iter().position(|seen| *seen == next) {
                let mut cycle: Vec<String> = path[pos..].iter().map(|n| n.to_string()).collect();
                cycle.push(next.to_string());
                return cycle;
            }
            path.push(next);
        }

        path.into_iter().map(String::from).collect()
    }

    fn unplaced_dependency<'a>(&'a self, name: &str, placed: &HashSet<&str>) -> Option<&'a str> {
        self.node(name)?
            .dependencies()
            .find(|dep| !placed.contains(dep))
    }

    /// SHA-256 of the graph definition, hex encoded.
    pub fn fingerprint(&self) -> String {
        let json =
            serde_json::to_vec(self).expect("DeploymentGraph serialization should never fail");
        hex::encode(Sha256::digest(&json))
    }
}
