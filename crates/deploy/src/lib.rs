//! keystone-deploy - Dependency-ordered smart contract deployment.
//!
//! This crate deploys a graph of interdependent contracts from a single signing identity,
//! hands their ownership to a coordinating contract, optionally waits for the deployer to be
//! funded first, and verifies the deployed contracts with a block explorer. Progress is kept in
//! a [`DeploymentRecord`] so an interrupted run can be resumed.

pub mod address_table;
pub mod chain;
pub mod rpc;

mod artifacts;
pub use artifacts::ContractArtifacts;

mod cancel;
pub use cancel::{CancelHandle, CancelSignal, cancel_channel};

mod config;
pub use config::{
    CONFIG_FILENAME, ConfirmationConfig, ENV_PREFIX, FundingConfig, KeystoneConfig,
    NetworkConfig, OutputConfig, VerificationConfig,
};

pub use chain::{
    ChainClient, ChainError, ConfirmationPolicy, JsonRpcChainClient, PendingDeployment, Receipt,
};

mod fs;

mod funding;
pub use funding::{
    DEFAULT_MAX_SOFT_FAILURES, Funded, FundingError, FundingProbe, FundingState,
    wait_for_funding,
};

mod graph;
pub use graph::{
    ArgValue, ConstructorArg, ContractNode, DeploymentGraph, GraphError, OwnershipEdge,
    SourceRef, encode_constructor_args,
};

mod orchestrator;
pub use orchestrator::{OrchestrationError, Orchestrator, RunReport};

mod record;
pub use record::{
    AppliedTransfer, DeploymentRecord, JsonFileStore, RecordEntry, RecordError, RecordStore,
    RunLock, VerificationStatus,
};

mod status;
pub use status::{NodeStatus, StatusReport, TransferStatus};

pub mod verify;
pub use verify::{
    EtherscanClient, EtherscanConfig, ServiceError, Submission, VerificationError,
    VerificationReceipt, VerificationRequest, VerificationService, VerificationSummary,
    Verifier, VerifierConfig,
};
