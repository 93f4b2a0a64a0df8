//! End-to-end orchestration against an in-memory chain.

mod common;

use alloy_core::primitives::{Address, B256, Bytes, U256};
use common::{ChainEvent, MockChain, init_test_tracing};
use keystone_deploy::{
    ArgValue, ChainError, ConstructorArg, ContractArtifacts, ContractNode, DeploymentGraph,
    DeploymentRecord, GraphError, JsonFileStore, OrchestrationError, Orchestrator, OwnershipEdge,
    RecordEntry, RecordStore, cancel_channel, encode_constructor_args,
};
use tempdir::TempDir;

fn artifacts(names: &[&str]) -> ContractArtifacts {
    let mut artifacts = ContractArtifacts::default();
    for (i, name) in names.iter().enumerate() {
        artifacts.insert(*name, Bytes::from(vec![0x60, 0x80, i as u8]));
    }
    artifacts
}

/// A, then B taking A's address, with B owned by A once both exist.
fn two_node_graph() -> DeploymentGraph {
    DeploymentGraph::new()
        .add_node(ContractNode::new("A", "A.json"))
        .add_node(ContractNode::new("B", "B.json").arg(ConstructorArg::node("A")))
        .add_edge(OwnershipEdge::new("B", "A"))
}

struct Setup {
    _dir: TempDir,
    orchestrator: Orchestrator<MockChain, JsonFileStore>,
}

fn setup(chain: MockChain, names: &[&str]) -> Setup {
    init_test_tracing();
    let dir = TempDir::new("keystone-orchestrator").unwrap();
    let store = JsonFileStore::new(dir.path().join("record.json"));
    Setup {
        orchestrator: Orchestrator::new(chain, store, artifacts(names)),
        _dir: dir,
    }
}

#[tokio::test]
async fn test_two_contracts_with_ownership_transfer() {
    let Setup { _dir, orchestrator } = setup(MockChain::new(), &["A", "B"]);
    let chain = orchestrator.client();

    let report = orchestrator.run(&two_node_graph(), None).await.unwrap();
    let addr_a = chain.address_at(0);
    let addr_b = chain.address_at(1);

    assert_eq!(report.deployed, vec!["A", "B"]);
    assert!(report.skipped.is_empty());
    assert_eq!(report.record.address_of("A"), Some(addr_a));
    assert_eq!(report.record.address_of("B"), Some(addr_b));
    assert_eq!(
        report.record.entry("B").unwrap().constructor_args,
        vec![ArgValue::Address(addr_a)]
    );

    // Both deployments precede the single transfer.
    let events = chain.events();
    assert_eq!(events.len(), 3);
    assert!(matches!(events[0], ChainEvent::Deploy { address, .. } if address == addr_a));
    assert!(matches!(
        &events[1],
        ChainEvent::Deploy { address, args, .. }
            if *address == addr_b && *args == encode_constructor_args(&[ArgValue::Address(addr_a)])
    ));
    assert_eq!(
        events[2],
        ChainEvent::Transfer {
            contract: addr_b,
            new_owner: addr_a
        }
    );
    assert_eq!(chain.owner_of(addr_b), Some(addr_a));
    assert_eq!(chain.owner_of(addr_a), Some(chain.sender()));

    assert_eq!(report.transfers_applied, vec![OwnershipEdge::new("B", "A")]);
    assert_eq!(
        orchestrator.store().load().unwrap(),
        Some(report.record.clone())
    );
}

#[tokio::test]
async fn test_standard_topology() {
    let names = ["Token", "PriceFeed", "Treasury", "Hub"];
    let Setup { _dir, orchestrator } = setup(MockChain::new(), &names);
    let chain = orchestrator.client();

    let report = orchestrator
        .run(&DeploymentGraph::standard(), None)
        .await
        .unwrap();

    assert_eq!(report.deployed, names);
    let hub = report.record.address_of("Hub").unwrap();
    assert_eq!(
        report.record.entry("Hub").unwrap().constructor_args,
        vec![
            ArgValue::Address(chain.address_at(0)),
            ArgValue::Address(chain.address_at(1)),
            ArgValue::Address(chain.address_at(2)),
        ]
    );
    assert_eq!(
        chain.transfers(),
        vec![
            (chain.address_at(0), hub),
            (chain.address_at(1), hub),
            (chain.address_at(2), hub),
        ]
    );
}

#[tokio::test]
async fn test_resume_after_failed_deployment() {
    let Setup { _dir, orchestrator } = setup(MockChain::new().fail_deploy(1), &["A", "B"]);
    let chain = orchestrator.client();
    let graph = two_node_graph();

    let err = orchestrator.run(&graph, None).await.unwrap_err();
    assert!(matches!(
        &err,
        OrchestrationError::Deployment { node, cause: ChainError::Reverted { .. } } if node == "B"
    ));
    assert!(err.to_string().starts_with("transaction for `B` failed"));
    assert!(chain.transfers().is_empty());

    // The record written before the failure holds A only.
    let partial = orchestrator.store().load().unwrap().unwrap();
    assert!(partial.is_deployed("A"));
    assert!(!partial.is_deployed("B"));
    let entry_a = partial.entry("A").unwrap().clone();

    chain.clear_failures();
    let report = orchestrator.run(&graph, Some(partial)).await.unwrap();

    assert_eq!(report.skipped, vec!["A"]);
    assert_eq!(report.deployed, vec!["B"]);
    assert_eq!(report.record.entry("A"), Some(&entry_a));
    // A was deployed once, B twice (the reverted attempt and the retry).
    assert_eq!(chain.deploy_calls(), 3);
    assert_eq!(chain.deployments(), vec![entry_a.address, chain.address_at(2)]);
    assert_eq!(chain.transfers(), vec![(chain.address_at(2), entry_a.address)]);
}

#[tokio::test]
async fn test_rerun_of_complete_record_sends_nothing() {
    let Setup { _dir, orchestrator } = setup(MockChain::new(), &["A", "B"]);
    let chain = orchestrator.client();
    let graph = two_node_graph();

    let first = orchestrator.run(&graph, None).await.unwrap();
    let events = chain.events();

    let second = orchestrator
        .run(&graph, Some(first.record.clone()))
        .await
        .unwrap();
    assert_eq!(second.record, first.record);
    assert_eq!(second.skipped, vec!["A", "B"]);
    assert!(second.deployed.is_empty());
    assert_eq!(second.transfers_skipped, vec![OwnershipEdge::new("B", "A")]);
    assert_eq!(chain.events(), events);
}

#[tokio::test]
async fn test_unrecorded_transfer_is_found_on_chain() {
    let Setup { _dir, orchestrator } = setup(MockChain::new(), &["A", "B", "C"]);
    let chain = orchestrator.client();
    let graph = DeploymentGraph::new()
        .add_node(ContractNode::new("A", "A.json"))
        .add_node(ContractNode::new("B", "B.json"))
        .add_node(ContractNode::new("C", "C.json"))
        .add_edge(OwnershipEdge::new("A", "C"))
        .add_edge(OwnershipEdge::new("B", "C"));

    let mut record = orchestrator.run(&graph, None).await.unwrap().record;
    // Forget the second transfer, as if the run stopped between confirming and recording it.
    record.ownership.truncate(1);
    let events = chain.events();

    let report = orchestrator.run(&graph, Some(record)).await.unwrap();
    assert_eq!(report.transfers_skipped, vec![OwnershipEdge::new("A", "C")]);
    assert_eq!(report.transfers_applied, vec![OwnershipEdge::new("B", "C")]);
    assert_eq!(chain.events(), events);

    let applied = report.record.transfer(&OwnershipEdge::new("B", "C")).unwrap();
    assert_eq!(applied.tx_hash, None);
    assert_eq!(orchestrator.store().load().unwrap(), Some(report.record.clone()));

    // Once recorded, the edge is skipped like any other.
    let again = orchestrator.run(&graph, Some(report.record)).await.unwrap();
    assert_eq!(again.transfers_skipped.len(), 2);
    assert_eq!(chain.events(), events);
}

#[tokio::test]
async fn test_resume_after_confirmation_timeout() {
    let Setup { _dir, orchestrator } = setup(MockChain::new().stall_deploy(1), &["A", "B"]);
    let chain = orchestrator.client();
    let graph = two_node_graph();

    let err = orchestrator.run(&graph, None).await.unwrap_err();
    assert!(matches!(
        &err,
        OrchestrationError::ConfirmationTimeout { node, attempts: 150, .. } if node == "B"
    ));
    assert!(err.to_string().contains("for `B` was not confirmed"));
    assert!(chain.transfers().is_empty());

    let partial = orchestrator.store().load().unwrap().unwrap();
    assert!(partial.is_deployed("A"));
    assert!(!partial.is_deployed("B"));
    let entry_a = partial.entry("A").unwrap().clone();

    chain.clear_failures();
    let report = orchestrator.run(&graph, Some(partial)).await.unwrap();

    assert_eq!(report.skipped, vec!["A"]);
    assert_eq!(report.deployed, vec!["B"]);
    assert_eq!(report.record.entry("A"), Some(&entry_a));
    assert_eq!(report.record.address_of("B"), Some(chain.address_at(2)));
    assert_eq!(chain.transfers(), vec![(chain.address_at(2), entry_a.address)]);
}

#[tokio::test]
async fn test_inconsistent_record_sends_no_transaction() {
    let Setup { _dir, orchestrator } = setup(MockChain::new(), &["A", "B"]);
    let chain = orchestrator.client();

    let mut record = DeploymentRecord::new();
    record.record_deployment(
        "A",
        RecordEntry::new(Address::repeat_byte(0x0a), B256::repeat_byte(1), vec![]),
    );
    record.record_deployment(
        "B",
        RecordEntry::new(
            Address::repeat_byte(0x0b),
            B256::repeat_byte(2),
            vec![ArgValue::Address(Address::repeat_byte(0xff))],
        ),
    );

    let err = orchestrator
        .run(&two_node_graph(), Some(record))
        .await
        .unwrap_err();
    assert!(matches!(
        &err,
        OrchestrationError::RecordInconsistency { node, .. } if node == "B"
    ));
    assert!(chain.events().is_empty());
    assert_eq!(chain.deploy_calls(), 0);
    assert!(orchestrator.store().load().unwrap().is_none());
}

#[tokio::test]
async fn test_dependent_recorded_without_dependency() {
    let Setup { _dir, orchestrator } = setup(MockChain::new(), &["A", "B"]);
    let chain = orchestrator.client();

    let mut record = DeploymentRecord::new();
    record.record_deployment(
        "B",
        RecordEntry::new(
            Address::repeat_byte(0x0b),
            B256::repeat_byte(2),
            vec![ArgValue::Address(Address::repeat_byte(0x0a))],
        ),
    );

    let err = orchestrator
        .run(&two_node_graph(), Some(record))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestrationError::RecordInconsistency { .. }));
    assert_eq!(chain.deploy_calls(), 0);
}

#[tokio::test]
async fn test_cycle_fails_before_any_chain_call() {
    let Setup { _dir, orchestrator } = setup(MockChain::new(), &["A", "B"]);
    let graph = DeploymentGraph::new()
        .add_node(ContractNode::new("A", "A.json").arg(ConstructorArg::node("B")))
        .add_node(ContractNode::new("B", "B.json").arg(ConstructorArg::node("A")));

    let err = orchestrator.run(&graph, None).await.unwrap_err();
    match err {
        OrchestrationError::Graph(GraphError::Cycle { cycle }) => {
            assert!(cycle.contains(&"A".to_string()));
            assert!(cycle.contains(&"B".to_string()));
        }
        other => panic!("expected a cycle error, got {other}"),
    }
    assert_eq!(orchestrator.client().deploy_calls(), 0);
}

#[tokio::test]
async fn test_missing_artifact_fails_before_any_chain_call() {
    let Setup { _dir, orchestrator } = setup(MockChain::new(), &["A"]);

    let err = orchestrator.run(&two_node_graph(), None).await.unwrap_err();
    assert!(matches!(
        &err,
        OrchestrationError::MissingArtifact { node } if node == "B"
    ));
    assert_eq!(orchestrator.client().deploy_calls(), 0);
}

#[tokio::test]
async fn test_cancelled_run_stops_at_step_boundary() {
    init_test_tracing();
    let dir = TempDir::new("keystone-orchestrator").unwrap();
    let (handle, cancel) = cancel_channel();
    let orchestrator = Orchestrator::new(
        MockChain::new(),
        JsonFileStore::new(dir.path().join("record.json")),
        artifacts(&["A", "B"]),
    )
    .with_cancel(cancel);

    handle.cancel();
    let err = orchestrator.run(&two_node_graph(), None).await.unwrap_err();
    assert!(matches!(
        &err,
        OrchestrationError::Cancelled { pending } if pending == "A"
    ));
    assert_eq!(orchestrator.client().deploy_calls(), 0);
}

#[tokio::test]
async fn test_literal_arguments_are_encoded() {
    let Setup { _dir, orchestrator } = setup(MockChain::new(), &["Token"]);
    let graph = DeploymentGraph::new().add_node(
        ContractNode::new("Token", "Token.json")
            .arg(ConstructorArg::String("Keystone".to_string()))
            .arg(ConstructorArg::Uint(U256::from(1_000_000u64))),
    );

    let report = orchestrator.run(&graph, None).await.unwrap();
    let expected = vec![
        ArgValue::String("Keystone".to_string()),
        ArgValue::Uint(U256::from(1_000_000u64)),
    ];
    assert_eq!(report.record.entry("Token").unwrap().constructor_args, expected);
    assert!(matches!(
        &orchestrator.client().events()[0],
        ChainEvent::Deploy { args, .. } if *args == encode_constructor_args(&expected)
    ));
}
