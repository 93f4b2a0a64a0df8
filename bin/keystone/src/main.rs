//! keystone deploys a graph of interdependent contracts, hands their ownership to a hub
//! contract and verifies them with a block explorer.

mod cli;

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::Instant;

use cli::{Cli, Command, DeployArgs};
use keystone_deploy::{
    CONFIG_FILENAME, CancelHandle, ContractArtifacts, DeploymentGraph,
    DeploymentRecord, EtherscanClient, FundingProbe, JsonFileStore, JsonRpcChainClient,
    KeystoneConfig, Orchestrator, RecordStore, RunLock, StatusReport, Verifier, address_table,
    cancel_channel,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize the logger.
    tracing_subscriber::fmt()
        .with_max_level(cli.verbosity)
        .init();

    let load_config = || KeystoneConfig::load(&cli.config);

    match cli.command {
        Command::Init { force } => init(&cli.config, force),
        Command::Deploy(args) => deploy(&load_config()?, args).await,
        Command::WaitForFunding {
            address,
            min_balance,
            deadline_secs,
        } => {
            let config = load_config()?;
            let client = connect(&config).await?.0;
            let funded = FundingProbe::new(
                address,
                min_balance,
                Duration::from_secs(config.funding.poll_interval_secs),
                Instant::now() + Duration::from_secs(deadline_secs),
            )
            .with_max_soft_failures(config.funding.max_soft_failures)
            .run(&client)
            .await?;

            println!("{address} funded with {} wei", funded.balance);
            Ok(())
        }
        Command::Verify { record, all } => {
            let config = load_config()?;
            let record_path = record.unwrap_or_else(|| config.output.record.clone());
            verify(&config, record_path, all).await
        }
        Command::Status { record, table } => {
            let config = load_config()?;
            let record_path = record.unwrap_or_else(|| config.output.record.clone());
            let record = JsonFileStore::new(&record_path).load()?.unwrap_or_default();
            let report = StatusReport::new(&config.graph(), &record);
            if table {
                println!("{}", report.to_table());
            } else {
                print!("{report}");
            }
            Ok(())
        }
        Command::UpdateAddresses { record, output } => {
            let config = load_config()?;
            let record_path = record.unwrap_or_else(|| config.output.record.clone());
            let record = load_record(&record_path)?;
            let output = output
                .or_else(|| config.output.address_table.clone())
                .context("No address table configured, pass --output or set output.address_table")?;
            let written = address_table::update(&output, &record, &config.output.key_prefix)?;
            println!("{written} addresses written to {}", output.display());
            Ok(())
        }
    }
}

/// Write a starter config holding the standard graph. A directory gets the default file name.
fn init(path: &Path, force: bool) -> Result<()> {
    let path = if path.is_dir() {
        path.join(CONFIG_FILENAME)
    } else {
        path.to_path_buf()
    };

    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists, pass --force to overwrite it",
            path.display()
        );
    }

    let config = KeystoneConfig {
        graph: Some(DeploymentGraph::standard()),
        ..Default::default()
    };
    config.save_to_file(&path)
}

/// Connect to the configured node and return the client with the chain id it serves.
async fn connect(config: &KeystoneConfig) -> Result<(JsonRpcChainClient, u64)> {
    let client = JsonRpcChainClient::new(config.network.rpc_url.clone(), config.network.from)?;
    let chain_id = client
        .probe(
            config.network.chain_id,
            Duration::from_secs(config.network.probe_timeout_secs),
        )
        .await?;
    Ok((client, chain_id))
}

fn load_record(path: &Path) -> Result<DeploymentRecord> {
    JsonFileStore::new(path)
        .load()?
        .with_context(|| format!("No deployment record at {}", path.display()))
}

/// Trip the cancel signal on the first Ctrl+C, exit on the second.
fn cancel_on_ctrl_c(handle: CancelHandle) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        tracing::warn!("Interrupted, stopping after the current step (press Ctrl+C again to abort)");
        handle.cancel();

        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::error!("Aborted");
            std::process::exit(130);
        }
    });
}

async fn deploy(config: &KeystoneConfig, args: DeployArgs) -> Result<()> {
    let graph = config.graph();
    let record_path = &config.output.record;

    let _lock = RunLock::acquire(record_path)?;
    let store = JsonFileStore::new(record_path);
    let existing = store.load()?;

    let artifacts = ContractArtifacts::load_pending(&graph, existing.as_ref(), &config.artifacts_dir)?;
    let (client, chain_id) = connect(config).await?;

    if args.wait_for_funding {
        FundingProbe::new(
            client.sender(),
            config.funding.min_balance_wei()?,
            Duration::from_secs(config.funding.poll_interval_secs),
            Instant::now() + Duration::from_secs(config.funding.timeout_secs),
        )
        .with_max_soft_failures(config.funding.max_soft_failures)
        .run(&client)
        .await?;
    }

    let (handle, cancel) = cancel_channel();
    cancel_on_ctrl_c(handle);

    tracing::info!(
        contracts = graph.contracts.len(),
        transfers = graph.ownership.len(),
        record = %record_path.display(),
        resumed = existing.is_some(),
        "Starting deployment"
    );

    let orchestrator = Orchestrator::new(client, store, artifacts)
        .with_policy(config.confirmation.policy())
        .with_cancel(cancel.clone());
    let report = orchestrator
        .run(&graph, existing)
        .await
        .context("Deployment failed")?;

    if !report.skipped.is_empty() {
        tracing::info!(contracts = ?report.skipped, "Resumed, skipped already deployed contracts");
    }

    let mut record = report.record;
    if config.verification.enabled && !args.no_verify {
        let verifier = explorer_verifier(config, chain_id)?;
        let summary = verifier
            .verify_record(&graph, &mut record, orchestrator.store(), false, &cancel)
            .await?;
        for (contract, error) in &summary.failed {
            tracing::warn!(contract = %contract, error = %error, "Contract left unverified");
        }
    }

    if let Some(path) = &config.output.address_table {
        address_table::update(path, &record, &config.output.key_prefix)?;
    }

    print!("{}", StatusReport::new(&graph, &record));
    Ok(())
}

fn explorer_verifier(config: &KeystoneConfig, chain_id: u64) -> Result<Verifier<EtherscanClient>> {
    if config.verification.api_key.is_empty() {
        tracing::warn!("No explorer API key configured (verification.api_key)");
    }
    let client =
        EtherscanClient::new(config.verification.etherscan(chain_id, &config.artifacts_dir))?;
    Ok(Verifier::new(client, config.verification.verifier()))
}

async fn verify(config: &KeystoneConfig, record_path: PathBuf, all: bool) -> Result<()> {
    let _lock = RunLock::acquire(&record_path)?;
    let store = JsonFileStore::new(&record_path);
    let mut record = load_record(&record_path)?;

    let chain_id = match config.verification.chain_id.or(config.network.chain_id) {
        Some(chain_id) => chain_id,
        None => connect(config).await?.1,
    };

    let (handle, cancel) = cancel_channel();
    cancel_on_ctrl_c(handle);

    let summary = explorer_verifier(config, chain_id)?
        .verify_record(&config.graph(), &mut record, &store, all, &cancel)
        .await?;
    for contract in &summary.verified {
        println!("[ok] {contract}");
    }
    for contract in &summary.skipped {
        println!("[--] {contract} (not submitted)");
    }

    if !summary.is_success() {
        let failed: Vec<_> = summary.failed.iter().map(|(name, _)| name.as_str()).collect();
        anyhow::bail!("Verification failed for: {}", failed.join(", "));
    }
    Ok(())
}
