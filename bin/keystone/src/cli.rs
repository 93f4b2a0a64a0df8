use std::path::PathBuf;

use alloy_core::primitives::{Address, U256, utils::parse_ether};
use clap::{Args, Parser, Subcommand};
use keystone_deploy::CONFIG_FILENAME;
use tracing::level_filters::LevelFilter;

#[derive(Parser)]
#[command(name = "keystone")]
#[command(
    author,
    version,
    about = "Deploy a set of interdependent contracts, hand over their ownership and verify them"
)]
pub struct Cli {
    /// The verbosity level.
    #[arg(short, long, global = true, env = "KEYSTONE_VERBOSITY", default_value_t = LevelFilter::INFO)]
    pub verbosity: LevelFilter,

    /// Path to the configuration file, or to a directory containing `Keystone.toml`.
    ///
    /// Settings can also be overridden with `KEYSTONE_`-prefixed environment variables,
    /// e.g. `KEYSTONE_NETWORK__RPC_URL`.
    #[arg(short, long, global = true, alias = "conf", env = "KEYSTONE_CONFIG", default_value = CONFIG_FILENAME)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Write a configuration file with the default settings and the standard contract graph.
    Init {
        /// Overwrite an existing configuration file.
        #[arg(long)]
        force: bool,
    },

    /// Deploy every contract missing from the record, then apply the ownership transfers.
    Deploy(DeployArgs),

    /// Wait until an address holds a minimum balance.
    WaitForFunding {
        /// The address to watch.
        address: Address,
        /// Minimum balance, in ether.
        #[arg(value_parser = parse_ether_amount)]
        min_balance: U256,
        /// Seconds to wait before giving up.
        deadline_secs: u64,
    },

    /// Verify the recorded contracts with the block explorer.
    Verify {
        /// Deployment record to verify. Defaults to the configured record.
        #[arg(long)]
        record: Option<PathBuf>,
        /// Also resubmit contracts already verified.
        #[arg(long)]
        all: bool,
    },

    /// Report which contracts are deployed and verified, and which transfers are applied.
    Status {
        /// Deployment record to inspect. Defaults to the configured record.
        #[arg(long)]
        record: Option<PathBuf>,
        /// Render contracts as a table.
        #[arg(long)]
        table: bool,
    },

    /// Rewrite the address table from the deployment record.
    UpdateAddresses {
        /// Deployment record to read. Defaults to the configured record.
        #[arg(long)]
        record: Option<PathBuf>,
        /// Address table to write. Defaults to the configured address table.
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[derive(Args)]
pub struct DeployArgs {
    /// Wait for the sender to hold the configured minimum balance before deploying.
    #[arg(long, env = "KEYSTONE_WAIT_FOR_FUNDING")]
    pub wait_for_funding: bool,

    /// Skip verification even when it is enabled in the configuration.
    #[arg(long)]
    pub no_verify: bool,
}

fn parse_ether_amount(value: &str) -> Result<U256, String> {
    parse_ether(value).map_err(|e| format!("invalid ether amount `{value}`: {e}"))
}
