//! [`ChainClient`] over plain Ethereum JSON-RPC.
//!
//! Transactions go through `eth_sendTransaction`, so the node signs on behalf of the
//! configured sender (Anvil, a dev node, or a node fronted by a signer such as Clef).

use std::time::Duration;

use alloy_core::primitives::{Address, B256, Bytes, U256};
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::{Value, json};
use url::Url;

use super::{ChainClient, ChainError, ConfirmationPolicy, PendingDeployment, Receipt};
use crate::rpc;

/// Transaction receipt as returned by `eth_getTransactionReceipt`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcReceipt {
    transaction_hash: B256,
    #[serde(deserialize_with = "rpc::deserialize_u64_from_hex")]
    block_number: u64,
    /// `0x1` on success, `0x0` on revert. Absent on pre-Byzantium chains.
    status: Option<String>,
    contract_address: Option<Address>,
}

/// JSON-RPC chain client sending every transaction from `from`.
#[derive(Debug, Clone)]
pub struct JsonRpcChainClient {
    client: reqwest::Client,
    url: Url,
    from: Address,
}

impl JsonRpcChainClient {
    pub fn new(url: Url, from: Address) -> anyhow::Result<Self> {
        Ok(Self {
            client: rpc::create_client()?,
            url,
            from,
        })
    }

    /// The signing identity used for every transaction.
    pub fn sender(&self) -> Address {
        self.from
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<T, ChainError> {
        rpc::json_rpc_call(&self.client, self.url.as_str(), method, params)
            .await
            .map_err(|e| ChainError::Rpc(format!("{e:#}")))
    }

    async fn quantity(&self, method: &str, params: Vec<Value>) -> Result<u64, ChainError> {
        let hex: String = self.request(method, params).await?;
        rpc::parse_hex_u64(&hex)
            .map_err(|e| ChainError::Rpc(format!("invalid {method} quantity {hex}: {e}")))
    }

    pub async fn chain_id(&self) -> Result<u64, ChainError> {
        self.quantity("eth_chainId", vec![]).await
    }

    pub async fn block_number(&self) -> Result<u64, ChainError> {
        self.quantity("eth_blockNumber", vec![]).await
    }

    async fn pending_nonce(&self) -> Result<u64, ChainError> {
        self.quantity(
            "eth_getTransactionCount",
            vec![json!(self.from), json!("pending")],
        )
        .await
    }

    /// One receipt poll. `None` while the transaction is unmined or not deep enough.
    async fn poll_receipt(
        &self,
        tx_hash: B256,
        policy: &ConfirmationPolicy,
    ) -> Result<Option<Receipt>, ChainError> {
        let receipt: Option<RpcReceipt> = self
            .request("eth_getTransactionReceipt", vec![json!(tx_hash)])
            .await?;
        let Some(receipt) = receipt else {
            return Ok(None);
        };
        if receipt.status.as_deref() == Some("0x0") {
            return Err(ChainError::Reverted { tx_hash });
        }

        let head = self.block_number().await?;
        let confirmations = head.saturating_sub(receipt.block_number) + 1;
        if confirmations < policy.confirmations {
            tracing::debug!(
                %tx_hash,
                confirmations,
                required = policy.confirmations,
                "Waiting for more confirmations"
            );
            return Ok(None);
        }

        Ok(Some(Receipt {
            tx_hash: receipt.transaction_hash,
            block_number: receipt.block_number,
            contract_address: receipt.contract_address,
            confirmations,
        }))
    }

    /// Wait for the endpoint to answer, then check it serves the expected chain.
    pub async fn probe(&self, expected_chain_id: Option<u64>, timeout: Duration) -> anyhow::Result<u64> {
        let this = self;
        rpc::wait_until_ready(self.url.as_str(), timeout, move || async move {
            this.chain_id().await.map(|_| ()).map_err(anyhow::Error::from)
        })
        .await?;

        let chain_id = self.chain_id().await?;
        if let Some(expected) = expected_chain_id.filter(|expected| *expected != chain_id) {
            anyhow::bail!(
                "RPC endpoint {} serves chain {} but chain {} is configured",
                self.url,
                chain_id,
                expected
            );
        }

        tracing::info!(url = %self.url, chain_id, sender = %self.from, "RPC endpoint is reachable");
        Ok(chain_id)
    }
}

impl ChainClient for JsonRpcChainClient {
    async fn deploy_contract(
        &self,
        bytecode: &Bytes,
        constructor_args: &Bytes,
    ) -> Result<PendingDeployment, ChainError> {
        let nonce = self.pending_nonce().await?;
        let address = self.from.create(nonce);

        let mut data = bytecode.to_vec();
        data.extend_from_slice(constructor_args);

        let tx_hash: B256 = self
            .request(
                "eth_sendTransaction",
                vec![json!({
                    "from": self.from,
                    "data": Bytes::from(data),
                })],
            )
            .await?;

        tracing::debug!(%tx_hash, %address, nonce, "Contract creation submitted");
        Ok(PendingDeployment { address, tx_hash })
    }

    async fn confirm_transaction(
        &self,
        tx_hash: B256,
        policy: &ConfirmationPolicy,
    ) -> Result<Receipt, ChainError> {
        for attempt in 1..=policy.max_attempts {
            if attempt > 1 {
                tokio::time::sleep(policy.poll_interval).await;
            }

            // A failed poll spends an attempt but does not end the wait.
            match self.poll_receipt(tx_hash, policy).await {
                Ok(Some(receipt)) => return Ok(receipt),
                Ok(None) => {
                    tracing::trace!(%tx_hash, attempt, "Transaction not confirmed yet");
                }
                Err(err @ ChainError::Reverted { .. }) => return Err(err),
                Err(err) => {
                    tracing::warn!(
                        %tx_hash,
                        attempt,
                        max_attempts = policy.max_attempts,
                        error = %err,
                        "Receipt poll failed"
                    );
                }
            }
        }

        Err(ChainError::ConfirmationTimeout {
            tx_hash,
            attempts: policy.max_attempts,
        })
    }

    async fn get_balance(&self, address: Address) -> Result<U256, ChainError> {
        self.request("eth_getBalance", vec![json!(address), json!("latest")])
            .await
    }

    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes, ChainError> {
        self.request(
            "eth_call",
            vec![
                json!({ "from": self.from, "to": to, "data": data }),
                json!("latest"),
            ],
        )
        .await
    }

    async fn send_transaction(&self, to: Address, data: Bytes) -> Result<B256, ChainError> {
        self.request(
            "eth_sendTransaction",
            vec![json!({ "from": self.from, "to": to, "data": data })],
        )
        .await
    }
}
