//! Ledger RPC client contract
//!
//! The ledger node is an external collaborator consumed over REST. The
//! trait keeps the core testable; `HttpLedgerRpc` is the production
//! implementation.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::ledger::types::CoinFragment;
use crate::ledger::UtxoRef;
use crate::types::{Result, SettlementError};

/// A transaction as observed on the ledger
#[derive(Debug, Clone, Deserialize)]
pub struct LedgerTransaction {
    /// Transaction hash (hex)
    pub hash: String,
    /// Embedded protocol payload bytes, if any
    pub payload: Option<Vec<u8>>,
    /// Address that funded the first input, where the node can resolve it
    pub funding_address: Option<String>,
    /// Whether the transaction has been accepted into the confirmed set
    pub confirmed: bool,
}

/// Read/submit access to the public ledger node
#[async_trait]
pub trait LedgerRpc: Send + Sync {
    /// Fetch the spendable coin fragments for an address
    async fn fetch_spendable_fragments(&self, address: &str) -> Result<Vec<CoinFragment>>;

    /// Submit a signed transaction, returning its hash
    async fn submit_transaction(&self, raw_tx: &str) -> Result<String>;

    /// Fetch a transaction by hash; `None` when the ledger has never seen it
    async fn get_transaction(&self, tx_hash: &str) -> Result<Option<LedgerTransaction>>;
}

/// REST-backed ledger RPC client
pub struct HttpLedgerRpc {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct UtxoEntry {
    transaction_id: String,
    output_index: u32,
    amount: u64,
    script_public_key: String,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    transaction_id: String,
}

impl HttpLedgerRpc {
    /// Create a client against a ledger node REST endpoint
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SettlementError::Config(format!("failed to build http client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn transient(e: reqwest::Error) -> SettlementError {
        SettlementError::TransientLedger(e.to_string())
    }
}

#[async_trait]
impl LedgerRpc for HttpLedgerRpc {
    async fn fetch_spendable_fragments(&self, address: &str) -> Result<Vec<CoinFragment>> {
        let url = format!("{}/addresses/{}/utxos", self.base_url, address);
        let entries: Vec<UtxoEntry> = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(Self::transient)?
            .error_for_status()
            .map_err(Self::transient)?
            .json()
            .await
            .map_err(Self::transient)?;

        debug!(address = %address, count = entries.len(), "Fetched spendable fragments");

        Ok(entries
            .into_iter()
            .map(|e| {
                CoinFragment::new(
                    UtxoRef::new(e.transaction_id, e.output_index),
                    e.amount,
                    e.script_public_key,
                )
            })
            .collect())
    }

    async fn submit_transaction(&self, raw_tx: &str) -> Result<String> {
        let url = format!("{}/transactions", self.base_url);
        let response: SubmitResponse = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "transaction": raw_tx }))
            .send()
            .await
            .map_err(Self::transient)?
            .error_for_status()
            .map_err(Self::transient)?
            .json()
            .await
            .map_err(Self::transient)?;

        debug!(tx_hash = %response.transaction_id, "Submitted transaction");
        Ok(response.transaction_id)
    }

    async fn get_transaction(&self, tx_hash: &str) -> Result<Option<LedgerTransaction>> {
        let url = format!("{}/transactions/{}", self.base_url, tx_hash);
        let response = self.client.get(&url).send().await.map_err(Self::transient)?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let tx: LedgerTransaction = response
            .error_for_status()
            .map_err(Self::transient)?
            .json()
            .await
            .map_err(Self::transient)?;
        Ok(Some(tx))
    }
}
