//! Capability surface of the chain node, plus the JSON-RPC client that
//! implements it in production. Tests substitute their own
//! implementations of [`Node`].

use crate::jsonrpc::{self, RpcFailure};
use async_trait::async_trait;
use log::debug;
use reqwest::header::AUTHORIZATION;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

// dcrd returns this code when it has no information about a transaction.
const RPC_ERR_NO_TX_INFO: i32 = -5;

#[derive(Debug, Error)]
pub enum NodeError {
    /// Typed miss for transaction lookups, so callers can distinguish "the
    /// node has never seen this" from operational failures.
    #[error("no transaction with hash {0}")]
    UnknownTx(String),

    #[error("node RPC error: {0}")]
    Rpc(String),
}

impl From<NodeError> for crate::errors::Error {
    fn from(e: NodeError) -> Self {
        crate::errors::Error::NodeRpc(e.to_string())
    }
}

/// True when a broadcast rejection indicates the transaction spends
/// outputs the node does not know, which clients can repair by rebuilding
/// the transaction.
pub fn is_unknown_outputs_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("orphan")
        || (lower.contains("unknown") && lower.contains("output"))
        || (lower.contains("spent") && lower.contains("output"))
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawTransaction {
    pub hex: String,
    #[serde(default)]
    pub confirmations: i64,
    #[serde(default)]
    pub blockhash: String,
    #[serde(default)]
    pub blockheight: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BlockHeader {
    pub hash: String,
    pub height: i64,
    #[serde(rename = "poolsize", default)]
    pub pool_size: u32,
    /// Stake difficulty (ticket price) in whole coins.
    #[serde(default)]
    pub sbits: f64,
}

impl BlockHeader {
    /// Ticket price in atoms.
    pub fn sbits_atoms(&self) -> i64 {
        (self.sbits * 1e8).round() as i64
    }
}

#[async_trait]
pub trait Node: Send + Sync {
    async fn get_raw_transaction(&self, hash: &str) -> Result<RawTransaction, NodeError>;
    async fn send_raw_transaction(&self, tx_hex: &str) -> Result<String, NodeError>;
    async fn best_block_header(&self) -> Result<BlockHeader, NodeError>;
    async fn is_dcp0010_active(&self) -> Result<bool, NodeError>;
    /// Whether a ticket can still cast a vote: unmined, immature, or in
    /// the live pool.
    async fn can_ticket_vote(&self, tx: &RawTransaction, hash: &str) -> Result<bool, NodeError>;
}

/// JSON-RPC client for a trusted dcrd instance.
pub struct RpcNode {
    http: reqwest::Client,
    url: String,
    auth_header: String,
    ticket_maturity: i64,
}

impl RpcNode {
    pub fn new(url: &str, username: &str, password: &str, ticket_maturity: i64) -> Self {
        let auth = format!("{}:{}", username, password);
        let auth_header = format!("Basic {}", base64::encode(&auth));
        RpcNode {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("default reqwest client"),
            url: url.trim_end_matches('/').to_owned(),
            auth_header,
            ticket_maturity,
        }
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<serde_json::Value>,
    ) -> Result<T, RpcFailure> {
        debug!("node rpc {}", method);
        let request = jsonrpc::Request::new(method, params);
        let response = self
            .http
            .post(&self.url)
            .header(AUTHORIZATION, self.auth_header.clone())
            .json(&request)
            .send()
            .await
            .map_err(|e| RpcFailure::Decode(format!("request failed: {}", e)))?;
        let envelope: jsonrpc::Response = response
            .json()
            .await
            .map_err(|e| RpcFailure::Decode(format!("cannot decode response: {}", e)))?;
        envelope.into_result()
    }
}

#[async_trait]
impl Node for RpcNode {
    async fn get_raw_transaction(&self, hash: &str) -> Result<RawTransaction, NodeError> {
        match self
            .call("getrawtransaction", vec![json!(hash), json!(1)])
            .await
        {
            Ok(tx) => Ok(tx),
            Err(RpcFailure::Server(e)) if e.code == RPC_ERR_NO_TX_INFO => {
                Err(NodeError::UnknownTx(hash.to_owned()))
            }
            Err(e) => Err(NodeError::Rpc(e.to_string())),
        }
    }

    async fn send_raw_transaction(&self, tx_hex: &str) -> Result<String, NodeError> {
        self.call("sendrawtransaction", vec![json!(tx_hex)])
            .await
            .map_err(|e| NodeError::Rpc(e.to_string()))
    }

    async fn best_block_header(&self) -> Result<BlockHeader, NodeError> {
        let hash: String = self
            .call("getbestblockhash", vec![])
            .await
            .map_err(|e| NodeError::Rpc(e.to_string()))?;
        self.call("getblockheader", vec![json!(hash), json!(true)])
            .await
            .map_err(|e| NodeError::Rpc(e.to_string()))
    }

    async fn is_dcp0010_active(&self) -> Result<bool, NodeError> {
        let info: serde_json::Value = self
            .call("getblockchaininfo", vec![])
            .await
            .map_err(|e| NodeError::Rpc(e.to_string()))?;
        let status = info
            .pointer("/deployments/changesubsidysplit/status")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        Ok(status == "active")
    }

    async fn can_ticket_vote(&self, tx: &RawTransaction, hash: &str) -> Result<bool, NodeError> {
        // Not mined yet: it may still be, and vote later.
        if tx.confirmations == 0 {
            return Ok(true);
        }
        let live: bool = self
            .call("existsliveticket", vec![json!(hash)])
            .await
            .map_err(|e| NodeError::Rpc(e.to_string()))?;
        if live {
            return Ok(true);
        }
        // Mined but not live: votable only while still maturing.
        let best = self.best_block_header().await?;
        Ok(tx.blockheight + self.ticket_maturity >= best.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_outputs_detection() {
        assert!(is_unknown_outputs_error(
            "rejected transaction: orphan transaction"
        ));
        assert!(is_unknown_outputs_error(
            "references outputs of unknown or fully spent transaction"
        ));
        assert!(!is_unknown_outputs_error("insufficient fee"));
        assert!(!is_unknown_outputs_error("transaction already exists"));
    }

    #[test]
    fn raw_transaction_decodes_with_defaults() {
        let tx: RawTransaction = serde_json::from_str(r#"{"hex":"0100"}"#).unwrap();
        assert_eq!(tx.confirmations, 0);
        assert_eq!(tx.blockhash, "");
        assert_eq!(tx.blockheight, 0);
    }

    #[test]
    fn sbits_conversion() {
        let header = BlockHeader {
            sbits: 123.45678901,
            ..BlockHeader::default()
        };
        assert_eq!(header.sbits_atoms(), 12_345_678_901);
    }
}
