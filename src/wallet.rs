//! Capability surface of the voting wallets and the JSON-RPC client pool
//! implementing it. Every wallet holds the same voting keys; per-wallet
//! failures are reported but never fatal to the caller's request.

use crate::errors::Error;
use crate::jsonrpc;
use async_trait::async_trait;
use futures::future::join_all;
use log::{debug, warn};
use reqwest::header::AUTHORIZATION;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct WalletInfo {
    pub voting: bool,
    pub unlocked: bool,
    #[serde(rename = "voteversion", default)]
    pub vote_version: u32,
}

#[async_trait]
pub trait Wallet: Send + Sync {
    fn host(&self) -> &str;
    async fn wallet_info(&self) -> Result<WalletInfo, Error>;
    async fn best_block_height(&self) -> Result<i64, Error>;
    async fn import_priv_key(&self, wif: &str) -> Result<(), Error>;
    async fn add_transaction(&self, block_hash: &str, tx_hex: &str) -> Result<(), Error>;
    async fn set_vote_choice(
        &self,
        agenda: &str,
        choice: &str,
        ticket_hash: &str,
    ) -> Result<(), Error>;
    async fn set_tspend_policy(
        &self,
        tspend_hash: &str,
        policy: &str,
        ticket_hash: &str,
    ) -> Result<(), Error>;
    async fn set_treasury_policy(
        &self,
        key: &str,
        policy: &str,
        ticket_hash: &str,
    ) -> Result<(), Error>;
}

/// JSON-RPC client for one voting wallet.
pub struct RpcWallet {
    http: reqwest::Client,
    url: String,
    host: String,
    auth_header: String,
}

impl RpcWallet {
    pub fn new(url: &str, username: &str, password: &str) -> Self {
        let auth = format!("{}:{}", username, password);
        let auth_header = format!("Basic {}", base64::encode(&auth));
        let url = url.trim_end_matches('/').to_owned();
        RpcWallet {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("default reqwest client"),
            host: url.clone(),
            url,
            auth_header,
        }
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<serde_json::Value>,
    ) -> Result<T, Error> {
        debug!("wallet rpc {} on {}", method, self.host);
        let request = jsonrpc::Request::new(method, params);
        let response = self
            .http
            .post(&self.url)
            .header(AUTHORIZATION, self.auth_header.clone())
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::WalletRpc(format!("{}: request failed: {}", self.host, e)))?;
        let envelope: jsonrpc::Response = response
            .json()
            .await
            .map_err(|e| Error::WalletRpc(format!("{}: cannot decode response: {}", self.host, e)))?;
        envelope
            .into_result()
            .map_err(|e| Error::WalletRpc(format!("{}: {}", self.host, e)))
    }
}

#[async_trait]
impl Wallet for RpcWallet {
    fn host(&self) -> &str {
        &self.host
    }

    async fn wallet_info(&self) -> Result<WalletInfo, Error> {
        self.call("walletinfo", vec![]).await
    }

    async fn best_block_height(&self) -> Result<i64, Error> {
        #[derive(Deserialize)]
        struct BestBlock {
            height: i64,
        }
        let best: BestBlock = self.call("getbestblock", vec![]).await?;
        Ok(best.height)
    }

    async fn import_priv_key(&self, wif: &str) -> Result<(), Error> {
        // Rescanning is pointless: the ticket is added explicitly.
        self.call(
            "importprivkey",
            vec![json!(wif), json!("imported"), json!(false)],
        )
        .await
    }

    async fn add_transaction(&self, block_hash: &str, tx_hex: &str) -> Result<(), Error> {
        self.call("addtransaction", vec![json!(block_hash), json!(tx_hex)])
            .await
    }

    async fn set_vote_choice(
        &self,
        agenda: &str,
        choice: &str,
        ticket_hash: &str,
    ) -> Result<(), Error> {
        self.call(
            "setvotechoice",
            vec![json!(agenda), json!(choice), json!(ticket_hash)],
        )
        .await
    }

    async fn set_tspend_policy(
        &self,
        tspend_hash: &str,
        policy: &str,
        ticket_hash: &str,
    ) -> Result<(), Error> {
        self.call(
            "settspendpolicy",
            vec![json!(tspend_hash), json!(policy), json!(ticket_hash)],
        )
        .await
    }

    async fn set_treasury_policy(
        &self,
        key: &str,
        policy: &str,
        ticket_hash: &str,
    ) -> Result<(), Error> {
        self.call(
            "settreasurypolicy",
            vec![json!(key), json!(policy), json!(ticket_hash)],
        )
        .await
    }
}

/// The set of configured voting wallets.
pub struct WalletPool {
    wallets: Vec<Arc<dyn Wallet>>,
}

impl WalletPool {
    pub fn new(wallets: Vec<Arc<dyn Wallet>>) -> Self {
        WalletPool { wallets }
    }

    /// Builds a pool from a comma-separated URL list sharing one set of
    /// credentials.
    pub fn from_cfg(urls: &str, username: &str, password: &str) -> Self {
        let wallets = urls
            .split(',')
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .map(|u| Arc::new(RpcWallet::new(u, username, password)) as Arc<dyn Wallet>)
            .collect();
        WalletPool { wallets }
    }

    pub fn len(&self) -> usize {
        self.wallets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wallets.is_empty()
    }

    /// Partitions the pool into reachable clients and the hosts that
    /// failed, probing each wallet once. Wallets with voting disabled or
    /// locked keys are still usable but get a warning.
    pub async fn clients(&self) -> (Vec<Arc<dyn Wallet>>, Vec<String>) {
        let probes = join_all(self.wallets.iter().map(|w| async move {
            let info = w.wallet_info().await;
            (w, info)
        }))
        .await;

        let mut connected = Vec::new();
        let mut failed = Vec::new();
        for (wallet, info) in probes {
            match info {
                Ok(info) => {
                    if !info.voting {
                        warn!("wallet {} has voting disabled", wallet.host());
                    }
                    if !info.unlocked {
                        warn!("wallet {} is locked", wallet.host());
                    }
                    connected.push(wallet.clone());
                }
                Err(e) => {
                    warn!("wallet {} unreachable: {}", wallet.host(), e);
                    failed.push(wallet.host().to_owned());
                }
            }
        }
        (connected, failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubWallet {
        host: String,
        reachable: bool,
    }

    #[async_trait]
    impl Wallet for StubWallet {
        fn host(&self) -> &str {
            &self.host
        }

        async fn wallet_info(&self) -> Result<WalletInfo, Error> {
            if self.reachable {
                Ok(WalletInfo {
                    voting: true,
                    unlocked: true,
                    vote_version: 10,
                })
            } else {
                Err(Error::WalletRpc(format!("{}: connection refused", self.host)))
            }
        }

        async fn best_block_height(&self) -> Result<i64, Error> {
            Ok(0)
        }
        async fn import_priv_key(&self, _: &str) -> Result<(), Error> {
            Ok(())
        }
        async fn add_transaction(&self, _: &str, _: &str) -> Result<(), Error> {
            Ok(())
        }
        async fn set_vote_choice(&self, _: &str, _: &str, _: &str) -> Result<(), Error> {
            Ok(())
        }
        async fn set_tspend_policy(&self, _: &str, _: &str, _: &str) -> Result<(), Error> {
            Ok(())
        }
        async fn set_treasury_policy(&self, _: &str, _: &str, _: &str) -> Result<(), Error> {
            Ok(())
        }
    }

    #[actix_rt::test]
    async fn clients_partitions_by_reachability() {
        let wallets: Vec<Arc<dyn Wallet>> = vec![
            Arc::new(StubWallet {
                host: "alpha:19110".to_owned(),
                reachable: true,
            }),
            Arc::new(StubWallet {
                host: "beta:19110".to_owned(),
                reachable: false,
            }),
            Arc::new(StubWallet {
                host: "gamma:19110".to_owned(),
                reachable: true,
            }),
        ];
        let pool = WalletPool::new(wallets);
        let (connected, failed) = pool.clients().await;
        assert_eq!(connected.len(), 2);
        assert_eq!(failed, vec!["beta:19110".to_owned()]);
        assert_eq!(pool.len(), 3);
    }

    #[test]
    fn pool_from_cfg_splits_urls() {
        let pool = WalletPool::from_cfg(
            "https://one:19110, https://two:19110 ,",
            "user",
            "pass",
        );
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.wallets[0].host(), "https://one:19110");
    }
}
