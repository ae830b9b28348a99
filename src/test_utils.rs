//! Shared fixtures for tests: fake node and wallet implementations of the
//! RPC capability traits, plus builders for tickets and fee transactions.

use crate::app::{AppCfg, AppState};
use crate::chain::{self, ChainParams, Tx, TxIn, TxOut};
use crate::db::{Store, DEFAULT_MAX_VOTE_CHANGES};
use crate::errors::Error;
use crate::node::{BlockHeader, Node, NodeError, RawTransaction};
use crate::wallet::{Wallet, WalletInfo, WalletPool};
use actix_web::web;
use async_trait::async_trait;
use parking_lot::Mutex;
use secp256k1::{PublicKey, Secp256k1, SecretKey};
use std::collections::HashMap;
use std::sync::Arc;

pub fn keypair(seed: u8) -> (SecretKey, PublicKey) {
    let secp = Secp256k1::new();
    let sk = SecretKey::from_slice(&[seed; 32]).expect("nonzero seed");
    let pk = PublicKey::from_secret_key(&secp, &sk);
    (sk, pk)
}

/// Base64 client signature over a request body, as carried in the
/// VSP-Client-Signature header.
pub fn sign_body(body: &[u8], sk: &SecretKey) -> String {
    base64::encode(chain::sign_message(body, sk))
}

/// Deterministic extended public key for address generation.
pub fn xpub_string(params: &ChainParams, seed: u8) -> String {
    let (_, pk) = keypair(seed);
    chain::ExtendedPubKey {
        depth: 0,
        parent_fingerprint: [0; 4],
        child_number: 0,
        chain_code: [seed; 32],
        pubkey: pk,
    }
    .encode(params)
}

/// A parent transaction paying to the commitment key, and a ticket that
/// spends it: voting rights for `voting_pk` in output zero, a commitment
/// to `commitment_pk` in output one.
pub fn make_parent_and_ticket(
    params: &ChainParams,
    voting_pk: &PublicKey,
    commitment_pk: &PublicKey,
    price: i64,
) -> (Tx, Tx) {
    let commitment_addr = chain::pubkey_address(commitment_pk, params);
    let parent = Tx {
        version: 1,
        inputs: vec![TxIn {
            prev_hash: "11".repeat(32),
            prev_index: 0,
            tree: 0,
            sequence: 0xffff_ffff,
        }],
        outputs: vec![TxOut {
            value: price + 100_000,
            version: 0,
            script: chain::pay_to_addr_script(&commitment_addr, params).unwrap(),
        }],
        lock_time: 0,
        expiry: 0,
    };
    let ticket = Tx {
        version: 1,
        inputs: vec![TxIn {
            prev_hash: parent.hash(),
            prev_index: 0,
            tree: 0,
            sequence: 0xffff_ffff,
        }],
        outputs: vec![
            TxOut {
                value: price,
                version: 0,
                script: chain::voting_rights_script(&chain::hash160(&voting_pk.serialize())),
            },
            TxOut {
                value: 0,
                version: 0,
                script: chain::ticket_commitment_script(
                    &chain::hash160(&commitment_pk.serialize()),
                    price,
                ),
            },
            TxOut {
                value: 0,
                version: 0,
                script: vec![chain::OP_SSTXCHANGE, chain::OP_RETURN],
            },
        ],
        lock_time: 0,
        expiry: 0,
    };
    (parent, ticket)
}

/// A transaction paying `amount` to the given fee address.
pub fn fee_tx_paying(addr: &str, amount: i64, params: &ChainParams) -> Tx {
    Tx {
        version: 1,
        inputs: vec![TxIn {
            prev_hash: "22".repeat(32),
            prev_index: 1,
            tree: 0,
            sequence: 0xffff_ffff,
        }],
        outputs: vec![TxOut {
            value: amount,
            version: 0,
            script: chain::pay_to_addr_script(addr, params).unwrap(),
        }],
        lock_time: 0,
        expiry: 0,
    }
}

pub fn test_cfg(network: &str, fee_xpub: String) -> AppCfg {
    AppCfg {
        listen: "127.0.0.1:0".to_owned(),
        db_file: String::new(),
        network: network.to_owned(),
        node_rpc_url: "https://127.0.0.1:9109".to_owned(),
        node_rpc_user: "user".to_owned(),
        node_rpc_pass: "pass".to_owned(),
        wallet_rpc_urls: "https://127.0.0.1:19110".to_owned(),
        wallet_rpc_user: "user".to_owned(),
        wallet_rpc_pass: "pass".to_owned(),
        fee_xpub,
        fee_percent: 3.0,
        admin_pass: "adminpass".to_owned(),
        vsp_closed: false,
        vsp_closed_msg: String::new(),
        max_vote_change_records: DEFAULT_MAX_VOTE_CHANGES,
        debug: true,
    }
}

/// A fully wired application state over fakes, backed by a store at the
/// given path.
pub struct TestEnv {
    pub state: web::Data<AppState>,
    pub node: Arc<FakeNode>,
    pub wallet: Arc<FakeWallet>,
}

pub fn test_state(db_path: &std::path::Path) -> TestEnv {
    let params = Arc::new(ChainParams::simnet());
    let cfg = test_cfg("simnet", xpub_string(&params, 0xab));
    test_state_with_cfg(db_path, cfg)
}

pub fn test_state_with_cfg(db_path: &std::path::Path, cfg: AppCfg) -> TestEnv {
    let params = Arc::new(ChainParams::simnet());
    let store = Arc::new(Store::open(db_path, cfg.max_vote_change_records).unwrap());
    let node = FakeNode::new();
    let wallet = FakeWallet::new("wallet-one:19110");
    let wallets = Arc::new(WalletPool::new(vec![wallet.clone() as Arc<dyn Wallet>]));
    let state = AppState::with_deps(cfg, params, store, node.clone(), wallets).unwrap();
    TestEnv {
        state: web::Data::new(state),
        node,
        wallet,
    }
}

#[derive(Default)]
pub struct FakeNode {
    pub txs: Mutex<HashMap<String, RawTransaction>>,
    pub broadcast: Mutex<Vec<String>>,
    pub best: Mutex<BlockHeader>,
    pub dcp0010: Mutex<bool>,
    /// Per-hash override for vote eligibility; unknown hashes default to
    /// votable.
    pub votable: Mutex<HashMap<String, bool>>,
    /// When set, every broadcast fails with this message.
    pub reject_broadcast: Mutex<Option<String>>,
}

impl FakeNode {
    pub fn new() -> Arc<FakeNode> {
        let node = FakeNode::default();
        *node.best.lock() = BlockHeader {
            hash: "00".repeat(32),
            height: 1000,
            pool_size: 40960,
            sbits: 100.0,
        };
        Arc::new(node)
    }

    pub fn add_tx(&self, tx: &Tx, confirmations: i64, blockheight: i64) {
        self.txs.lock().insert(
            tx.hash(),
            RawTransaction {
                hex: hex::encode(tx.serialize()),
                confirmations,
                blockhash: "bb".repeat(32),
                blockheight,
            },
        );
    }
}

#[async_trait]
impl Node for FakeNode {
    async fn get_raw_transaction(&self, hash: &str) -> Result<RawTransaction, NodeError> {
        self.txs
            .lock()
            .get(hash)
            .cloned()
            .ok_or_else(|| NodeError::UnknownTx(hash.to_owned()))
    }

    async fn send_raw_transaction(&self, tx_hex: &str) -> Result<String, NodeError> {
        if let Some(msg) = self.reject_broadcast.lock().clone() {
            return Err(NodeError::Rpc(msg));
        }
        let tx = chain::decode_tx_hex(tx_hex)
            .map_err(|e| NodeError::Rpc(format!("undecodable tx: {}", e)))?;
        let hash = tx.hash();
        self.broadcast.lock().push(tx_hex.to_owned());
        self.txs.lock().insert(
            hash.clone(),
            RawTransaction {
                hex: tx_hex.to_owned(),
                confirmations: 0,
                blockhash: String::new(),
                blockheight: 0,
            },
        );
        Ok(hash)
    }

    async fn best_block_header(&self) -> Result<BlockHeader, NodeError> {
        Ok(self.best.lock().clone())
    }

    async fn is_dcp0010_active(&self) -> Result<bool, NodeError> {
        Ok(*self.dcp0010.lock())
    }

    async fn can_ticket_vote(&self, _tx: &RawTransaction, hash: &str) -> Result<bool, NodeError> {
        Ok(self.votable.lock().get(hash).copied().unwrap_or(true))
    }
}

#[derive(Default)]
pub struct FakeWallet {
    pub host: String,
    pub unreachable: Mutex<bool>,
    pub imported: Mutex<Vec<String>>,
    pub added: Mutex<Vec<(String, String)>>,
    pub vote_choices: Mutex<Vec<(String, String, String)>>,
    pub tspend_policies: Mutex<Vec<(String, String, String)>>,
    pub treasury_policies: Mutex<Vec<(String, String, String)>>,
    /// When set, mutating calls fail with this message.
    pub fail_calls: Mutex<Option<String>>,
}

impl FakeWallet {
    pub fn new(host: &str) -> Arc<FakeWallet> {
        Arc::new(FakeWallet {
            host: host.to_owned(),
            ..FakeWallet::default()
        })
    }

    fn check(&self) -> Result<(), Error> {
        if let Some(msg) = self.fail_calls.lock().clone() {
            return Err(Error::WalletRpc(format!("{}: {}", self.host, msg)));
        }
        Ok(())
    }
}

#[async_trait]
impl Wallet for FakeWallet {
    fn host(&self) -> &str {
        &self.host
    }

    async fn wallet_info(&self) -> Result<WalletInfo, Error> {
        if *self.unreachable.lock() {
            return Err(Error::WalletRpc(format!("{}: connection refused", self.host)));
        }
        Ok(WalletInfo {
            voting: true,
            unlocked: true,
            vote_version: 10,
        })
    }

    async fn best_block_height(&self) -> Result<i64, Error> {
        Ok(1000)
    }

    async fn import_priv_key(&self, wif: &str) -> Result<(), Error> {
        self.check()?;
        self.imported.lock().push(wif.to_owned());
        Ok(())
    }

    async fn add_transaction(&self, block_hash: &str, tx_hex: &str) -> Result<(), Error> {
        self.check()?;
        self.added
            .lock()
            .push((block_hash.to_owned(), tx_hex.to_owned()));
        Ok(())
    }

    async fn set_vote_choice(
        &self,
        agenda: &str,
        choice: &str,
        ticket_hash: &str,
    ) -> Result<(), Error> {
        self.check()?;
        self.vote_choices.lock().push((
            agenda.to_owned(),
            choice.to_owned(),
            ticket_hash.to_owned(),
        ));
        Ok(())
    }

    async fn set_tspend_policy(
        &self,
        tspend_hash: &str,
        policy: &str,
        ticket_hash: &str,
    ) -> Result<(), Error> {
        self.check()?;
        self.tspend_policies.lock().push((
            tspend_hash.to_owned(),
            policy.to_owned(),
            ticket_hash.to_owned(),
        ));
        Ok(())
    }

    async fn set_treasury_policy(
        &self,
        key: &str,
        policy: &str,
        ticket_hash: &str,
    ) -> Result<(), Error> {
        self.check()?;
        self.treasury_policies.lock().push((
            key.to_owned(),
            policy.to_owned(),
            ticket_hash.to_owned(),
        ));
        Ok(())
    }
}
