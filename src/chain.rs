//! Chain-domain primitives consumed by the registration protocol: network
//! parameters, transaction decoding, script construction, addresses, WIF
//! keys, signed messages and extended public key derivation.

use hmac::{Hmac, Mac};
use lazy_static::lazy_static;
use ripemd::Ripemd160;
use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{All, Message, PublicKey, Scalar, Secp256k1, SecretKey};
use sha2::{Digest, Sha256, Sha512};
use std::collections::HashMap;
use thiserror::Error;

lazy_static! {
    static ref SECP: Secp256k1<All> = Secp256k1::new();
}

pub const OP_RETURN: u8 = 0x6a;
pub const OP_DUP: u8 = 0x76;
pub const OP_EQUALVERIFY: u8 = 0x88;
pub const OP_HASH160: u8 = 0xa9;
pub const OP_CHECKSIG: u8 = 0xac;
pub const OP_SSTX: u8 = 0xba;
pub const OP_SSTXCHANGE: u8 = 0xbd;
pub const OP_DATA_20: u8 = 0x14;
pub const OP_DATA_30: u8 = 0x1e;

/// Largest amount of atoms a single output may carry.
pub const MAX_ATOMS: i64 = 21_000_000 * 100_000_000;

const MESSAGE_MAGIC: &str = "Decred Signed Message:\n";

/// Accepted values for treasury and treasury-spend policy entries.
pub const POLICY_VALUES: [&str; 5] = ["", "yes", "no", "abstain", "invalid"];

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("cannot decode transaction: {0}")]
    TxDecode(String),

    #[error("invalid address: {0}")]
    Address(String),

    #[error("invalid private key: {0}")]
    PrivKey(String),

    #[error("invalid extended public key: {0}")]
    Xpub(String),

    #[error("derived child is not a valid point")]
    InvalidChild,

    #[error("cannot derive hardened child from a public key")]
    HardenedChild,

    #[error("invalid signature: {0}")]
    Signature(String),

    #[error("{0}")]
    Invalid(String),
}

/// A consensus agenda that tickets may vote on.
#[derive(Debug, Clone)]
pub struct Agenda {
    pub id: String,
    pub choices: Vec<String>,
}

impl Agenda {
    fn new(id: &str) -> Self {
        Agenda {
            id: id.to_owned(),
            choices: vec!["abstain".to_owned(), "no".to_owned(), "yes".to_owned()],
        }
    }
}

/// Static parameters of one network deployment.
#[derive(Debug, Clone)]
pub struct ChainParams {
    pub name: &'static str,
    pub pubkey_hash_addr_id: [u8; 2],
    pub wif_privkey_id: [u8; 2],
    pub hd_public_key_id: [u8; 4],
    pub block_time_seconds: i64,
    pub ticket_maturity: i64,
    pub ticket_expiry: i64,
    pub ticket_pool_target: i64,
    pub votes_per_block: i64,
    pub base_subsidy: i64,
    pub mul_subsidy: i64,
    pub div_subsidy: i64,
    pub subsidy_reduction_interval: i64,
    pub work_subsidy_proportion: i64,
    pub vote_subsidy_proportion: i64,
    pub treasury_subsidy_proportion: i64,
    pub dcp0010_work_proportion: i64,
    pub dcp0010_vote_proportion: i64,
    pub relay_fee: i64,
    pub agendas: Vec<Agenda>,
}

impl ChainParams {
    pub fn mainnet() -> Self {
        ChainParams {
            name: "mainnet",
            pubkey_hash_addr_id: [0x07, 0x3f],
            wif_privkey_id: [0x22, 0xde],
            hd_public_key_id: [0x02, 0xfd, 0xa9, 0x26],
            block_time_seconds: 300,
            ticket_maturity: 256,
            ticket_expiry: 40960,
            ticket_pool_target: 40960,
            votes_per_block: 5,
            base_subsidy: 3_119_582_664,
            mul_subsidy: 100,
            div_subsidy: 101,
            subsidy_reduction_interval: 6144,
            work_subsidy_proportion: 6,
            vote_subsidy_proportion: 3,
            treasury_subsidy_proportion: 1,
            dcp0010_work_proportion: 1,
            dcp0010_vote_proportion: 8,
            relay_fee: 10_000,
            agendas: vec![
                Agenda::new("blake3pow"),
                Agenda::new("changesubsidysplitr2"),
                Agenda::new("changesubsidysplit"),
                Agenda::new("autorevocations"),
                Agenda::new("explicitverupgrades"),
                Agenda::new("reverttreasurypolicy"),
                Agenda::new("treasury"),
            ],
        }
    }

    pub fn testnet() -> Self {
        ChainParams {
            name: "testnet",
            pubkey_hash_addr_id: [0x0f, 0x21],
            wif_privkey_id: [0x23, 0x0e],
            hd_public_key_id: [0x04, 0x35, 0x87, 0xd1],
            block_time_seconds: 120,
            ticket_maturity: 16,
            ticket_expiry: 6144,
            ticket_pool_target: 1024,
            ..ChainParams::mainnet()
        }
    }

    pub fn simnet() -> Self {
        ChainParams {
            name: "simnet",
            pubkey_hash_addr_id: [0x0e, 0x91],
            wif_privkey_id: [0x23, 0x07],
            hd_public_key_id: [0x04, 0x20, 0xbd, 0x3d],
            block_time_seconds: 1,
            ticket_maturity: 16,
            ticket_expiry: 384,
            ticket_pool_target: 64,
            base_subsidy: 50_000_000_000,
            subsidy_reduction_interval: 128,
            ..ChainParams::mainnet()
        }
    }

    pub fn from_name(name: &str) -> Result<Self, ChainError> {
        match name {
            "mainnet" => Ok(ChainParams::mainnet()),
            "testnet" => Ok(ChainParams::testnet()),
            "simnet" => Ok(ChainParams::simnet()),
            other => Err(ChainError::Invalid(format!("unknown network {:?}", other))),
        }
    }

    pub fn agenda(&self, id: &str) -> Option<&Agenda> {
        self.agendas.iter().find(|a| a.id == id)
    }

    /// Full subsidy of the block at the given height, after the periodic
    /// reductions up to that point.
    fn block_subsidy(&self, height: i64) -> i64 {
        let mut subsidy = self.base_subsidy;
        let reductions = height / self.subsidy_reduction_interval;
        for _ in 0..reductions {
            subsidy = subsidy * self.mul_subsidy / self.div_subsidy;
            if subsidy == 0 {
                break;
            }
        }
        subsidy
    }

    /// Subsidy paid to a single vote at the given height. The DCP0010
    /// flag selects the modified work/vote split.
    pub fn vote_subsidy(&self, height: i64, dcp0010_active: bool) -> i64 {
        let (work, vote) = if dcp0010_active {
            (self.dcp0010_work_proportion, self.dcp0010_vote_proportion)
        } else {
            (self.work_subsidy_proportion, self.vote_subsidy_proportion)
        };
        let total_proportions = work + vote + self.treasury_subsidy_proportion;
        let total = self.block_subsidy(height);
        total * vote / total_proportions / self.votes_per_block
    }

    /// Fee a stake pool charges for a ticket, as a function of the ticket
    /// price, the relay fee, the vote subsidy at the current height and
    /// the pool's fee percentage.
    pub fn stake_pool_ticket_fee(
        &self,
        stake_diff: i64,
        relay_fee: i64,
        height: i64,
        fee_percent: f64,
        dcp0010_active: bool,
    ) -> i64 {
        let subsidy = self.vote_subsidy(height, dcp0010_active);
        pool_fee(subsidy, stake_diff, relay_fee, fee_percent)
    }
}

// The proportion is scaled to basis points so the division stays in
// integer arithmetic: fee = p * s * (v + z) / ((s + v) * 10000).
fn pool_fee(subsidy: i64, stake_diff: i64, relay_fee: i64, fee_percent: f64) -> i64 {
    let basis_points = (fee_percent * 100.0).floor() as i128;
    let s = subsidy as i128;
    let v = stake_diff as i128;
    let z = relay_fee as i128;
    let num = basis_points * s * (v + z);
    let den = (s + v) * 10_000;
    if den == 0 {
        return 0;
    }
    (num / den) as i64
}

pub fn sha256d(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    second.into()
}

pub fn hash160(data: &[u8]) -> [u8; 20] {
    let sha = Sha256::digest(data);
    Ripemd160::digest(sha).into()
}

fn base58check_encode(payload: &[u8]) -> String {
    let mut data = payload.to_vec();
    let checksum = sha256d(&data);
    data.extend_from_slice(&checksum[..4]);
    bs58::encode(data).into_string()
}

fn base58check_decode(s: &str) -> Result<Vec<u8>, ChainError> {
    let data = bs58::decode(s)
        .into_vec()
        .map_err(|e| ChainError::Address(format!("base58 decode: {}", e)))?;
    if data.len() < 5 {
        return Err(ChainError::Address("payload too short".to_owned()));
    }
    let (payload, checksum) = data.split_at(data.len() - 4);
    if sha256d(payload)[..4] != *checksum {
        return Err(ChainError::Address("checksum mismatch".to_owned()));
    }
    Ok(payload.to_vec())
}

/// Encodes a pubkey hash as a pay-to-pubkey-hash address on the network.
pub fn pubkey_hash_address(hash: &[u8; 20], params: &ChainParams) -> String {
    let mut payload = Vec::with_capacity(22);
    payload.extend_from_slice(&params.pubkey_hash_addr_id);
    payload.extend_from_slice(hash);
    base58check_encode(&payload)
}

/// Decodes a pay-to-pubkey-hash address, verifying checksum and network.
pub fn decode_address(addr: &str, params: &ChainParams) -> Result<[u8; 20], ChainError> {
    let payload = base58check_decode(addr)?;
    if payload.len() != 22 {
        return Err(ChainError::Address(format!(
            "wrong payload length {}",
            payload.len()
        )));
    }
    if payload[..2] != params.pubkey_hash_addr_id {
        return Err(ChainError::Address(format!(
            "wrong network prefix for {}",
            params.name
        )));
    }
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&payload[2..]);
    Ok(hash)
}

pub fn pubkey_address(pk: &PublicKey, params: &ChainParams) -> String {
    pubkey_hash_address(&hash160(&pk.serialize()), params)
}

/// Standard pay-to-pubkey-hash output script for an address.
pub fn pay_to_addr_script(addr: &str, params: &ChainParams) -> Result<Vec<u8>, ChainError> {
    let hash = decode_address(addr, params)?;
    let mut script = Vec::with_capacity(25);
    script.push(OP_DUP);
    script.push(OP_HASH160);
    script.push(OP_DATA_20);
    script.extend_from_slice(&hash);
    script.push(OP_EQUALVERIFY);
    script.push(OP_CHECKSIG);
    Ok(script)
}

/// Stake-submission tagged pay-to-pubkey-hash script; output zero of every
/// ticket carries one of these and it locks the voting rights.
pub fn voting_rights_script(hash: &[u8; 20]) -> Vec<u8> {
    let mut script = Vec::with_capacity(26);
    script.push(OP_SSTX);
    script.push(OP_DUP);
    script.push(OP_HASH160);
    script.push(OP_DATA_20);
    script.extend_from_slice(hash);
    script.push(OP_EQUALVERIFY);
    script.push(OP_CHECKSIG);
    script
}

fn is_voting_rights_script(script: &[u8]) -> bool {
    script.len() == 26
        && script[0] == OP_SSTX
        && script[1] == OP_DUP
        && script[2] == OP_HASH160
        && script[3] == OP_DATA_20
        && script[24] == OP_EQUALVERIFY
        && script[25] == OP_CHECKSIG
}

/// Null-data commitment script carried in output one of a ticket:
/// OP_RETURN followed by the 20-byte commitment hash, the 8-byte committed
/// amount and 2 bytes of fee limits.
pub fn ticket_commitment_script(hash: &[u8; 20], amount: i64) -> Vec<u8> {
    let mut script = Vec::with_capacity(32);
    script.push(OP_RETURN);
    script.push(OP_DATA_30);
    script.extend_from_slice(hash);
    script.extend_from_slice(&amount.to_le_bytes());
    script.extend_from_slice(&[0x00, 0x58]);
    script
}

fn is_commitment_script(script: &[u8]) -> bool {
    script.len() == 32 && script[0] == OP_RETURN && script[1] == OP_DATA_30
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxIn {
    pub prev_hash: String,
    pub prev_index: u32,
    pub tree: u8,
    pub sequence: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOut {
    pub value: i64,
    pub version: u16,
    pub script: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tx {
    pub version: u32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub lock_time: u32,
    pub expiry: u32,
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ChainError> {
        if self.buf.len() - self.pos < n {
            return Err(ChainError::TxDecode("unexpected end of input".to_owned()));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, ChainError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, ChainError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, ChainError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, ChainError> {
        let b = self.take(8)?;
        let mut a = [0u8; 8];
        a.copy_from_slice(b);
        Ok(u64::from_le_bytes(a))
    }

    fn varint(&mut self) -> Result<u64, ChainError> {
        match self.u8()? {
            n @ 0..=0xfc => Ok(n as u64),
            0xfd => Ok(self.u16()? as u64),
            0xfe => Ok(self.u32()? as u64),
            0xff => self.u64(),
        }
    }

    fn done(&self) -> bool {
        self.pos == self.buf.len()
    }
}

fn write_varint(out: &mut Vec<u8>, n: u64) {
    match n {
        0..=0xfc => out.push(n as u8),
        0xfd..=0xffff => {
            out.push(0xfd);
            out.extend_from_slice(&(n as u16).to_le_bytes());
        }
        0x10000..=0xffff_ffff => {
            out.push(0xfe);
            out.extend_from_slice(&(n as u32).to_le_bytes());
        }
        _ => {
            out.push(0xff);
            out.extend_from_slice(&n.to_le_bytes());
        }
    }
}

// Hashes are displayed as hex in reverse byte order; the wire carries the
// forward order.
fn hash_to_wire(hash: &str) -> Result<[u8; 32], ChainError> {
    let bytes = hex::decode(hash).map_err(|e| ChainError::TxDecode(format!("bad hash: {}", e)))?;
    if bytes.len() != 32 {
        return Err(ChainError::TxDecode("hash must be 32 bytes".to_owned()));
    }
    let mut out = [0u8; 32];
    for (i, b) in bytes.iter().rev().enumerate() {
        out[i] = *b;
    }
    Ok(out)
}

fn wire_to_hash(bytes: &[u8]) -> String {
    let mut rev: Vec<u8> = bytes.to_vec();
    rev.reverse();
    hex::encode(rev)
}

impl Tx {
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.version.to_le_bytes());
        write_varint(&mut out, self.inputs.len() as u64);
        for input in &self.inputs {
            // Serialization failure of a hash we produced is a programming
            // error, and inputs are validated on construction.
            let wire = hash_to_wire(&input.prev_hash).unwrap_or([0u8; 32]);
            out.extend_from_slice(&wire);
            out.extend_from_slice(&input.prev_index.to_le_bytes());
            out.push(input.tree);
            out.extend_from_slice(&input.sequence.to_le_bytes());
        }
        write_varint(&mut out, self.outputs.len() as u64);
        for output in &self.outputs {
            out.extend_from_slice(&(output.value as u64).to_le_bytes());
            out.extend_from_slice(&output.version.to_le_bytes());
            write_varint(&mut out, output.script.len() as u64);
            out.extend_from_slice(&output.script);
        }
        out.extend_from_slice(&self.lock_time.to_le_bytes());
        out.extend_from_slice(&self.expiry.to_le_bytes());
        out
    }

    pub fn deserialize(buf: &[u8]) -> Result<Tx, ChainError> {
        let mut r = Reader::new(buf);
        let version = r.u32()?;
        let n_in = r.varint()?;
        if n_in > 4096 {
            return Err(ChainError::TxDecode("too many inputs".to_owned()));
        }
        let mut inputs = Vec::with_capacity(n_in as usize);
        for _ in 0..n_in {
            let prev_hash = wire_to_hash(r.take(32)?);
            let prev_index = r.u32()?;
            let tree = r.u8()?;
            let sequence = r.u32()?;
            inputs.push(TxIn {
                prev_hash,
                prev_index,
                tree,
                sequence,
            });
        }
        let n_out = r.varint()?;
        if n_out > 4096 {
            return Err(ChainError::TxDecode("too many outputs".to_owned()));
        }
        let mut outputs = Vec::with_capacity(n_out as usize);
        for _ in 0..n_out {
            let value = r.u64()? as i64;
            let version = r.u16()?;
            let script_len = r.varint()? as usize;
            if script_len > 16384 {
                return Err(ChainError::TxDecode("script too long".to_owned()));
            }
            let script = r.take(script_len)?.to_vec();
            outputs.push(TxOut {
                value,
                version,
                script,
            });
        }
        let lock_time = r.u32()?;
        let expiry = r.u32()?;
        if !r.done() {
            return Err(ChainError::TxDecode("trailing bytes".to_owned()));
        }
        Ok(Tx {
            version,
            inputs,
            outputs,
            lock_time,
            expiry,
        })
    }

    pub fn hash(&self) -> String {
        wire_to_hash(&sha256d(&self.serialize()))
    }
}

pub fn decode_tx_hex(hex_str: &str) -> Result<Tx, ChainError> {
    let bytes =
        hex::decode(hex_str).map_err(|e| ChainError::TxDecode(format!("bad hex: {}", e)))?;
    Tx::deserialize(&bytes)
}

/// Structural sanity checks applied to any transaction submitted by a
/// client before it is considered for broadcast.
pub fn check_transaction_sanity(tx: &Tx) -> Result<(), ChainError> {
    if tx.inputs.is_empty() {
        return Err(ChainError::Invalid("transaction has no inputs".to_owned()));
    }
    if tx.outputs.is_empty() {
        return Err(ChainError::Invalid("transaction has no outputs".to_owned()));
    }
    let mut total: i64 = 0;
    for output in &tx.outputs {
        if output.value < 0 || output.value > MAX_ATOMS {
            return Err(ChainError::Invalid(format!(
                "output value {} out of range",
                output.value
            )));
        }
        total = total.saturating_add(output.value);
        if total > MAX_ATOMS {
            return Err(ChainError::Invalid("total output value out of range".to_owned()));
        }
    }
    for (i, a) in tx.inputs.iter().enumerate() {
        for b in tx.inputs.iter().skip(i + 1) {
            if a.prev_hash == b.prev_hash && a.prev_index == b.prev_index {
                return Err(ChainError::Invalid("duplicate transaction inputs".to_owned()));
            }
        }
    }
    Ok(())
}

/// Verifies the transaction is a well-formed stake submission: exactly
/// three outputs, voting rights in output zero, a commitment in output one
/// and a tagged change output.
pub fn check_stake_submission(tx: &Tx) -> Result<(), ChainError> {
    check_transaction_sanity(tx)?;
    if tx.outputs.len() != 3 {
        return Err(ChainError::Invalid(format!(
            "ticket has {} outputs, want 3",
            tx.outputs.len()
        )));
    }
    if !is_voting_rights_script(&tx.outputs[0].script) {
        return Err(ChainError::Invalid(
            "output 0 is not a stake submission script".to_owned(),
        ));
    }
    if !is_commitment_script(&tx.outputs[1].script) {
        return Err(ChainError::Invalid(
            "output 1 is not a ticket commitment script".to_owned(),
        ));
    }
    if tx.outputs[2].script.first() != Some(&OP_SSTXCHANGE) {
        return Err(ChainError::Invalid(
            "output 2 is not a stake change script".to_owned(),
        ));
    }
    Ok(())
}

/// Extracts the commitment address from output one of a ticket.
pub fn commitment_address(tx: &Tx, params: &ChainParams) -> Result<String, ChainError> {
    if tx.outputs.len() < 2 {
        return Err(ChainError::Invalid("missing commitment output".to_owned()));
    }
    let script = &tx.outputs[1].script;
    if !is_commitment_script(script) {
        return Err(ChainError::Invalid("not a ticket commitment script".to_owned()));
    }
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&script[2..22]);
    Ok(pubkey_hash_address(&hash, params))
}

/// Encodes a secret key in wallet import format with the compressed
/// pubkey marker.
pub fn wif_encode(sk: &SecretKey, params: &ChainParams) -> String {
    let mut payload = Vec::with_capacity(35);
    payload.extend_from_slice(&params.wif_privkey_id);
    payload.extend_from_slice(&sk.secret_bytes());
    payload.push(0x01);
    base58check_encode(&payload)
}

pub fn wif_decode(wif: &str, params: &ChainParams) -> Result<SecretKey, ChainError> {
    let payload = base58check_decode(wif).map_err(|e| ChainError::PrivKey(e.to_string()))?;
    if payload.len() != 35 {
        return Err(ChainError::PrivKey(format!(
            "wrong payload length {}",
            payload.len()
        )));
    }
    if payload[..2] != params.wif_privkey_id {
        return Err(ChainError::PrivKey(format!(
            "wrong network prefix for {}",
            params.name
        )));
    }
    if payload[34] != 0x01 {
        return Err(ChainError::PrivKey("missing compressed key marker".to_owned()));
    }
    SecretKey::from_slice(&payload[2..34]).map_err(|e| ChainError::PrivKey(e.to_string()))
}

/// Voting rights script controlled by a WIF-encoded private key.
pub fn wif_voting_script(wif: &str, params: &ChainParams) -> Result<Vec<u8>, ChainError> {
    let sk = wif_decode(wif, params)?;
    let pk = PublicKey::from_secret_key(&SECP, &sk);
    Ok(voting_rights_script(&hash160(&pk.serialize())))
}

fn message_digest(msg: &[u8]) -> [u8; 32] {
    let mut buf = Vec::with_capacity(MESSAGE_MAGIC.len() + msg.len() + 18);
    write_varint(&mut buf, MESSAGE_MAGIC.len() as u64);
    buf.extend_from_slice(MESSAGE_MAGIC.as_bytes());
    write_varint(&mut buf, msg.len() as u64);
    buf.extend_from_slice(msg);
    sha256d(&buf)
}

/// Signs a message with a compact recoverable signature so the signer's
/// address can be recovered during verification.
pub fn sign_message(msg: &[u8], sk: &SecretKey) -> Vec<u8> {
    let digest = Message::from_digest(message_digest(msg));
    let sig = SECP.sign_ecdsa_recoverable(&digest, sk);
    let (rec_id, compact) = sig.serialize_compact();
    let mut out = Vec::with_capacity(65);
    // Header byte 27 + recovery id, + 4 for a compressed pubkey.
    out.push(27 + rec_id.to_i32() as u8 + 4);
    out.extend_from_slice(&compact);
    out
}

/// Verifies a compact recoverable signature over a message against the
/// pay-to-pubkey-hash address of the signing key.
pub fn verify_message(
    addr: &str,
    sig: &[u8],
    msg: &[u8],
    params: &ChainParams,
) -> Result<bool, ChainError> {
    if sig.len() != 65 {
        return Err(ChainError::Signature(format!(
            "wrong signature length {}",
            sig.len()
        )));
    }
    let header = sig[0];
    if !(27..=34).contains(&header) {
        return Err(ChainError::Signature(format!("invalid header byte {}", header)));
    }
    let compressed = header >= 31;
    let rec_id = RecoveryId::from_i32(((header - 27) & 3) as i32)
        .map_err(|e| ChainError::Signature(e.to_string()))?;
    let recoverable = RecoverableSignature::from_compact(&sig[1..], rec_id)
        .map_err(|e| ChainError::Signature(e.to_string()))?;
    let digest = Message::from_digest(message_digest(msg));
    let pk = SECP
        .recover_ecdsa(&digest, &recoverable)
        .map_err(|e| ChainError::Signature(e.to_string()))?;
    let serialized = if compressed {
        pk.serialize().to_vec()
    } else {
        pk.serialize_uncompressed().to_vec()
    };
    let recovered = pubkey_hash_address(&hash160(&serialized), params);
    Ok(recovered == addr)
}

/// A BIP32 extended public key restricted to what address generation
/// needs: parsing, non-hardened child derivation and address encoding.
#[derive(Debug, Clone)]
pub struct ExtendedPubKey {
    pub depth: u8,
    pub parent_fingerprint: [u8; 4],
    pub child_number: u32,
    pub chain_code: [u8; 32],
    pub pubkey: PublicKey,
}

impl ExtendedPubKey {
    pub fn parse(s: &str, params: &ChainParams) -> Result<Self, ChainError> {
        let payload = base58check_decode(s).map_err(|e| ChainError::Xpub(e.to_string()))?;
        if payload.len() != 78 {
            return Err(ChainError::Xpub(format!(
                "wrong payload length {}",
                payload.len()
            )));
        }
        if payload[..4] != params.hd_public_key_id {
            return Err(ChainError::Xpub(format!(
                "wrong version bytes for {}",
                params.name
            )));
        }
        let depth = payload[4];
        let mut parent_fingerprint = [0u8; 4];
        parent_fingerprint.copy_from_slice(&payload[5..9]);
        let child_number = u32::from_be_bytes([payload[9], payload[10], payload[11], payload[12]]);
        let mut chain_code = [0u8; 32];
        chain_code.copy_from_slice(&payload[13..45]);
        let pubkey = PublicKey::from_slice(&payload[45..78])
            .map_err(|e| ChainError::Xpub(format!("bad public key: {}", e)))?;
        Ok(ExtendedPubKey {
            depth,
            parent_fingerprint,
            child_number,
            chain_code,
            pubkey,
        })
    }

    pub fn encode(&self, params: &ChainParams) -> String {
        let mut payload = Vec::with_capacity(78);
        payload.extend_from_slice(&params.hd_public_key_id);
        payload.push(self.depth);
        payload.extend_from_slice(&self.parent_fingerprint);
        payload.extend_from_slice(&self.child_number.to_be_bytes());
        payload.extend_from_slice(&self.chain_code);
        payload.extend_from_slice(&self.pubkey.serialize());
        base58check_encode(&payload)
    }

    /// Derives the non-hardened child at the given index. Fails with
    /// `InvalidChild` for the (astronomically rare) indices whose derived
    /// key is not a valid curve point; callers skip those indices.
    pub fn child(&self, index: u32) -> Result<ExtendedPubKey, ChainError> {
        if index >= 0x8000_0000 {
            return Err(ChainError::HardenedChild);
        }
        let mut mac = Hmac::<Sha512>::new_from_slice(&self.chain_code)
            .map_err(|e| ChainError::Xpub(e.to_string()))?;
        mac.update(&self.pubkey.serialize());
        mac.update(&index.to_be_bytes());
        let i = mac.finalize().into_bytes();
        let mut il = [0u8; 32];
        il.copy_from_slice(&i[..32]);
        let mut chain_code = [0u8; 32];
        chain_code.copy_from_slice(&i[32..]);

        let tweak = Scalar::from_be_bytes(il).map_err(|_| ChainError::InvalidChild)?;
        let pubkey = self
            .pubkey
            .add_exp_tweak(&SECP, &tweak)
            .map_err(|_| ChainError::InvalidChild)?;

        let fingerprint = hash160(&self.pubkey.serialize());
        let mut parent_fingerprint = [0u8; 4];
        parent_fingerprint.copy_from_slice(&fingerprint[..4]);
        Ok(ExtendedPubKey {
            depth: self.depth + 1,
            parent_fingerprint,
            child_number: index,
            chain_code,
            pubkey,
        })
    }

    pub fn address(&self, params: &ChainParams) -> String {
        pubkey_address(&self.pubkey, params)
    }
}

/// Checks vote choices against the consensus agenda catalogue. Returns the
/// offending description on failure so callers can decide whether to
/// reject or drop.
pub fn validate_vote_choices(
    choices: &HashMap<String, String>,
    params: &ChainParams,
) -> Result<(), String> {
    for (agenda_id, choice) in choices {
        let agenda = match params.agenda(agenda_id) {
            Some(a) => a,
            None => return Err(format!("no agenda with id {:?}", agenda_id)),
        };
        if !agenda.choices.iter().any(|c| c == choice) {
            return Err(format!(
                "choice {:?} not valid for agenda {:?}",
                choice, agenda_id
            ));
        }
    }
    Ok(())
}

/// Treasury policy keys are 33-byte compressed pubkeys in hex.
pub fn validate_treasury_policy(policy: &HashMap<String, String>) -> Result<(), String> {
    for (key, value) in policy {
        let bytes = hex::decode(key).map_err(|e| format!("bad policy key {:?}: {}", key, e))?;
        if bytes.len() != 33 {
            return Err(format!("policy key {:?} is not a 33 byte pubkey", key));
        }
        validate_policy_value(value)?;
    }
    Ok(())
}

/// Treasury-spend policy keys are 32-byte transaction hashes in hex.
pub fn validate_tspend_policy(policy: &HashMap<String, String>) -> Result<(), String> {
    for (key, value) in policy {
        let bytes = hex::decode(key).map_err(|e| format!("bad policy key {:?}: {}", key, e))?;
        if bytes.len() != 32 {
            return Err(format!("policy key {:?} is not a 32 byte hash", key));
        }
        validate_policy_value(value)?;
    }
    Ok(())
}

fn validate_policy_value(value: &str) -> Result<(), String> {
    if POLICY_VALUES.contains(&value) {
        Ok(())
    } else {
        Err(format!("invalid policy value {:?}", value))
    }
}
