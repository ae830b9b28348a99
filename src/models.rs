use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use strum_macros::{Display, EnumString};

/// Progress of a ticket's fee transaction through the registration
/// protocol.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum FeeStatus {
    #[default]
    None,
    Received,
    Broadcast,
    Confirmed,
    Error,
}

/// Terminal on-chain result for a ticket. Empty until the ticket either
/// votes or is revoked.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString,
)]
pub enum TicketOutcome {
    #[default]
    #[serde(rename = "")]
    #[strum(serialize = "")]
    None,
    #[serde(rename = "voted")]
    #[strum(serialize = "voted")]
    Voted,
    #[serde(rename = "revoked")]
    #[strum(serialize = "revoked")]
    Revoked,
}

// Container-level default so blobs written by older layouts, which may
// lack newer fields, still decode.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Ticket {
    pub hash: String,
    #[serde(rename = "commitmentaddress")]
    pub commitment_address: String,
    /// Height of the block containing the ticket; zero until the purchase
    /// is confirmed.
    #[serde(rename = "purchaseheight")]
    pub purchase_height: i64,
    #[serde(rename = "feeaddressxpubid")]
    pub fee_address_xpub_id: u32,
    #[serde(rename = "feeaddressindex")]
    pub fee_address_index: u32,
    #[serde(rename = "feeaddress")]
    pub fee_address: String,
    /// Fee owed, in atoms.
    #[serde(rename = "feeamount")]
    pub fee_amount: i64,
    /// Unix time after which the fee offer is no longer honoured.
    #[serde(rename = "feeexpiration")]
    pub fee_expiration: i64,
    #[serde(rename = "feetxhex")]
    pub fee_tx_hex: String,
    #[serde(rename = "feetxhash")]
    pub fee_tx_hash: String,
    #[serde(rename = "feetxstatus")]
    pub fee_tx_status: FeeStatus,
    #[serde(rename = "votingwif")]
    pub voting_wif: String,
    pub confirmed: bool,
    #[serde(rename = "votechoices")]
    pub vote_choices: HashMap<String, String>,
    #[serde(rename = "tspendpolicy")]
    pub tspend_policy: HashMap<String, String>,
    #[serde(rename = "treasurypolicy")]
    pub treasury_policy: HashMap<String, String>,
    pub outcome: TicketOutcome,
}

impl Ticket {
    pub fn fee_expired(&self, now: i64) -> bool {
        now >= self.fee_expiration
    }

    /// A fee transaction may only be (re)submitted in these states.
    pub fn fee_settable(&self) -> bool {
        matches!(self.fee_tx_status, FeeStatus::None | FeeStatus::Error)
    }
}

/// One extended public key used for fee-address derivation. The record
/// with the highest ID is the active one; retired records are kept so
/// previously issued addresses remain attributable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeXPub {
    pub id: u32,
    pub key: String,
    #[serde(rename = "lastusedidx")]
    pub last_used_idx: u32,
    /// Unix time of retirement, zero while active.
    pub retired: i64,
}

/// Client-designated substitute signing address, immutable once set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AltSignAddrRecord {
    #[serde(rename = "altsignaddr")]
    pub alt_sign_addr: String,
    pub req: String,
    #[serde(rename = "reqsig")]
    pub req_sig: String,
    pub resp: String,
    #[serde(rename = "respsig")]
    pub resp_sig: String,
}

/// Audit entry for a vote-preference mutation: the signed request and the
/// signed response, verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteChangeRecord {
    pub request: String,
    #[serde(rename = "requestsignature")]
    pub request_signature: String,
    pub response: String,
    #[serde(rename = "responsesignature")]
    pub response_signature: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn fee_status_wire_names() {
        assert_eq!(FeeStatus::None.to_string(), "none");
        assert_eq!(FeeStatus::Broadcast.to_string(), "broadcast");
        assert_eq!(FeeStatus::from_str("confirmed").unwrap(), FeeStatus::Confirmed);
        assert_eq!(
            serde_json::to_string(&FeeStatus::Received).unwrap(),
            "\"received\""
        );
        let parsed: FeeStatus = serde_json::from_str("\"error\"").unwrap();
        assert_eq!(parsed, FeeStatus::Error);
    }

    #[test]
    fn outcome_serializes_empty_until_terminal() {
        assert_eq!(TicketOutcome::None.to_string(), "");
        assert_eq!(serde_json::to_string(&TicketOutcome::None).unwrap(), "\"\"");
        assert_eq!(
            serde_json::to_string(&TicketOutcome::Revoked).unwrap(),
            "\"revoked\""
        );
        let parsed: TicketOutcome = serde_json::from_str("\"\"").unwrap();
        assert_eq!(parsed, TicketOutcome::None);
    }

    #[test]
    fn fee_expiry_window() {
        let ticket = Ticket {
            fee_expiration: 100,
            ..Ticket::default()
        };
        assert!(!ticket.fee_expired(99));
        assert!(ticket.fee_expired(100));
        assert!(ticket.fee_expired(101));
    }

    #[test]
    fn fee_settable_states() {
        let mut ticket = Ticket::default();
        assert!(ticket.fee_settable());
        ticket.fee_tx_status = FeeStatus::Error;
        assert!(ticket.fee_settable());
        ticket.fee_tx_status = FeeStatus::Received;
        assert!(!ticket.fee_settable());
        ticket.fee_tx_status = FeeStatus::Confirmed;
        assert!(!ticket.fee_settable());
    }
}
