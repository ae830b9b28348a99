//! Request and response bodies of the v3 registration API, shared by the
//! server handlers and the client SDK.

use crate::errors::{ApiCode, Error};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::collections::HashMap;

pub const CLIENT_SIGNATURE_HEADER: &str = "VSP-Client-Signature";
pub const SERVER_SIGNATURE_HEADER: &str = "VSP-Server-Signature";

pub const API_VERSION: u32 = 3;

/// Cap on tspend and treasury policy entries per request.
pub const MAX_POLICY_ENTRIES: usize = 3;

/// Common surface of every authenticated request body.
pub trait SignedPayload: DeserializeOwned {
    fn ticket_hash(&self) -> &str;

    fn timestamp(&self) -> Option<i64> {
        None
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeAddressRequest {
    pub timestamp: i64,
    pub tickethash: String,
    pub tickethex: String,
    pub parenthex: String,
}

impl SignedPayload for FeeAddressRequest {
    fn ticket_hash(&self) -> &str {
        &self.tickethash
    }
    fn timestamp(&self) -> Option<i64> {
        Some(self.timestamp)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FeeAddressResponse {
    pub timestamp: i64,
    pub feeaddress: String,
    pub feeamount: i64,
    pub expiration: i64,
    pub request: Box<RawValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayFeeRequest {
    pub timestamp: i64,
    pub tickethash: String,
    pub feetx: String,
    pub votingkey: String,
    #[serde(default)]
    pub votechoices: HashMap<String, String>,
    #[serde(default)]
    pub tspendpolicy: HashMap<String, String>,
    #[serde(default)]
    pub treasurypolicy: HashMap<String, String>,
}

impl SignedPayload for PayFeeRequest {
    fn ticket_hash(&self) -> &str {
        &self.tickethash
    }
    fn timestamp(&self) -> Option<i64> {
        Some(self.timestamp)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PayFeeResponse {
    pub timestamp: i64,
    pub request: Box<RawValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketStatusRequest {
    pub tickethash: String,
}

impl SignedPayload for TicketStatusRequest {
    fn ticket_hash(&self) -> &str {
        &self.tickethash
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TicketStatusResponse {
    pub timestamp: i64,
    pub ticketconfirmed: bool,
    pub feetxstatus: String,
    pub feetxhash: String,
    pub altsignaddress: String,
    pub votechoices: HashMap<String, String>,
    pub tspendpolicy: HashMap<String, String>,
    pub treasurypolicy: HashMap<String, String>,
    pub request: Box<RawValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetVoteChoicesRequest {
    pub timestamp: i64,
    pub tickethash: String,
    #[serde(default)]
    pub votechoices: HashMap<String, String>,
    #[serde(default)]
    pub tspendpolicy: HashMap<String, String>,
    #[serde(default)]
    pub treasurypolicy: HashMap<String, String>,
}

impl SignedPayload for SetVoteChoicesRequest {
    fn ticket_hash(&self) -> &str {
        &self.tickethash
    }
    fn timestamp(&self) -> Option<i64> {
        Some(self.timestamp)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SetVoteChoicesResponse {
    pub timestamp: i64,
    pub request: Box<RawValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetAltSignAddrRequest {
    pub timestamp: i64,
    pub tickethash: String,
    pub tickethex: String,
    pub parenthex: String,
    pub altsignaddress: String,
}

impl SignedPayload for SetAltSignAddrRequest {
    fn ticket_hash(&self) -> &str {
        &self.tickethash
    }
    fn timestamp(&self) -> Option<i64> {
        Some(self.timestamp)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SetAltSignAddrResponse {
    pub timestamp: i64,
    pub request: Box<RawValue>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VspInfoResponse {
    pub apiversions: Vec<u32>,
    pub timestamp: i64,
    /// Base64 of the server's Ed25519 public key.
    pub pubkey: String,
    pub feepercentage: f64,
    pub vspclosed: bool,
    pub vspclosedmsg: String,
    pub network: String,
    pub vspdversion: String,
    pub voting: i64,
    pub voted: i64,
    pub totalvotingwallets: usize,
    pub votingwalletsonline: usize,
    pub expired: i64,
    pub missed: i64,
    pub blockheight: i64,
    pub estimatednetworkproportion: f64,
}

/// Responses that echo the request they answer, so clients can detect
/// tampering.
pub trait EchoesRequest {
    fn echoed_request(&self) -> &RawValue;
}

macro_rules! echoes_request {
    ($($ty:ty),*) => {
        $(impl EchoesRequest for $ty {
            fn echoed_request(&self) -> &RawValue {
                &self.request
            }
        })*
    };
}

echoes_request!(
    FeeAddressResponse,
    PayFeeResponse,
    TicketStatusResponse,
    SetVoteChoicesResponse,
    SetAltSignAddrResponse
);

/// Wraps the verbatim bytes of a client request for echoing in a
/// response. The bytes were parsed as JSON on the way in, so failure here
/// means the caller handed over something else entirely.
pub fn echo(raw: &[u8]) -> Result<Box<RawValue>, Error> {
    let text = std::str::from_utf8(raw)
        .map_err(|e| Error::api(ApiCode::BadRequest, format!("request is not UTF-8: {}", e)))?;
    RawValue::from_string(text.to_owned())
        .map_err(|e| Error::api(ApiCode::BadRequest, format!("request is not JSON: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_parse_with_missing_optional_maps() {
        let req: PayFeeRequest = serde_json::from_str(
            r#"{"timestamp":1,"tickethash":"ab","feetx":"00","votingkey":"wif"}"#,
        )
        .unwrap();
        assert!(req.votechoices.is_empty());
        assert_eq!(req.ticket_hash(), "ab");
        assert_eq!(req.timestamp(), Some(1));

        let req: TicketStatusRequest =
            serde_json::from_str(r#"{"tickethash":"cd"}"#).unwrap();
        assert_eq!(req.timestamp(), None);
    }

    #[test]
    fn echoed_request_preserves_bytes() {
        let original = br#"{"timestamp":1,"tickethash":"ab","b":  [1,2]}"#;
        let echoed = echo(original).unwrap();
        assert_eq!(echoed.get().as_bytes(), original);

        let resp = PayFeeResponse {
            timestamp: 2,
            request: echoed,
        };
        let wire = serde_json::to_vec(&resp).unwrap();
        let parsed: PayFeeResponse = serde_json::from_slice(&wire).unwrap();
        assert_eq!(parsed.echoed_request().get().as_bytes(), original);

        assert!(echo(b"not json").is_err());
    }
}
