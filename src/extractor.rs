//! Authentication of signed client requests. Every authenticated request
//! body names a ticket; the signature over the exact body bytes must
//! verify against the ticket's commitment address, or against a recorded
//! alternate signing address.

use crate::api::{SignedPayload, CLIENT_SIGNATURE_HEADER};
use crate::app::AppState;
use crate::chain::{self, ChainParams};
use crate::db::Store;
use crate::errors::{ApiCode, Error};
use crate::models::Ticket;
use crate::node::{Node, NodeError};
use actix_web::dev::Payload;
use actix_web::web::{Bytes, Data};
use actix_web::{FromRequest, HttpRequest};
use chrono::Utc;
use futures::future::LocalBoxFuture;

/// Tolerated skew between a signed request timestamp and server time.
const TIMESTAMP_WINDOW_SECS: i64 = 300;

/// An authenticated request: the parsed body, the exact bytes it was
/// parsed from, and what the signature resolved to.
#[derive(Debug)]
pub struct SignedRequest<T> {
    pub payload: T,
    pub raw: Bytes,
    /// Base64 client signature, kept for audit records.
    pub signature: String,
    pub commitment_address: String,
    pub ticket: Option<Ticket>,
}

pub async fn authenticate<T: SignedPayload>(
    store: &Store,
    node: &dyn Node,
    params: &ChainParams,
    raw: Bytes,
    signature: Option<String>,
) -> Result<SignedRequest<T>, Error> {
    let payload: T = serde_json::from_slice(&raw)
        .map_err(|e| Error::api(ApiCode::BadRequest, format!("cannot parse request: {}", e)))?;

    let hash = payload.ticket_hash();
    if hash.len() != 64 || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(Error::api(ApiCode::BadRequest, "invalid tickethash"));
    }

    if let Some(timestamp) = payload.timestamp() {
        if (Utc::now().timestamp() - timestamp).abs() > TIMESTAMP_WINDOW_SECS {
            return Err(Error::code(ApiCode::InvalidTimestamp));
        }
    }

    let signature = signature.ok_or_else(|| {
        Error::api(ApiCode::BadRequest, "no VSP-Client-Signature header")
    })?;
    let sig_bytes = base64::decode(&signature).map_err(|e| {
        Error::api(ApiCode::BadRequest, format!("cannot decode signature: {}", e))
    })?;

    let ticket = store.get_ticket(hash)?;
    let commitment_address = match &ticket {
        Some(t) => t.commitment_address.clone(),
        None => resolve_commitment_address(node, params, hash).await?,
    };

    let mut valid =
        chain::verify_message(&commitment_address, &sig_bytes, &raw, params).unwrap_or(false);
    if !valid {
        if let Some(record) = store.alt_sign_addr(hash)? {
            valid = chain::verify_message(&record.alt_sign_addr, &sig_bytes, &raw, params)
                .unwrap_or(false);
        }
    }
    if !valid {
        return Err(Error::code(ApiCode::BadSignature));
    }

    Ok(SignedRequest {
        payload,
        raw,
        signature,
        commitment_address,
        ticket,
    })
}

/// For tickets the VSP has never seen, the commitment address comes from
/// the on-chain transaction itself.
async fn resolve_commitment_address(
    node: &dyn Node,
    params: &ChainParams,
    hash: &str,
) -> Result<String, Error> {
    let raw_tx = node.get_raw_transaction(hash).await.map_err(|e| match e {
        NodeError::UnknownTx(_) => Error::code(ApiCode::UnknownTicket),
        other => other.into(),
    })?;
    let tx = chain::decode_tx_hex(&raw_tx.hex)
        .map_err(|e| Error::api(ApiCode::InvalidTicket, format!("cannot decode ticket: {}", e)))?;
    chain::check_stake_submission(&tx)
        .map_err(|e| Error::api(ApiCode::InvalidTicket, e.to_string()))?;
    chain::commitment_address(&tx, params)
        .map_err(|e| Error::api(ApiCode::InvalidTicket, e.to_string()))
}

impl<T: SignedPayload + 'static> FromRequest for SignedRequest<T> {
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self, Error>>;

    fn from_request(req: &HttpRequest, payload: &mut Payload) -> Self::Future {
        let state = req.app_data::<Data<AppState>>().cloned();
        let signature = req
            .headers()
            .get(CLIENT_SIGNATURE_HEADER)
            .and_then(|h| h.to_str().ok())
            .map(str::to_owned);
        let body = Bytes::from_request(req, payload);
        Box::pin(async move {
            let state =
                state.ok_or_else(|| Error::internal("application state is not configured"))?;
            let raw = body.await.map_err(|e| {
                Error::api(ApiCode::BadRequest, format!("cannot read request body: {}", e))
            })?;
            authenticate::<T>(
                &state.store,
                state.node.as_ref(),
                &state.params,
                raw,
                signature,
            )
            .await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::TicketStatusRequest;
    use crate::api::{FeeAddressRequest, PayFeeRequest};
    use crate::db::DEFAULT_MAX_VOTE_CHANGES;
    use crate::models::AltSignAddrRecord;
    use crate::test_utils::{keypair, make_parent_and_ticket, sign_body, FakeNode};
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Harness {
        _dir: TempDir,
        store: Store,
        node: Arc<FakeNode>,
        params: ChainParams,
    }

    fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path().join("vspd.db"), DEFAULT_MAX_VOTE_CHANGES).unwrap();
        Harness {
            _dir: dir,
            store,
            node: FakeNode::new(),
            params: ChainParams::simnet(),
        }
    }

    fn status_body(hash: &str) -> Bytes {
        Bytes::from(format!("{{\"tickethash\":\"{}\"}}", hash))
    }

    #[actix_rt::test]
    async fn verifies_signature_against_stored_commitment_address() {
        let h = harness();
        let (commitment_sk, commitment_pk) = keypair(3);
        let hash = "ab".repeat(32);
        h.store
            .insert_new_ticket(&Ticket {
                hash: hash.clone(),
                commitment_address: chain::pubkey_address(&commitment_pk, &h.params),
                ..Ticket::default()
            })
            .unwrap();

        let body = status_body(&hash);
        let sig = sign_body(&body, &commitment_sk);
        let authed = authenticate::<TicketStatusRequest>(
            &h.store,
            &*h.node,
            &h.params,
            body.clone(),
            Some(sig),
        )
        .await
        .unwrap();
        assert!(authed.ticket.is_some());
        assert_eq!(authed.payload.tickethash, hash);
        assert_eq!(&authed.raw[..], &body[..]);

        // A signature from some other key is rejected.
        let (other_sk, _) = keypair(4);
        let err = authenticate::<TicketStatusRequest>(
            &h.store,
            &*h.node,
            &h.params,
            body.clone(),
            Some(sign_body(&body, &other_sk)),
        )
        .await
        .unwrap_err();
        assert_eq!(err.api_code(), ApiCode::BadSignature);

        // A missing header is a bad request.
        let err =
            authenticate::<TicketStatusRequest>(&h.store, &*h.node, &h.params, body, None)
                .await
                .unwrap_err();
        assert_eq!(err.api_code(), ApiCode::BadRequest);
    }

    #[actix_rt::test]
    async fn falls_back_to_alt_sign_address() {
        let h = harness();
        let (_, commitment_pk) = keypair(3);
        let (alt_sk, alt_pk) = keypair(4);
        let hash = "cd".repeat(32);
        h.store
            .insert_new_ticket(&Ticket {
                hash: hash.clone(),
                commitment_address: chain::pubkey_address(&commitment_pk, &h.params),
                ..Ticket::default()
            })
            .unwrap();
        h.store
            .insert_alt_sign_addr(
                &hash,
                &AltSignAddrRecord {
                    alt_sign_addr: chain::pubkey_address(&alt_pk, &h.params),
                    req: "{}".to_owned(),
                    req_sig: "r".to_owned(),
                    resp: "{}".to_owned(),
                    resp_sig: "s".to_owned(),
                },
            )
            .unwrap();

        let body = status_body(&hash);
        let authed = authenticate::<TicketStatusRequest>(
            &h.store,
            &*h.node,
            &h.params,
            body.clone(),
            Some(sign_body(&body, &alt_sk)),
        )
        .await
        .unwrap();
        assert_eq!(authed.payload.tickethash, hash);
    }

    #[actix_rt::test]
    async fn resolves_unknown_ticket_from_node() {
        let h = harness();
        let (commitment_sk, commitment_pk) = keypair(3);
        let (_, voting_pk) = keypair(5);
        let (_, ticket_tx) =
            make_parent_and_ticket(&h.params, &voting_pk, &commitment_pk, 1_000_000);
        h.node.add_tx(&ticket_tx, 1, 100);
        let hash = ticket_tx.hash();

        let body = Bytes::from(
            serde_json::to_vec(&FeeAddressRequest {
                timestamp: Utc::now().timestamp(),
                tickethash: hash.clone(),
                tickethex: "00".to_owned(),
                parenthex: "00".to_owned(),
            })
            .unwrap(),
        );
        let authed = authenticate::<FeeAddressRequest>(
            &h.store,
            &*h.node,
            &h.params,
            body.clone(),
            Some(sign_body(&body, &commitment_sk)),
        )
        .await
        .unwrap();
        assert!(authed.ticket.is_none());
        assert_eq!(
            authed.commitment_address,
            chain::pubkey_address(&commitment_pk, &h.params)
        );

        // A hash the node has never seen is an unknown ticket.
        let ghost = "ef".repeat(32);
        let body = status_body(&ghost);
        let err = authenticate::<TicketStatusRequest>(
            &h.store,
            &*h.node,
            &h.params,
            body.clone(),
            Some(sign_body(&body, &commitment_sk)),
        )
        .await
        .unwrap_err();
        assert_eq!(err.api_code(), ApiCode::UnknownTicket);
    }

    #[actix_rt::test]
    async fn rejects_malformed_hashes_and_stale_timestamps() {
        let h = harness();
        let (sk, _) = keypair(3);

        let body = status_body("zz");
        let err = authenticate::<TicketStatusRequest>(
            &h.store,
            &*h.node,
            &h.params,
            body.clone(),
            Some(sign_body(&body, &sk)),
        )
        .await
        .unwrap_err();
        assert_eq!(err.api_code(), ApiCode::BadRequest);

        let stale = PayFeeRequest {
            timestamp: Utc::now().timestamp() - 2 * TIMESTAMP_WINDOW_SECS,
            tickethash: "ab".repeat(32),
            feetx: String::new(),
            votingkey: String::new(),
            votechoices: Default::default(),
            tspendpolicy: Default::default(),
            treasurypolicy: Default::default(),
        };
        let body = Bytes::from(serde_json::to_vec(&stale).unwrap());
        let err = authenticate::<PayFeeRequest>(
            &h.store,
            &*h.node,
            &h.params,
            body.clone(),
            Some(sign_body(&body, &sk)),
        )
        .await
        .unwrap_err();
        assert_eq!(err.api_code(), ApiCode::InvalidTimestamp);
    }
}
