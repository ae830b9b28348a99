use crate::api::{self, VspInfoResponse};
use crate::app::AppState;
use crate::errors::Error;
use actix_web::http::header::ContentType;
use actix_web::{web, HttpRequest, HttpResponse};
use chrono::Utc;
use ed25519_dalek::Signer;
use serde::Serialize;

pub mod admin;
pub mod ticket;
pub mod vote;

/// Public metadata about this VSP. Served from the stats cache so the
/// request never touches the store or the node.
pub async fn vsp_info(state: web::Data<AppState>) -> Result<HttpResponse, Error> {
    let stats = state.stats.data();
    Ok(HttpResponse::Ok().json(VspInfoResponse {
        apiversions: vec![api::API_VERSION],
        timestamp: Utc::now().timestamp(),
        pubkey: base64::encode(state.pub_key.to_bytes()),
        feepercentage: state.cfg.fee_percent,
        vspclosed: state.cfg.vsp_closed,
        vspclosedmsg: state.cfg.vsp_closed_msg.clone(),
        network: state.params.name.to_owned(),
        vspdversion: env!("CARGO_PKG_VERSION").to_owned(),
        voting: stats.voting,
        voted: stats.voted,
        totalvotingwallets: stats.total_wallets,
        votingwalletsonline: stats.wallets_online,
        // The node interface does not expose why a ticket left the pool,
        // so all revocations are reported as expired.
        expired: stats.revoked,
        missed: 0,
        blockheight: stats.block_height,
        estimatednetworkproportion: stats.network_proportion,
    }))
}

/// Serializes a response and signs the exact bytes, for handlers that
/// persist the signed response in an audit record. The same bytes are
/// returned to the client, so the signature the middleware attaches is
/// identical (Ed25519 is deterministic).
pub(crate) fn signed_json<T: Serialize>(
    state: &AppState,
    value: &T,
) -> Result<(Vec<u8>, String), Error> {
    let body = serde_json::to_vec(value)
        .map_err(|e| Error::internal(format!("cannot encode response: {}", e)))?;
    let signature = base64::encode(state.signing_key.sign(&body).to_bytes());
    Ok((body, signature))
}

pub(crate) fn json_response(body: Vec<u8>) -> HttpResponse {
    HttpResponse::Ok()
        .content_type(ContentType::json())
        .body(body)
}

pub(crate) fn client_signature(req: &HttpRequest) -> Option<String> {
    req.headers()
        .get(api::CLIENT_SIGNATURE_HEADER)
        .and_then(|h| h.to_str().ok())
        .map(str::to_owned)
}
