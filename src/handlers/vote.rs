use crate::api::{
    self, SetAltSignAddrRequest, SetAltSignAddrResponse, SetVoteChoicesRequest,
    SetVoteChoicesResponse,
};
use crate::app::AppState;
use crate::chain;
use crate::errors::{ApiCode, Error};
use crate::extractor::{self, SignedRequest};
use crate::handlers::{client_signature, json_response, signed_json};
use crate::models::{AltSignAddrRecord, FeeStatus, VoteChangeRecord};
use actix_web::{web, HttpRequest, HttpResponse};
use chrono::Utc;
use log::{info, warn};

/// Updates vote choices and treasury policies. The store is the source of
/// truth and is written first; the wallet fan-out afterwards is
/// best-effort.
pub async fn set_vote_choices(
    state: web::Data<AppState>,
    authed: SignedRequest<SetVoteChoicesRequest>,
) -> Result<HttpResponse, Error> {
    let mut ticket = authed
        .ticket
        .clone()
        .ok_or_else(|| Error::code(ApiCode::UnknownTicket))?;

    if matches!(ticket.fee_tx_status, FeeStatus::None | FeeStatus::Error) {
        return Err(Error::code(ApiCode::FeeNotReceived));
    }

    let payload = &authed.payload;
    if payload.tspendpolicy.len() > api::MAX_POLICY_ENTRIES
        || payload.treasurypolicy.len() > api::MAX_POLICY_ENTRIES
    {
        return Err(Error::api(
            ApiCode::BadRequest,
            format!("policies are limited to {} entries", api::MAX_POLICY_ENTRIES),
        ));
    }
    chain::validate_vote_choices(&payload.votechoices, &state.params)
        .map_err(|e| Error::api(ApiCode::InvalidVoteChoices, e))?;
    chain::validate_tspend_policy(&payload.tspendpolicy)
        .map_err(|e| Error::api(ApiCode::BadRequest, e))?;
    chain::validate_treasury_policy(&payload.treasurypolicy)
        .map_err(|e| Error::api(ApiCode::BadRequest, e))?;

    // Updates merge by key so clients can adjust one agenda or policy
    // without restating the rest.
    for (agenda, choice) in &payload.votechoices {
        ticket.vote_choices.insert(agenda.clone(), choice.clone());
    }
    for (hash, policy) in &payload.tspendpolicy {
        ticket.tspend_policy.insert(hash.clone(), policy.clone());
    }
    for (key, policy) in &payload.treasurypolicy {
        ticket.treasury_policy.insert(key.clone(), policy.clone());
    }
    state.store.update_ticket(&ticket)?;
    info!("vote preferences updated for ticket {}", ticket.hash);

    state.fsm.update_wallet_preferences(&ticket).await;

    let response = SetVoteChoicesResponse {
        timestamp: Utc::now().timestamp(),
        request: api::echo(&authed.raw)?,
    };
    let (body, response_signature) = signed_json(&state, &response)?;
    if let Err(e) = state.store.save_vote_change(
        &ticket.hash,
        &VoteChangeRecord {
            request: String::from_utf8_lossy(&authed.raw).into_owned(),
            request_signature: authed.signature.clone(),
            response: String::from_utf8_lossy(&body).into_owned(),
            response_signature,
        },
    ) {
        warn!("cannot save audit record for {}: {}", ticket.hash, e);
    }
    Ok(json_response(body))
}

/// Records a substitute signing address for a ticket. One chance only:
/// the record is immutable once set.
pub async fn set_alt_sign_addr(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    let parsed: SetAltSignAddrRequest = serde_json::from_slice(&body)
        .map_err(|e| Error::api(ApiCode::BadRequest, format!("cannot parse request: {}", e)))?;
    state
        .fsm
        .broadcast_ticket(&parsed.tickethash, &parsed.tickethex, &parsed.parenthex)
        .await?;

    let authed = extractor::authenticate::<SetAltSignAddrRequest>(
        &state.store,
        state.node.as_ref(),
        &state.params,
        body,
        client_signature(&req),
    )
    .await?;
    let payload = &authed.payload;
    let hash = &payload.tickethash;

    if state.store.alt_sign_addr(hash)?.is_some() {
        return Err(Error::api(
            ApiCode::BadRequest,
            "alternate sign address data already exists",
        ));
    }

    chain::decode_address(&payload.altsignaddress, &state.params).map_err(|e| {
        Error::api(
            ApiCode::BadRequest,
            format!("invalid alternate signing address: {}", e),
        )
    })?;

    let raw_ticket = state.node.get_raw_transaction(hash).await?;
    if !state.node.can_ticket_vote(&raw_ticket, hash).await? {
        return Err(Error::code(ApiCode::TicketCannotVote));
    }

    let response = SetAltSignAddrResponse {
        timestamp: Utc::now().timestamp(),
        request: api::echo(&authed.raw)?,
    };
    let (body_out, resp_sig) = signed_json(&state, &response)?;
    state.store.insert_alt_sign_addr(
        hash,
        &AltSignAddrRecord {
            alt_sign_addr: payload.altsignaddress.clone(),
            req: String::from_utf8_lossy(&authed.raw).into_owned(),
            req_sig: authed.signature.clone(),
            resp: String::from_utf8_lossy(&body_out).into_owned(),
            resp_sig,
        },
    )?;
    info!("alternate sign address recorded for ticket {}", hash);
    Ok(json_response(body_out))
}
