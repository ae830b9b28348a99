use crate::api::{
    self, FeeAddressRequest, FeeAddressResponse, PayFeeRequest, PayFeeResponse,
    TicketStatusRequest, TicketStatusResponse,
};
use crate::app::AppState;
use crate::errors::{ApiCode, Error};
use crate::extractor::{self, SignedRequest};
use crate::fsm::{FEE_ADDRESS_EXPIRATION_SECS, REQUIRED_CONFS};
use crate::handlers::{client_signature, json_response, signed_json};
use crate::models::{Ticket, VoteChangeRecord};
use actix_web::{web, HttpRequest, HttpResponse};
use chrono::Utc;
use log::{info, warn};

/// Issues (or re-issues) the fee offer for a ticket. The ticket and its
/// parent are relayed to the node before authentication so the commitment
/// address of a brand-new ticket can be resolved on chain.
pub async fn fee_address(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    if state.cfg.vsp_closed {
        return Err(Error::code(ApiCode::VspClosed));
    }

    let parsed: FeeAddressRequest = serde_json::from_slice(&body)
        .map_err(|e| Error::api(ApiCode::BadRequest, format!("cannot parse request: {}", e)))?;
    state
        .fsm
        .broadcast_ticket(&parsed.tickethash, &parsed.tickethex, &parsed.parenthex)
        .await?;

    let authed = extractor::authenticate::<FeeAddressRequest>(
        &state.store,
        state.node.as_ref(),
        &state.params,
        body,
        client_signature(&req),
    )
    .await?;

    let hash = &authed.payload.tickethash;
    let raw_ticket = state.node.get_raw_transaction(hash).await?;
    if !state.node.can_ticket_vote(&raw_ticket, hash).await? {
        return Err(Error::code(ApiCode::TicketCannotVote));
    }

    let now = Utc::now().timestamp();
    let ticket = match authed.ticket.clone() {
        Some(ticket) if !ticket.fee_expired(now) => ticket,
        Some(mut ticket) => {
            // Expired offer: fresh amount and deadline, same address.
            ticket.fee_amount = state.fsm.current_fee().await?;
            ticket.fee_expiration = now + FEE_ADDRESS_EXPIRATION_SECS;
            state.store.update_ticket(&ticket)?;
            info!("fee offer for ticket {} reissued", ticket.hash);
            ticket
        }
        None => {
            let fee_amount = state.fsm.current_fee().await?;
            let (fee_address, fee_address_index) = state.addr_gen.next_address()?;
            let confirmed = raw_ticket.confirmations >= REQUIRED_CONFS;
            let ticket = Ticket {
                hash: hash.clone(),
                commitment_address: authed.commitment_address.clone(),
                purchase_height: if confirmed { raw_ticket.blockheight } else { 0 },
                fee_address_xpub_id: state.addr_gen.xpub_id(),
                fee_address_index,
                fee_address,
                fee_amount,
                fee_expiration: now + FEE_ADDRESS_EXPIRATION_SECS,
                confirmed,
                ..Ticket::default()
            };
            match state.store.insert_new_ticket(&ticket) {
                Ok(()) => {
                    info!("fee address issued for ticket {}", ticket.hash);
                    ticket
                }
                // A concurrent request won the insert; serve its offer.
                Err(insert_err) => match state.store.get_ticket(hash)? {
                    Some(existing) => existing,
                    None => return Err(insert_err),
                },
            }
        }
    };

    Ok(HttpResponse::Ok().json(FeeAddressResponse {
        timestamp: now,
        feeaddress: ticket.fee_address.clone(),
        feeamount: ticket.fee_amount,
        expiration: ticket.fee_expiration,
        request: api::echo(&authed.raw)?,
    }))
}

pub async fn pay_fee(
    state: web::Data<AppState>,
    authed: SignedRequest<PayFeeRequest>,
) -> Result<HttpResponse, Error> {
    let mut ticket = authed
        .ticket
        .clone()
        .ok_or_else(|| Error::code(ApiCode::UnknownTicket))?;

    if authed.payload.tspendpolicy.len() > api::MAX_POLICY_ENTRIES
        || authed.payload.treasurypolicy.len() > api::MAX_POLICY_ENTRIES
    {
        return Err(Error::api(
            ApiCode::BadRequest,
            format!("policies are limited to {} entries", api::MAX_POLICY_ENTRIES),
        ));
    }

    let now = Utc::now().timestamp();
    state.fsm.accept_fee(&mut ticket, &authed.payload, now).await?;

    let response = PayFeeResponse {
        timestamp: now,
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

pub async fn ticket_status(
    state: web::Data<AppState>,
    authed: SignedRequest<TicketStatusRequest>,
) -> Result<HttpResponse, Error> {
    let ticket = authed
        .ticket
        .clone()
        .ok_or_else(|| Error::code(ApiCode::UnknownTicket))?;
    let alt_sign_address = state
        .store
        .alt_sign_addr(&ticket.hash)?
        .map(|r| r.alt_sign_addr)
        .unwrap_or_default();

    Ok(HttpResponse::Ok().json(TicketStatusResponse {
        timestamp: Utc::now().timestamp(),
        ticketconfirmed: ticket.confirmed,
        feetxstatus: ticket.fee_tx_status.to_string(),
        feetxhash: ticket.fee_tx_hash.clone(),
        altsignaddress: alt_sign_address,
        votechoices: ticket.vote_choices.clone(),
        tspendpolicy: ticket.tspend_policy.clone(),
        treasurypolicy: ticket.treasury_policy.clone(),
        request: api::echo(&authed.raw)?,
    }))
}
