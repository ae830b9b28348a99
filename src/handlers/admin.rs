//! Admin surface: session login, ticket search, database backup and a
//! basic-auth health endpoint. These sit outside the signed API scope.

use crate::app::AppState;
use actix_session::Session;
use actix_web::error::{ErrorInternalServerError, ErrorUnauthorized};
use actix_web::http::header;
use actix_web::{web, Error as ActixError, HttpResponse};
use actix_web_httpauth::extractors::basic::BasicAuth;
use log::{info, warn};
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};

/// Fixed-length comparison so the password check does not leak length or
/// prefix information.
fn password_matches(given: &str, expected: &str) -> bool {
    Sha256::digest(given.as_bytes()) == Sha256::digest(expected.as_bytes())
}

fn require_admin(session: &Session) -> Result<(), ActixError> {
    match session.get::<bool>("admin") {
        Ok(Some(true)) => Ok(()),
        _ => Err(ErrorUnauthorized("admin session required")),
    }
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub password: String,
}

pub async fn login(
    state: web::Data<AppState>,
    session: Session,
    body: web::Json<LoginRequest>,
) -> Result<HttpResponse, ActixError> {
    if !password_matches(&body.password, &state.cfg.admin_pass) {
        warn!("failed admin login attempt");
        return Ok(HttpResponse::Unauthorized().json(json!({"error": "invalid password"})));
    }
    session
        .insert("admin", true)
        .map_err(ErrorInternalServerError)?;
    info!("admin logged in");
    Ok(HttpResponse::Ok().json(json!({"ok": true})))
}

pub async fn logout(session: Session) -> HttpResponse {
    session.purge();
    HttpResponse::Ok().json(json!({"ok": true}))
}

pub async fn home(
    state: web::Data<AppState>,
    session: Session,
) -> Result<HttpResponse, ActixError> {
    require_admin(&session)?;
    let stats = state.stats.data();
    let (connected, failed) = state.wallets.clients().await;
    let xpubs = state.store.all_fee_xpubs()?;
    Ok(HttpResponse::Ok().json(json!({
        "network": state.params.name,
        "vspclosed": state.cfg.vsp_closed,
        "dbversion": state.store.version()?,
        "stats": {
            "voting": stats.voting,
            "voted": stats.voted,
            "revoked": stats.revoked,
            "blockheight": stats.block_height,
            "networkproportion": stats.network_proportion,
            "updated": stats.updated,
        },
        "wallets": {
            "connected": connected.iter().map(|w| w.host().to_owned()).collect::<Vec<_>>(),
            "failed": failed,
        },
        "feexpubs": xpubs.iter().map(|x| json!({
            "id": x.id,
            "lastusedidx": x.last_used_idx,
            "retired": x.retired,
        })).collect::<Vec<_>>(),
    })))
}

#[derive(Debug, Deserialize)]
pub struct TicketSearchRequest {
    pub tickethash: String,
}

pub async fn ticket_search(
    state: web::Data<AppState>,
    session: Session,
    body: web::Json<TicketSearchRequest>,
) -> Result<HttpResponse, ActixError> {
    require_admin(&session)?;
    let ticket = state.store.get_ticket(&body.tickethash)?;
    let vote_changes = state.store.vote_changes(&body.tickethash)?;
    let alt_sign_addr = state.store.alt_sign_addr(&body.tickethash)?;
    Ok(HttpResponse::Ok().json(json!({
        "ticket": ticket,
        "votechanges": vote_changes,
        "altsignaddr": alt_sign_addr,
    })))
}

/// Streams a consistent snapshot of the database file.
pub async fn backup(
    state: web::Data<AppState>,
    session: Session,
) -> Result<HttpResponse, ActixError> {
    require_admin(&session)?;
    let snapshot = state.store.backup_bytes()?;
    info!("serving database backup ({} bytes)", snapshot.len());
    Ok(HttpResponse::Ok()
        .insert_header((header::CONTENT_TYPE, "application/octet-stream"))
        .insert_header((
            header::CONTENT_DISPOSITION,
            "attachment; filename=\"vspd.db\"",
        ))
        .body(snapshot))
}

/// Health endpoint for monitoring, authenticated with HTTP basic auth
/// rather than a session cookie.
pub async fn status(
    state: web::Data<AppState>,
    auth: BasicAuth,
) -> Result<HttpResponse, ActixError> {
    let authorized = auth.user_id() == "admin"
        && auth
            .password()
            .map(|p| password_matches(p, &state.cfg.admin_pass))
            .unwrap_or(false);
    if !authorized {
        return Err(ErrorUnauthorized("invalid credentials"));
    }
    let (connected, failed) = state.wallets.clients().await;
    let mut wallets = Vec::with_capacity(connected.len());
    for wallet in &connected {
        let height = wallet.best_block_height().await.ok();
        wallets.push(json!({
            "host": wallet.host(),
            "bestblockheight": height,
        }));
    }
    Ok(HttpResponse::Ok().json(json!({
        "vspclosed": state.cfg.vsp_closed,
        "totalwallets": state.wallets.len(),
        "connectedwallets": wallets,
        "failedwallets": failed,
    })))
}
