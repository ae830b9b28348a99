use crate::addrgen::AddrGen;
use crate::chain::ChainParams;
use crate::db::{Store, DEFAULT_MAX_VOTE_CHANGES};
use crate::errors::Error;
use crate::fsm::Fsm;
use crate::handlers;
use crate::middleware::SignResponse;
use crate::node::{Node, RpcNode};
use crate::stats::StatsCache;
use crate::wallet::WalletPool;
use actix_session::storage::CookieSessionStore;
use actix_session::SessionMiddleware;
use actix_web::cookie::Key;
use actix_web::dev::HttpServiceFactory;
use actix_web::web;
use chrono::Utc;
use ed25519_dalek::{SigningKey, VerifyingKey};
use sha2::{Digest, Sha512};
use std::env;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct AppCfg {
    pub listen: String,
    pub db_file: String,
    pub network: String,
    pub node_rpc_url: String,
    pub node_rpc_user: String,
    pub node_rpc_pass: String,
    pub wallet_rpc_urls: String,
    pub wallet_rpc_user: String,
    pub wallet_rpc_pass: String,
    pub fee_xpub: String,
    pub fee_percent: f64,
    pub admin_pass: String,
    pub vsp_closed: bool,
    pub vsp_closed_msg: String,
    pub max_vote_change_records: u32,
    pub debug: bool,
}

fn env_flag(name: &str) -> bool {
    matches!(env::var(name).as_deref(), Ok("1") | Ok("true") | Ok("yes"))
}

impl AppCfg {
    pub fn from_env() -> AppCfg {
        AppCfg {
            listen: env::var("VSPD_LISTEN").unwrap_or_else(|_| "0.0.0.0:8800".to_owned()),
            db_file: env::var("VSPD_DB_FILE").unwrap_or_else(|_| "vspd.db".to_owned()),
            network: env::var("VSPD_NETWORK").unwrap_or_else(|_| "mainnet".to_owned()),
            node_rpc_url: env::var("DCRD_RPC_URL").expect("DCRD_RPC_URL must be set"),
            node_rpc_user: env::var("DCRD_RPC_USER").expect("DCRD_RPC_USER must be set"),
            node_rpc_pass: env::var("DCRD_RPC_PASS").expect("DCRD_RPC_PASS must be set"),
            wallet_rpc_urls: env::var("WALLET_RPC_URLS").expect("WALLET_RPC_URLS must be set"),
            wallet_rpc_user: env::var("WALLET_RPC_USER").expect("WALLET_RPC_USER must be set"),
            wallet_rpc_pass: env::var("WALLET_RPC_PASS").expect("WALLET_RPC_PASS must be set"),
            fee_xpub: env::var("VSPD_FEE_XPUB").expect("VSPD_FEE_XPUB must be set"),
            fee_percent: env::var("VSPD_FEE_PERCENT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3.0),
            admin_pass: env::var("VSPD_ADMIN_PASS").expect("VSPD_ADMIN_PASS must be set"),
            vsp_closed: env_flag("VSPD_CLOSED"),
            vsp_closed_msg: env::var("VSPD_CLOSED_MSG").unwrap_or_default(),
            max_vote_change_records: DEFAULT_MAX_VOTE_CHANGES,
            debug: env_flag("VSPD_DEBUG"),
        }
    }

    pub fn stats_interval(&self) -> Duration {
        if self.debug {
            Duration::from_secs(1)
        } else {
            Duration::from_secs(60)
        }
    }
}

/// Owns every long-lived collaborator. Dependencies flow one way: the
/// state owns store, generator, cache and clients; handlers only ever
/// borrow from it.
pub struct AppState {
    pub cfg: AppCfg,
    pub params: Arc<ChainParams>,
    pub store: Arc<Store>,
    pub addr_gen: AddrGen,
    pub node: Arc<dyn Node>,
    pub wallets: Arc<WalletPool>,
    pub stats: Arc<StatsCache>,
    pub fsm: Arc<Fsm>,
    pub signing_key: Arc<SigningKey>,
    pub pub_key: VerifyingKey,
}

impl AppState {
    pub fn new(cfg: AppCfg) -> Result<AppState, Error> {
        let params = Arc::new(
            ChainParams::from_name(&cfg.network).map_err(|e| Error::internal(e.to_string()))?,
        );
        let store = Arc::new(Store::open(&cfg.db_file, cfg.max_vote_change_records)?);
        let node: Arc<dyn Node> = Arc::new(RpcNode::new(
            &cfg.node_rpc_url,
            &cfg.node_rpc_user,
            &cfg.node_rpc_pass,
            params.ticket_maturity,
        ));
        let wallets = Arc::new(WalletPool::from_cfg(
            &cfg.wallet_rpc_urls,
            &cfg.wallet_rpc_user,
            &cfg.wallet_rpc_pass,
        ));
        AppState::with_deps(cfg, params, store, node, wallets)
    }

    /// Wires the state from pre-built collaborators. Tests inject fakes
    /// through this path. Xpub retirement happens here, before any
    /// listener or generator exists, so it is trivially serialized with
    /// address issuance.
    pub fn with_deps(
        cfg: AppCfg,
        params: Arc<ChainParams>,
        store: Arc<Store>,
        node: Arc<dyn Node>,
        wallets: Arc<WalletPool>,
    ) -> Result<AppState, Error> {
        let xpub = store.upsert_fee_xpub(&cfg.fee_xpub, Utc::now().timestamp())?;
        let addr_gen = AddrGen::new(store.clone(), params.clone(), &xpub)?;
        let signing_key = Arc::new(store.signing_key()?);
        let pub_key = signing_key.verifying_key();
        let fsm = Arc::new(Fsm {
            store: store.clone(),
            node: node.clone(),
            wallets: wallets.clone(),
            params: params.clone(),
            fee_percent: cfg.fee_percent,
        });
        Ok(AppState {
            cfg,
            params,
            store,
            addr_gen,
            node,
            wallets,
            stats: Arc::new(StatsCache::new()),
            fsm,
            signing_key,
            pub_key,
        })
    }

    /// Key for admin session cookies, derived from the persisted secret.
    pub fn cookie_key(&self) -> Result<Key, Error> {
        let secret = self.store.cookie_secret()?;
        Ok(Key::from(Sha512::digest(secret).as_slice()))
    }
}

pub fn api_routes(state: &web::Data<AppState>) -> impl HttpServiceFactory {
    web::scope("/api/v3")
        .wrap(SignResponse::new(state.signing_key.clone()))
        .service(web::resource("/vspinfo").route(web::get().to(handlers::vsp_info)))
        .service(
            web::resource("/feeaddress").route(web::post().to(handlers::ticket::fee_address)),
        )
        .service(web::resource("/payfee").route(web::post().to(handlers::ticket::pay_fee)))
        .service(
            web::resource("/ticketstatus").route(web::post().to(handlers::ticket::ticket_status)),
        )
        .service(
            web::resource("/setvotechoices")
                .route(web::post().to(handlers::vote::set_vote_choices)),
        )
        .service(
            web::resource("/setaltsignaddr")
                .route(web::post().to(handlers::vote::set_alt_sign_addr)),
        )
}

pub fn admin_routes(state: &web::Data<AppState>) -> Result<impl HttpServiceFactory, Error> {
    let key = state.cookie_key()?;
    let sessions = SessionMiddleware::builder(CookieSessionStore::default(), key)
        .cookie_name("vspdsession".to_owned())
        .cookie_secure(false)
        .build();
    Ok(web::scope("/admin")
        .wrap(sessions)
        .service(
            web::resource("")
                .route(web::get().to(handlers::admin::home))
                .route(web::post().to(handlers::admin::login)),
        )
        .service(web::resource("/ticket").route(web::post().to(handlers::admin::ticket_search)))
        .service(web::resource("/backup").route(web::get().to(handlers::admin::backup)))
        .service(web::resource("/logout").route(web::post().to(handlers::admin::logout)))
        .service(web::resource("/status").route(web::get().to(handlers::admin::status))))
}
