//! Periodic background work: stats-cache refresh, the per-ticket state
//! machine sweeps and the hourly wallet consistency pass. Runs as one
//! actor; each tick spawns an independent task so a slow sweep never
//! blocks the timer.

use crate::app::AppState;
use actix::prelude::*;
use actix_web::web;
use chrono::Utc;
use log::{debug, error, info};
use std::time::Duration;

const SWEEP_INTERVAL: Duration = Duration::from_secs(30);
const WALLET_CHECK_INTERVAL: Duration = Duration::from_secs(3600);

pub struct Cron {
    state: web::Data<AppState>,
}

impl Cron {
    pub fn new(state: web::Data<AppState>) -> Self {
        Cron { state }
    }
}

impl Actor for Cron {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!("starting background process");
        ctx.run_interval(self.state.cfg.stats_interval(), refresh_stats);
        ctx.run_interval(SWEEP_INTERVAL, run_sweeps);
        ctx.run_interval(WALLET_CHECK_INTERVAL, check_wallets);
        // Serve real numbers from the first request on.
        refresh_stats(self, ctx);
    }

    fn stopping(&mut self, _ctx: &mut Self::Context) -> Running {
        Running::Stop
    }
}

fn refresh_stats(cron: &mut Cron, _: &mut Context<Cron>) {
    debug!("run refresh_stats");
    let state = cron.state.clone();
    actix_rt::spawn(async move {
        let now = Utc::now().timestamp();
        if let Err(e) = state
            .stats
            .refresh(&state.store, state.node.as_ref(), &state.wallets, now)
            .await
        {
            error!("cannot refresh stats cache: {}", e);
        }
    });
}

fn run_sweeps(cron: &mut Cron, _: &mut Context<Cron>) {
    debug!("run state machine sweeps");
    let state = cron.state.clone();
    actix_rt::spawn(async move {
        if let Err(e) = state.fsm.run_sweeps().await {
            error!("sweep failed: {}", e);
        }
    });
}

fn check_wallets(cron: &mut Cron, _: &mut Context<Cron>) {
    debug!("run wallet consistency check");
    let state = cron.state.clone();
    actix_rt::spawn(async move {
        if let Err(e) = state.fsm.check_wallet_consistency().await {
            error!("wallet consistency check failed: {}", e);
        }
    });
}
