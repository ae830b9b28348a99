//! Drives each ticket through its registration state machine: broadcast
//! of the ticket and its parent, fee acceptance and broadcast, fee
//! confirmation, wallet registration and outcome detection.

use crate::api::PayFeeRequest;
use crate::chain::{self, ChainParams};
use crate::db::Store;
use crate::errors::{ApiCode, Error};
use crate::models::{FeeStatus, Ticket, TicketOutcome};
use crate::node::{self, Node, NodeError};
use crate::wallet::{Wallet, WalletPool};
use chrono::Utc;
use log::{debug, error, info, warn};
use std::sync::Arc;

/// Confirmations before a ticket purchase or a fee payment is final.
pub const REQUIRED_CONFS: i64 = 6;

/// Lifetime of a fee offer.
pub const FEE_ADDRESS_EXPIRATION_SECS: i64 = 3600;

pub struct Fsm {
    pub store: Arc<Store>,
    pub node: Arc<dyn Node>,
    pub wallets: Arc<WalletPool>,
    pub params: Arc<ChainParams>,
    pub fee_percent: f64,
}

impl Fsm {
    /// Ensures the node knows both the ticket and its funding parent,
    /// broadcasting whichever it has not seen. Returns the decoded ticket.
    pub async fn broadcast_ticket(
        &self,
        ticket_hash: &str,
        ticket_hex: &str,
        parent_hex: &str,
    ) -> Result<chain::Tx, Error> {
        let ticket = chain::decode_tx_hex(ticket_hex)
            .map_err(|e| Error::api(ApiCode::InvalidTicket, format!("cannot decode ticket: {}", e)))?;
        if ticket.hash() != ticket_hash {
            return Err(Error::api(
                ApiCode::BadRequest,
                "provided ticket hex does not match hash",
            ));
        }
        chain::check_stake_submission(&ticket)
            .map_err(|e| Error::api(ApiCode::InvalidTicket, e.to_string()))?;

        let parent = chain::decode_tx_hex(parent_hex)
            .map_err(|e| Error::api(ApiCode::BadRequest, format!("cannot decode parent: {}", e)))?;
        let parent_hash = parent.hash();

        match self.node.get_raw_transaction(&parent_hash).await {
            Ok(_) => {}
            Err(NodeError::UnknownTx(_)) => {
                // Only relay a parent the ticket actually spends.
                if !ticket.inputs.iter().any(|i| i.prev_hash == parent_hash) {
                    return Err(Error::api(
                        ApiCode::BadRequest,
                        "parent transaction is not referenced by the ticket",
                    ));
                }
                info!("broadcasting parent tx {}", parent_hash);
                self.node.send_raw_transaction(parent_hex).await.map_err(|e| {
                    error!("cannot broadcast parent {}: {}", parent_hash, e);
                    Error::code(ApiCode::CannotBroadcastTicket)
                })?;
            }
            Err(e) => return Err(e.into()),
        }

        match self.node.get_raw_transaction(ticket_hash).await {
            Ok(_) => {}
            Err(NodeError::UnknownTx(_)) => {
                info!("broadcasting ticket {}", ticket_hash);
                self.node.send_raw_transaction(ticket_hex).await.map_err(|e| {
                    error!("cannot broadcast ticket {}: {}", ticket_hash, e);
                    Error::code(ApiCode::CannotBroadcastTicket)
                })?;
            }
            Err(e) => return Err(e.into()),
        }

        Ok(ticket)
    }

    /// The fee currently charged for a new ticket, in atoms.
    pub async fn current_fee(&self) -> Result<i64, Error> {
        let best = self.node.best_block_header().await?;
        let dcp0010_active = self.node.is_dcp0010_active().await?;
        let fee = self.params.stake_pool_ticket_fee(
            best.sbits_atoms(),
            self.params.relay_fee,
            best.height,
            self.fee_percent,
            dcp0010_active,
        );
        debug!("current ticket fee is {} atoms", fee);
        Ok(fee)
    }

    /// Validates and records a fee payment, then broadcasts it when the
    /// ticket is already confirmed. Invalid vote preferences are dropped
    /// with a warning; everything else in the request must be right.
    pub async fn accept_fee(
        &self,
        ticket: &mut Ticket,
        request: &PayFeeRequest,
        now: i64,
    ) -> Result<(), Error> {
        if !ticket.fee_settable() {
            return Err(Error::code(ApiCode::FeeAlreadyReceived));
        }
        if ticket.fee_expired(now) {
            return Err(Error::code(ApiCode::FeeExpired));
        }

        let fee_tx = chain::decode_tx_hex(&request.feetx).map_err(|e| {
            Error::api(ApiCode::InvalidFeeTx, format!("cannot decode fee transaction: {}", e))
        })?;
        chain::check_transaction_sanity(&fee_tx)
            .map_err(|e| Error::api(ApiCode::InvalidFeeTx, e.to_string()))?;

        let fee_script = chain::pay_to_addr_script(&ticket.fee_address, &self.params)
            .map_err(|e| Error::internal(format!("stored fee address invalid: {}", e)))?;
        let fee_paid = fee_tx
            .outputs
            .iter()
            .find(|o| o.version == 0 && o.script == fee_script)
            .map(|o| o.value)
            .ok_or_else(|| {
                Error::api(
                    ApiCode::InvalidFeeTx,
                    "feetx does not include any payments to the fee address",
                )
            })?;
        if fee_paid < ticket.fee_amount {
            return Err(Error::api(
                ApiCode::FeeTooSmall,
                format!("sent: {}, required: {}", fee_paid, ticket.fee_amount),
            ));
        }

        let voting_script = chain::wif_voting_script(&request.votingkey, &self.params)
            .map_err(|e| Error::api(ApiCode::InvalidPrivKey, e.to_string()))?;
        let raw_ticket = self.node.get_raw_transaction(&ticket.hash).await?;
        let ticket_tx = chain::decode_tx_hex(&raw_ticket.hex)
            .map_err(|e| Error::internal(format!("cannot decode stored ticket: {}", e)))?;
        if ticket_tx.outputs.first().map(|o| o.script.as_slice()) != Some(voting_script.as_slice())
        {
            return Err(Error::api(
                ApiCode::InvalidPrivKey,
                "voting key does not match ticket voting address",
            ));
        }

        match chain::validate_vote_choices(&request.votechoices, &self.params) {
            Ok(()) => ticket.vote_choices = request.votechoices.clone(),
            Err(e) => warn!("dropping vote choices for {}: {}", ticket.hash, e),
        }
        match chain::validate_tspend_policy(&request.tspendpolicy) {
            Ok(()) => ticket.tspend_policy = request.tspendpolicy.clone(),
            Err(e) => warn!("dropping tspend policy for {}: {}", ticket.hash, e),
        }
        match chain::validate_treasury_policy(&request.treasurypolicy) {
            Ok(()) => ticket.treasury_policy = request.treasurypolicy.clone(),
            Err(e) => warn!("dropping treasury policy for {}: {}", ticket.hash, e),
        }

        ticket.voting_wif = request.votingkey.clone();
        ticket.fee_tx_hex = request.feetx.clone();
        ticket.fee_tx_hash = fee_tx.hash();
        ticket.fee_tx_status = FeeStatus::Received;
        self.store.update_ticket(ticket)?;
        info!("fee tx received for ticket {}", ticket.hash);

        if ticket.confirmed {
            self.broadcast_fee(ticket).await?;
        }
        Ok(())
    }

    /// Broadcasts a received fee transaction. A rejection parks the ticket
    /// in the error state so the client can submit a replacement.
    pub async fn broadcast_fee(&self, ticket: &mut Ticket) -> Result<(), Error> {
        match self.node.send_raw_transaction(&ticket.fee_tx_hex).await {
            Ok(_) => {
                info!("fee tx {} broadcast for ticket {}", ticket.fee_tx_hash, ticket.hash);
                ticket.fee_tx_status = FeeStatus::Broadcast;
                self.store.update_ticket(ticket)?;
                Ok(())
            }
            Err(e) => {
                error!("cannot broadcast fee tx for ticket {}: {}", ticket.hash, e);
                ticket.fee_tx_status = FeeStatus::Error;
                self.store.update_ticket(ticket)?;
                if node::is_unknown_outputs_error(&e.to_string()) {
                    Err(Error::code(ApiCode::CannotBroadcastFeeUnknownOutputs))
                } else {
                    Err(Error::code(ApiCode::CannotBroadcastFee))
                }
            }
        }
    }

    /// Registers a fee-confirmed ticket with every reachable voting
    /// wallet. Individual wallet failures are logged and skipped.
    pub async fn register_with_wallets(&self, ticket: &Ticket) -> Result<(), Error> {
        let raw = self.node.get_raw_transaction(&ticket.hash).await?;
        let (clients, failed) = self.wallets.clients().await;
        if !failed.is_empty() {
            warn!("skipping unreachable wallets: {}", failed.join(", "));
        }
        for wallet in clients {
            if let Err(e) = wallet.add_transaction(&raw.blockhash, &raw.hex).await {
                error!("cannot add ticket {} to wallet: {}", ticket.hash, e);
                continue;
            }
            if let Err(e) = wallet.import_priv_key(&ticket.voting_wif).await {
                error!("cannot import voting key for {} into wallet: {}", ticket.hash, e);
                continue;
            }
            apply_preferences(wallet.as_ref(), ticket).await;
        }
        Ok(())
    }

    /// Pushes updated vote preferences to every reachable wallet,
    /// best-effort.
    pub async fn update_wallet_preferences(&self, ticket: &Ticket) {
        let (clients, failed) = self.wallets.clients().await;
        if !failed.is_empty() {
            warn!("skipping unreachable wallets: {}", failed.join(", "));
        }
        for wallet in clients {
            apply_preferences(wallet.as_ref(), ticket).await;
        }
    }

    /// One pass of the periodic maintenance: confirm ticket purchases,
    /// backfill purchase heights, retry and confirm fee broadcasts, and
    /// detect terminal outcomes.
    pub async fn run_sweeps(&self) -> Result<(), Error> {
        let best = self.node.best_block_header().await?;
        self.confirm_tickets().await?;
        self.backfill_purchase_heights().await?;
        self.broadcast_pending_fees().await?;
        self.confirm_fees().await?;
        self.check_outcomes(best.height).await?;
        Ok(())
    }

    async fn confirm_tickets(&self) -> Result<(), Error> {
        let now = Utc::now().timestamp();
        for mut ticket in self.store.unconfirmed_tickets()? {
            match self.node.get_raw_transaction(&ticket.hash).await {
                Ok(raw) => {
                    if raw.confirmations >= REQUIRED_CONFS {
                        ticket.confirmed = true;
                        ticket.purchase_height = raw.blockheight;
                        self.store.update_ticket(&ticket)?;
                        info!("ticket {} confirmed", ticket.hash);
                    }
                }
                Err(NodeError::UnknownTx(_)) => {
                    // The purchase never made it on chain. Once the offer
                    // lapses the ticket is unsalvageable.
                    if ticket.fee_expired(now) {
                        warn!("removing abandoned ticket {}", ticket.hash);
                        self.store.delete_ticket(&ticket.hash)?;
                    }
                }
                Err(e) => warn!("cannot look up ticket {}: {}", ticket.hash, e),
            }
        }
        Ok(())
    }

    async fn backfill_purchase_heights(&self) -> Result<(), Error> {
        for mut ticket in self.store.missing_purchase_height()? {
            match self.node.get_raw_transaction(&ticket.hash).await {
                Ok(raw) if raw.blockheight > 0 => {
                    ticket.purchase_height = raw.blockheight;
                    self.store.update_ticket(&ticket)?;
                }
                Ok(_) => {}
                Err(e) => warn!("cannot look up ticket {}: {}", ticket.hash, e),
            }
        }
        Ok(())
    }

    async fn broadcast_pending_fees(&self) -> Result<(), Error> {
        for mut ticket in self.store.pending_fees()? {
            if let Err(e) = self.broadcast_fee(&mut ticket).await {
                warn!("fee broadcast for {} failed: {}", ticket.hash, e);
            }
        }
        Ok(())
    }

    async fn confirm_fees(&self) -> Result<(), Error> {
        for mut ticket in self.store.unconfirmed_fees()? {
            match self.node.get_raw_transaction(&ticket.fee_tx_hash).await {
                Ok(raw) if raw.confirmations >= REQUIRED_CONFS => {
                    ticket.fee_tx_status = FeeStatus::Confirmed;
                    self.store.update_ticket(&ticket)?;
                    info!("fee tx confirmed for ticket {}", ticket.hash);
                    if let Err(e) = self.register_with_wallets(&ticket).await {
                        warn!("cannot register ticket {} with wallets: {}", ticket.hash, e);
                    }
                }
                Ok(_) => {}
                Err(NodeError::UnknownTx(_)) => {
                    // Evicted from the mempool; the client has to submit a
                    // replacement.
                    warn!("fee tx for ticket {} disappeared", ticket.hash);
                    ticket.fee_tx_status = FeeStatus::Error;
                    self.store.update_ticket(&ticket)?;
                }
                Err(e) => warn!("cannot look up fee tx for {}: {}", ticket.hash, e),
            }
        }
        Ok(())
    }

    async fn check_outcomes(&self, best_height: i64) -> Result<(), Error> {
        for mut ticket in self.store.votable_tickets()? {
            let raw = match self.node.get_raw_transaction(&ticket.hash).await {
                Ok(raw) => raw,
                Err(e) => {
                    warn!("cannot look up ticket {}: {}", ticket.hash, e);
                    continue;
                }
            };
            match self.node.can_ticket_vote(&raw, &ticket.hash).await {
                Ok(true) => {}
                Ok(false) => {
                    // Left the live pool. Inside the expiry window that
                    // means it voted; past it, it was revoked.
                    let expiry_height = ticket.purchase_height
                        + self.params.ticket_maturity
                        + self.params.ticket_expiry;
                    ticket.outcome = if ticket.purchase_height > 0 && best_height >= expiry_height {
                        TicketOutcome::Revoked
                    } else {
                        TicketOutcome::Voted
                    };
                    info!("ticket {} outcome: {}", ticket.hash, ticket.outcome);
                    self.store.update_ticket(&ticket)?;
                }
                Err(e) => warn!("cannot check vote eligibility for {}: {}", ticket.hash, e),
            }
        }
        Ok(())
    }

    /// Re-registers every votable ticket with the wallets. Registration is
    /// idempotent, so this repairs wallets that were unreachable when a
    /// ticket first confirmed.
    pub async fn check_wallet_consistency(&self) -> Result<(), Error> {
        for ticket in self.store.votable_tickets()? {
            if let Err(e) = self.register_with_wallets(&ticket).await {
                warn!("cannot re-register ticket {}: {}", ticket.hash, e);
            }
        }
        Ok(())
    }
}

async fn apply_preferences(wallet: &dyn Wallet, ticket: &Ticket) {
    for (agenda, choice) in &ticket.vote_choices {
        if let Err(e) = wallet.set_vote_choice(agenda, choice, &ticket.hash).await {
            error!("cannot set vote choice on wallet: {}", e);
        }
    }
    for (hash, policy) in &ticket.tspend_policy {
        if let Err(e) = wallet.set_tspend_policy(hash, policy, &ticket.hash).await {
            error!("cannot set tspend policy on wallet: {}", e);
        }
    }
    for (key, policy) in &ticket.treasury_policy {
        if let Err(e) = wallet.set_treasury_policy(key, policy, &ticket.hash).await {
            error!("cannot set treasury policy on wallet: {}", e);
        }
    }
}
