//! Periodically aggregated counters served to clients and the admin page.

use crate::db::Store;
use crate::errors::Error;
use crate::node::Node;
use crate::wallet::WalletPool;
use parking_lot::RwLock;

#[derive(Debug, Clone, Default)]
pub struct Stats {
    pub voting: i64,
    pub voted: i64,
    pub revoked: i64,
    pub block_height: i64,
    /// Share of the live ticket pool this VSP is voting for.
    pub network_proportion: f64,
    pub total_wallets: usize,
    pub wallets_online: usize,
    pub updated: i64,
}

/// Readers always see a complete snapshot; the refresh replaces it in one
/// assignment under the write lock.
#[derive(Default)]
pub struct StatsCache {
    snapshot: RwLock<Stats>,
}

impl StatsCache {
    pub fn new() -> Self {
        StatsCache::default()
    }

    pub fn data(&self) -> Stats {
        self.snapshot.read().clone()
    }

    pub async fn refresh(
        &self,
        store: &Store,
        node: &dyn Node,
        wallets: &WalletPool,
        now: i64,
    ) -> Result<(), Error> {
        let (voting, voted, revoked) = store.count_tickets()?;
        let best = node.best_block_header().await?;
        let (connected, _) = wallets.clients().await;

        let network_proportion = if best.pool_size > 0 {
            voting as f64 / best.pool_size as f64
        } else {
            0.0
        };

        *self.snapshot.write() = Stats {
            voting,
            voted,
            revoked,
            block_height: best.height,
            network_proportion,
            total_wallets: wallets.len(),
            wallets_online: connected.len(),
            updated: now,
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DEFAULT_MAX_VOTE_CHANGES;
    use crate::models::{FeeStatus, Ticket, TicketOutcome};
    use crate::test_utils::{FakeNode, FakeWallet};
    use crate::wallet::WalletPool;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[actix_rt::test]
    async fn refresh_aggregates_store_node_and_wallets() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path().join("vspd.db"), DEFAULT_MAX_VOTE_CHANGES).unwrap();

        for (seed, outcome) in [
            (0x41u8, TicketOutcome::None),
            (0x42, TicketOutcome::None),
            (0x43, TicketOutcome::Voted),
            (0x44, TicketOutcome::Revoked),
        ] {
            store
                .insert_new_ticket(&Ticket {
                    hash: format!("{:02x}", seed).repeat(32),
                    commitment_address: "Ss".to_owned(),
                    fee_tx_status: FeeStatus::Confirmed,
                    confirmed: true,
                    outcome,
                    ..Ticket::default()
                })
                .unwrap();
        }

        let node = FakeNode::new();
        let reachable = FakeWallet::new("alpha");
        let dead = FakeWallet::new("beta");
        *dead.unreachable.lock() = true;
        let wallets = WalletPool::new(vec![
            reachable as Arc<dyn crate::wallet::Wallet>,
            dead as Arc<dyn crate::wallet::Wallet>,
        ]);

        let cache = StatsCache::new();
        cache.refresh(&store, &*node, &wallets, 777).await.unwrap();

        let stats = cache.data();
        assert_eq!(stats.voting, 2);
        assert_eq!(stats.voted, 1);
        assert_eq!(stats.revoked, 1);
        assert_eq!(stats.block_height, 1000);
        assert_eq!(stats.total_wallets, 2);
        assert_eq!(stats.wallets_online, 1);
        assert_eq!(stats.updated, 777);
        assert!((stats.network_proportion - 2.0 / 40960.0).abs() < 1e-12);
    }
}
