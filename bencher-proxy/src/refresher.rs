//! Background refresh of upstream mining info and chain arbitration.
//!
//! One pass per second: fetch the primary chain's round, apply the
//! transition table, then do the same for the secondary chain unless the
//! primary is mid-scan. A miner that started scanning chain A keeps
//! reporting A's height for up to `scanTime` seconds; switching the served
//! round during that window would waste its work and bounce its
//! submissions, so transitions defer to whichever chain is busy.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::admission::RoundCaches;
use crate::capacity::ClientRegistry;
use crate::chain::{Chain, ChainState};
use crate::error::{Error, Result};
use crate::tracing::prelude::*;
use crate::types::MiningInfo;
use crate::upstream::Transport;

const REFRESH_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    /// Height moved forward; caches survive.
    NewBlock,
    /// Height moved backward, or the base target changed in place; the
    /// round was invalidated and per-chain caches flush.
    Fork,
}

fn classify(current: Option<&MiningInfo>, incoming: &MiningInfo) -> Option<Transition> {
    match current {
        None => Some(Transition::NewBlock),
        Some(cur) if cur.height < incoming.height => Some(Transition::NewBlock),
        Some(cur) if cur.height > incoming.height => Some(Transition::Fork),
        Some(cur) if cur.base_target != incoming.base_target => Some(Transition::Fork),
        _ => None,
    }
}

/// Drives the upstream transports once per second and publishes round
/// transitions into the shared chain state.
pub struct Refresher {
    chains: Arc<ChainState>,
    caches: Arc<RoundCaches>,
    clients: Arc<ClientRegistry>,
    primary: Arc<Transport>,
    secondary: Option<Arc<Transport>>,
    scan_time: u64,
    display_miners: bool,
}

impl Refresher {
    pub fn new(
        chains: Arc<ChainState>,
        caches: Arc<RoundCaches>,
        clients: Arc<ClientRegistry>,
        primary: Arc<Transport>,
        secondary: Option<Arc<Transport>>,
        scan_time: u64,
        display_miners: bool,
    ) -> Self {
        Self {
            chains,
            caches,
            clients,
            primary,
            secondary,
            scan_time,
            display_miners,
        }
    }

    /// One refresh pass over both chains.
    pub async fn refresh(&self) -> Result<()> {
        let total_capacity = self.clients.total_capacity();

        let mut primary_err = None;
        match self.primary.fetch_mining_info(total_capacity).await {
            Ok(Some(incoming)) => {
                if self.apply(Chain::Primary, incoming) {
                    // A primary transition consumes the tick; the secondary
                    // is reconsidered once miners have moved over.
                    return Ok(());
                }
            }
            // Streaming upstream with no round delivered yet.
            Ok(None) => {}
            Err(e) => primary_err = Some(e),
        }

        let Some(secondary) = &self.secondary else {
            return primary_err.map_or(Ok(()), Err);
        };

        if let Some(current) = self.chains.current_info(Chain::Primary) {
            if current.scanning(self.scan_time) {
                return primary_err.map_or(Ok(()), Err);
            }
        }

        match secondary.fetch_mining_info(total_capacity).await {
            Ok(Some(incoming)) => {
                self.apply(Chain::Secondary, incoming);
            }
            Ok(None) => {
                return Err(Error::Upstream(
                    "secondary chain: initial mining info missing".to_string(),
                ));
            }
            Err(e) => return Err(e),
        }

        primary_err.map_or(Ok(()), Err)
    }

    /// Apply the transition table for `chain`. Returns true when a new
    /// round was published.
    fn apply(&self, chain: Chain, incoming: MiningInfo) -> bool {
        let current = self.chains.current_info(chain);
        let Some(transition) = classify(current.as_deref(), &incoming) else {
            return false;
        };

        info!(
            chain = chain.label(),
            height = incoming.height,
            base_target = incoming.base_target,
            target_deadline = incoming.target_deadline,
            gen_sig = %incoming.gen_sig,
            "new block"
        );
        if self.display_miners {
            self.clients.log_miners();
        }

        let (height, base_target) = (incoming.height, incoming.base_target);
        self.chains.publish(chain, Arc::new(incoming.started()));
        if transition == Transition::Fork {
            self.caches.flush(chain);
        }
        self.chains.advance(chain, height, base_target);

        if chain.is_primary() {
            // Miners redirected to primary must not keep scanning a
            // half-finished secondary round.
            if let Some(secondary) = self.chains.current_info(Chain::Secondary) {
                if secondary.scanning(self.scan_time) {
                    self.chains
                        .publish(Chain::Secondary, Arc::new(MiningInfo::zeroed()));
                }
            }
        }
        true
    }

    /// Tick loop. Refresh failures are logged and the previously published
    /// round stays current.
    pub async fn run(self, running: CancellationToken) {
        let mut tick = tokio::time::interval(REFRESH_INTERVAL);
        loop {
            tokio::select! {
                _ = running.cancelled() => return,
                _ = tick.tick() => {
                    if let Err(e) = self.refresh().await {
                        warn!(error = %e, "mining info refresh failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::IpBucket;
    use crate::types::MinerRound;
    use crate::upstream::mock::MockUpstream;

    struct Harness {
        refresher: Refresher,
        chains: Arc<ChainState>,
        caches: Arc<RoundCaches>,
        primary: Arc<MockUpstream>,
        secondary: Option<Arc<MockUpstream>>,
    }

    fn harness(with_secondary: bool, scan_time: u64) -> Harness {
        let chains = Arc::new(ChainState::new(u64::MAX, u64::MAX));
        let caches = Arc::new(RoundCaches::new());
        let clients = Arc::new(ClientRegistry::new());
        let primary = Arc::new(MockUpstream::default());
        let secondary = with_secondary.then(|| Arc::new(MockUpstream::default()));
        let refresher = Refresher::new(
            chains.clone(),
            caches.clone(),
            clients,
            Arc::new(Transport::Mock(primary.clone())),
            secondary.clone().map(|mock| Arc::new(Transport::Mock(mock))),
            scan_time,
            false,
        );
        Harness {
            refresher,
            chains,
            caches,
            primary,
            secondary,
        }
    }

    fn seed_bucket(caches: &RoundCaches, chain: Chain) {
        let round = MinerRound {
            account_id: 1,
            height: 100,
            nonce: 7,
            deadline: 5000,
            passphrase: None,
            adjusted: false,
        };
        caches.store_bucket(
            chain,
            "1.1.1.1:4711".to_string(),
            Arc::new(IpBucket::with_round(round)),
        );
    }

    fn bucket_exists(caches: &RoundCaches, chain: Chain) -> bool {
        caches.bucket(chain, "1.1.1.1:4711").is_some()
    }

    #[tokio::test]
    async fn test_first_refresh_publishes_and_advances() {
        let h = harness(false, 0);
        h.primary.push_info(100, 10);

        h.refresher.refresh().await.unwrap();

        let info = h.chains.current_info(Chain::Primary).unwrap();
        assert_eq!(info.height, 100);
        assert!(info.start_time.is_some());
        let current = h.chains.current_block();
        assert_eq!(current.height, 100);
        assert_eq!(current.base_target, 10);
        assert!(current.primary);
    }

    #[tokio::test]
    async fn test_new_block_resets_best_but_keeps_caches() {
        let h = harness(false, 0);
        h.primary.push_info(100, 10);
        h.refresher.refresh().await.unwrap();

        seed_bucket(&h.caches, Chain::Primary);
        h.chains.record_best(Chain::Primary, 400);

        h.primary.push_info(101, 11);
        h.refresher.refresh().await.unwrap();

        assert_eq!(h.chains.best(Chain::Primary), u64::MAX);
        assert!(bucket_exists(&h.caches, Chain::Primary));
        assert_eq!(h.chains.current_block().height, 101);
    }

    #[tokio::test]
    async fn test_fork_back_flushes_caches() {
        let h = harness(false, 0);
        h.primary.push_info(100, 10);
        h.refresher.refresh().await.unwrap();
        seed_bucket(&h.caches, Chain::Primary);

        h.primary.push_info(99, 10);
        h.refresher.refresh().await.unwrap();

        assert!(!bucket_exists(&h.caches, Chain::Primary));
        assert_eq!(h.chains.current_block().height, 99);
        assert_eq!(h.chains.best(Chain::Primary), u64::MAX);
    }

    #[tokio::test]
    async fn test_same_height_retarget_flushes_caches() {
        let h = harness(false, 0);
        h.primary.push_info(100, 10);
        h.refresher.refresh().await.unwrap();
        seed_bucket(&h.caches, Chain::Primary);
        h.chains.record_best(Chain::Primary, 400);

        h.primary.push_info(100, 12);
        h.refresher.refresh().await.unwrap();

        assert!(!bucket_exists(&h.caches, Chain::Primary));
        assert_eq!(h.chains.current_block().base_target, 12);
        assert_eq!(h.chains.best(Chain::Primary), u64::MAX);
    }

    #[tokio::test]
    async fn test_unchanged_round_is_a_no_op() {
        let h = harness(false, 0);
        h.primary.push_info(100, 10);
        h.refresher.refresh().await.unwrap();
        seed_bucket(&h.caches, Chain::Primary);
        h.chains.record_best(Chain::Primary, 400);
        let published = h.chains.current_info(Chain::Primary).unwrap();

        h.primary.push_info(100, 10);
        h.refresher.refresh().await.unwrap();

        assert!(Arc::ptr_eq(
            &published,
            &h.chains.current_info(Chain::Primary).unwrap()
        ));
        assert!(bucket_exists(&h.caches, Chain::Primary));
        assert_eq!(h.chains.best(Chain::Primary), 400);
    }

    #[tokio::test]
    async fn test_secondary_transition_remembers_outgoing_primary() {
        let h = harness(true, 0);
        h.primary.push_info(100, 10);
        h.secondary.as_ref().unwrap().push_info(200, 20);
        h.refresher.refresh().await.unwrap();
        // Primary transition consumed the first tick.
        h.primary.push_info(100, 10);
        h.refresher.refresh().await.unwrap();

        let current = h.chains.current_block();
        let last = h.chains.last_block();
        assert!(!current.primary);
        assert_eq!(current.height, 200);
        assert!(last.primary);
        assert_eq!(last.height, 100);
        assert_eq!(last.base_target, 10);
    }

    #[tokio::test]
    async fn test_secondary_skipped_while_primary_scanning() {
        let h = harness(true, 3600);
        h.primary.push_info(100, 10);
        h.refresher.refresh().await.unwrap();

        // The primary round just started; its scan window blocks secondary.
        h.primary.push_info(100, 10);
        h.secondary.as_ref().unwrap().push_info(200, 20);
        h.refresher.refresh().await.unwrap();

        assert!(h.chains.current_info(Chain::Secondary).is_none());
        assert!(h.chains.current_block().primary);
    }

    #[tokio::test]
    async fn test_primary_transition_parks_scanning_secondary() {
        let h = harness(true, 3600);
        // Secondary establishes the current round first.
        h.secondary.as_ref().unwrap().push_info(200, 20);
        h.refresher.refresh().await.unwrap();
        assert_eq!(h.chains.current_info(Chain::Secondary).unwrap().height, 200);

        // Primary comes alive while the secondary round is mid-scan.
        h.primary.push_info(100, 10);
        h.refresher.refresh().await.unwrap();

        let parked = h.chains.current_info(Chain::Secondary).unwrap();
        assert_eq!(parked.height, 0);
        assert!(parked.start_time.is_none());
        assert!(h.chains.current_block().primary);
    }

    #[tokio::test]
    async fn test_push_upstream_not_ready_skips_tick() {
        let h = harness(false, 0);

        h.refresher.refresh().await.unwrap();

        assert!(h.chains.current_info(Chain::Primary).is_none());
    }
}
