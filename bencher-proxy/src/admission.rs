//! Submission admission: the per-IP, per-account state machine deciding
//! whether an arriving nonce is forwarded upstream.
//!
//! Decisions for one source address are serialized by that address's bucket
//! mutex, held across the upstream round-trip; across addresses there is no
//! ordering. The refresher may flush a chain's buckets concurrently; a
//! submission admitted into a just-flushed bucket is dropped with it, which
//! is indistinguishable from a fork-time rejection.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::cache::TtlCache;
use crate::capacity::ClientRegistry;
use crate::chain::{Chain, ChainState};
use crate::error::{Error, Result};
use crate::tracing::prelude::*;
use crate::types::{MinerRound, SubmitResponse};
use crate::upstream::{SubmitOutcome, Transport};

/// Sliding lifetime of per-IP submission state. Liar marks use the same
/// period, fixed from insertion.
const ROUND_CACHE_TTL: Duration = Duration::from_secs(15 * 60);

/// Rounds submitted by one remote address, keyed by account id.
pub struct IpBucket {
    rounds: Mutex<HashMap<u64, MinerRound>>,
}

impl IpBucket {
    pub(crate) fn with_round(round: MinerRound) -> Self {
        let mut rounds = HashMap::new();
        rounds.insert(round.account_id, round);
        Self {
            rounds: Mutex::new(rounds),
        }
    }
}

/// Per-IP admission state for both chains plus the liar quarantine.
pub struct RoundCaches {
    buckets: [TtlCache<Arc<IpBucket>>; 2],
    liars: TtlCache<()>,
}

impl Default for RoundCaches {
    fn default() -> Self {
        Self::new()
    }
}

impl RoundCaches {
    pub fn new() -> Self {
        Self {
            buckets: [
                TtlCache::new(ROUND_CACHE_TTL),
                TtlCache::new(ROUND_CACHE_TTL),
            ],
            liars: TtlCache::new(ROUND_CACHE_TTL),
        }
    }

    /// Drop all per-IP state for `chain` (fork handling). The other chain's
    /// buckets are untouched.
    pub fn flush(&self, chain: Chain) {
        self.buckets[chain.index()].flush();
    }

    pub(crate) fn bucket(&self, chain: Chain, key: &str) -> Option<Arc<IpBucket>> {
        self.buckets[chain.index()].get(key)
    }

    pub(crate) fn store_bucket(&self, chain: Chain, key: String, bucket: Arc<IpBucket>) {
        self.buckets[chain.index()].insert(key, bucket);
    }

    fn is_liar(&self, key: &str) -> bool {
        self.liars.peek(key).is_some()
    }

    fn mark_liar(&self, key: String) {
        self.liars.insert(key, ());
    }
}

/// What the engine decided about one submission.
#[derive(Debug, PartialEq, Eq)]
pub enum Admission {
    /// Forwarded and recorded; the body is the upstream's reply (or the
    /// synthetic one for a streaming upstream).
    Updated(Vec<u8>),

    /// Not forwarded; the caller answers with a locally computed success
    /// body.
    NotUpdated,

    /// Stale or unknown block height.
    WrongHeight,

    /// The source address exhausted its per-IP account allowance.
    ExceededMinersPerIp,

    /// The upstream could not be reached; nothing was recorded.
    RemoteError,
}

/// Per-chain admission policy knobs.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChainPolicy {
    pub ignore_worse_deadlines: bool,
}

/// The admission engine. One per process, shared by all request handlers.
pub struct Engine {
    chains: Arc<ChainState>,
    clients: Arc<ClientRegistry>,
    caches: Arc<RoundCaches>,
    primary: Arc<Transport>,
    secondary: Option<Arc<Transport>>,
    policy: [ChainPolicy; 2],
    miners_per_ip: usize,
    lie_detector: bool,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chains: Arc<ChainState>,
        clients: Arc<ClientRegistry>,
        caches: Arc<RoundCaches>,
        primary: Arc<Transport>,
        secondary: Option<Arc<Transport>>,
        policy: [ChainPolicy; 2],
        miners_per_ip: usize,
        lie_detector: bool,
    ) -> Self {
        Self {
            chains,
            clients,
            caches,
            primary,
            secondary,
            policy,
            miners_per_ip,
            lie_detector,
        }
    }

    fn transport(&self, chain: Chain) -> Option<&Transport> {
        match chain {
            Chain::Primary => Some(&self.primary),
            Chain::Secondary => self.secondary.as_deref(),
        }
    }

    /// Classify one submission from `peer` and forward it when it survives
    /// every filter.
    pub async fn try_update(&self, peer: SocketAddr, miner: &str, round: &MinerRound) -> Admission {
        let key = peer.to_string();
        let current = self.chains.current_block();
        let last = self.chains.last_block();

        // Late submission while no cross-chain transition is in flight.
        if round.height != current.height && current.primary == last.primary {
            info!(
                height = round.height,
                account = round.account_id,
                nonce = round.nonce,
                deadline = %format!("X{}", round.deadline),
                "deadline out-dated"
            );
            return Admission::WrongHeight;
        }
        // Neither the current block nor the remembered previous one.
        if round.height != current.height && round.height != last.height {
            info!(
                height = round.height,
                account = round.account_id,
                nonce = round.nonce,
                deadline = %format!("X{}", round.deadline),
                "deadline out-dated"
            );
            return Admission::WrongHeight;
        }

        // Quarantined source.
        if self.caches.is_liar(&key) {
            return Admission::NotUpdated;
        }

        // Bind to the chain the submitted height belongs to.
        let (chain, base_target) = if round.height == current.height {
            (Chain::from_primary_flag(current.primary), current.base_target)
        } else {
            (Chain::from_primary_flag(last.primary), last.base_target)
        };
        let deadline = round.adjusted_deadline(base_target);

        if deadline > self.chains.target_deadline(chain) {
            info!(
                height = round.height,
                account = round.account_id,
                nonce = round.nonce,
                deadline,
                "deadline filtered"
            );
            return Admission::NotUpdated;
        }
        if self.policy[chain.index()].ignore_worse_deadlines && deadline > self.chains.best(chain) {
            info!(
                height = round.height,
                account = round.account_id,
                nonce = round.nonce,
                deadline,
                "deadline discarded"
            );
            return Admission::NotUpdated;
        }

        let Some(bucket) = self.caches.bucket(chain, &key) else {
            // First submission from this address in the cache window.
            let body = match self.forward(chain, round, deadline, peer, miner).await {
                Ok(body) => body,
                Err(_) => return Admission::RemoteError,
            };
            self.caches
                .store_bucket(chain, key, Arc::new(IpBucket::with_round(round.clone())));
            self.chains.record_best(chain, deadline);
            info!(
                height = round.height,
                account = round.account_id,
                nonce = round.nonce,
                deadline,
                "deadline accepted"
            );
            return Admission::Updated(body);
        };

        let mut rounds = bucket.rounds.lock().await;
        match rounds.get(&round.account_id) {
            None => {
                if rounds.len() >= self.miners_per_ip {
                    // An entry from an earlier block can make room.
                    let stale = rounds
                        .iter()
                        .find(|(_, stored)| stored.height < round.height)
                        .map(|(account, _)| *account);
                    match stale {
                        Some(account) => {
                            rounds.remove(&account);
                        }
                        None => {
                            info!(
                                height = round.height,
                                account = round.account_id,
                                nonce = round.nonce,
                                deadline,
                                "deadline rejected"
                            );
                            return Admission::ExceededMinersPerIp;
                        }
                    }
                }
            }
            Some(existing) => {
                let existing_deadline = existing.adjusted_deadline(base_target);
                if existing.height > round.height
                    || (existing.height == round.height && existing_deadline < deadline)
                {
                    info!(
                        height = round.height,
                        account = round.account_id,
                        nonce = round.nonce,
                        deadline,
                        "deadline ignored"
                    );
                    return Admission::NotUpdated;
                }
            }
        }

        let body = match self.forward(chain, round, deadline, peer, miner).await {
            Ok(body) => body,
            Err(_) => return Admission::RemoteError,
        };
        rounds.insert(round.account_id, round.clone());
        self.chains.record_best(chain, deadline);
        info!(
            height = round.height,
            account = round.account_id,
            nonce = round.nonce,
            deadline,
            "deadline accepted"
        );
        Admission::Updated(body)
    }

    /// Forward over the bound chain's transport and post-process the reply.
    async fn forward(
        &self,
        chain: Chain,
        round: &MinerRound,
        deadline: u64,
        peer: SocketAddr,
        miner: &str,
    ) -> Result<Vec<u8>> {
        let Some(transport) = self.transport(chain) else {
            warn!(chain = chain.label(), "submission bound to an unconfigured chain");
            return Err(Error::Upstream("no upstream configured for chain".to_string()));
        };
        let total_capacity = self.clients.total_capacity();
        match transport
            .submit(round, miner, peer.ip(), total_capacity)
            .await
        {
            Ok(SubmitOutcome::Fired) => {
                info!(
                    height = round.height,
                    account = round.account_id,
                    nonce = round.nonce,
                    deadline = round.deadline,
                    "deadline fired"
                );
                Ok(success_body(deadline))
            }
            Ok(SubmitOutcome::Body(body)) => {
                if self.lie_detector {
                    if let Ok(reply) = serde_json::from_slice::<SubmitResponse>(&body) {
                        if reply.deadline.get() != deadline {
                            warn!(
                                height = round.height,
                                peer = %peer,
                                upstream = reply.deadline.get(),
                                local = deadline,
                                "liar detected"
                            );
                            self.caches.mark_liar(peer.to_string());
                        }
                    }
                }
                Ok(body)
            }
            Err(e) => {
                warn!(error = %e, chain = chain.label(), "upstream submit failed");
                Err(e)
            }
        }
    }
}

/// The success envelope served for locally answered submissions.
pub fn success_body(deadline: u64) -> Vec<u8> {
    format!("{{\"deadline\":{deadline},\"result\":\"success\"}}").into_bytes()
}
