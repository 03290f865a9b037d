//! Upstream transports.
//!
//! Each configured upstream URL is served by one of two transports with the
//! same contract: a pull transport that fetches mining info over HTTP once
//! per refresh tick, and a push transport that receives it over a
//! persistent websocket. Selection is by URL scheme: `wss` upstreams speak
//! the streaming protocol, anything else is polled. At most one push
//! transport exists per process.

mod pull;
mod push;

#[cfg(test)]
pub(crate) mod mock;

pub use pull::PullUpstream;
pub use push::PushUpstream;

use std::net::IpAddr;
use std::sync::Arc;

use crate::error::Result;
use crate::types::{MinerRound, MiningInfo};

/// What a submission produced on the upstream side.
pub enum SubmitOutcome {
    /// Synchronous upstream response body, handed to the miner verbatim.
    Body(Vec<u8>),

    /// Fire-and-forget send (push transport); the caller synthesizes the
    /// reply because the protocol has no per-submission answer.
    Fired,
}

/// A mining upstream reachable over one of the two transports.
///
/// An enum rather than a trait object: both variants are known at compile
/// time and the admission path stays free of boxed futures.
pub enum Transport {
    Pull(PullUpstream),
    Push(Arc<PushUpstream>),
    #[cfg(test)]
    Mock(Arc<mock::MockUpstream>),
}

impl Transport {
    /// Current round snapshot, if one is obtainable this tick. A push
    /// upstream that has not delivered its first round yet yields `None`.
    pub async fn fetch_mining_info(&self, total_capacity: i64) -> Result<Option<MiningInfo>> {
        match self {
            Transport::Pull(pull) => pull.fetch_mining_info(total_capacity).await.map(Some),
            Transport::Push(push) => Ok(push.current()),
            #[cfg(test)]
            Transport::Mock(mock) => mock.fetch(),
        }
    }

    /// Forward `round` upstream on behalf of `miner` at `peer_ip`.
    pub async fn submit(
        &self,
        round: &MinerRound,
        miner: &str,
        peer_ip: IpAddr,
        total_capacity: i64,
    ) -> Result<SubmitOutcome> {
        match self {
            Transport::Pull(pull) => pull
                .submit(round, miner, peer_ip, total_capacity)
                .await
                .map(SubmitOutcome::Body),
            Transport::Push(push) => {
                push.submit_nonce(round).await;
                Ok(SubmitOutcome::Fired)
            }
            #[cfg(test)]
            Transport::Mock(mock) => mock.submit(round),
        }
    }

    /// Tell a streaming upstream the fleet's current total capacity; pull
    /// upstreams learn it from request headers instead.
    pub fn set_capacity(&self, total_gib: i64) {
        if let Transport::Push(push) = self {
            push.set_capacity(total_gib);
        }
    }
}
