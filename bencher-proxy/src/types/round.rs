//! Submission and round snapshot types.

use std::time::Instant;

use serde::{Deserialize, Serialize};

use super::FlexU64;

/// One pending nonce submission as received from a miner.
///
/// Immutable after parsing; the admission engine compares and stores these
/// but never rewrites one in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MinerRound {
    /// Numeric account id the nonce was plotted for
    pub account_id: u64,

    /// Block height the miner scanned
    pub height: u64,

    /// The nonce itself
    pub nonce: u64,

    /// Deadline as submitted
    pub deadline: u64,

    /// Secret phrase, present only in solo/wallet setups
    pub passphrase: Option<String>,

    /// True when `deadline` is already divided by the base target (the
    /// miner sent it via the `X-Deadline` header).
    pub adjusted: bool,
}

impl MinerRound {
    /// Deadline in adjusted (comparable) form against `base_target`.
    pub fn adjusted_deadline(&self, base_target: u64) -> u64 {
        if self.adjusted {
            self.deadline
        } else {
            self.deadline / base_target.max(1)
        }
    }
}

/// Wire form of an upstream mining-info message.
///
/// Upstreams attach all sorts of extra fields; only these four matter to
/// the proxy, and `targetDeadline` is not always present.
#[derive(Debug, Clone, Deserialize)]
pub struct MiningInfoWire {
    pub height: FlexU64,

    #[serde(rename = "baseTarget")]
    pub base_target: FlexU64,

    #[serde(default, rename = "targetDeadline")]
    pub target_deadline: FlexU64,

    #[serde(default, rename = "generationSignature")]
    pub gen_sig: String,
}

/// Snapshot of an upstream's current round.
///
/// Replaced wholesale on every block transition; a published snapshot is
/// never mutated.
#[derive(Debug, Clone)]
pub struct MiningInfo {
    pub height: u64,
    pub base_target: u64,
    pub target_deadline: u64,
    pub gen_sig: String,

    /// Pre-serialized three-field body served verbatim to miners.
    pub payload: Vec<u8>,

    /// When this snapshot became the published round. `None` until
    /// published, and permanently for the zeroed placeholder.
    pub start_time: Option<Instant>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MiningInfoPayload<'a> {
    height: String,
    base_target: String,
    generation_signature: &'a str,
}

impl MiningInfo {
    pub fn new(height: u64, base_target: u64, target_deadline: u64, gen_sig: String) -> Self {
        let payload = serde_json::to_vec(&MiningInfoPayload {
            height: height.to_string(),
            base_target: base_target.to_string(),
            generation_signature: &gen_sig,
        })
        .expect("mining info payload serializes");
        Self {
            height,
            base_target,
            target_deadline,
            gen_sig,
            payload,
            start_time: None,
        }
    }

    /// Placeholder published to park a chain nobody should keep scanning.
    pub fn zeroed() -> Self {
        Self::new(0, 0, 0, String::new())
    }

    /// Stamp the wall-clock start of this round.
    pub fn started(mut self) -> Self {
        self.start_time = Some(Instant::now());
        self
    }

    /// Whether a miner that picked up this round could still be busy with
    /// it, given the configured scan time in seconds.
    pub fn scanning(&self, scan_time: u64) -> bool {
        match self.start_time {
            Some(started) => started.elapsed().as_secs() < scan_time,
            None => false,
        }
    }
}

impl From<MiningInfoWire> for MiningInfo {
    fn from(wire: MiningInfoWire) -> Self {
        Self::new(
            wire.height.get(),
            wire.base_target.get(),
            wire.target_deadline.get(),
            wire.gen_sig,
        )
    }
}

/// Upstream reply to a nonce submission, as far as the proxy cares.
#[derive(Debug, Deserialize)]
pub struct SubmitResponse {
    pub deadline: FlexU64,
}
