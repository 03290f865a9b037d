//! Process-wide view of the current and previous mining rounds.
//!
//! Readers (the admission engine and the miner-facing handler) load the
//! published pointers and scalar identifiers without coordination; a value
//! up to one refresh tick stale is acceptable because admission revalidates
//! the height carried by each submission. Writers publish a new `MiningInfo`
//! pointer first and update the scalar identifiers second, so readers never
//! observe scalars ahead of the pointer.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::types::MiningInfo;

/// The two upstream chains served through the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chain {
    Primary,
    Secondary,
}

impl Chain {
    pub fn is_primary(self) -> bool {
        matches!(self, Chain::Primary)
    }

    pub fn from_primary_flag(primary: bool) -> Self {
        if primary {
            Chain::Primary
        } else {
            Chain::Secondary
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            Chain::Primary => 0,
            Chain::Secondary => 1,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Chain::Primary => "primary",
            Chain::Secondary => "secondary",
        }
    }
}

/// Identifiers of one observed block transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockId {
    pub height: u64,
    pub base_target: u64,
    pub primary: bool,
}

struct BlockCell {
    height: AtomicU64,
    base_target: AtomicU64,
    primary: AtomicBool,
}

impl BlockCell {
    fn new() -> Self {
        Self {
            height: AtomicU64::new(0),
            base_target: AtomicU64::new(1),
            primary: AtomicBool::new(false),
        }
    }

    fn load(&self) -> BlockId {
        BlockId {
            height: self.height.load(Ordering::Acquire),
            base_target: self.base_target.load(Ordering::Acquire),
            primary: self.primary.load(Ordering::Acquire),
        }
    }

    fn store(&self, id: BlockId) {
        self.base_target.store(id.base_target, Ordering::Release);
        self.height.store(id.height, Ordering::Release);
        self.primary.store(id.primary, Ordering::Release);
    }
}

struct ChainSlot {
    info: RwLock<Option<Arc<MiningInfo>>>,
    best: AtomicU64,
    target_deadline: u64,
}

impl ChainSlot {
    fn new(target_deadline: u64) -> Self {
        Self {
            info: RwLock::new(None),
            best: AtomicU64::new(u64::MAX),
            target_deadline,
        }
    }
}

/// Shared chain state: one published round per chain plus the scalar
/// identifiers of the two most recent block transitions across both.
pub struct ChainState {
    slots: [ChainSlot; 2],
    current: BlockCell,
    last: BlockCell,
}

impl ChainState {
    pub fn new(primary_target_deadline: u64, secondary_target_deadline: u64) -> Self {
        Self {
            slots: [
                ChainSlot::new(primary_target_deadline),
                ChainSlot::new(secondary_target_deadline),
            ],
            current: BlockCell::new(),
            last: BlockCell::new(),
        }
    }

    /// Currently published round for `chain`, if any.
    pub fn current_info(&self, chain: Chain) -> Option<Arc<MiningInfo>> {
        self.slots[chain.index()]
            .info
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Publish `info` as the current round for `chain`.
    pub fn publish(&self, chain: Chain, info: Arc<MiningInfo>) {
        *self.slots[chain.index()]
            .info
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(info);
    }

    /// Best adjusted deadline forwarded this round; `u64::MAX` means none.
    pub fn best(&self, chain: Chain) -> u64 {
        self.slots[chain.index()].best.load(Ordering::Acquire)
    }

    pub fn record_best(&self, chain: Chain, deadline: u64) {
        self.slots[chain.index()]
            .best
            .store(deadline, Ordering::Release);
    }

    pub fn target_deadline(&self, chain: Chain) -> u64 {
        self.slots[chain.index()].target_deadline
    }

    pub fn current_block(&self) -> BlockId {
        self.current.load()
    }

    pub fn last_block(&self) -> BlockId {
        self.last.load()
    }

    /// Advance the process-wide block pointer to a new round on `chain`,
    /// resetting the chain's best-deadline counter. When the round moves
    /// across chains, the outgoing block is remembered in the `last` cell
    /// so late submissions for it can still be classified.
    pub fn advance(&self, chain: Chain, height: u64, base_target: u64) {
        let outgoing = self.current.load();
        if outgoing.primary != chain.is_primary() {
            self.last.store(outgoing);
        }
        self.current.store(BlockId {
            height,
            base_target,
            primary: chain.is_primary(),
        });
        self.slots[chain.index()].best.store(u64::MAX, Ordering::Release);
    }

    /// Adjusted deadline for `round` against whichever block it targets,
    /// used for locally synthesized responses.
    pub fn response_deadline(&self, round: &crate::types::MinerRound) -> u64 {
        let current = self.current_block();
        let base_target = if round.height == current.height {
            current.base_target
        } else {
            self.last_block().base_target
        };
        round.adjusted_deadline(base_target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MinerRound;

    #[test]
    fn test_initial_state() {
        let state = ChainState::new(1_000_000, 2_000_000);

        assert!(state.current_info(Chain::Primary).is_none());
        assert_eq!(state.best(Chain::Primary), u64::MAX);
        assert_eq!(state.current_block(), state.last_block());
        assert_eq!(state.current_block().base_target, 1);
        assert_eq!(state.target_deadline(Chain::Secondary), 2_000_000);
    }

    #[test]
    fn test_publish_and_read() {
        let state = ChainState::new(u64::MAX, u64::MAX);
        state.publish(Chain::Primary, Arc::new(MiningInfo::new(100, 10, 0, "ab".into())));

        let info = state.current_info(Chain::Primary).unwrap();
        assert_eq!(info.height, 100);
        assert_eq!(info.base_target, 10);
    }

    #[test]
    fn test_advance_same_chain_keeps_last() {
        let state = ChainState::new(u64::MAX, u64::MAX);
        state.advance(Chain::Primary, 100, 10);
        let last_after_first = state.last_block();

        state.advance(Chain::Primary, 101, 11);

        assert_eq!(state.current_block().height, 101);
        assert_eq!(state.last_block(), last_after_first);
    }

    #[test]
    fn test_advance_across_chains_remembers_outgoing() {
        let state = ChainState::new(u64::MAX, u64::MAX);
        state.advance(Chain::Primary, 100, 10);
        state.advance(Chain::Secondary, 200, 20);

        let current = state.current_block();
        let last = state.last_block();

        assert!(!current.primary);
        assert_eq!(current.height, 200);
        assert!(last.primary);
        assert_eq!(last.height, 100);
        assert_eq!(last.base_target, 10);
    }

    #[test]
    fn test_advance_resets_best() {
        let state = ChainState::new(u64::MAX, u64::MAX);
        state.advance(Chain::Primary, 100, 10);
        state.record_best(Chain::Primary, 400);
        assert_eq!(state.best(Chain::Primary), 400);

        state.advance(Chain::Primary, 101, 10);
        assert_eq!(state.best(Chain::Primary), u64::MAX);
    }

    #[test]
    fn test_response_deadline_uses_matching_block() {
        let state = ChainState::new(u64::MAX, u64::MAX);
        state.advance(Chain::Primary, 100, 10);
        state.advance(Chain::Secondary, 200, 20);

        let current_round = MinerRound {
            account_id: 1,
            height: 200,
            nonce: 7,
            deadline: 4000,
            passphrase: None,
            adjusted: false,
        };
        let last_round = MinerRound { height: 100, ..current_round.clone() };

        assert_eq!(state.response_deadline(&current_round), 200);
        assert_eq!(state.response_deadline(&last_round), 400);
    }
}
