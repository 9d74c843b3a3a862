//! Decides which blocks a peer should request next.

use std::{collections::VecDeque, time::Duration};

use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::{
    bitfield::{Bitfield, BitfieldExt},
    piece::BlockStatus,
    state::TransferState,
    tcp_wire::BlockInfo,
};

/// The algorithm that picks a new piece once the pieces in progress have
/// nothing left to hand out.
#[derive(Clone, Copy, Hash, PartialEq, Eq, Default, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PieceStrategy {
    /// Any needed piece, uniformly.
    #[default]
    Random,
    /// A needed piece among the ones advertised by the fewest peers, ties
    /// broken randomly.
    Rarest,
}

/// How many requests a peer can have outstanding. Grows while the peer
/// keeps up and shrinks back when a request times out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestWindow {
    pub cap: usize,
    min: usize,
    max: usize,
    served: usize,
}

impl RequestWindow {
    pub fn new(min: usize, max: usize) -> Self {
        let min = min.max(1);
        Self { cap: min, min, max: max.max(min), served: 0 }
    }

    /// A block requested from the peer arrived. After a whole window is
    /// served the window doubles.
    pub fn on_served(&mut self) {
        self.served += 1;
        if self.served >= self.cap {
            self.served = 0;
            self.cap = (self.cap * 2).min(self.max);
        }
    }

    pub fn on_timeout(&mut self) {
        self.cap = self.min;
        self.served = 0;
    }
}

#[derive(Debug)]
pub struct Scheduler {
    pub strategy: PieceStrategy,
    rng: StdRng,
}

impl Scheduler {
    pub fn new(strategy: PieceStrategy) -> Self {
        Self { strategy, rng: StdRng::from_entropy() }
    }

    /// Deterministic choices, for tests.
    pub fn with_seed(strategy: PieceStrategy, seed: u64) -> Self {
        Self { strategy, rng: StdRng::seed_from_u64(seed) }
    }

    /// Queue blocks the peer can serve until `queue` holds `cap` entries.
    ///
    /// Pieces already in progress come first, then new pieces are picked
    /// with the strategy. Queued blocks become `Unrequested`, so no other
    /// peer gets them. Returns how many were queued.
    #[tracing::instrument(skip_all)]
    pub fn fill(
        &mut self,
        state: &mut TransferState,
        peer_pieces: &Bitfield,
        queue: &mut VecDeque<BlockInfo>,
        cap: usize,
    ) -> usize {
        if queue.len() >= cap {
            return 0;
        }
        let before = queue.len();

        let mut started: Vec<u32> = state
            .outstanding
            .iter()
            .filter(|(i, p)| {
                state.in_progress.has(**i as usize)
                    && peer_pieces.has(**i as usize)
                    && p.has_unassigned()
            })
            .map(|(i, _)| *i)
            .collect();
        started.shuffle(&mut self.rng);

        for index in started {
            enqueue_piece(state, index, queue, cap);
            if queue.len() >= cap {
                return queue.len() - before;
            }
        }

        let mut fresh: Vec<(u32, u32)> = state
            .outstanding
            .iter()
            .filter(|(i, p)| {
                !state.in_progress.has(**i as usize)
                    && peer_pieces.has(**i as usize)
                    && p.has_unassigned()
            })
            .map(|(i, p)| (*i, p.commonality))
            .collect();

        while queue.len() < cap && !fresh.is_empty() {
            let pick = match self.strategy {
                PieceStrategy::Random => self.rng.gen_range(0..fresh.len()),
                PieceStrategy::Rarest => {
                    let rarest =
                        fresh.iter().map(|(_, c)| *c).min().unwrap_or_default();
                    let ties: Vec<usize> = fresh
                        .iter()
                        .enumerate()
                        .filter(|(_, (_, c))| *c == rarest)
                        .map(|(pos, _)| pos)
                        .collect();
                    ties[self.rng.gen_range(0..ties.len())]
                }
            };
            let (index, _) = fresh.swap_remove(pick);
            debug!("picked piece {index}");

            state.in_progress.set(index as usize, true);
            enqueue_piece(state, index, queue, cap);
        }

        queue.len() - before
    }
}

fn enqueue_piece(
    state: &mut TransferState,
    index: u32,
    queue: &mut VecDeque<BlockInfo>,
    cap: usize,
) {
    let Some(piece) = state.outstanding.get_mut(&index) else { return };
    for block in &mut piece.blocks {
        if queue.len() >= cap {
            break;
        }
        if block.status == BlockStatus::Unassigned {
            block.status = BlockStatus::Unrequested;
            queue.push_back(block.info());
        }
    }
}

/// Take back the blocks of `queue` that were requested or started longer
/// than `timeout` ago. They go back to `Unassigned` and are returned, so the
/// caller can cancel them.
///
/// Entries whose piece got completed in the meantime, or whose block went
/// back to the pool, are dropped too.
pub fn reclaim_stale(
    state: &mut TransferState,
    queue: &mut VecDeque<BlockInfo>,
    now: Instant,
    timeout: Duration,
) -> Vec<BlockInfo> {
    let mut stale = Vec::new();

    queue.retain(|info| {
        let Some(block) = state.block_mut(info) else {
            return false;
        };
        if block.status == BlockStatus::Unassigned {
            return false;
        }
        let expired = block
            .modified
            .is_some_and(|m| now.saturating_duration_since(m) >= timeout);

        if block.status.is_in_flight() && expired {
            block.reset();
            stale.push(*info);
            return false;
        }
        true
    });

    stale
}
