// icp-core/src/recovery/exchange.rs

//! Collective exchange of votes.
//!
//! Validation needs one operation: every rank contributes its vote and gets
//! back the votes of the whole group, indexed by rank. Transports plug in
//! behind [`GroupExchange`].

use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use tracing::debug;

use super::vote::LevelVote;
use crate::error::{IcpError, Result};

/// Synchronous all-gather over a group of ranks.
pub trait GroupExchange: Send + Sync {
    /// Rank of the caller within the group.
    fn rank(&self) -> u32;

    /// Number of ranks in the group.
    fn size(&self) -> u32;

    /// Contributes `vote` and blocks until every rank has contributed.
    ///
    /// Returns all votes, ordered by rank.
    ///
    /// # Errors
    ///
    /// Returns an error if the exchange fails or a vote cannot be decoded.
    fn all_gather(&self, vote: &LevelVote) -> Result<Vec<LevelVote>>;
}

/// Group of one.
#[derive(Debug, Clone, Copy, Default)]
pub struct SoloExchange;

impl GroupExchange for SoloExchange {
    fn rank(&self) -> u32 {
        0
    }

    fn size(&self) -> u32 {
        1
    }

    fn all_gather(&self, vote: &LevelVote) -> Result<Vec<LevelVote>> {
        Ok(vec![vote.clone()])
    }
}

#[derive(Debug)]
struct RoundState {
    generation: u64,
    arrived: u32,
    slots: Vec<Option<Vec<u8>>>,
    /// Votes of the last completed round.
    completed: Arc<Vec<Vec<u8>>>,
}

#[derive(Debug)]
struct GroupShared {
    size: u32,
    state: Mutex<RoundState>,
    round_done: Condvar,
}

impl GroupShared {
    fn lock(&self) -> MutexGuard<'_, RoundState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Group whose ranks are threads of the same process.
///
/// Votes travel in their wire encoding, as they would between processes.
/// Rounds are numbered so the exchange can be reused for every level.
#[derive(Debug, Clone)]
pub struct InProcessGroup {
    shared: Arc<GroupShared>,
    rank: u32,
}

impl InProcessGroup {
    /// Creates the members of a group of `size` ranks, indexed by rank.
    pub fn create(size: u32) -> Vec<InProcessGroup> {
        let shared = Arc::new(GroupShared {
            size,
            state: Mutex::new(RoundState {
                generation: 0,
                arrived: 0,
                slots: vec![None; size as usize],
                completed: Arc::new(Vec::new()),
            }),
            round_done: Condvar::new(),
        });
        (0..size)
            .map(|rank| InProcessGroup {
                shared: Arc::clone(&shared),
                rank,
            })
            .collect()
    }
}

impl GroupExchange for InProcessGroup {
    fn rank(&self) -> u32 {
        self.rank
    }

    fn size(&self) -> u32 {
        self.shared.size
    }

    fn all_gather(&self, vote: &LevelVote) -> Result<Vec<LevelVote>> {
        let encoded = vote.to_bytes()?;
        let mut state = self.shared.lock();

        let slot = &mut state.slots[self.rank as usize];
        if slot.is_some() {
            return Err(IcpError::serialization(format!(
                "rank {} contributed twice to the same round",
                self.rank
            )));
        }
        *slot = Some(encoded);
        state.arrived += 1;
        let generation = state.generation;

        let completed = if state.arrived == self.shared.size {
            let votes: Vec<Vec<u8>> = state
                .slots
                .iter_mut()
                .map(|s| s.take().unwrap_or_default())
                .collect();
            state.completed = Arc::new(votes);
            state.arrived = 0;
            state.generation += 1;
            debug!(generation, size = self.shared.size, "Vote round complete");
            self.shared.round_done.notify_all();
            Arc::clone(&state.completed)
        } else {
            while state.generation == generation {
                state = self
                    .shared
                    .round_done
                    .wait(state)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
            }
            Arc::clone(&state.completed)
        };
        drop(state);

        completed.iter().map(|bytes| LevelVote::from_bytes(bytes)).collect()
    }
}
