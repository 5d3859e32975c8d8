// icp-core/src/recovery/validator.rs

//! Casting and evaluating recovery votes.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::exchange::GroupExchange;
use super::files::LevelFiles;
use super::vote::{Expectation, LevelVote, VoteDetail, UNKNOWN_CHECKPOINT};
use super::{RecoveryReport, ResilienceLevel, Verdict};
use crate::checkpoint::LayerFile;
use crate::config::IcpConfig;
use crate::error::Result;
use crate::storage::StorageBackend;

/// What a rank found when it looked at one base file.
#[derive(Debug, Clone, Copy, Default)]
struct FileCheck {
    exists: bool,
    size: u64,
    checkpoint_id: Option<i32>,
    valid: bool,
}

/// Inspects a rank's files and builds its votes.
pub struct VoteCollector {
    storage: Arc<dyn StorageBackend>,
    files: LevelFiles,
    rank: u32,
    group_size: u32,
}

impl VoteCollector {
    pub fn new(storage: Arc<dyn StorageBackend>, files: LevelFiles, rank: u32, group_size: u32) -> Self {
        Self {
            storage,
            files,
            rank,
            group_size: group_size.max(1),
        }
    }

    pub fn rank(&self) -> u32 {
        self.rank
    }

    fn left(&self) -> u32 {
        (self.rank + self.group_size - 1) % self.group_size
    }

    /// Builds this rank's vote for `level`.
    ///
    /// Never fails: anything that goes wrong locally turns into a negative
    /// vote, so the collective step is always reached.
    pub fn local_vote(&self, level: ResilienceLevel, expect: &Expectation) -> LevelVote {
        let own_path = self.files.own_path(level, expect.file_id, self.rank);
        let own = self.check_file(&own_path, self.rank, expect);

        let detail = match level {
            ResilienceLevel::Local => VoteDetail::Local,
            ResilienceLevel::Global => VoteDetail::Global,
            ResilienceLevel::Partner => {
                let left = self.left();
                let copy_path = self.files.partner_copy_path(expect.file_id, left);
                let copy = self.check_file(&copy_path, left, expect);
                VoteDetail::Partner {
                    copy_exists: copy.exists,
                    peer_index: left,
                    copy_size: copy.size,
                    expected_copy_size: expect.partner_file_size,
                    copy_checksum_ok: copy.valid,
                }
            }
            ResilienceLevel::Erasure => {
                let path = self.files.erasure_path(expect.file_id, self.rank);
                let (exists, size) = self.probe(&path);
                VoteDetail::Erasure {
                    erasure_file_exists: exists,
                    erasure_file_size: size,
                    expected_erasure_size: expect.erasure_file_size,
                }
            }
        };

        let vote = LevelVote {
            rank: self.rank,
            level,
            checkpoint_id: own.checkpoint_id.unwrap_or(UNKNOWN_CHECKPOINT),
            file_exists: own.exists,
            file_size: own.size,
            expected_file_size: expect.file_size,
            checksum_ok: own.valid,
            detail,
        };
        debug!(rank = self.rank, level = %level, ?vote, "Cast recovery vote");
        vote
    }

    fn probe(&self, path: &Path) -> (bool, u64) {
        match self.storage.metadata(path) {
            Ok(meta) if !meta.is_dir => (true, meta.size),
            Ok(_) => (false, 0),
            Err(_) => (false, 0),
        }
    }

    fn check_file(&self, path: &Path, owner: u32, expect: &Expectation) -> FileCheck {
        let (exists, size) = self.probe(path);
        if !exists {
            debug!(path = %path.display(), "Checkpoint file missing");
            return FileCheck::default();
        }

        let file = match LayerFile::open(self.storage.as_ref(), path) {
            Ok(file) => file,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Checkpoint file unreadable");
                return FileCheck {
                    exists,
                    size,
                    ..FileCheck::default()
                };
            }
        };

        let checkpoint_id = file.newest().checkpoint_id;
        let mut valid = true;
        for (layer, result) in file.verify_all() {
            if let Err(e) = result {
                warn!(path = %path.display(), layer, error = %e, "Checkpoint layer failed verification");
                valid = false;
            }
        }
        let trailer = file.trailer();
        if trailer.file_id != expect.file_id || trailer.rank != owner {
            warn!(
                path = %path.display(),
                file_id = trailer.file_id,
                rank = trailer.rank,
                "Checkpoint file belongs to another rank or stack"
            );
            valid = false;
        }
        if checkpoint_id != expect.checkpoint_id {
            warn!(
                path = %path.display(),
                found = checkpoint_id,
                expected = expect.checkpoint_id,
                "Checkpoint file holds a different checkpoint"
            );
            valid = false;
        }

        FileCheck {
            exists,
            size,
            checkpoint_id: Some(checkpoint_id),
            valid,
        }
    }
}

/// Known checkpoint ids agree and at least one is known.
fn ids_agree(votes: &[LevelVote]) -> bool {
    let ids: BTreeSet<i32> = votes
        .iter()
        .map(|v| v.checkpoint_id)
        .filter(|&id| id != UNKNOWN_CHECKPOINT)
        .collect();
    ids.len() == 1
}

/// Group verdict for `level` from the votes of all ranks.
///
/// Every rank calls this on the same votes and therefore reaches the same
/// verdict. `max_erasures` bounds the losses tolerated at level 3 and
/// defaults to the group size.
pub fn evaluate(level: ResilienceLevel, votes: &[LevelVote], max_erasures: Option<u32>) -> Verdict {
    let mut votes = votes.to_vec();
    votes.sort_by_key(|v| v.rank);
    let n = votes.len();

    let well_formed = n > 0
        && votes
            .iter()
            .enumerate()
            .all(|(i, v)| v.rank as usize == i && v.level == level);
    if !well_formed {
        return Verdict::NotRecoverable;
    }

    let recoverable = match level {
        ResilienceLevel::Local | ResilienceLevel::Global => {
            votes.iter().all(LevelVote::own_file_ok) && ids_agree(&votes)
        }
        ResilienceLevel::Partner => {
            let covered = (0..n).all(|r| {
                let right = (r + 1) % n;
                let left = (r + n - 1) % n;
                (votes[r].own_file_ok() || votes[right].copy_ok())
                    && (votes[r].copy_ok() || votes[left].own_file_ok())
            });
            covered && ids_agree(&votes)
        }
        ResilienceLevel::Erasure => {
            let lost_files = votes.iter().filter(|v| !v.own_file_ok()).count();
            let lost_parity = votes.iter().filter(|v| !v.erasure_ok()).count();
            let limit = max_erasures.map_or(n, |m| m as usize);
            lost_files + lost_parity <= limit && ids_agree(&votes)
        }
    };

    if recoverable {
        Verdict::Recoverable
    } else {
        Verdict::NotRecoverable
    }
}

/// Runs the vote protocol for one rank.
pub struct LevelValidator<E: GroupExchange> {
    collector: VoteCollector,
    exchange: E,
    max_erasures: Option<u32>,
}

impl<E: GroupExchange> LevelValidator<E> {
    pub fn new(storage: Arc<dyn StorageBackend>, config: &IcpConfig, exchange: E) -> Self {
        let collector = VoteCollector::new(
            storage,
            LevelFiles::new(config.levels.clone()),
            exchange.rank(),
            exchange.size(),
        );
        Self {
            collector,
            exchange,
            max_erasures: config.recovery.max_erasures,
        }
    }

    pub fn exchange(&self) -> &E {
        &self.exchange
    }

    /// Votes on one level with the rest of the group.
    ///
    /// # Errors
    ///
    /// Only the exchange itself can fail.
    pub fn validate_level(&self, level: ResilienceLevel, expect: &Expectation) -> Result<Verdict> {
        let vote = self.collector.local_vote(level, expect);
        let votes = self.exchange.all_gather(&vote)?;
        let verdict = evaluate(level, &votes, self.max_erasures);
        info!(
            rank = self.exchange.rank(),
            level = %level,
            checkpoint_id = expect.checkpoint_id,
            ?verdict,
            "Recovery level validated"
        );
        Ok(verdict)
    }

    /// Votes on every level, in order.
    pub fn validate_all(&self, expect: &Expectation) -> Result<RecoveryReport> {
        let mut verdicts = Vec::with_capacity(ResilienceLevel::ALL.len());
        for level in ResilienceLevel::ALL {
            verdicts.push((level, self.validate_level(level, expect)?));
        }
        Ok(RecoveryReport {
            checkpoint_id: expect.checkpoint_id,
            verdicts,
        })
    }
}
