// icp-core/src/recovery/vote.rs

//! Votes exchanged during recovery validation.

use serde::{Deserialize, Serialize};

use super::ResilienceLevel;
use crate::checkpoint::CheckpointReceipt;
use crate::error::{IcpError, Result};

/// Checkpoint id reported when a rank could not read one.
pub const UNKNOWN_CHECKPOINT: i32 = -1;

/// Level-specific part of a vote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoteDetail {
    Local,
    Partner {
        /// The copy of the left neighbour's file exists.
        copy_exists: bool,
        /// Rank whose file the copy holds.
        peer_index: u32,
        copy_size: u64,
        expected_copy_size: Option<u64>,
        /// The copy parsed and every layer of it verified.
        copy_checksum_ok: bool,
    },
    Erasure {
        erasure_file_exists: bool,
        erasure_file_size: u64,
        expected_erasure_size: Option<u64>,
    },
    Global,
}

/// One rank's view of one level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelVote {
    pub rank: u32,
    pub level: ResilienceLevel,
    /// Newest checkpoint id found in the rank's file, or
    /// [`UNKNOWN_CHECKPOINT`].
    pub checkpoint_id: i32,
    pub file_exists: bool,
    pub file_size: u64,
    pub expected_file_size: Option<u64>,
    /// The file parsed, every layer verified and the newest layer is the
    /// expected checkpoint.
    pub checksum_ok: bool,
    pub detail: VoteDetail,
}

impl LevelVote {
    /// A vote for a rank that found nothing usable.
    pub fn negative(rank: u32, level: ResilienceLevel) -> Self {
        let detail = match level {
            ResilienceLevel::Local => VoteDetail::Local,
            ResilienceLevel::Partner => VoteDetail::Partner {
                copy_exists: false,
                peer_index: 0,
                copy_size: 0,
                expected_copy_size: None,
                copy_checksum_ok: false,
            },
            ResilienceLevel::Erasure => VoteDetail::Erasure {
                erasure_file_exists: false,
                erasure_file_size: 0,
                expected_erasure_size: None,
            },
            ResilienceLevel::Global => VoteDetail::Global,
        };
        Self {
            rank,
            level,
            checkpoint_id: UNKNOWN_CHECKPOINT,
            file_exists: false,
            file_size: 0,
            expected_file_size: None,
            checksum_ok: false,
            detail,
        }
    }

    /// The rank's own file is present, of the expected size and valid.
    pub fn own_file_ok(&self) -> bool {
        self.file_exists
            && self.checksum_ok
            && self.expected_file_size.map_or(true, |size| size == self.file_size)
    }

    /// The partner copy this rank holds is usable. False for other levels.
    pub fn copy_ok(&self) -> bool {
        match &self.detail {
            VoteDetail::Partner {
                copy_exists,
                copy_size,
                expected_copy_size,
                copy_checksum_ok,
                ..
            } => {
                *copy_exists
                    && *copy_checksum_ok
                    && expected_copy_size.map_or(true, |size| size == *copy_size)
            }
            _ => false,
        }
    }

    /// The redundancy file this rank holds is usable. False for other
    /// levels.
    pub fn erasure_ok(&self) -> bool {
        match &self.detail {
            VoteDetail::Erasure {
                erasure_file_exists,
                erasure_file_size,
                expected_erasure_size,
            } => {
                *erasure_file_exists
                    && expected_erasure_size.map_or(true, |size| size == *erasure_file_size)
            }
            _ => false,
        }
    }

    /// Wire form of the vote.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self)
            .map_err(|e| IcpError::serialization(format!("failed to encode vote: {e}")))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes)
            .map_err(|e| IcpError::serialization(format!("failed to decode vote: {e}")))
    }
}

/// What a rank expects to find when validating.
///
/// Sizes left as `None` are not checked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expectation {
    pub checkpoint_id: i32,
    pub file_id: u64,
    pub file_size: Option<u64>,
    /// Size of the left neighbour's file, which the partner copy mirrors.
    pub partner_file_size: Option<u64>,
    pub erasure_file_size: Option<u64>,
}

impl Expectation {
    pub fn new(checkpoint_id: i32, file_id: u64) -> Self {
        Self {
            checkpoint_id,
            file_id,
            file_size: None,
            partner_file_size: None,
            erasure_file_size: None,
        }
    }

    /// Expects exactly the file a checkpoint produced.
    pub fn from_receipt(receipt: &CheckpointReceipt) -> Self {
        Self {
            file_size: Some(receipt.file_size),
            ..Self::new(receipt.checkpoint_id, receipt.file_id)
        }
    }

    #[must_use]
    pub fn with_partner_file_size(mut self, size: u64) -> Self {
        self.partner_file_size = Some(size);
        self
    }

    #[must_use]
    pub fn with_erasure_file_size(mut self, size: u64) -> Self {
        self.erasure_file_size = Some(size);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negative_vote_is_not_ok() {
        for level in ResilienceLevel::ALL {
            let vote = LevelVote::negative(3, level);
            assert!(!vote.own_file_ok());
            assert!(!vote.copy_ok());
            assert!(!vote.erasure_ok());
            assert_eq!(vote.checkpoint_id, UNKNOWN_CHECKPOINT);
        }
    }

    #[test]
    fn test_size_expectation() {
        let mut vote = LevelVote::negative(0, ResilienceLevel::Local);
        vote.file_exists = true;
        vote.checksum_ok = true;
        vote.file_size = 100;
        assert!(vote.own_file_ok());

        vote.expected_file_size = Some(99);
        assert!(!vote.own_file_ok());
    }

    #[test]
    fn test_wire_roundtrip() {
        let mut vote = LevelVote::negative(7, ResilienceLevel::Partner);
        vote.checkpoint_id = 12;
        let restored = LevelVote::from_bytes(&vote.to_bytes().unwrap()).unwrap();
        assert_eq!(restored, vote);
        assert!(LevelVote::from_bytes(&[1, 2]).is_err());
    }
}
