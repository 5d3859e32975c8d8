// icp-core/tests/recovery.rs

//! Group recovery votes over files written by real checkpoint sessions.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use proptest::prelude::*;

use icp_core::recovery::LevelFiles;
use icp_core::{
    CheckpointSession, Expectation, IcpConfig, InProcessGroup, LevelValidator, MemoryStorage,
    RecoveryReport, ResilienceLevel, StorageBackend, VariableRegistry, Verdict,
};

const GROUP: u32 = 4;
const CHECKPOINT: i32 = 7;

/// Writes one checkpoint per rank and stages it on every level.
fn staged_group() -> (Arc<MemoryStorage>, IcpConfig) {
    let storage = Arc::new(MemoryStorage::new());
    let mut config = IcpConfig::default();
    config.incremental.block_size = 64;
    let files = LevelFiles::new(config.levels.clone());

    for rank in 0..GROUP {
        let mut session = CheckpointSession::new(storage.clone(), &config, rank).unwrap();
        let mut registry = VariableRegistry::new();
        registry.protect(0, vec![rank as u8; 300], 1);
        session.checkpoint(CHECKPOINT, &registry).unwrap();

        for level in [ResilienceLevel::Partner, ResilienceLevel::Erasure, ResilienceLevel::Global] {
            files
                .replicate(storage.as_ref(), ResilienceLevel::Local, level, 0, rank)
                .unwrap();
        }
        files.stage_partner_copy(storage.as_ref(), 0, rank).unwrap();
        storage.put(files.erasure_path(0, rank), vec![0xA5; 128]);
    }
    (storage, config)
}

fn run_vote(storage: &Arc<MemoryStorage>, config: &IcpConfig, expect: &Expectation) -> RecoveryReport {
    let handles: Vec<_> = InProcessGroup::create(GROUP)
        .into_iter()
        .map(|member| {
            let validator = LevelValidator::new(storage.clone(), config, member);
            let expect = expect.clone();
            thread::spawn(move || validator.validate_all(&expect).unwrap())
        })
        .collect();

    let reports: Vec<RecoveryReport> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    for report in &reports[1..] {
        assert_eq!(report, &reports[0], "ranks disagree on the verdicts");
    }
    reports.into_iter().next().unwrap()
}

fn verdicts(report: &RecoveryReport) -> Vec<Verdict> {
    ResilienceLevel::ALL
        .iter()
        .map(|&level| report.verdict(level).unwrap())
        .collect()
}

fn all_files(storage: &MemoryStorage) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    for dir in ["l1", "l2", "l3", "l4"] {
        for name in storage.list(Path::new(dir)).unwrap() {
            paths.push(Path::new(dir).join(name));
        }
    }
    paths.sort();
    paths
}

#[test]
fn test_every_level_recoverable_when_staged() {
    let (storage, config) = staged_group();
    let report = run_vote(&storage, &config, &Expectation::new(CHECKPOINT, 0));

    assert_eq!(verdicts(&report), vec![Verdict::Recoverable; 4]);
    assert_eq!(report.first_recoverable(), Some(ResilienceLevel::Local));
}

#[test]
fn test_lost_local_file_escalates_to_partner() {
    let (storage, config) = staged_group();
    storage.delete(Path::new("l1/dcp-id0-rank1.icp")).unwrap();

    let report = run_vote(&storage, &config, &Expectation::new(CHECKPOINT, 0));
    assert_eq!(report.verdict(ResilienceLevel::Local), Some(Verdict::NotRecoverable));
    assert_eq!(report.first_recoverable(), Some(ResilienceLevel::Partner));
}

#[test]
fn test_partner_needs_file_or_copy() {
    let (storage, config) = staged_group();
    storage.delete(Path::new("l2/dcp-id0-rank2.icp")).unwrap();

    let report = run_vote(&storage, &config, &Expectation::new(CHECKPOINT, 0));
    assert_eq!(report.verdict(ResilienceLevel::Partner), Some(Verdict::Recoverable));

    storage.delete(Path::new("l2/dcp-id0-rank2.partner.icp")).unwrap();
    let report = run_vote(&storage, &config, &Expectation::new(CHECKPOINT, 0));
    assert_eq!(report.verdict(ResilienceLevel::Partner), Some(Verdict::NotRecoverable));
}

#[test]
fn test_erasure_bound() {
    let (storage, mut config) = staged_group();
    storage.delete(Path::new("l3/dcp-id0-rank0.icp")).unwrap();
    storage.delete(Path::new("l3/rs-id0-rank3.icp")).unwrap();

    let report = run_vote(&storage, &config, &Expectation::new(CHECKPOINT, 0));
    assert_eq!(report.verdict(ResilienceLevel::Erasure), Some(Verdict::Recoverable));

    config.recovery.max_erasures = Some(1);
    let report = run_vote(&storage, &config, &Expectation::new(CHECKPOINT, 0));
    assert_eq!(report.verdict(ResilienceLevel::Erasure), Some(Verdict::NotRecoverable));
}

#[test]
fn test_corrupt_global_file() {
    let (storage, config) = staged_group();
    let path = Path::new("l4/dcp-id0-rank3.icp");
    let mut bytes = storage.contents(path).unwrap();
    bytes[40] ^= 0xFF;
    storage.put(path, bytes);

    let report = run_vote(&storage, &config, &Expectation::new(CHECKPOINT, 0));
    assert_eq!(report.verdict(ResilienceLevel::Global), Some(Verdict::NotRecoverable));
    assert_eq!(report.verdict(ResilienceLevel::Local), Some(Verdict::Recoverable));
}

#[test]
fn test_wrong_checkpoint_is_not_recoverable() {
    let (storage, config) = staged_group();
    let report = run_vote(&storage, &config, &Expectation::new(CHECKPOINT + 1, 0));
    assert_eq!(report.first_recoverable(), None);
}

#[test]
fn test_size_expectation_is_checked() {
    let (storage, config) = staged_group();
    let size = storage.metadata(Path::new("l1/dcp-id0-rank0.icp")).unwrap().size;

    let mut expect = Expectation::new(CHECKPOINT, 0);
    expect.file_size = Some(size);
    let report = run_vote(&storage, &config, &expect);
    assert_eq!(report.verdict(ResilienceLevel::Local), Some(Verdict::Recoverable));

    expect.file_size = Some(size + 1);
    let report = run_vote(&storage, &config, &expect);
    assert_eq!(report.verdict(ResilienceLevel::Local), Some(Verdict::NotRecoverable));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn prop_losing_files_never_restores_a_level(seed in any::<u64>()) {
        let (storage, config) = staged_group();
        let mut files = all_files(&storage);
        let mut seed = seed;
        for i in (1..files.len()).rev() {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            files.swap(i, (seed >> 33) as usize % (i + 1));
        }

        let expect = Expectation::new(CHECKPOINT, 0);
        let mut previous = verdicts(&run_vote(&storage, &config, &expect));
        for path in files.iter().take(6) {
            storage.delete(path).unwrap();
            let current = verdicts(&run_vote(&storage, &config, &expect));
            for (before, after) in previous.iter().zip(&current) {
                prop_assert!(before.is_recoverable() || !after.is_recoverable());
            }
            previous = current;
        }
    }
}
