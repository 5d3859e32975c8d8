// icp-core/tests/incremental.rs

//! End-to-end checkpoint and reconstruction tests over in-memory storage.

use std::path::Path;
use std::sync::Arc;

use proptest::prelude::*;

use icp_core::checkpoint::format::{LAYER_PREAMBLE_SIZE, META_RECORD_SIZE};
use icp_core::{
    CheckpointSession, HashFunction, IcpConfig, IcpError, IoMode, LayerFile, MemoryStorage,
    Reconstructor, StatusCode, StorageBackend, VariableRegistry,
};

fn config(block_size: u64, stack_size: u32) -> IcpConfig {
    let mut config = IcpConfig::default();
    config.incremental.block_size = block_size;
    config.incremental.stack_size = stack_size;
    config
}

fn assert_restores(storage: &Arc<MemoryStorage>, path: &Path, registry: &VariableRegistry) {
    let restored = Reconstructor::new(storage.clone()).reconstruct(path).unwrap();
    assert_eq!(restored.len(), registry.len());
    for var in registry.iter() {
        assert_eq!(restored.variable(var.id()).unwrap(), var.bytes(), "variable {}", var.id());
    }
}

#[test]
fn test_small_blocks_with_growth_and_rollover() {
    let storage = Arc::new(MemoryStorage::new());
    let mut session = CheckpointSession::new(storage.clone(), &config(64, 3), 0).unwrap();
    let mut registry = VariableRegistry::new();
    registry.protect(0, (0..200u32).map(|i| i as u8).collect(), 1);

    let first = session.checkpoint(1, &registry).unwrap();
    assert_eq!((first.file_id, first.layer), (0, 0));
    assert_eq!(first.stats.committed_blocks, 4);
    assert_restores(&storage, &first.path, &registry);

    registry.get_mut(0).unwrap().bytes_mut()[10] ^= 0xFF;
    let second = session.checkpoint(2, &registry).unwrap();
    assert_eq!((second.file_id, second.layer), (0, 1));
    assert_eq!(second.stats.committed_blocks, 1);
    assert_eq!(second.stats.unchanged_blocks, 3);
    assert_eq!(second.stats.dcp_size, 64);
    assert_restores(&storage, &second.path, &registry);

    let mut grown = registry.get(0).unwrap().bytes().to_vec();
    grown.extend((0..100u32).map(|i| (i * 7) as u8));
    registry.get_mut(0).unwrap().set_bytes(grown);
    let third = session.checkpoint(3, &registry).unwrap();
    assert_eq!((third.file_id, third.layer), (0, 2));
    assert!(third.stats.committed_blocks >= 1);
    assert_restores(&storage, &third.path, &registry);

    let fourth = session.checkpoint(4, &registry).unwrap();
    assert_eq!((fourth.file_id, fourth.layer), (1, 0));
    assert_restores(&storage, &fourth.path, &registry);
    assert!(!storage.exists(&first.path).unwrap());

    let file = LayerFile::open(storage.as_ref(), &fourth.path).unwrap();
    assert_eq!(file.layers().len(), 1);
    assert_eq!(file.newest().checkpoint_id, 4);
}

#[test]
fn test_unchanged_checkpoint_commits_no_content() {
    let storage = Arc::new(MemoryStorage::new());
    let mut session = CheckpointSession::new(storage.clone(), &config(128, 4), 2).unwrap();
    let mut registry = VariableRegistry::new();
    registry.protect(0, vec![3u8; 1000], 4);
    registry.protect(5, vec![9u8; 333], 1);

    session.checkpoint(10, &registry).unwrap();
    let receipt = session.checkpoint(11, &registry).unwrap();

    assert_eq!(receipt.layer, 1);
    assert_eq!(receipt.stats.committed_blocks, 0);
    assert_eq!(receipt.stats.dcp_size, 0);
    assert_eq!(receipt.stats.data_size, 1333);
    assert_restores(&storage, &receipt.path, &registry);

    let restored = Reconstructor::new(storage.clone()).reconstruct(&receipt.path).unwrap();
    assert_eq!(restored.checkpoint_id(), 11);
}

#[test]
fn test_corrupt_layer_falls_back() {
    let storage = Arc::new(MemoryStorage::new());
    let mut session = CheckpointSession::new(storage.clone(), &config(32, 4), 0).unwrap();
    let mut registry = VariableRegistry::new();
    registry.protect(1, vec![0u8; 256], 1);

    session.checkpoint(1, &registry).unwrap();
    registry.get_mut(1).unwrap().bytes_mut()[40] = 1;
    session.checkpoint(2, &registry).unwrap();
    let snapshot = registry.get(1).unwrap().bytes().to_vec();
    registry.get_mut(1).unwrap().bytes_mut()[200] = 2;
    let receipt = session.checkpoint(3, &registry).unwrap();

    let mut bytes = storage.contents(&receipt.path).unwrap();
    let file = LayerFile::open(storage.as_ref(), &receipt.path).unwrap();
    let offset = file.layers()[2].body_offset as usize + LAYER_PREAMBLE_SIZE + META_RECORD_SIZE;
    bytes[offset] ^= 0x5A;
    storage.put(receipt.path.clone(), bytes);

    let reconstructor = Reconstructor::new(storage.clone());
    let restored = reconstructor.reconstruct(&receipt.path).unwrap();
    assert_eq!(restored.layer(), 1);
    assert_eq!(restored.checkpoint_id(), 2);
    assert_eq!(restored.corrupt_layers(), &[2]);
    assert_eq!(restored.variable(1).unwrap(), snapshot.as_slice());

    let err = reconstructor.reconstruct_layer(&receipt.path, 2).unwrap_err();
    assert!(err.is_corrupt_layer());
    assert_eq!(err.status(), StatusCode::SoftFailure);
}

#[test]
fn test_middle_block_change_commits_one_block() {
    let storage = Arc::new(MemoryStorage::new());
    let mut session = CheckpointSession::new(storage.clone(), &config(64, 3), 0).unwrap();
    let mut registry = VariableRegistry::new();
    let original: Vec<u8> = (0..200u32).map(|i| i as u8).collect();
    registry.protect(0, original.clone(), 1);
    session.checkpoint(1, &registry).unwrap();

    for byte in &mut registry.get_mut(0).unwrap().bytes_mut()[64..128] {
        *byte = !*byte;
    }
    let expected = registry.get(0).unwrap().bytes().to_vec();
    let receipt = session.checkpoint(2, &registry).unwrap();
    assert_eq!(receipt.layer, 1);
    assert_eq!(receipt.stats.committed_blocks, 1);
    assert_eq!(receipt.stats.unchanged_blocks, 3);
    assert_eq!(receipt.stats.dcp_size, 64);

    let file = LayerFile::open(storage.as_ref(), &receipt.path).unwrap();
    let layer = file.verify_layer(1).unwrap();
    assert_eq!(layer.blocks.len(), 1);
    assert_eq!((layer.blocks[0].var_id, layer.blocks[0].block_id), (0, 1));
    assert_eq!(
        layer.summary.body_size as usize,
        LAYER_PREAMBLE_SIZE + META_RECORD_SIZE + 64
    );
    assert_eq!(file.block_bytes(&layer.blocks[0]), &expected[64..128]);

    let reconstructor = Reconstructor::new(storage.clone());
    let merged = reconstructor.reconstruct_layer(&receipt.path, 1).unwrap();
    assert_eq!(merged.variable(0).unwrap(), expected.as_slice());
    let base = reconstructor.reconstruct_layer(&receipt.path, 0).unwrap();
    assert_eq!(base.variable(0).unwrap(), original.as_slice());
}

#[test]
fn test_flipped_meta_record_is_corrupt() {
    let storage = Arc::new(MemoryStorage::new());
    let mut session = CheckpointSession::new(storage.clone(), &config(64, 3), 0).unwrap();
    let mut registry = VariableRegistry::new();
    registry.protect(0, vec![1u8; 64], 1);
    registry.protect(1, vec![2u8; 64], 1);
    session.checkpoint(1, &registry).unwrap();

    registry.get_mut(0).unwrap().set_bytes(vec![9u8; 64]);
    let receipt = session.checkpoint(2, &registry).unwrap();

    // Low bit of the first meta byte is the low bit of the variable id.
    let mut bytes = storage.contents(&receipt.path).unwrap();
    let file = LayerFile::open(storage.as_ref(), &receipt.path).unwrap();
    bytes[file.layers()[1].body_offset as usize + LAYER_PREAMBLE_SIZE] ^= 1;
    storage.put(receipt.path.clone(), bytes);

    let reconstructor = Reconstructor::new(storage.clone());
    let err = reconstructor.reconstruct_layer(&receipt.path, 1).unwrap_err();
    assert!(err.is_corrupt_layer());

    let restored = reconstructor.reconstruct(&receipt.path).unwrap();
    assert_eq!(restored.layer(), 0);
    assert_eq!(restored.corrupt_layers(), &[1]);
    assert_eq!(restored.variable(0).unwrap(), vec![1u8; 64].as_slice());
    assert_eq!(restored.variable(1).unwrap(), vec![2u8; 64].as_slice());
}

#[test]
fn test_zero_length_variable_restores_empty() {
    let storage = Arc::new(MemoryStorage::new());
    let mut session = CheckpointSession::new(storage.clone(), &config(64, 3), 0).unwrap();
    let mut registry = VariableRegistry::new();
    registry.protect(3, Vec::new(), 1);
    registry.protect(4, vec![5u8; 10], 1);

    let receipt = session.checkpoint(1, &registry).unwrap();
    assert_eq!(receipt.stats.committed_blocks, 1);

    let restored = Reconstructor::new(storage.clone()).reconstruct(&receipt.path).unwrap();
    assert_eq!(restored.variable(3).unwrap(), &[] as &[u8]);
    assert_eq!(restored.variable(4).unwrap(), vec![5u8; 10].as_slice());
    assert!(matches!(
        restored.variable(9),
        Err(IcpError::VariableNotFound { id: 9 })
    ));
}

#[test]
fn test_failed_checkpoint_is_retried() {
    let storage = Arc::new(MemoryStorage::new());
    let mut session = CheckpointSession::new(storage.clone(), &config(64, 3), 0).unwrap();
    let mut registry = VariableRegistry::new();
    registry.protect(0, vec![1u8; 300], 1);
    session.checkpoint(1, &registry).unwrap();

    registry.get_mut(0).unwrap().bytes_mut()[0] = 7;
    storage.fail_sync(true);
    assert!(session.checkpoint(2, &registry).is_err());
    assert_eq!(session.next_position(), (0, 1));

    storage.clear_faults();
    let receipt = session.checkpoint(2, &registry).unwrap();
    assert_eq!(receipt.layer, 1);
    assert_restores(&storage, &receipt.path, &registry);
}

#[test]
fn test_overflowing_variable_id_is_rejected() {
    let storage = Arc::new(MemoryStorage::new());
    let mut config = config(64, 2);
    config.incremental.max_var_id = 15;
    let mut session = CheckpointSession::new(storage.clone(), &config, 0).unwrap();
    let mut registry = VariableRegistry::new();
    registry.protect(16, vec![0u8; 10], 1);

    let err = session.checkpoint(1, &registry).unwrap_err();
    assert!(matches!(err, IcpError::ConfigOverflow { var_id: 16, .. }));
    assert_eq!(err.status(), StatusCode::HardFailure);
    assert_eq!(session.counter(), 0);
    assert!(storage.list(Path::new("l1")).unwrap().is_empty());
}

#[test]
fn test_full_mode_restores() {
    let storage = Arc::new(MemoryStorage::new());
    let mut config = config(64, 3);
    config.incremental.mode = IoMode::Full;
    let mut session = CheckpointSession::new(storage.clone(), &config, 1).unwrap();
    let mut registry = VariableRegistry::new();
    registry.protect(0, vec![4u8; 150], 1);
    registry.protect(2, vec![8u8; 70], 2);

    session.checkpoint(1, &registry).unwrap();
    registry.get_mut(2).unwrap().set_bytes(vec![6u8; 90]);
    let receipt = session.checkpoint(2, &registry).unwrap();

    let restored = Reconstructor::new(storage.clone()).restore_full(&receipt.path).unwrap();
    assert_eq!(restored.checkpoint_id(), 2);
    assert_eq!(restored.variable(2).unwrap(), vec![6u8; 90].as_slice());
    assert_eq!(restored.variable(0).unwrap(), vec![4u8; 150].as_slice());
}

#[derive(Debug, Clone)]
struct Step {
    writes: Vec<(usize, u8)>,
    resize: Option<usize>,
}

fn step_strategy() -> impl Strategy<Value = Step> {
    (
        prop::collection::vec((0usize..1024, any::<u8>()), 0..8),
        prop::option::weighted(0.2, 1usize..700),
    )
        .prop_map(|(writes, resize)| Step { writes, resize })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_every_layer_restores_exactly(
        block_size in prop::sample::select(vec![16u64, 64, 100]),
        stack_size in 1u32..5,
        hash in prop::sample::select(vec![HashFunction::Xxhash64, HashFunction::Crc32, HashFunction::Blake3]),
        initial in prop::collection::vec(any::<u8>(), 1..600),
        steps in prop::collection::vec(step_strategy(), 1..7),
    ) {
        let storage = Arc::new(MemoryStorage::new());
        let mut config = config(block_size, stack_size);
        config.incremental.hash_function = hash;
        let mut session = CheckpointSession::new(storage.clone(), &config, 0).unwrap();
        let mut registry = VariableRegistry::new();
        registry.protect(0, initial, 1);
        registry.protect(1, vec![0u8; 50], 1);

        for (i, step) in steps.iter().enumerate() {
            let var = registry.get_mut(0).unwrap();
            if let Some(len) = step.resize {
                let mut data = var.bytes().to_vec();
                data.resize(len, 0xEE);
                var.set_bytes(data);
            }
            let len = var.size() as usize;
            for &(offset, value) in &step.writes {
                var.bytes_mut()[offset % len] = value;
            }

            let receipt = session.checkpoint(i as i32 + 1, &registry).unwrap();
            prop_assert_eq!(receipt.layer as u64, i as u64 % u64::from(stack_size));

            let restored = Reconstructor::new(storage.clone()).reconstruct(&receipt.path).unwrap();
            prop_assert_eq!(restored.checkpoint_id(), i as i32 + 1);
            for var in registry.iter() {
                prop_assert_eq!(restored.variable(var.id()).unwrap(), var.bytes());
            }
        }
    }
}
