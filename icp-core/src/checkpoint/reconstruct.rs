// icp-core/src/checkpoint/reconstruct.rs

//! Restoring variables from checkpoint files.
//!
//! Layered files are replayed: a zeroed buffer is allocated for every
//! variable of the target layer, then the blocks of layers 0 through the
//! target are copied over it in order.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use super::layout::Datastructure;
use super::reader::{LayerFile, VerifiedLayer};
use super::registry::{VarId, VariableRegistry};
use super::writer::{variable_checksum, FullTrailer};
use crate::error::{IcpError, Result};
use crate::storage::StorageBackend;

/// Variables restored from one checkpoint.
#[derive(Debug, Clone)]
pub struct RestoredState {
    path: PathBuf,
    checkpoint_id: i32,
    layer: u32,
    variables: BTreeMap<VarId, Vec<u8>>,
    corrupt: Vec<u32>,
}

impl RestoredState {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn checkpoint_id(&self) -> i32 {
        self.checkpoint_id
    }

    /// Layer that was replayed.
    pub fn layer(&self) -> u32 {
        self.layer
    }

    /// Layers newer than the replayed one that failed verification.
    pub fn corrupt_layers(&self) -> &[u32] {
        &self.corrupt
    }

    /// Bytes of a restored variable.
    ///
    /// # Errors
    ///
    /// Returns `VariableNotFound` if the checkpoint holds no such variable.
    pub fn variable(&self, id: VarId) -> Result<&[u8]> {
        self.variables
            .get(&id)
            .map(Vec::as_slice)
            .ok_or_else(|| IcpError::variable_not_found(id))
    }

    pub fn ids(&self) -> impl Iterator<Item = VarId> + '_ {
        self.variables.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    pub fn into_variables(self) -> BTreeMap<VarId, Vec<u8>> {
        self.variables
    }

    /// Copies restored bytes into every registered variable.
    ///
    /// # Errors
    ///
    /// Returns `VariableNotFound` for a registered variable the checkpoint
    /// does not hold; the registry is left untouched in that case.
    pub fn apply_to(&self, registry: &mut VariableRegistry) -> Result<()> {
        for id in registry.ids() {
            self.variable(id)?;
        }
        for id in registry.ids() {
            if let (Some(var), Some(bytes)) = (registry.get_mut(id), self.variables.get(&id)) {
                var.set_bytes(bytes.clone());
            }
        }
        Ok(())
    }
}

/// Rebuilds variables from layered or full checkpoint files.
pub struct Reconstructor {
    storage: Arc<dyn StorageBackend>,
}

impl Reconstructor {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    /// Replays the newest layer for which it and all earlier layers verify.
    ///
    /// Layers that fail verification are logged and listed in the result.
    ///
    /// # Errors
    ///
    /// Returns `CorruptLayer` if layer 0 fails verification.
    pub fn reconstruct(&self, path: &Path) -> Result<RestoredState> {
        let file = LayerFile::open(self.storage.as_ref(), path)?;

        let mut verified = Vec::new();
        let mut corrupt = Vec::new();
        let mut first_error = None;
        for (layer, result) in file.verify_all() {
            match result {
                Ok(v) if corrupt.is_empty() => verified.push(v),
                Ok(_) => corrupt.push(layer),
                Err(e) => {
                    warn!(path = %path.display(), layer, error = %e, "Checkpoint layer failed verification");
                    corrupt.push(layer);
                    first_error.get_or_insert(e);
                }
            }
        }

        if verified.is_empty() {
            return Err(first_error
                .unwrap_or_else(|| IcpError::corrupt_layer(path, 0, "no layer verified")));
        }
        if !corrupt.is_empty() {
            warn!(
                path = %path.display(),
                replayed = verified.len() - 1,
                ?corrupt,
                "Falling back to an older layer"
            );
        }

        let mut state = replay(&file, &verified);
        state.corrupt = corrupt;
        Ok(state)
    }

    /// Replays exactly layer `layer`.
    ///
    /// # Errors
    ///
    /// Returns `CorruptLayer` if the file has no such layer or if it or any
    /// earlier layer fails verification.
    pub fn reconstruct_layer(&self, path: &Path, layer: u32) -> Result<RestoredState> {
        let file = LayerFile::open(self.storage.as_ref(), path)?;
        if layer as usize >= file.layers().len() {
            return Err(IcpError::corrupt_layer(
                path,
                layer,
                format!("file holds only {} finalized layers", file.layers().len()),
            ));
        }
        let verified = (0..=layer)
            .map(|l| file.verify_layer(l))
            .collect::<Result<Vec<_>>>()?;
        Ok(replay(&file, &verified))
    }

    /// Restores a file written in full mode.
    ///
    /// # Errors
    ///
    /// Returns a format error if the trailer is missing and `CorruptLayer`
    /// if a variable's checksum does not match.
    pub fn restore_full(&self, path: &Path) -> Result<RestoredState> {
        read_full_checkpoint(self.storage.as_ref(), path)
    }
}

fn replay(file: &LayerFile, layers: &[VerifiedLayer]) -> RestoredState {
    let target = &layers[layers.len() - 1].summary;
    let block_size = file.header().block_size as usize;

    let mut variables: BTreeMap<VarId, Vec<u8>> = target
        .variables
        .iter()
        .map(|extent| (extent.var_id, vec![0u8; extent.size as usize]))
        .collect();

    for layer in layers {
        for block in &layer.blocks {
            let Some(buffer) = variables.get_mut(&block.var_id) else {
                continue;
            };
            let start = block.block_id as usize * block_size;
            if start >= buffer.len() {
                continue;
            }
            let end = (start + block_size).min(buffer.len());
            buffer[start..end].copy_from_slice(&file.block_bytes(block)[..end - start]);
        }
    }

    info!(
        path = %file.path().display(),
        layer = target.layer,
        checkpoint_id = target.checkpoint_id,
        variables = variables.len(),
        "Reconstructed checkpoint"
    );

    RestoredState {
        path: file.path().to_path_buf(),
        checkpoint_id: target.checkpoint_id,
        layer: target.layer,
        variables,
        corrupt: Vec::new(),
    }
}

/// Reads a full checkpoint file.
pub fn read_full_checkpoint(storage: &dyn StorageBackend, path: &Path) -> Result<RestoredState> {
    let data = storage.open_read(path)?.read_all()?;
    let trailer = FullTrailer::from_file_bytes(&data)
        .ok_or_else(|| IcpError::format(path, "no full checkpoint trailer found"))?;
    if trailer.body_size > data.len() as u64 {
        return Err(IcpError::corrupt_layer(path, 0, "body extends past the trailer"));
    }

    let layout = Datastructure::from_blocks(trailer.datastructure);
    let mut variables = BTreeMap::new();
    for entry in &trailer.variables {
        let mut buffer = vec![0u8; entry.size as usize];
        for chunk in layout.chunks(entry.var_id)? {
            if chunk.chunk_size == 0 {
                continue;
            }
            let src = chunk.file_offset as usize..(chunk.file_offset + chunk.chunk_size) as usize;
            let dst =
                chunk.memory_offset as usize..(chunk.memory_offset + chunk.chunk_size) as usize;
            let bytes = data.get(src).ok_or_else(|| {
                IcpError::corrupt_layer(path, 0, format!("variable {} is truncated", entry.var_id))
            })?;
            buffer
                .get_mut(dst)
                .ok_or_else(|| {
                    IcpError::corrupt_layer(
                        path,
                        0,
                        format!("variable {} layout exceeds its size", entry.var_id),
                    )
                })?
                .copy_from_slice(bytes);
        }
        if variable_checksum(&buffer) != entry.checksum {
            return Err(IcpError::corrupt_layer(
                path,
                0,
                format!("checksum mismatch for variable {}", entry.var_id),
            ));
        }
        variables.insert(entry.var_id, buffer);
    }

    Ok(RestoredState {
        path: path.to_path_buf(),
        checkpoint_id: trailer.checkpoint_id,
        layer: 0,
        variables,
        corrupt: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::format::base_file_name;
    use crate::checkpoint::layout::Datastructure;
    use crate::checkpoint::writer::{FullWriter, IncrementalLayerWriter, LayerPlan};
    use crate::config::IncrementalConfig;
    use crate::storage::MemoryStorage;

    fn write_layers(storage: Arc<MemoryStorage>, versions: &[Vec<u8>]) -> PathBuf {
        let config = IncrementalConfig {
            block_size: 8,
            stack_size: 8,
            ..IncrementalConfig::default()
        };
        let mut writer = IncrementalLayerWriter::new(storage, &config);
        let mut layout = Datastructure::new();
        let mut hashes = BTreeMap::new();
        let path = PathBuf::from("l1").join(base_file_name(0, 0));

        for (layer, bytes) in versions.iter().enumerate() {
            let mut registry = VariableRegistry::new();
            registry.protect(5, bytes.clone(), 1);
            layout.update(&registry);
            writer
                .initialize(LayerPlan {
                    rank: 0,
                    file_id: 0,
                    layer: layer as u32,
                    checkpoint_id: layer as i32 + 10,
                    var_count: 1,
                    path: path.clone(),
                })
                .unwrap();
            writer
                .write_variable(5, bytes, hashes.get(&5), &mut layout)
                .unwrap();
            hashes = writer.finalize(&layout).unwrap().hashes;
        }
        path
    }

    #[test]
    fn test_replay_every_layer() {
        let storage = Arc::new(MemoryStorage::new());
        let versions = vec![vec![1u8; 20], vec![2u8; 12], vec![3u8; 30]];
        let path = write_layers(storage.clone(), &versions);
        let reconstructor = Reconstructor::new(storage);

        for (layer, expected) in versions.iter().enumerate() {
            let state = reconstructor.reconstruct_layer(&path, layer as u32).unwrap();
            assert_eq!(state.variable(5).unwrap(), expected.as_slice());
            assert_eq!(state.checkpoint_id(), layer as i32 + 10);
        }

        let newest = reconstructor.reconstruct(&path).unwrap();
        assert_eq!(newest.layer(), 2);
        assert!(newest.corrupt_layers().is_empty());
        assert!(matches!(
            newest.variable(6),
            Err(IcpError::VariableNotFound { id: 6 })
        ));
    }

    #[test]
    fn test_corrupt_delta_falls_back() {
        let storage = Arc::new(MemoryStorage::new());
        let versions = vec![vec![1u8; 16], vec![9u8; 16]];
        let path = write_layers(storage.clone(), &versions);

        let reconstructor = Reconstructor::new(storage.clone());
        let file = LayerFile::open(storage.as_ref(), &path).unwrap();
        let offset = file.layers()[1].body_offset as usize + 8 + 6;

        let mut bytes = storage.contents(&path).unwrap();
        bytes[offset] ^= 0xFF;
        storage.put(path.clone(), bytes);

        let state = reconstructor.reconstruct(&path).unwrap();
        assert_eq!(state.layer(), 0);
        assert_eq!(state.corrupt_layers(), &[1]);
        assert_eq!(state.variable(5).unwrap(), &[1u8; 16]);

        let err = reconstructor.reconstruct_layer(&path, 1).unwrap_err();
        assert!(matches!(err, IcpError::CorruptLayer { layer: 1, .. }));
    }

    #[test]
    fn test_corrupt_base_layer_fails() {
        let storage = Arc::new(MemoryStorage::new());
        let path = write_layers(storage.clone(), &[vec![4u8; 16]]);

        let mut bytes = storage.contents(&path).unwrap();
        bytes[12 + 8 + 12] ^= 0x01;
        storage.put(path.clone(), bytes);

        let err = Reconstructor::new(storage).reconstruct(&path).unwrap_err();
        assert!(matches!(err, IcpError::CorruptLayer { layer: 0, .. }));
    }

    #[test]
    fn test_apply_to_registry() {
        let storage = Arc::new(MemoryStorage::new());
        let path = write_layers(storage.clone(), &[vec![7u8; 9]]);
        let state = Reconstructor::new(storage).reconstruct(&path).unwrap();

        let mut registry = VariableRegistry::new();
        registry.protect(5, vec![0u8; 3], 1);
        state.apply_to(&mut registry).unwrap();
        assert_eq!(registry.get(5).unwrap().bytes(), &[7u8; 9]);

        registry.protect(8, vec![0u8; 3], 1);
        assert!(state.apply_to(&mut registry).is_err());
    }

    #[test]
    fn test_full_checkpoint_roundtrip_and_checksum() {
        let storage = Arc::new(MemoryStorage::new());
        let mut registry = VariableRegistry::new();
        registry.protect(1, (0..50).collect(), 1);
        registry.protect(2, vec![3u8; 7], 1);
        let mut layout = Datastructure::new();
        layout.update(&registry);
        registry.protect(1, (0..80).collect(), 1);
        layout.update(&registry);

        let path = PathBuf::from("l1/Ckpt4-Rank0.icp");
        let mut writer = FullWriter::new(storage.clone(), &IncrementalConfig::default());
        writer
            .initialize(LayerPlan {
                rank: 0,
                file_id: 0,
                layer: 0,
                checkpoint_id: 4,
                var_count: 2,
                path: path.clone(),
            })
            .unwrap();
        for var in registry.iter() {
            writer.write_variable(var.id(), var.bytes(), &mut layout).unwrap();
        }
        writer.finalize(&layout).unwrap();

        let state = Reconstructor::new(storage.clone()).restore_full(&path).unwrap();
        assert_eq!(state.checkpoint_id(), 4);
        assert_eq!(state.variable(1).unwrap(), registry.get(1).unwrap().bytes());
        assert_eq!(state.variable(2).unwrap(), &[3u8; 7]);

        let mut bytes = storage.contents(&path).unwrap();
        bytes[60] ^= 0xFF;
        storage.put(path.clone(), bytes);
        assert!(read_full_checkpoint(storage.as_ref(), &path)
            .unwrap_err()
            .is_corrupt_layer());
    }
}
