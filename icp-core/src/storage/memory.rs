// icp-core/src/storage/memory.rs

//! In-process storage backend.
//!
//! Objects live in a shared map, so several handles (and several simulated
//! ranks) observe the same bytes. Writes go straight to the map, which means
//! an aborted write leaves a partial object behind exactly like a crashed
//! process would. Failures can be injected to exercise the I/O error paths.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use super::traits::{ObjectMeta, OpenMode, StorageBackend, StorageReader, StorageWriter};
use crate::error::{IcpError, Result};

#[derive(Debug, Default)]
struct MemoryState {
    files: BTreeMap<PathBuf, Vec<u8>>,
    dirs: BTreeSet<PathBuf>,
    /// Remaining bytes that may be written before writes start failing.
    write_budget: Option<u64>,
    fail_sync: bool,
}

/// Storage backend keeping every object in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStorage {
    /// Creates an empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        // A panic while holding the lock cannot leave the maps inconsistent.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Lets only `bytes` more bytes be written; later writes fail.
    pub fn fail_writes_after(&self, bytes: u64) {
        self.lock().write_budget = Some(bytes);
    }

    /// Makes every `finish` fail at the sync step.
    pub fn fail_sync(&self, fail: bool) {
        self.lock().fail_sync = fail;
    }

    /// Removes any injected failure.
    pub fn clear_faults(&self) {
        let mut state = self.lock();
        state.write_budget = None;
        state.fail_sync = false;
    }

    /// Returns a copy of an object's bytes.
    pub fn contents(&self, path: &Path) -> Option<Vec<u8>> {
        self.lock().files.get(path).cloned()
    }

    /// Replaces an object's bytes. Used to simulate media corruption.
    pub fn put(&self, path: impl Into<PathBuf>, data: Vec<u8>) {
        self.lock().files.insert(path.into(), data);
    }
}

fn not_found(path: &Path) -> IcpError {
    IcpError::storage_with_source(
        path,
        "object not found",
        std::io::Error::new(std::io::ErrorKind::NotFound, "no such object"),
    )
}

impl StorageBackend for MemoryStorage {
    fn exists(&self, path: &Path) -> Result<bool> {
        let state = self.lock();
        Ok(state.files.contains_key(path) || state.dirs.contains(path))
    }

    fn metadata(&self, path: &Path) -> Result<ObjectMeta> {
        let state = self.lock();
        if let Some(data) = state.files.get(path) {
            return Ok(ObjectMeta {
                size: data.len() as u64,
                modified: None,
                is_dir: false,
            });
        }
        if state.dirs.contains(path) {
            return Ok(ObjectMeta {
                size: 0,
                modified: None,
                is_dir: true,
            });
        }
        Err(not_found(path))
    }

    fn open_read(&self, path: &Path) -> Result<Box<dyn StorageReader>> {
        let data = self.contents(path).ok_or_else(|| not_found(path))?;
        Ok(Box::new(MemoryReader {
            cursor: Cursor::new(data),
            path: path.to_path_buf(),
        }))
    }

    fn open_write(&self, path: &Path, mode: OpenMode) -> Result<Box<dyn StorageWriter>> {
        let mut state = self.lock();
        if let Some(parent) = path.parent() {
            for ancestor in parent.ancestors() {
                if !ancestor.as_os_str().is_empty() {
                    state.dirs.insert(ancestor.to_path_buf());
                }
            }
        }
        let file = state.files.entry(path.to_path_buf()).or_default();
        if mode == OpenMode::Truncate {
            file.clear();
        }
        let pos = file.len() as u64;
        drop(state);

        Ok(Box::new(MemoryWriter {
            storage: self.clone(),
            path: path.to_path_buf(),
            pos,
        }))
    }

    fn delete(&self, path: &Path) -> Result<()> {
        let mut state = self.lock();
        if state.files.remove(path).is_some() {
            return Ok(());
        }
        if state.dirs.remove(path) {
            state.files.retain(|p, _| !p.starts_with(path));
            return Ok(());
        }
        Err(not_found(path))
    }

    fn list(&self, prefix: &Path) -> Result<Vec<String>> {
        let state = self.lock();
        let mut entries: Vec<String> = state
            .files
            .keys()
            .chain(state.dirs.iter())
            .filter(|p| p.parent() == Some(prefix))
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()).map(str::to_string))
            .collect();
        entries.sort();
        entries.dedup();
        Ok(entries)
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let mut state = self.lock();
        let data = state.files.remove(from).ok_or_else(|| not_found(from))?;
        state.files.insert(to.to_path_buf(), data);
        Ok(())
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        let mut state = self.lock();
        for ancestor in path.ancestors() {
            if !ancestor.as_os_str().is_empty() {
                state.dirs.insert(ancestor.to_path_buf());
            }
        }
        Ok(())
    }
}

struct MemoryReader {
    cursor: Cursor<Vec<u8>>,
    path: PathBuf,
}

impl Read for MemoryReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.cursor.read(buf)
    }
}

impl Seek for MemoryReader {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.cursor.seek(pos)
    }
}

impl StorageReader for MemoryReader {
    fn size(&self) -> u64 {
        self.cursor.get_ref().len() as u64
    }

    fn read_range(&mut self, start: u64, length: usize) -> Result<Vec<u8>> {
        let data = self.cursor.get_ref();
        let start = usize::try_from(start).unwrap_or(usize::MAX);
        let end = start.saturating_add(length);
        if end > data.len() {
            return Err(IcpError::storage(
                &self.path,
                format!("read range {start}..{end} exceeds size {}", data.len()),
            ));
        }
        Ok(data[start..end].to_vec())
    }
}

struct MemoryWriter {
    storage: MemoryStorage,
    path: PathBuf,
    pos: u64,
}

impl Write for MemoryWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut state = self.storage.lock();

        let allowed = match state.write_budget {
            Some(0) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "injected write failure",
                ))
            }
            Some(budget) => buf.len().min(usize::try_from(budget).unwrap_or(usize::MAX)),
            None => buf.len(),
        };
        if let Some(budget) = state.write_budget.as_mut() {
            *budget -= allowed as u64;
        }

        let file = state.files.entry(self.path.clone()).or_default();
        let start = usize::try_from(self.pos).unwrap_or(usize::MAX);
        let end = start + allowed;
        if file.len() < end {
            file.resize(end, 0);
        }
        file[start..end].copy_from_slice(&buf[..allowed]);
        self.pos = end as u64;
        Ok(allowed)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Seek for MemoryWriter {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let len = self
            .storage
            .lock()
            .files
            .get(&self.path)
            .map_or(0, |f| f.len() as i64);
        let new_pos = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::End(offset) => len + offset,
            SeekFrom::Current(offset) => self.pos as i64 + offset,
        };
        if new_pos < 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "seek to negative position",
            ));
        }
        self.pos = new_pos as u64;
        Ok(self.pos)
    }
}

impl StorageWriter for MemoryWriter {
    fn position(&mut self) -> Result<u64> {
        Ok(self.pos)
    }

    fn finish(self: Box<Self>) -> Result<()> {
        if self.storage.lock().fail_sync {
            return Err(IcpError::storage_with_source(
                &self.path,
                "failed to sync file to disk",
                std::io::Error::new(std::io::ErrorKind::Other, "injected sync failure"),
            ));
        }
        Ok(())
    }
}
