//! Paired persistence of the vector file and its metadata sidecar.
//!
//! Each file is staged to a `*.tmp` sibling, synced, then renamed into
//! place: sidecar first, vectors second. A single file is never seen
//! half-written, but the pair is not swapped as one unit. Readers load the
//! vector file before the sidecar, so the sidecar they get is at least as
//! new as the vectors. Entries are append-only, so a newer sidecar only
//! adds ids the vector file lacks; [`IndexStore::load`] drops exactly those
//! entries. The same rule recovers a crash between the two renames.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::chunk::ChunkingProfile;
use crate::config::IndexPaths;
use crate::error::{RagError, Result};
use crate::metadata::IndexManifest;
use crate::vector_index::FlatIndex;

/// In-memory view of a persisted index.
#[derive(Debug, Clone)]
pub struct IndexStore {
    pub manifest: IndexManifest,
    /// `None` until the first vectors establish a dimension.
    pub index: Option<FlatIndex>,
}

impl IndexStore {
    pub fn empty(chunking: ChunkingProfile, embedding_model: &str) -> Self {
        Self {
            manifest: IndexManifest::new(chunking, embedding_model),
            index: None,
        }
    }

    /// Load persisted state, failing with `NotIndexed` when nothing usable
    /// has been written yet.
    pub fn load(paths: &IndexPaths) -> Result<Self> {
        match Self::load_parts(paths)? {
            Some(store) if store.index.is_some() => Ok(store),
            _ => Err(RagError::NotIndexed(paths.metadata.clone())),
        }
    }

    /// Load persisted state, or start empty for a first run.
    pub fn load_or_empty(
        paths: &IndexPaths,
        chunking: &ChunkingProfile,
        embedding_model: &str,
    ) -> Result<Self> {
        match Self::load_parts(paths)? {
            Some(mut store) => {
                store.manifest.check_compatible(chunking, embedding_model)?;
                Ok(store)
            }
            None => Ok(Self::empty(chunking.clone(), embedding_model)),
        }
    }

    fn load_parts(paths: &IndexPaths) -> Result<Option<Self>> {
        // Vectors before sidecar: a concurrent save renames the sidecar first.
        let has_vectors = paths.vectors.exists();
        let has_meta = paths.metadata.exists();

        match (has_meta, has_vectors) {
            (false, false) => Ok(None),
            (false, true) => Err(RagError::IndexMismatch(format!(
                "vector file {} exists without its metadata sidecar",
                paths.vectors.display()
            ))),
            (true, false) => {
                // First-ever save was interrupted after the sidecar rename.
                let mut manifest = IndexManifest::load(&paths.metadata)?;
                if !manifest.entries.is_empty() {
                    warn!(
                        dropped = manifest.entries.len(),
                        "vector file missing; discarding entries from an interrupted save"
                    );
                    manifest.entries.clear();
                }
                Ok(Some(Self {
                    manifest,
                    index: None,
                }))
            }
            (true, true) => {
                let index = FlatIndex::load(&paths.vectors)?;
                let manifest = IndexManifest::load(&paths.metadata)?;
                let store = Self::reconcile(manifest, index)?;
                debug!(entries = store.len(), "loaded index");
                Ok(Some(store))
            }
        }
    }

    fn reconcile(mut manifest: IndexManifest, index: FlatIndex) -> Result<Self> {
        if let Some(dims) = manifest.dims {
            if dims != index.dims() {
                return Err(RagError::IndexMismatch(format!(
                    "metadata records {} dims but vector file has {}",
                    dims,
                    index.dims()
                )));
            }
        }
        manifest.dims = Some(index.dims());

        let before = manifest.entries.len();
        manifest.entries.retain(|e| index.contains(e.id));
        if manifest.entries.len() != before {
            warn!(
                dropped = before - manifest.entries.len(),
                "metadata lists ids missing from the vector file; discarding entries from an interrupted save"
            );
        }

        if manifest.entries.len() != index.len() {
            return Err(RagError::IndexMismatch(format!(
                "vector file holds {} vectors but metadata describes {}",
                index.len(),
                manifest.entries.len()
            )));
        }

        Ok(Self {
            manifest,
            index: Some(index),
        })
    }

    pub fn len(&self) -> usize {
        self.manifest.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.manifest.entries.is_empty()
    }

    pub fn dims(&self) -> Option<usize> {
        self.index.as_ref().map(FlatIndex::dims)
    }

    /// Persist both files together.
    pub fn save(&self, paths: &IndexPaths) -> Result<()> {
        let index = self.index.as_ref().ok_or_else(|| {
            RagError::IndexMismatch("cannot save an index with no vectors".to_string())
        })?;

        let mut manifest = self.manifest.clone();
        manifest.dims = Some(index.dims());

        let meta_tmp = stage(&paths.metadata, manifest.to_json()?.as_bytes())?;
        let vectors_tmp = stage(&paths.vectors, &index.to_bytes())?;
        commit(&meta_tmp, &paths.metadata)?;
        commit(&vectors_tmp, &paths.vectors)?;
        Ok(())
    }
}

/// Write `bytes` to `path` via a synced temporary file and a rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = stage(path, bytes)?;
    commit(&tmp, path)
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

fn stage(path: &Path, bytes: &[u8]) -> Result<PathBuf> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let tmp = tmp_path(path);
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(tmp)
}

fn commit(tmp: &Path, path: &Path) -> Result<()> {
    fs::rename(tmp, path)?;
    Ok(())
}

/// Exclusive lock held for the duration of an indexing run.
///
/// The file records the holder's PID and is removed on drop. A lock whose
/// PID no longer names a running process is treated as abandoned and
/// replaced. A lock with unreadable contents is left for the operator.
#[derive(Debug)]
pub struct IndexLock {
    path: PathBuf,
}

impl IndexLock {
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        match Self::create(path)? {
            Some(lock) => Ok(lock),
            None => {
                let holder = read_holder(path);
                match holder {
                    Some(pid) if !process_alive(pid) => {
                        warn!(path = %path.display(), pid, "removing index lock left by a dead process");
                        match fs::remove_file(path) {
                            Ok(()) => {}
                            Err(e) if e.kind() == ErrorKind::NotFound => {}
                            Err(e) => return Err(e.into()),
                        }
                        Self::create(path)?.ok_or_else(|| RagError::Locked(path.to_path_buf()))
                    }
                    _ => Err(RagError::Locked(path.to_path_buf())),
                }
            }
        }
    }

    /// `None` when the lock file already exists.
    fn create(path: &Path) -> Result<Option<Self>> {
        let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        writeln!(file, "{}", std::process::id())?;
        file.sync_all()?;
        Ok(Some(Self {
            path: path.to_path_buf(),
        }))
    }
}

fn read_holder(path: &Path) -> Option<i32> {
    let contents = fs::read_to_string(path).ok()?;
    contents.trim().parse::<i32>().ok().filter(|pid| *pid > 0)
}

#[cfg(unix)]
fn process_alive(pid: i32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    // Signal 0 only checks existence; EPERM still means the process exists.
    !matches!(kill(Pid::from_raw(pid), None), Err(Errno::ESRCH))
}

#[cfg(not(unix))]
fn process_alive(_pid: i32) -> bool {
    true
}

impl Drop for IndexLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove index lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::IndexEntry;
    use tempfile::TempDir;

    fn profile() -> ChunkingProfile {
        ChunkingProfile {
            chunk_size: 10,
            overlap: 2,
            tokenizer: "word-v1".to_string(),
        }
    }

    fn entry(id: u64, chunk_index: usize) -> IndexEntry {
        IndexEntry {
            id,
            ticker: "MSFT".to_string(),
            accession: "acc-1".to_string(),
            chunk_index,
            filing_date: "2024-07-30".to_string(),
            form: None,
            chunk_hash: None,
        }
    }

    fn store_with(ids: &[u64]) -> IndexStore {
        let mut store = IndexStore::empty(profile(), "model");
        let mut index = FlatIndex::create_empty(2).unwrap();
        let vectors: Vec<Vec<f32>> = ids.iter().map(|_| vec![1.0, 0.0]).collect();
        index.add(ids, &vectors).unwrap();
        store.index = Some(index);
        store.manifest.entries = ids
            .iter()
            .enumerate()
            .map(|(i, &id)| entry(id, i))
            .collect();
        store.manifest.next_id = ids.iter().max().map_or(0, |m| m + 1);
        store
    }

    #[test]
    fn test_load_missing_is_not_indexed() {
        let tmp = TempDir::new().unwrap();
        let paths = IndexPaths::in_dir(tmp.path());
        assert!(matches!(IndexStore::load(&paths), Err(RagError::NotIndexed(_))));

        let store = IndexStore::load_or_empty(&paths, &profile(), "model").unwrap();
        assert!(store.is_empty());
        assert!(store.index.is_none());
    }

    #[test]
    fn test_save_then_load() {
        let tmp = TempDir::new().unwrap();
        let paths = IndexPaths::in_dir(&tmp.path().join("index"));
        store_with(&[0, 1, 2]).save(&paths).unwrap();

        let loaded = IndexStore::load(&paths).unwrap();
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded.dims(), Some(2));
        assert_eq!(loaded.manifest.next_id, 3);
        assert!(!tmp.path().join("index/metadata.json.tmp").exists());
    }

    #[test]
    fn test_interrupted_save_drops_uncommitted_entries() {
        let tmp = TempDir::new().unwrap();
        let paths = IndexPaths::in_dir(tmp.path());
        store_with(&[0, 1]).save(&paths).unwrap();

        // New sidecar committed, vector file still from the previous run.
        let newer = store_with(&[0, 1, 2, 3]);
        let json = newer.manifest.to_json().unwrap();
        fs::write(&paths.metadata, json).unwrap();

        let loaded = IndexStore::load(&paths).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.manifest.next_id, 4);
    }

    #[test]
    fn test_extra_vectors_are_mismatch() {
        let tmp = TempDir::new().unwrap();
        let paths = IndexPaths::in_dir(tmp.path());
        store_with(&[0, 1, 2]).save(&paths).unwrap();

        let older = store_with(&[0, 1]);
        fs::write(&paths.metadata, older.manifest.to_json().unwrap()).unwrap();
        assert!(matches!(
            IndexStore::load(&paths),
            Err(RagError::IndexMismatch(_))
        ));
    }

    #[test]
    fn test_drifted_profile_rejected_on_load() {
        let tmp = TempDir::new().unwrap();
        let paths = IndexPaths::in_dir(tmp.path());
        store_with(&[0]).save(&paths).unwrap();

        let mut other = profile();
        other.chunk_size = 20;
        assert!(matches!(
            IndexStore::load_or_empty(&paths, &other, "model"),
            Err(RagError::IndexMismatch(_))
        ));
    }

    #[test]
    fn test_lock_is_exclusive_and_released() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("index.lock");
        let lock = IndexLock::acquire(&path).unwrap();
        assert!(matches!(IndexLock::acquire(&path), Err(RagError::Locked(_))));
        drop(lock);
        assert!(!path.exists());
        IndexLock::acquire(&path).unwrap();
    }

    #[test]
    fn test_lock_held_by_running_process_is_respected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("index.lock");
        fs::write(&path, format!("{}\n", std::process::id())).unwrap();
        assert!(matches!(IndexLock::acquire(&path), Err(RagError::Locked(_))));
        assert!(path.exists());
    }

    #[test]
    fn test_unreadable_lock_is_respected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("index.lock");
        fs::write(&path, "not a pid").unwrap();
        assert!(matches!(IndexLock::acquire(&path), Err(RagError::Locked(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_lock_left_by_dead_process_is_replaced() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("index.lock");
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let dead_pid = child.id();
        child.wait().unwrap();
        fs::write(&path, format!("{}\n", dead_pid)).unwrap();

        let lock = IndexLock::acquire(&path).unwrap();
        let holder = fs::read_to_string(&path).unwrap();
        assert_eq!(holder.trim(), std::process::id().to_string());
        drop(lock);
        assert!(!path.exists());
    }

    #[test]
    fn test_load_during_repeated_saves_never_mismatches() {
        let tmp = TempDir::new().unwrap();
        let paths = IndexPaths::in_dir(tmp.path());
        store_with(&[0, 1]).save(&paths).unwrap();

        let writer_paths = paths.clone();
        let writer = std::thread::spawn(move || {
            for n in 3..400u64 {
                let ids: Vec<u64> = (0..n).collect();
                store_with(&ids).save(&writer_paths).unwrap();
            }
        });

        let mut loads = 0;
        while !writer.is_finished() {
            let store = IndexStore::load(&paths)
                .unwrap_or_else(|e| panic!("load {} failed during saves: {}", loads, e));
            assert_eq!(store.len(), store.index.as_ref().unwrap().len());
            loads += 1;
        }
        writer.join().unwrap();
        assert_eq!(IndexStore::load(&paths).unwrap().len(), 399);
    }
}
