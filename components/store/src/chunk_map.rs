// Copyright 2024 tsumiki
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{collections::HashMap, fs, path::Path, sync::Arc};

use parking_lot::{Condvar, Mutex, RwLock};
use snafu::ResultExt;
use tracing::debug;
use tsumiki_common::{chunk_file_name, ChunkId, TEMP_SUFFIX};

use crate::{
    chunk::{ChunkEnv, ChunkRef, FileChunk},
    err::{IoSnafu, Result, StoreOp},
};

pub(crate) type ChunkMapRef = Arc<ChunkMap>;

/// [ChunkMap] holds the one in-memory instance of every open chunk.
///
/// An entry is present exactly while its chunk has at least one open
/// reference, except for the short window in which the closer that dropped
/// the last reference tears the chunk down. Openers arriving in that window
/// sleep until the entry goes away and then load a fresh instance.
#[derive(Default)]
pub struct ChunkMap {
    chunks:   RwLock<HashMap<ChunkId, ChunkRef>>,
    /// [released] is signalled whenever entries leave the map.
    released: Condvar,
    gate:     Mutex<()>,
}

impl ChunkMap {
    pub fn new() -> Self { Self::default() }

    pub fn get(&self, chunk_id: ChunkId) -> Option<ChunkRef> {
        self.chunks.read().get(&chunk_id).cloned()
    }

    /// Remove the entry for `chunk` if it is still that very instance.
    pub fn remove(&self, chunk: &ChunkRef) -> bool {
        let removed = {
            let mut chunks = self.chunks.write();
            match chunks.get(&chunk.chunk_id()) {
                Some(cur) if Arc::ptr_eq(cur, chunk) => {
                    chunks.remove(&chunk.chunk_id());
                    true
                }
                _ => false,
            }
        };
        if removed {
            self.notify_released();
        }
        removed
    }

    fn notify_released(&self) {
        let _gate = self.gate.lock();
        self.released.notify_all();
    }

    /// Sleep until `dying`, whose last reference is gone, leaves the map.
    fn wait_released(&self, dying: &ChunkRef) {
        let mut gate = self.gate.lock();
        while self
            .chunks
            .read()
            .get(&dying.chunk_id())
            .is_some_and(|cur| Arc::ptr_eq(cur, dying))
        {
            self.released.wait(&mut gate);
        }
    }

    pub fn exists(&self, chunk_id: ChunkId) -> bool { self.chunks.read().contains_key(&chunk_id) }

    pub fn is_empty(&self) -> bool { self.chunks.read().is_empty() }

    pub fn len(&self) -> usize { self.chunks.read().len() }

    /// Some open chunk, if there is one.
    pub fn any_chunk(&self) -> Option<ChunkRef> { self.chunks.read().values().next().cloned() }

    /// Run `f` under the map's write lock if `chunk_id` is not open. Nobody
    /// can open the chunk while `f` runs.
    pub(crate) fn if_absent<R>(&self, chunk_id: ChunkId, f: impl FnOnce() -> R) -> Option<R> {
        let chunks = self.chunks.write();
        if chunks.contains_key(&chunk_id) {
            return None;
        }
        let r = f();
        drop(chunks);
        Some(r)
    }

    pub(crate) fn open_or_insert<F>(&self, chunk_id: ChunkId, load: F) -> Result<ChunkRef>
    where
        F: FnMut() -> Result<FileChunk>,
    {
        self.open_or_insert_with(chunk_id, load, || Ok(true))
    }

    /// Hand out the open instance of `chunk_id` with one more reference, or
    /// load it with `load` and insert it with a count of one.
    ///
    /// `load` runs without holding the map lock. If another opener inserts
    /// the chunk meanwhile, its instance wins and ours is dropped. `admit`
    /// runs under the write lock right before a new instance goes in. It may
    /// veto the insertion with an error, or answer false when the chunk
    /// changed on disk after `load` read it, in which case it is loaded again.
    pub(crate) fn open_or_insert_with<F, A>(
        &self,
        chunk_id: ChunkId,
        mut load: F,
        mut admit: A,
    ) -> Result<ChunkRef>
    where
        F: FnMut() -> Result<FileChunk>,
        A: FnMut() -> Result<bool>,
    {
        loop {
            match self.get(chunk_id) {
                Some(chunk) if chunk.try_acquire() => return Ok(chunk),
                // the last reference is being dropped right now
                Some(dying) => {
                    self.wait_released(&dying);
                    continue;
                }
                None => {}
            }

            let loaded = Arc::new(load()?);
            let mut chunks = self.chunks.write();
            match chunks.get(&chunk_id) {
                Some(winner) if winner.try_acquire() => {
                    debug!(chunk_id, "lost the open race, using the winner");
                    return Ok(winner.clone());
                }
                Some(dying) => {
                    // Its teardown persists newer state than `loaded` holds.
                    let dying = dying.clone();
                    drop(chunks);
                    self.wait_released(&dying);
                }
                None => {
                    if !admit()? {
                        drop(chunks);
                        debug!(chunk_id, "chunk changed while loading, loading again");
                        continue;
                    }
                    loaded.ref_add();
                    // Completions must find the context as soon as anybody can
                    // see the chunk.
                    loaded.attach_io();
                    chunks.insert(chunk_id, loaded.clone());
                    return Ok(loaded);
                }
            }
        }
    }

    /// Persist the descriptor of every open chunk into `dir`, named by chunk
    /// id like the meta directory.
    pub fn store(&self, dir: &Path) -> Result<usize> {
        let chunks: Vec<ChunkRef> = self.chunks.read().values().cloned().collect();
        for chunk in &chunks {
            let path = dir.join(chunk_file_name(chunk.chunk_id()));
            chunk.descriptor().store(&path)?;
        }
        debug!(?dir, count = chunks.len(), "chunk map stored");
        Ok(chunks.len())
    }

    /// Load every descriptor in `dir` into the map. Each loaded chunk holds
    /// one open reference which the caller gives back through a close.
    /// Chunks already in the map are left alone.
    pub(crate) fn load(&self, env: &Arc<ChunkEnv>, dir: &Path) -> Result<usize> {
        let entries = fs::read_dir(dir).context(IoSnafu {
            op:   StoreOp::ChunkLoad,
            path: dir,
        })?;
        let mut loaded = 0;
        for entry in entries {
            let entry = entry.context(IoSnafu {
                op:   StoreOp::ChunkLoad,
                path: dir,
            })?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let Ok(chunk_id) = ChunkId::from_str_radix(name, 16) else {
                continue;
            };
            if name.ends_with(TEMP_SUFFIX) || !entry.path().is_file() {
                continue;
            }
            if self.exists(chunk_id) {
                continue;
            }
            let chunk = FileChunk::load_from(env.clone(), &entry.path())?;
            let mut chunks = self.chunks.write();
            if chunks.contains_key(&chunk_id) {
                continue;
            }
            chunk.ref_add();
            chunk.attach_io();
            chunks.insert(chunk_id, Arc::new(chunk));
            loaded += 1;
        }
        debug!(?dir, loaded, "chunk map loaded");
        Ok(loaded)
    }

    /// Forget every entry, handing them back to the caller.
    pub fn cleanup(&self) -> Vec<ChunkRef> {
        let drained: Vec<ChunkRef> = self.chunks.write().drain().map(|(_, c)| c).collect();
        if !drained.is_empty() {
            self.notify_released();
            debug!(count = drained.len(), "chunk map cleaned up");
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tsumiki_types::{ChunkCreateOpts, IoMode};

    use super::*;
    use crate::layout::StoreLayout;

    fn env(dir: &Path) -> Arc<ChunkEnv> {
        let layout = StoreLayout::new(dir, "data", "meta", "journal", "backup");
        for d in layout.sub_dirs() {
            fs::create_dir_all(d).unwrap();
        }
        let mut env = ChunkEnv::new(layout, IoMode::Sync);
        env.block_size_shift = 12;
        Arc::new(env)
    }

    fn create(env: &Arc<ChunkEnv>, chunk_id: ChunkId) {
        FileChunk::create(
            env.clone(),
            chunk_id,
            &ChunkCreateOpts::default().with_size(1 << 14),
        )
        .unwrap();
    }

    #[test]
    fn open_twice_shares_one_instance() {
        let dir = tempfile::tempdir().unwrap();
        let env = env(dir.path());
        create(&env, 1);
        let map = ChunkMap::new();

        let a = map
            .open_or_insert(1, || FileChunk::load(env.clone(), 1))
            .unwrap();
        let b = map
            .open_or_insert(1, || panic!("must reuse the open instance"))
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.open_ref(), 2);
        assert_eq!(map.len(), 1);
        assert!(map.exists(1));

        assert!(!a.release().unwrap());
        assert!(b.release().unwrap());
        assert!(map.remove(&b));
        assert!(map.is_empty());
        assert!(!map.remove(&a));
    }

    #[test]
    fn concurrent_opens_keep_one_instance() {
        let dir = tempfile::tempdir().unwrap();
        let env = env(dir.path());
        create(&env, 2);
        let map = Arc::new(ChunkMap::new());
        let loads = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let map = map.clone();
                let env = env.clone();
                let loads = loads.clone();
                std::thread::spawn(move || {
                    map.open_or_insert(2, || {
                        loads.fetch_add(1, Ordering::SeqCst);
                        FileChunk::load(env.clone(), 2)
                    })
                    .unwrap()
                })
            })
            .collect();
        let opened: Vec<ChunkRef> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(loads.load(Ordering::SeqCst) >= 1);
        for c in &opened {
            assert!(Arc::ptr_eq(c, &opened[0]));
        }
        assert_eq!(opened[0].open_ref(), 8);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn load_error_leaves_map_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let env = env(dir.path());
        let map = ChunkMap::new();
        assert!(map.open_or_insert(3, || FileChunk::load(env.clone(), 3)).is_err());
        assert!(map.is_empty());
        assert!(map.any_chunk().is_none());
    }

    #[test]
    fn opener_sleeps_until_the_closer_is_done() {
        let dir = tempfile::tempdir().unwrap();
        let env = env(dir.path());
        create(&env, 4);
        let map = Arc::new(ChunkMap::new());
        let dying = map
            .open_or_insert(4, || FileChunk::load(env.clone(), 4))
            .unwrap();
        assert!(dying.release().unwrap());

        let opener = {
            let map = map.clone();
            let env = env.clone();
            std::thread::spawn(move || map.open_or_insert(4, || FileChunk::load(env.clone(), 4)))
        };
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!opener.is_finished());

        dying.teardown().unwrap();
        assert!(map.remove(&dying));
        let fresh = opener.join().unwrap().unwrap();
        assert!(!Arc::ptr_eq(&fresh, &dying));
        assert_eq!(fresh.open_ref(), 1);
        assert!(Arc::ptr_eq(&map.get(4).unwrap(), &fresh));
    }

    #[test]
    fn stale_load_is_loaded_again() {
        let dir = tempfile::tempdir().unwrap();
        let env = env(dir.path());
        create(&env, 5);
        let map = ChunkMap::new();
        let mut loads = 0;
        let mut admits = 0;
        let chunk = map
            .open_or_insert_with(
                5,
                || {
                    loads += 1;
                    FileChunk::load(env.clone(), 5)
                },
                || {
                    admits += 1;
                    Ok(admits > 1)
                },
            )
            .unwrap();
        assert_eq!((loads, admits), (2, 2));
        assert_eq!(chunk.open_ref(), 1);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn store_load_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let env = env(dir.path());
        create(&env, 0xa);
        create(&env, 0xb);
        let map = ChunkMap::new();
        for id in [0xa, 0xb] {
            map.open_or_insert(id, || FileChunk::load(env.clone(), id))
                .unwrap();
        }
        map.get(0xa).unwrap().set_xattr("k", "v").unwrap();

        let snapshot = dir.path().join("snapshot");
        fs::create_dir(&snapshot).unwrap();
        assert_eq!(map.store(&snapshot).unwrap(), 2);

        let drained = map.cleanup();
        assert_eq!(drained.len(), 2);
        assert!(map.is_empty());

        fs::write(snapshot.join("not-a-chunk"), b"").unwrap();
        assert_eq!(map.load(&env, &snapshot).unwrap(), 2);
        assert_eq!(map.len(), 2);
        let a = map.get(0xa).unwrap();
        assert_eq!(a.open_ref(), 1);
        assert_eq!(a.get_xattr("k").unwrap(), "v");
        assert!(map.any_chunk().is_some());
    }
}
