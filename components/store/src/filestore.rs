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

//! The file backed chunk store.
//!
//! Every chunk is a descriptor file in the meta directory plus a directory of
//! object files in the data directory. Store wide accounting lives in the
//! superblock, which is written at format and unmount and read at mount.

use std::{
    cell::Cell,
    collections::HashSet,
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::{Mutex, RwLock};
use snafu::{ensure, OptionExt, ResultExt};
use strum_macros::Display;
use tracing::{debug, error, info, warn};
use tsumiki_common::{ChunkId, CONFIG_FILE, SUPERBLOCK_FILE, TEMP_SUFFIX};
use tsumiki_types::{ChunkCreateOpts, DevStatus, IoMode, StoreInfo};
use tsumiki_utils::{readable_size::ReadableSize, time::now_millis};

use crate::{
    chunk::{ChunkEnv, ChunkRef, FileChunk},
    chunk_map::{ChunkMap, ChunkMapRef},
    config::FileStoreConfig,
    context::StoreContext,
    descriptor::{read_size_xattr, ChunkDescriptor},
    err::{
        AlreadyMountedSnafu, ChunkBusySnafu, ChunkExistsSnafu, ChunkNotFoundSnafu, InvalidUrlSnafu,
        IoSnafu, NotMountedSnafu, Result, StoreBusySnafu, StoreOp,
    },
    layout::StoreLayout,
    reactor::{Multiplexer, Reactor},
    superblock::{load_super, persist_super},
};

pub const FILESTORE_DRIVER: &str = "FileStore";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum FileStoreState {
    None,
    Formatted,
    Mounted,
    Down,
}

struct MountedEnv {
    env:     Arc<ChunkEnv>,
    chunks:  ChunkMapRef,
    reactor: Option<Reactor>,
}

/// [FileStore] is the chunk store over a local directory tree.
pub struct FileStore {
    ctx:         StoreContext,
    config_path: PathBuf,
    /// [config] is read on first use by check, format or mount.
    config:      RwLock<Option<FileStoreConfig>>,
    info:        Mutex<StoreInfo>,
    state:       RwLock<FileStoreState>,
    mounted:     RwLock<Option<MountedEnv>>,
    /// [busy_ids] are chunks in the middle of a create or remove.
    busy_ids:    Mutex<HashSet<ChunkId>>,
    /// [removals] counts finished removes. An opener compares it across its
    /// load to spot a chunk that was removed and maybe created again.
    removals:    AtomicU64,
}

impl FileStore {
    pub fn new(ctx: StoreContext, config_path: impl Into<PathBuf>) -> Self {
        FileStore {
            ctx,
            config_path: config_path.into(),
            config: RwLock::new(None),
            info: Mutex::new(StoreInfo::default()),
            state: RwLock::new(FileStoreState::None),
            mounted: RwLock::new(None),
            busy_ids: Mutex::new(HashSet::new()),
            removals: AtomicU64::new(0),
        }
    }

    /// Use `config` instead of reading the config file.
    pub fn with_config(ctx: StoreContext, config: FileStoreConfig) -> Self {
        let store = FileStore::new(ctx, config.config_path.clone());
        *store.config.write() = Some(config);
        store
    }

    fn config(&self) -> Result<FileStoreConfig> {
        if let Some(cfg) = self.config.read().as_ref() {
            return Ok(cfg.clone());
        }
        let cfg = FileStoreConfig::load(&self.config_path)?;
        *self.config.write() = Some(cfg.clone());
        Ok(cfg)
    }

    fn layout(&self) -> Result<StoreLayout> { Ok(self.config()?.layout()) }

    // Store info

    pub fn get_info(&self) -> StoreInfo { self.info.lock().clone() }

    /// Overwrite the store identity and accounting, as an upstream manager
    /// does when registering the store.
    pub fn set_info(&self, info: StoreInfo) {
        debug!(id = info.id, cluster = %info.cluster_name, "store info set");
        *self.info.lock() = info;
    }

    pub fn driver_name(&self) -> &'static str { FILESTORE_DRIVER }

    pub fn config_info(&self) -> Result<String> { Ok(self.config()?.to_string()) }

    pub fn runtime_info(&self) -> String {
        let info = self.get_info();
        format!(
            "state={} io_mode={} open_chunks={} chunks={} used={} size={}",
            self.state(),
            self.io_mode(),
            self.open_chunks(),
            info.chunk_count,
            ReadableSize(info.used),
            ReadableSize(info.size)
        )
    }

    pub fn io_mode(&self) -> IoMode {
        if let Some(m) = self.mounted.read_recursive().as_ref() {
            return m.env.io_mode;
        }
        self.config
            .read()
            .as_ref()
            .map(|c| c.io_mode)
            .unwrap_or_default()
    }

    pub fn is_support_mem_persist(&self) -> bool { false }

    pub fn is_mounted(&self) -> bool { *self.state.read() == FileStoreState::Mounted }

    pub fn state(&self) -> FileStoreState { *self.state.read() }

    pub fn open_chunks(&self) -> usize {
        self.mounted
            .read_recursive()
            .as_ref()
            .map(|m| m.chunks.len())
            .unwrap_or(0)
    }

    // Device lifecycle

    /// Load and validate the configuration without touching the device.
    pub fn dev_check(&self) -> DevStatus {
        let cfg = match FileStoreConfig::load(&self.config_path).and_then(|cfg| {
            cfg.validate()?;
            Ok(cfg)
        }) {
            Ok(cfg) => cfg,
            Err(e) => {
                error!(config = ?self.config_path, "store check failed: {e}");
                return DevStatus::None;
            }
        };
        debug!(config = %cfg, "config is valid");
        let status = match load_super(&cfg.layout().superblock_path()) {
            Ok(sb) if !sb.cluster_name.is_empty() && sb.cluster_name != self.ctx.cluster_name => {
                warn!(
                    found = %sb.cluster_name,
                    expected = %self.ctx.cluster_name,
                    "store belongs to another cluster"
                );
                DevStatus::ClusterOut
            }
            _ => DevStatus::ClusterIn,
        };
        *self.config.write() = Some(cfg);
        status
    }

    /// Wipe the store and write a fresh superblock. A mounted store closes
    /// its open chunks first and stays mounted.
    pub fn dev_format(&self) -> Result<()> {
        let cfg = self.config()?;
        cfg.validate()?;
        let layout = cfg.layout();

        let closed = self.close_active_chunks();
        if closed > 0 {
            info!(closed, "closed active chunks before format");
        }

        let mounted = self.mounted.write();
        if let Some(m) = mounted.as_ref() {
            ensure!(
                m.chunks.is_empty(),
                StoreBusySnafu {
                    open_chunks: m.chunks.len(),
                }
            );
        }
        self.wipe(&layout)?;

        let info = {
            let mut info = self.info.lock();
            if info.cluster_name.is_empty() {
                info.cluster_name = self.ctx.cluster_name.clone();
            }
            if info.name.is_empty() {
                info.name = self.ctx.node_name.clone();
            }
            info.size = cfg.size_in_bytes();
            info.used = 0;
            info.chunk_count = 0;
            info.ftime = now_millis();
            info.clone()
        };
        persist_super(&layout.superblock_path(), &info)?;
        if mounted.is_none() {
            *self.state.write() = FileStoreState::Formatted;
        }
        info!(
            id = info.id,
            cluster = %info.cluster_name,
            size = %ReadableSize(info.size),
            "store formatted"
        );
        Ok(())
    }

    fn wipe(&self, layout: &StoreLayout) -> Result<()> {
        let fmt_err = |path: &Path| IoSnafu {
            op:   StoreOp::Format,
            path: path.to_path_buf(),
        };
        if layout.meta_dir().exists() {
            let removed = self.remove_all_chunks(layout)?;
            debug!(removed, "chunks removed");
        }

        let base = layout.base_dir();
        let entries = fs::read_dir(base).context(fmt_err(base))?;
        for entry in entries {
            let entry = entry.context(fmt_err(base))?;
            let path = entry.path();
            if path == self.config_path {
                continue;
            }
            let file_type = entry.file_type().context(fmt_err(&path))?;
            if file_type.is_dir() {
                fs::remove_dir_all(&path).context(fmt_err(&path))?;
            } else {
                fs::remove_file(&path).context(fmt_err(&path))?;
            }
        }

        for dir in layout.sub_dirs() {
            fs::create_dir_all(dir).context(fmt_err(dir))?;
        }
        Ok(())
    }

    pub fn dev_mount(&self) -> Result<()> {
        let mut mounted = self.mounted.write();
        ensure!(mounted.is_none(), AlreadyMountedSnafu);

        let cfg = self.config()?;
        let layout = cfg.layout();
        let sb = load_super(&layout.superblock_path())?;

        let mut env = ChunkEnv::new(layout, cfg.io_mode);
        env.direct_io = cfg.direct_io;
        env.block_size_shift = cfg.block_size_shift;
        let mut reactor = None;
        if cfg.io_mode.is_async() {
            // Both are dropped again if the reactor cannot start.
            let mux = Multiplexer::new(cfg.io_depth)?;
            reactor = Some(Reactor::start(mux.clone())?);
            env.mux = Some(mux);
        }

        *self.info.lock() = sb;
        *mounted = Some(MountedEnv {
            env: Arc::new(env),
            chunks: Arc::new(ChunkMap::new()),
            reactor,
        });
        *self.state.write() = FileStoreState::Mounted;
        info!(
            config = %cfg,
            io_mode = %cfg.io_mode,
            "store mounted"
        );
        Ok(())
    }

    /// Stop the reactor and write the superblock. Refused while any chunk is
    /// open.
    pub fn dev_unmount(&self) -> Result<()> {
        let mut mounted = self.mounted.write();
        let m = mounted.as_ref().context(NotMountedSnafu)?;
        ensure!(
            m.chunks.is_empty(),
            StoreBusySnafu {
                open_chunks: m.chunks.len(),
            }
        );
        let MountedEnv { env, reactor, .. } = mounted.take().context(NotMountedSnafu)?;
        *self.state.write() = FileStoreState::Down;

        let stopped = reactor.map_or(Ok(()), Reactor::stop);
        if let Err(e) = &stopped {
            error!("stopping the completion reactor failed: {e}");
        }
        let info = self.get_info();
        persist_super(&env.layout.superblock_path(), &info)?;
        info!(chunks = info.chunk_count, used = %ReadableSize(info.used), "store unmounted");
        stopped
    }

    fn with_mounted<T>(&self, f: impl FnOnce(&MountedEnv) -> Result<T>) -> Result<T> {
        let mounted = self.mounted.read_recursive();
        let m = mounted.as_ref().context(NotMountedSnafu)?;
        f(m)
    }

    /// Mark `chunk_id` busy for the duration of a create or remove.
    fn claim(&self, chunk_id: ChunkId) -> Option<IdClaim<'_>> {
        if self.busy_ids.lock().insert(chunk_id) {
            Some(IdClaim {
                ids: &self.busy_ids,
                chunk_id,
            })
        } else {
            None
        }
    }

    // Chunks

    pub fn chunk_exist(&self, chunk_id: ChunkId) -> Result<bool> {
        self.with_mounted(|m| Ok(m.env.layout.chunk_meta_path(chunk_id).exists()))
    }

    pub fn chunk_create(&self, chunk_id: ChunkId, opts: &ChunkCreateOpts) -> Result<()> {
        self.with_mounted(|m| {
            let _claim = self
                .claim(chunk_id)
                .context(ChunkBusySnafu { chunk_id })?;
            if m.env.layout.chunk_meta_path(chunk_id).exists() {
                error!(chunk_id, "chunk already exists");
                return ChunkExistsSnafu { chunk_id }.fail();
            }

            FileChunk::create(m.env.clone(), chunk_id, opts)?;

            let mut info = self.info.lock();
            info.chunk_count += 1;
            info.used += opts.size;
            Ok(())
        })
    }

    /// Delete a closed chunk: its data directory is moved aside, then the
    /// descriptor is removed, then the moved directory.
    pub fn chunk_remove(&self, chunk_id: ChunkId) -> Result<()> {
        self.with_mounted(|m| {
            let layout = &m.env.layout;
            let _claim = m
                .chunks
                .if_absent(chunk_id, || self.claim(chunk_id))
                .flatten()
                .context(ChunkBusySnafu { chunk_id })?;
            let meta = layout.chunk_meta_path(chunk_id);
            ensure!(meta.exists(), ChunkNotFoundSnafu { chunk_id });

            let size = ChunkDescriptor::load(&meta)
                .map(|d| d.size)
                .ok()
                .or_else(|| read_size_xattr(&meta))
                .map_or_else(|| self.chunk_size_from_objects(layout, chunk_id), Ok)?;

            let data = layout.chunk_data_dir(chunk_id);
            let trash = layout.chunk_trash_dir(chunk_id);
            let has_data = data.exists();
            if has_data {
                fs::rename(&data, &trash).context(IoSnafu {
                    op:   StoreOp::ChunkRemove,
                    path: data.clone(),
                })?;
            }
            if let Err(e) = fs::remove_file(&meta) {
                error!(chunk_id, "remove descriptor failed: {e}");
                if has_data {
                    if let Err(e) = fs::rename(&trash, &data) {
                        error!(chunk_id, "cannot restore the data directory: {e}");
                    }
                }
                return Err(e).context(IoSnafu {
                    op:   StoreOp::ChunkRemove,
                    path: meta,
                });
            }
            if has_data {
                if let Err(e) = fs::remove_dir_all(&trash) {
                    warn!(chunk_id, ?trash, "leaving removed chunk data behind: {e}");
                }
            }

            self.removals.fetch_add(1, Ordering::AcqRel);
            let mut info = self.info.lock();
            info.chunk_count = info.chunk_count.saturating_sub(1);
            info.used = info.used.saturating_sub(size);
            info!(chunk_id, size, "chunk removed");
            Ok(())
        })
    }

    /// Open `chunk_id`, sharing the instance other openers hold.
    pub fn chunk_open(&self, chunk_id: ChunkId) -> Result<ChunkRef> {
        self.open_with(chunk_id, FileChunk::load)
    }

    /// Open through `load`, which reads the chunk without the map lock held.
    /// A remove that finishes meanwhile makes the open fail with
    /// [ChunkNotFound](crate::err::Error::ChunkNotFound), and a remove plus
    /// create makes it load the new chunk.
    fn open_with<F>(&self, chunk_id: ChunkId, mut load: F) -> Result<ChunkRef>
    where
        F: FnMut(Arc<ChunkEnv>, ChunkId) -> Result<FileChunk>,
    {
        self.with_mounted(|m| {
            let seen = Cell::new(0);
            let chunk = m.chunks.open_or_insert_with(
                chunk_id,
                || {
                    seen.set(self.removals.load(Ordering::Acquire));
                    load(m.env.clone(), chunk_id)
                },
                || {
                    ensure!(
                        !self.busy_ids.lock().contains(&chunk_id),
                        ChunkBusySnafu { chunk_id }
                    );
                    ensure!(
                        m.env.layout.chunk_meta_path(chunk_id).exists(),
                        ChunkNotFoundSnafu { chunk_id }
                    );
                    Ok(self.removals.load(Ordering::Acquire) == seen.get())
                },
            )?;
            debug!(chunk_id, open_ref = chunk.open_ref(), "chunk opened");
            Ok(chunk)
        })
    }

    /// Drop one reference of `chunk`. The last close persists the chunk and
    /// releases everything it holds.
    pub fn chunk_close(&self, chunk: &ChunkRef) -> Result<()> {
        self.with_mounted(|m| close_chunk(&m.chunks, chunk))
    }

    /// Close every open chunk no matter how many references it has.
    /// Returns how many chunks were torn down here.
    pub fn close_active_chunks(&self) -> usize {
        let Some(chunks) = self
            .mounted
            .read_recursive()
            .as_ref()
            .map(|m| m.chunks.clone())
        else {
            return 0;
        };
        let mut closed = 0;
        while let Some(chunk) = chunks.any_chunk() {
            loop {
                match chunk.release() {
                    Ok(false) => continue,
                    Ok(true) => {
                        if let Err(e) = chunk.teardown() {
                            warn!(chunk_id = chunk.chunk_id(), "forced close: {e}");
                        }
                        chunks.remove(&chunk);
                        closed += 1;
                        break;
                    }
                    // somebody else is closing it
                    Err(_) => {
                        std::thread::yield_now();
                        break;
                    }
                }
            }
        }
        closed
    }

    /// Remove every chunk whose descriptor is in the meta directory, data
    /// first. A descriptor that cannot be deleted is renamed to `.<name>`.
    fn remove_all_chunks(&self, layout: &StoreLayout) -> Result<usize> {
        let meta_dir = layout.meta_dir();
        let rm_err = |path: &Path| IoSnafu {
            op:   StoreOp::RemoveAll,
            path: path.to_path_buf(),
        };
        let mut removed = 0;
        for entry in fs::read_dir(meta_dir).context(rm_err(meta_dir))? {
            let entry = entry.context(rm_err(meta_dir))?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name == SUPERBLOCK_FILE || name == CONFIG_FILE || name.ends_with(TEMP_SUFFIX) {
                continue;
            }
            let path = entry.path();
            let file_type = entry.file_type().context(rm_err(&path))?;
            if file_type.is_dir() {
                fs::remove_dir_all(&path).context(rm_err(&path))?;
                continue;
            }
            if !file_type.is_file() {
                continue;
            }

            let data = layout.data_dir().join(name.as_ref());
            match fs::remove_dir_all(&data) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e).context(rm_err(&data)),
            }
            if let Err(e) = fs::remove_file(&path) {
                error!(?path, "cannot remove descriptor: {e}");
                let aside = meta_dir.join(format!(".{}", name));
                fs::rename(&path, &aside).context(rm_err(&path))?;
            }
            removed += 1;
        }
        Ok(removed)
    }

    /// Sum of the object file sizes of `chunk_id`.
    fn chunk_size_from_objects(&self, layout: &StoreLayout, chunk_id: ChunkId) -> Result<u64> {
        let dir = layout.chunk_data_dir(chunk_id);
        let size_err = |path: &Path| IoSnafu {
            op:   StoreOp::ChunkSize,
            path: path.to_path_buf(),
        };
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e).context(size_err(&dir)),
        };
        let mut size = 0;
        for entry in entries {
            let entry = entry.context(size_err(&dir))?;
            size += entry.metadata().context(size_err(&entry.path()))?.len();
        }
        Ok(size)
    }

    /// Size of an unopened chunk from its object files on disk.
    pub fn chunk_size_on_disk(&self, chunk_id: ChunkId) -> Result<u64> {
        let layout = self.layout()?;
        self.chunk_size_from_objects(&layout, chunk_id)
    }

    /// Size of an unopened chunk as recorded on its descriptor file.
    pub fn chunk_size_from_xattr(&self, chunk_id: ChunkId) -> Result<Option<u64>> {
        let layout = self.layout()?;
        Ok(read_size_xattr(&layout.chunk_meta_path(chunk_id)))
    }

    /// Persist the descriptors of all open chunks into the backup directory.
    pub fn backup_open_chunks(&self) -> Result<usize> {
        self.with_mounted(|m| m.chunks.store(m.env.layout.backup_dir()))
    }

    /// Open every chunk whose descriptor is in the backup directory.
    pub fn restore_open_chunks(&self) -> Result<usize> {
        self.with_mounted(|m| m.chunks.load(&m.env, m.env.layout.backup_dir()))
    }
}

fn close_chunk(chunks: &ChunkMap, chunk: &ChunkRef) -> Result<()> {
    if !chunk.release()? {
        debug!(chunk_id = chunk.chunk_id(), open_ref = chunk.open_ref(), "chunk released");
        return Ok(());
    }
    let result = chunk.teardown();
    chunks.remove(chunk);
    match &result {
        Ok(()) => info!(chunk_id = chunk.chunk_id(), "chunk closed"),
        Err(e) => error!(chunk_id = chunk.chunk_id(), "chunk closed without persisting: {e}"),
    }
    result
}

struct IdClaim<'a> {
    ids:      &'a Mutex<HashSet<ChunkId>>,
    chunk_id: ChunkId,
}

impl Drop for IdClaim<'_> {
    fn drop(&mut self) { self.ids.lock().remove(&self.chunk_id); }
}

impl std::fmt::Debug for FileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStore")
            .field("config_path", &self.config_path)
            .field("state", &self.state())
            .finish()
    }
}

/// Build the store a `filestore://<config path>` url points at.
pub(crate) fn from_url_params(ctx: StoreContext, params: &str) -> Result<FileStore> {
    ensure!(
        !params.is_empty(),
        InvalidUrlSnafu {
            url: format!("filestore://{}", params),
        }
    );
    Ok(FileStore::new(ctx, params))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use crossbeam::channel;
    use tsumiki_utils::{
        logger::install_fmt_log,
        readable_size::{SizeUnit, UnitSize},
    };

    use super::*;
    use crate::err::Error;

    const SHIFT: u8 = 12;
    const OS: u64 = 1 << SHIFT;

    fn store_at(dir: &Path, io_mode: IoMode) -> FileStore {
        let cfg = FileStoreConfig::new(dir.join(CONFIG_FILE), dir)
            .with_size(UnitSize::new(16, SizeUnit::Mega))
            .with_io_mode(io_mode)
            .with_block_size_shift(SHIFT);
        cfg.store().unwrap();
        FileStore::new(StoreContext::new("flame", "node-1"), dir.join(CONFIG_FILE))
    }

    fn mounted(dir: &Path, io_mode: IoMode) -> FileStore {
        let store = store_at(dir, io_mode);
        assert_eq!(store.dev_check(), DevStatus::ClusterIn);
        store.dev_format().unwrap();
        store.dev_mount().unwrap();
        store
    }

    fn opts(size: u64) -> ChunkCreateOpts { ChunkCreateOpts::default().with_size(size) }

    #[test]
    fn check_bad_config() {
        install_fmt_log();
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(StoreContext::default(), dir.path().join("missing"));
        assert_eq!(store.dev_check(), DevStatus::None);

        fs::write(dir.path().join("config"), "base_path /definitely/not/here\n").unwrap();
        let store = FileStore::new(StoreContext::default(), dir.path().join("config"));
        assert_eq!(store.dev_check(), DevStatus::None);
    }

    #[test]
    fn other_cluster() {
        let dir = tempfile::tempdir().unwrap();
        let store = mounted(dir.path(), IoMode::Sync);
        store.dev_unmount().unwrap();
        let other = FileStore::new(
            StoreContext::new("elsewhere", "node-1"),
            dir.path().join(CONFIG_FILE),
        );
        assert_eq!(other.dev_check(), DevStatus::ClusterOut);
    }

    #[test]
    fn operations_need_a_mounted_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_at(dir.path(), IoMode::Sync);
        store.dev_format().unwrap();
        assert_eq!(store.state(), FileStoreState::Formatted);
        assert!(matches!(
            store.chunk_create(1, &opts(OS)).unwrap_err(),
            Error::NotMounted { .. }
        ));
        assert!(matches!(
            store.dev_unmount().unwrap_err(),
            Error::NotMounted { .. }
        ));
        store.dev_mount().unwrap();
        assert!(matches!(
            store.dev_mount().unwrap_err(),
            Error::AlreadyMounted { .. }
        ));
    }

    #[test]
    fn mount_without_superblock() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_at(dir.path(), IoMode::Sync);
        assert!(matches!(
            store.dev_mount().unwrap_err(),
            Error::NoSuperblock { .. }
        ));
        assert!(!store.is_mounted());
    }

    #[test]
    fn create_exist_remove_accounting() {
        install_fmt_log();
        let dir = tempfile::tempdir().unwrap();
        let store = mounted(dir.path(), IoMode::Sync);
        let before = store.get_info();
        assert_eq!(before.used, 0);
        assert_eq!(before.cluster_name, "flame");
        assert_eq!(before.size, 16 << 20);

        store.chunk_create(0x10, &opts(2 * OS)).unwrap();
        assert!(store.chunk_exist(0x10).unwrap());
        let info = store.get_info();
        assert_eq!(info.chunk_count, 1);
        assert_eq!(info.used, 2 * OS);

        let err = store.chunk_create(0x10, &opts(2 * OS)).unwrap_err();
        assert!(matches!(err, Error::ChunkExists { .. }));
        assert_eq!(store.get_info(), info);

        assert_eq!(store.chunk_size_from_xattr(0x10).unwrap().unwrap_or(2 * OS), 2 * OS);

        store.chunk_remove(0x10).unwrap();
        assert!(!store.chunk_exist(0x10).unwrap());
        let after = store.get_info();
        assert_eq!(after.chunk_count, before.chunk_count);
        assert_eq!(after.used, before.used);
        assert!(!dir.path().join("store").join(".10").exists());

        assert!(matches!(
            store.chunk_remove(0x10).unwrap_err(),
            Error::ChunkNotFound { .. }
        ));
    }

    #[test]
    fn remove_open_chunk_is_busy() {
        let dir = tempfile::tempdir().unwrap();
        let store = mounted(dir.path(), IoMode::Sync);
        store.chunk_create(1, &opts(OS)).unwrap();
        let chunk = store.chunk_open(1).unwrap();
        chunk.write_sync(b"keep", 0).unwrap();

        let err = store.chunk_remove(1).unwrap_err();
        assert!(err.is_busy());
        assert!(store.chunk_exist(1).unwrap());
        assert!(dir.path().join("store").join("1").join("0").exists());

        store.chunk_close(&chunk).unwrap();
        store.chunk_remove(1).unwrap();
    }

    #[test]
    fn remove_during_open_does_not_resurrect() {
        install_fmt_log();
        let dir = tempfile::tempdir().unwrap();
        let store = mounted(dir.path(), IoMode::Sync);
        store.chunk_create(9, &opts(2 * OS)).unwrap();
        let before = store.get_info();

        let err = store
            .open_with(9, |env, id| {
                let loaded = FileChunk::load(env, id);
                store.chunk_remove(id).unwrap();
                loaded
            })
            .unwrap_err();
        assert!(matches!(err, Error::ChunkNotFound { chunk_id: 9, .. }));
        assert!(!store.chunk_exist(9).unwrap());
        assert_eq!(store.open_chunks(), 0);
        assert_eq!(store.get_info().chunk_count, before.chunk_count - 1);
        assert!(store.chunk_open(9).is_err());
    }

    #[test]
    fn remove_and_create_during_open_loads_the_new_chunk() {
        install_fmt_log();
        let dir = tempfile::tempdir().unwrap();
        let store = mounted(dir.path(), IoMode::Sync);
        store.chunk_create(9, &opts(2 * OS)).unwrap();

        let mut loads = 0;
        let chunk = store
            .open_with(9, |env, id| {
                loads += 1;
                let loaded = FileChunk::load(env, id);
                if loads == 1 {
                    store.chunk_remove(id).unwrap();
                    store.chunk_create(id, &opts(4 * OS)).unwrap();
                }
                loaded
            })
            .unwrap();
        assert_eq!(loads, 2);
        assert_eq!(chunk.size(), 4 * OS);

        store.chunk_close(&chunk).unwrap();
        let info = store.get_info();
        assert_eq!(info.chunk_count, 1);
        assert_eq!(info.used, 4 * OS);
        store.chunk_remove(9).unwrap();
        assert_eq!(store.get_info().used, 0);
    }

    #[test]
    fn failed_object_create_removes_the_data_dir() {
        install_fmt_log();
        let dir = tempfile::tempdir().unwrap();
        let store = mounted(dir.path(), IoMode::Sync);
        let layout = store.layout().unwrap();
        let before = store.get_info();

        // the second object already exists, so creating it fails
        fs::create_dir_all(layout.chunk_data_dir(3)).unwrap();
        fs::write(layout.object_path(3, 1), b"").unwrap();

        assert!(store
            .chunk_create(3, &opts(4 * OS).with_prealloc(true))
            .is_err());
        assert!(!layout.chunk_data_dir(3).exists());
        assert!(!store.chunk_exist(3).unwrap());
        let after = store.get_info();
        assert_eq!((after.chunk_count, after.used), (before.chunk_count, before.used));
    }

    #[test]
    fn failed_descriptor_persist_removes_the_data_dir() {
        install_fmt_log();
        let dir = tempfile::tempdir().unwrap();
        let store = mounted(dir.path(), IoMode::Sync);
        let layout = store.layout().unwrap();
        let before = store.get_info();

        // a temp descriptor in the way makes the persist fail
        let temp = crate::layout::temp_path(&layout.chunk_meta_path(4));
        fs::write(&temp, b"").unwrap();

        let err = store
            .chunk_create(4, &opts(2 * OS).with_prealloc(true))
            .unwrap_err();
        assert!(matches!(err, Error::Io { op: StoreOp::ChunkPersist, .. }));
        assert!(!layout.chunk_data_dir(4).exists());
        assert!(!store.chunk_exist(4).unwrap());
        let after = store.get_info();
        assert_eq!((after.chunk_count, after.used), (before.chunk_count, before.used));

        fs::remove_file(&temp).unwrap();
        store.chunk_create(4, &opts(2 * OS)).unwrap();
        assert!(store.chunk_exist(4).unwrap());
    }

    #[test]
    fn open_n_times_close_n_times() {
        install_fmt_log();
        let dir = tempfile::tempdir().unwrap();
        let store = mounted(dir.path(), IoMode::Sync);
        store.chunk_create(2, &opts(2 * OS)).unwrap();
        let meta = dir.path().join("meta").join("2");

        let handles: Vec<_> = (0..3).map(|_| store.chunk_open(2).unwrap()).collect();
        assert_eq!(handles[0].open_ref(), 3);
        assert_eq!(store.open_chunks(), 1);
        handles[0].set_xattr("owner", "vol-1").unwrap();
        let stamp = fs::metadata(&meta).unwrap().modified().unwrap();

        store.chunk_close(&handles[0]).unwrap();
        store.chunk_close(&handles[1]).unwrap();
        // intermediate closes never write the descriptor
        assert_eq!(fs::metadata(&meta).unwrap().modified().unwrap(), stamp);
        assert_eq!(store.open_chunks(), 1);
        assert!(store.dev_unmount().unwrap_err().is_busy());

        store.chunk_close(&handles[2]).unwrap();
        assert_eq!(store.open_chunks(), 0);
        assert!(matches!(
            store.chunk_close(&handles[2]).unwrap_err(),
            Error::AlreadyClosed { .. }
        ));

        let again = store.chunk_open(2).unwrap();
        assert!(!Arc::ptr_eq(&again, &handles[0]));
        assert_eq!(again.get_xattr("owner").unwrap(), "vol-1");
        store.chunk_close(&again).unwrap();
        store.dev_unmount().unwrap();
        assert_eq!(store.state(), FileStoreState::Down);
    }

    #[test]
    fn end_to_end_split_io() {
        let dir = tempfile::tempdir().unwrap();
        let store = mounted(dir.path(), IoMode::Sync);
        store.chunk_create(3, &opts(2 * OS)).unwrap();
        assert!(store.chunk_exist(3).unwrap());
        let chunk = store.chunk_open(3).unwrap();
        assert_eq!(chunk.used(), 0);

        let data: Vec<u8> = (0..OS + 100).map(|i| (i % 97) as u8).collect();
        chunk.write_sync(&data, OS - 100).unwrap();
        assert_eq!(chunk.write_counter(), 2);
        let mut back = vec![0u8; data.len()];
        chunk.read_sync(&mut back, OS - 100).unwrap();
        assert_eq!(back, data);
        store.chunk_close(&chunk).unwrap();

        let chunk = store.chunk_open(3).unwrap();
        assert_eq!(chunk.write_counter(), 2);
        assert_eq!(chunk.read_counter(), 2);
        store.chunk_close(&chunk).unwrap();
    }

    #[test]
    fn mount_format_mount_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = mounted(dir.path(), IoMode::Sync);
        let mut info = store.get_info();
        info.id = 77;
        store.set_info(info);
        store.chunk_create(1, &opts(OS)).unwrap();
        store.chunk_create(2, &opts(OS).with_prealloc(true)).unwrap();
        store.dev_unmount().unwrap();

        let restarted = store_at(dir.path(), IoMode::Sync);
        restarted.dev_mount().unwrap();
        let info = restarted.get_info();
        assert_eq!(info.id, 77);
        assert_eq!(info.cluster_name, "flame");
        assert_eq!(info.chunk_count, 2);
        assert_eq!(info.used, 2 * OS);

        // format while mounted wipes the chunks and keeps the identity
        let open = restarted.chunk_open(1).unwrap();
        restarted.dev_format().unwrap();
        assert!(restarted.is_mounted());
        assert_eq!(open.open_ref(), 0);
        assert_eq!(restarted.open_chunks(), 0);
        assert!(!restarted.chunk_exist(1).unwrap());
        assert!(!restarted.chunk_exist(2).unwrap());
        assert!(dir.path().join(CONFIG_FILE).exists());
        restarted.dev_unmount().unwrap();

        let third = store_at(dir.path(), IoMode::Sync);
        third.dev_mount().unwrap();
        let info = third.get_info();
        assert_eq!(info.id, 77);
        assert_eq!(info.cluster_name, "flame");
        assert_eq!(info.chunk_count, 0);
        assert_eq!(info.used, 0);
        third.dev_unmount().unwrap();
    }

    #[test]
    fn async_mode_round_trip() {
        install_fmt_log();
        let dir = tempfile::tempdir().unwrap();
        let store = mounted(dir.path(), IoMode::Async);
        assert_eq!(store.io_mode(), IoMode::Async);
        store.chunk_create(4, &opts(4 * OS)).unwrap();
        let chunk = store.chunk_open(4).unwrap();

        let data = Bytes::from(vec![0x5au8; (2 * OS) as usize]);
        let (tx, rx) = channel::unbounded();
        chunk
            .write_chunk(data.clone(), OS / 2, Box::new(move |r| tx.send(r).unwrap()))
            .unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();

        let (tx, rx) = channel::unbounded();
        chunk
            .read_chunk(OS / 2, 2 * OS, Box::new(move |r| tx.send(r).unwrap()))
            .unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap(), data);

        store.chunk_close(&chunk).unwrap();
        store.dev_unmount().unwrap();
    }

    #[test]
    fn close_from_a_completion_callback() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(mounted(dir.path(), IoMode::Async));
        store.chunk_create(5, &opts(OS)).unwrap();
        let chunk = store.chunk_open(5).unwrap();

        let (tx, rx) = channel::unbounded();
        let (s, c) = (store.clone(), chunk.clone());
        chunk
            .write_chunk(
                Bytes::from_static(b"bye"),
                0,
                Box::new(move |r| {
                    r.unwrap();
                    tx.send(s.chunk_close(&c)).unwrap();
                }),
            )
            .unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
        assert_eq!(store.open_chunks(), 0);
        store.dev_unmount().unwrap();
    }

    #[test]
    fn backup_and_restore_open_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let store = mounted(dir.path(), IoMode::Sync);
        store.chunk_create(6, &opts(OS)).unwrap();
        let chunk = store.chunk_open(6).unwrap();
        assert_eq!(store.backup_open_chunks().unwrap(), 1);
        store.chunk_close(&chunk).unwrap();

        assert_eq!(store.restore_open_chunks().unwrap(), 1);
        assert_eq!(store.open_chunks(), 1);
        assert_eq!(store.close_active_chunks(), 1);
        store.dev_unmount().unwrap();
    }

    #[test]
    fn info_strings() {
        let dir = tempfile::tempdir().unwrap();
        let store = mounted(dir.path(), IoMode::Sync);
        assert_eq!(store.driver_name(), "FileStore");
        assert!(!store.is_support_mem_persist());
        assert!(store.config_info().unwrap().starts_with("filestore://"));
        assert!(store.runtime_info().contains("state=mounted"));
        store.dev_unmount().unwrap();
    }
}
