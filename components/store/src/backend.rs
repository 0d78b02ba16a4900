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

//! Picking a store backend from a `<scheme>://<params>` url.

use std::str::FromStr;

use bytes::Bytes;
use once_cell::sync::Lazy;
use regex::Regex;
use snafu::OptionExt;
use strum_macros::{Display, EnumString};
use tracing::{info, warn};
use tsumiki_common::ChunkId;
use tsumiki_types::{ChunkCreateOpts, ChunkInfo, DevStatus, IoMode, StoreInfo};

use crate::{
    aio::{ReadCallback, WriteCallback},
    chunk::ChunkRef,
    context::StoreContext,
    err::{ForeignHandleSnafu, InvalidUrlSnafu, Result, UnknownDriverSnafu},
    filestore::{self, FileStore},
    simstore::{self, SimChunkRef, SimStore},
};

static STORE_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\w+)://(.+)$").expect("store url pattern"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum StoreKind {
    FileStore,
    SimStore,
}

/// Open the store `url` names, unformatted and unmounted.
///
/// ```text
/// filestore:///data/store/config
/// simstore://100G:/var/backup/sim.bk
/// ```
pub fn open_store(ctx: StoreContext, url: &str) -> Result<ChunkStore> {
    let caps = STORE_URL.captures(url).context(InvalidUrlSnafu { url })?;
    let scheme = &caps[1];
    let params = &caps[2];
    let kind = StoreKind::from_str(scheme)
        .ok()
        .context(UnknownDriverSnafu { driver: scheme })?;
    let store = match kind {
        StoreKind::FileStore => ChunkStore::File(filestore::from_url_params(ctx, params)?),
        StoreKind::SimStore => ChunkStore::Sim(simstore::from_url_params(ctx, params)?),
    };
    info!(%kind, params, "store opened");
    Ok(store)
}

/// One of the chunk store backends.
#[derive(Debug)]
pub enum ChunkStore {
    File(FileStore),
    Sim(SimStore),
}

macro_rules! delegate {
    ($self:ident, $s:ident => $e:expr) => {
        match $self {
            ChunkStore::File($s) => $e,
            ChunkStore::Sim($s) => $e,
        }
    };
}

impl ChunkStore {
    pub fn kind(&self) -> StoreKind {
        match self {
            ChunkStore::File(_) => StoreKind::FileStore,
            ChunkStore::Sim(_) => StoreKind::SimStore,
        }
    }

    pub fn get_info(&self) -> StoreInfo { delegate!(self, s => s.get_info()) }

    pub fn set_info(&self, info: StoreInfo) { delegate!(self, s => s.set_info(info)) }

    pub fn driver_name(&self) -> &'static str { delegate!(self, s => s.driver_name()) }

    pub fn config_info(&self) -> Result<String> {
        match self {
            ChunkStore::File(s) => s.config_info(),
            ChunkStore::Sim(s) => Ok(s.config_info()),
        }
    }

    pub fn runtime_info(&self) -> String { delegate!(self, s => s.runtime_info()) }

    pub fn io_mode(&self) -> IoMode { delegate!(self, s => s.io_mode()) }

    pub fn is_support_mem_persist(&self) -> bool { delegate!(self, s => s.is_support_mem_persist()) }

    pub fn is_mounted(&self) -> bool { delegate!(self, s => s.is_mounted()) }

    pub fn open_chunks(&self) -> usize { delegate!(self, s => s.open_chunks()) }

    pub fn dev_check(&self) -> DevStatus { delegate!(self, s => s.dev_check()) }

    pub fn dev_format(&self) -> Result<()> { delegate!(self, s => s.dev_format()) }

    pub fn dev_mount(&self) -> Result<()> { delegate!(self, s => s.dev_mount()) }

    pub fn dev_unmount(&self) -> Result<()> { delegate!(self, s => s.dev_unmount()) }

    pub fn chunk_exist(&self, chunk_id: ChunkId) -> Result<bool> {
        delegate!(self, s => s.chunk_exist(chunk_id))
    }

    pub fn chunk_create(&self, chunk_id: ChunkId, opts: &ChunkCreateOpts) -> Result<()> {
        delegate!(self, s => s.chunk_create(chunk_id, opts))
    }

    pub fn chunk_remove(&self, chunk_id: ChunkId) -> Result<()> {
        delegate!(self, s => s.chunk_remove(chunk_id))
    }

    pub fn chunk_open(&self, chunk_id: ChunkId) -> Result<ChunkHandle> {
        match self {
            ChunkStore::File(s) => s.chunk_open(chunk_id).map(ChunkHandle::File),
            ChunkStore::Sim(s) => s.chunk_open(chunk_id).map(ChunkHandle::Sim),
        }
    }

    /// Give back a handle from [ChunkStore::chunk_open]. A handle opened by
    /// the other backend is refused.
    pub fn chunk_close(&self, handle: ChunkHandle) -> Result<()> {
        match (self, handle) {
            (ChunkStore::File(s), ChunkHandle::File(c)) => s.chunk_close(&c),
            (ChunkStore::Sim(s), ChunkHandle::Sim(c)) => s.chunk_close(c),
            (store, handle) => {
                warn!(chunk_id = handle.chunk_id(), "chunk closed through the wrong store");
                ForeignHandleSnafu {
                    chunk_id: handle.chunk_id(),
                    owner:    handle.driver_name(),
                    driver:   store.driver_name(),
                }
                .fail()
            }
        }
    }
}

/// An open chunk of either backend.
#[derive(Debug, Clone)]
pub enum ChunkHandle {
    File(ChunkRef),
    Sim(SimChunkRef),
}

macro_rules! delegate_chunk {
    ($self:ident, $c:ident => $e:expr) => {
        match $self {
            ChunkHandle::File($c) => $e,
            ChunkHandle::Sim($c) => $e,
        }
    };
}

impl ChunkHandle {
    pub fn chunk_id(&self) -> ChunkId { delegate_chunk!(self, c => c.chunk_id()) }

    /// Driver name of the store that opened this handle.
    pub fn driver_name(&self) -> &'static str {
        match self {
            ChunkHandle::File(_) => filestore::FILESTORE_DRIVER,
            ChunkHandle::Sim(_) => simstore::SIMSTORE_DRIVER,
        }
    }

    pub fn info(&self) -> ChunkInfo { delegate_chunk!(self, c => c.info()) }

    pub fn size(&self) -> u64 { delegate_chunk!(self, c => c.size()) }

    pub fn used(&self) -> u64 { delegate_chunk!(self, c => c.used()) }

    pub fn stat(&self) -> u32 { delegate_chunk!(self, c => c.stat()) }

    pub fn vol_id(&self) -> u64 { delegate_chunk!(self, c => c.vol_id()) }

    pub fn vol_index(&self) -> u32 { delegate_chunk!(self, c => c.vol_index()) }

    pub fn spolicy(&self) -> u32 { delegate_chunk!(self, c => c.spolicy()) }

    pub fn is_preallocated(&self) -> bool { delegate_chunk!(self, c => c.is_preallocated()) }

    pub fn io_mode(&self) -> IoMode { delegate_chunk!(self, c => c.io_mode()) }

    pub fn read_sync(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        delegate_chunk!(self, c => c.read_sync(buf, offset))
    }

    pub fn write_sync(&self, data: &[u8], offset: u64) -> Result<()> {
        delegate_chunk!(self, c => c.write_sync(data, offset))
    }

    pub fn read_async(&self, offset: u64, length: u64, cb: ReadCallback) -> Result<()> {
        delegate_chunk!(self, c => c.read_async(offset, length, cb))
    }

    pub fn write_async(&self, data: Bytes, offset: u64, cb: WriteCallback) -> Result<()> {
        delegate_chunk!(self, c => c.write_async(data, offset, cb))
    }

    /// Read in the I/O mode of the store the chunk belongs to.
    pub fn read_chunk(&self, offset: u64, length: u64, cb: ReadCallback) -> Result<()> {
        delegate_chunk!(self, c => c.read_chunk(offset, length, cb))
    }

    pub fn write_chunk(&self, data: Bytes, offset: u64, cb: WriteCallback) -> Result<()> {
        delegate_chunk!(self, c => c.write_chunk(data, offset, cb))
    }

    pub fn get_xattr(&self, name: &str) -> Result<String> {
        delegate_chunk!(self, c => c.get_xattr(name))
    }

    pub fn set_xattr(&self, name: &str, value: &str) -> Result<()> {
        delegate_chunk!(self, c => c.set_xattr(name, value))
    }

    pub fn remove_xattr(&self, name: &str) -> Result<()> {
        delegate_chunk!(self, c => c.remove_xattr(name))
    }

    pub fn xattr_count(&self) -> usize { delegate_chunk!(self, c => c.xattr_count()) }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crossbeam::channel;
    use tsumiki_common::CONFIG_FILE;
    use tsumiki_utils::{
        logger::install_fmt_log,
        readable_size::{SizeUnit, UnitSize},
    };

    use super::*;
    use crate::{config::FileStoreConfig, err::ErrorKind};

    fn ctx() -> StoreContext { StoreContext::new("flame", "node-1") }

    #[test]
    fn scheme_is_case_insensitive() {
        assert_eq!(StoreKind::from_str("FileStore").unwrap(), StoreKind::FileStore);
        assert_eq!(StoreKind::from_str("SIMSTORE").unwrap(), StoreKind::SimStore);
        assert_eq!(StoreKind::SimStore.to_string(), "simstore");

        let store = open_store(ctx(), "SimStore://4G").unwrap();
        assert_eq!(store.kind(), StoreKind::SimStore);
        assert_eq!(store.driver_name(), "SimStore");
        let store = open_store(ctx(), "filestore:///nowhere/config").unwrap();
        assert_eq!(store.kind(), StoreKind::FileStore);
        assert_eq!(store.driver_name(), "FileStore");
    }

    #[test]
    fn bad_urls() {
        for url in ["", "simstore", "simstore:/4G", "://4G", "simstore://"] {
            let err = open_store(ctx(), url).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Config, "{url}");
        }
        assert!(matches!(
            open_store(ctx(), "blobstore://x"),
            Err(crate::err::Error::UnknownDriver { .. })
        ));
        assert!(matches!(
            open_store(ctx(), "simstore://4K"),
            Err(crate::err::Error::InvalidUrl { .. })
        ));
    }

    fn exercise(store: &ChunkStore) {
        assert_eq!(store.dev_check(), DevStatus::ClusterIn);
        store.dev_format().unwrap();
        store.dev_mount().unwrap();
        assert!(store.is_mounted());
        assert!(!store.is_support_mem_persist());

        let opts = ChunkCreateOpts::default().with_size(1 << 16);
        store.chunk_create(1, &opts).unwrap();
        assert!(store.chunk_exist(1).unwrap());
        let chunk = store.chunk_open(1).unwrap();
        assert_eq!(chunk.chunk_id(), 1);
        assert_eq!(chunk.size(), 1 << 16);
        assert_eq!(chunk.info().size, 1 << 16);
        assert_eq!(store.open_chunks(), 1);

        chunk.set_xattr("k", "v").unwrap();
        assert_eq!(chunk.get_xattr("k").unwrap(), "v");
        assert_eq!(chunk.xattr_count(), 1);
        chunk.remove_xattr("k").unwrap();

        let (tx, rx) = channel::unbounded();
        let done = tx.clone();
        chunk
            .write_chunk(
                Bytes::from_static(b"tsumiki"),
                100,
                Box::new(move |r| done.send(r.map(|_| 0)).unwrap()),
            )
            .unwrap();
        let written = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(written.unwrap(), 0);
        chunk
            .read_chunk(
                100,
                7,
                Box::new(move |r| tx.send(r.map(|b| b.len())).unwrap()),
            )
            .unwrap();
        let read = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(read.unwrap(), 7);

        store.chunk_close(chunk).unwrap();
        store.chunk_remove(1).unwrap();
        assert_eq!(store.get_info().chunk_count, 0);
        assert!(!store.runtime_info().is_empty());
        assert!(store.config_info().is_ok());
        store.dev_unmount().unwrap();
        assert!(!store.is_mounted());
    }

    #[test]
    fn both_backends_behave_alike() {
        install_fmt_log();
        let dir = tempfile::tempdir().unwrap();
        FileStoreConfig::new(dir.path().join(CONFIG_FILE), dir.path())
            .with_size(UnitSize::new(16, SizeUnit::Mega))
            .with_block_size_shift(12)
            .store()
            .unwrap();
        let url = format!("filestore://{}", dir.path().join(CONFIG_FILE).display());
        let file = open_store(ctx(), &url).unwrap();
        exercise(&file);
        assert_eq!(file.io_mode(), IoMode::Sync);

        let sim = open_store(ctx(), "simstore://1G").unwrap();
        exercise(&sim);
        assert_eq!(sim.io_mode(), IoMode::Async);
    }

    #[test]
    fn close_through_the_wrong_backend() {
        install_fmt_log();
        let dir = tempfile::tempdir().unwrap();
        FileStoreConfig::new(dir.path().join(CONFIG_FILE), dir.path())
            .with_size(UnitSize::new(16, SizeUnit::Mega))
            .with_block_size_shift(12)
            .store()
            .unwrap();
        let url = format!("filestore://{}", dir.path().join(CONFIG_FILE).display());
        let file = open_store(ctx(), &url).unwrap();
        let sim = open_store(ctx(), "simstore://1G").unwrap();
        for store in [&file, &sim] {
            store.dev_format().unwrap();
            store.dev_mount().unwrap();
            store
                .chunk_create(7, &ChunkCreateOpts::default().with_size(1 << 14))
                .unwrap();
        }

        let handle = file.chunk_open(7).unwrap();
        assert_eq!(handle.driver_name(), "FileStore");
        let err = sim.chunk_close(handle.clone()).unwrap_err();
        assert!(matches!(err, crate::err::Error::ForeignHandle { chunk_id: 7, .. }));
        assert_eq!(err.kind(), ErrorKind::State);
        // the refused close left the reference in place
        file.chunk_close(handle).unwrap();
        file.chunk_remove(7).unwrap();

        let handle = sim.chunk_open(7).unwrap();
        assert_eq!(handle.driver_name(), "SimStore");
        let err = file.chunk_close(handle).unwrap_err();
        assert!(matches!(err, crate::err::Error::ForeignHandle { .. }));

        for store in [&file, &sim] {
            store.dev_unmount().unwrap();
        }
    }
}
