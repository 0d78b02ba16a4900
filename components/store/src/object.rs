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

use std::{
    fs::{File, OpenOptions},
    os::unix::fs::{FileExt, OpenOptionsExt},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use crossbeam::atomic::AtomicCell;
use rustix::fs::FallocateFlags;
use snafu::ResultExt;
use tracing::{debug, error};
use tsumiki_common::{ChunkId, ObjectIndex};
use tsumiki_utils::time::now_secs;

use crate::err::{IoSnafu, Result, StoreOp};

const OBJECT_FILE_MODE: u32 = 0o660;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectState {
    Loading,
    Opened,
    Closed,
}

pub type ObjectRef = Arc<Object>;

/// [Object] is one fixed size slice of a chunk, backed by one file. It is
/// owned by the chunk that opened it and never shared with another chunk.
#[derive(Debug)]
pub struct Object {
    chunk_id:      ChunkId,
    index:         ObjectIndex,
    path:          PathBuf,
    file:          File,
    direct:        bool,
    state:         AtomicCell<ObjectState>,
    open_time:     u64,
    access_time:   AtomicU64,
    read_counter:  AtomicU64,
    write_counter: AtomicU64,
}

impl Object {
    /// Open the object file, creating it if the chunk is thin provisioned
    /// and this object has never been written.
    pub(crate) fn open(
        chunk_id: ChunkId,
        index: ObjectIndex,
        path: PathBuf,
        direct: bool,
    ) -> Result<Object> {
        let state = AtomicCell::new(ObjectState::Loading);
        let mut options = OpenOptions::new();
        options
            .read(true)
            .write(true)
            .create(true)
            .mode(OBJECT_FILE_MODE);
        if direct {
            options.custom_flags(libc::O_DIRECT);
        }
        let file = options.open(&path).map_err(|e| {
            error!(chunk_id, index, ?path, "open object failed: {e}");
            e
        });
        let file = file.context(IoSnafu {
            op:   StoreOp::ChunkOpen,
            path: path.clone(),
        })?;
        state.store(ObjectState::Opened);

        let now = now_secs();
        debug!(chunk_id, index, direct, "object opened");
        Ok(Object {
            chunk_id,
            index,
            path,
            file,
            direct,
            state,
            open_time: now,
            access_time: AtomicU64::new(now),
            read_counter: AtomicU64::new(0),
            write_counter: AtomicU64::new(0),
        })
    }

    /// Create a new object file of exactly `size` bytes with its blocks
    /// reserved. Fails if the file is already there.
    pub(crate) fn create_preallocated(path: &Path, size: u64) -> Result<()> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(OBJECT_FILE_MODE)
            .open(path)
            .context(IoSnafu {
                op: StoreOp::ChunkCreate,
                path,
            })?;
        rustix::fs::fallocate(&file, FallocateFlags::empty(), 0, size)
            .map_err(std::io::Error::from)
            .context(IoSnafu {
                op: StoreOp::ChunkCreate,
                path,
            })?;
        Ok(())
    }

    /// One positioned read. The returned count may be short.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
        self.file.read_at(buf, offset)
    }

    /// One positioned write. The returned count may be short.
    pub fn write_at(&self, buf: &[u8], offset: u64) -> std::io::Result<usize> {
        self.file.write_at(buf, offset)
    }

    pub(crate) fn record_read(&self) {
        self.read_counter.fetch_add(1, Ordering::Relaxed);
        self.update_access_time();
    }

    pub(crate) fn record_write(&self) {
        self.write_counter.fetch_add(1, Ordering::Relaxed);
        self.update_access_time();
    }

    pub fn update_access_time(&self) { self.access_time.store(now_secs(), Ordering::Relaxed); }

    pub(crate) fn close(&self) {
        if self.state.swap(ObjectState::Closed) == ObjectState::Opened {
            debug!(chunk_id = self.chunk_id, index = self.index, "object closed");
        }
    }

    pub fn is_open(&self) -> bool { self.state.load() == ObjectState::Opened }

    pub fn state(&self) -> ObjectState { self.state.load() }

    pub fn index(&self) -> ObjectIndex { self.index }

    pub fn path(&self) -> &Path { &self.path }

    pub fn is_direct(&self) -> bool { self.direct }

    pub fn open_time(&self) -> u64 { self.open_time }

    pub fn access_time(&self) -> u64 { self.access_time.load(Ordering::Relaxed) }

    pub fn read_counter(&self) -> u64 { self.read_counter.load(Ordering::Relaxed) }

    pub fn write_counter(&self) -> u64 { self.write_counter.load(Ordering::Relaxed) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_io_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0");
        let obj = Object::open(1, 0, path.clone(), false).unwrap();
        assert!(obj.is_open());
        assert!(path.exists());

        assert_eq!(obj.write_at(b"hello", 10).unwrap(), 5);
        obj.record_write();
        let mut buf = [0u8; 5];
        assert_eq!(obj.read_at(&mut buf, 10).unwrap(), 5);
        obj.record_read();
        assert_eq!(&buf, b"hello");
        assert_eq!(obj.read_counter(), 1);
        assert_eq!(obj.write_counter(), 1);
        assert!(obj.access_time() >= obj.open_time());

        // reading past the end comes back short
        assert_eq!(obj.read_at(&mut buf, 13).unwrap(), 2);

        obj.close();
        assert_eq!(obj.state(), ObjectState::Closed);
    }

    #[test]
    fn preallocate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("1");
        Object::create_preallocated(&path, 64 << 10).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 64 << 10);
        assert!(Object::create_preallocated(&path, 64 << 10).is_err());
    }
}
