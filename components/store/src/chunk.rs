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
    collections::BTreeMap,
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc,
    },
};

use bytes::Bytes;
use parking_lot::RwLock;
use snafu::{ensure, OptionExt, ResultExt};
use tracing::{debug, error, info, warn};
use tsumiki_common::{object_count, object_size, ChunkId, ObjectIndex, DEFAULT_BLOCK_SIZE_SHIFT};
use tsumiki_types::{ChunkCreateOpts, ChunkFlags, ChunkInfo, IoMode, Xattr};
use tsumiki_utils::time::now_millis;

use crate::{
    aio::{check_direct_alignment, AsyncRequest, IoContext, ReadCallback, SubIo, WriteCallback},
    descriptor::{check_xattr_len, ChunkDescriptor},
    err::{
        AlreadyClosedSnafu, ChunkNotFoundSnafu, IoSnafu, OutOfRangeSnafu, Result,
        ShortTransferSnafu, StoreOp, WrongIoModeSnafu, XattrNotFoundSnafu,
    },
    layout::{temp_path, StoreLayout},
    object::{Object, ObjectRef},
    reactor::Multiplexer,
    split::{split_range, IoPiece},
};

pub type ChunkRef = Arc<FileChunk>;

/// [ChunkEnv] is what every chunk of a mounted store shares: where the files
/// live and how I/O is dispatched.
pub(crate) struct ChunkEnv {
    pub(crate) layout:           StoreLayout,
    pub(crate) io_mode:          IoMode,
    pub(crate) direct_io:        bool,
    /// [block_size_shift] applies to chunks created under this env. Loaded
    /// chunks keep the shift stored in their descriptor.
    pub(crate) block_size_shift: u8,
    pub(crate) mux:              Option<Arc<Multiplexer>>,
}

impl ChunkEnv {
    pub(crate) fn new(layout: StoreLayout, io_mode: IoMode) -> Self {
        ChunkEnv {
            layout,
            io_mode,
            direct_io: false,
            block_size_shift: DEFAULT_BLOCK_SIZE_SHIFT,
            mux: None,
        }
    }

    /// Objects bypass the page cache only for asynchronous I/O.
    fn direct(&self) -> bool { self.io_mode.is_async() && self.direct_io }
}

/// [FileChunk] is a chunk of the file store: a descriptor file under the meta
/// directory plus a directory of object files under the data directory.
pub struct FileChunk {
    chunk_id:         ChunkId,
    vol_id:           u64,
    index:            u32,
    stat:             u32,
    spolicy:          u32,
    flags:            ChunkFlags,
    size:             u64,
    create_time:      u64,
    dst_id:           u64,
    dst_ctime:        u64,
    block_size_shift: u8,
    object_size:      u64,

    env:           Arc<ChunkEnv>,
    objects:       RwLock<BTreeMap<ObjectIndex, ObjectRef>>,
    xattrs:        RwLock<Vec<Xattr>>,
    read_counter:  AtomicU64,
    write_counter: AtomicU64,
    open_ref:      AtomicU32,
    io_ctx:        Option<Arc<IoContext>>,
}

impl std::fmt::Debug for FileChunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileChunk")
            .field("chunk_id", &self.chunk_id)
            .field("size", &self.size)
            .field("object_size", &self.object_size)
            .field("open_ref", &self.open_ref())
            .finish()
    }
}

impl FileChunk {
    fn new(env: Arc<ChunkEnv>, desc: ChunkDescriptor) -> Self {
        let xattrs = desc
            .xattrs
            .into_iter()
            .enumerate()
            .map(|(i, (name, value))| Xattr {
                index: i as u32,
                name,
                value,
            })
            .collect();
        FileChunk {
            chunk_id: desc.chunk_id,
            vol_id: desc.vol_id,
            index: desc.index as u32,
            stat: desc.stat as u32,
            spolicy: desc.spolicy as u32,
            flags: ChunkFlags::from_bits_truncate(desc.flags as u32),
            size: desc.size,
            create_time: desc.create_time,
            dst_id: desc.dst_id,
            dst_ctime: desc.dst_ctime,
            block_size_shift: desc.block_size_shift,
            object_size: object_size(desc.block_size_shift),
            env,
            objects: RwLock::new(BTreeMap::new()),
            xattrs: RwLock::new(xattrs),
            read_counter: AtomicU64::new(desc.read_counter),
            write_counter: AtomicU64::new(desc.write_counter),
            open_ref: AtomicU32::new(0),
            io_ctx: None,
        }
    }

    /// Create the chunk on disk: its data directory, every object file when
    /// the chunk is preallocated, then its descriptor. A failure removes the
    /// data directory again.
    pub(crate) fn create(
        env: Arc<ChunkEnv>,
        chunk_id: ChunkId,
        opts: &ChunkCreateOpts,
    ) -> Result<FileChunk> {
        let desc = ChunkDescriptor {
            chunk_id,
            vol_id: opts.vol_id,
            index: opts.index as u64,
            spolicy: opts.spolicy as u64,
            flags: opts.flags.bits() as u64,
            size: opts.size,
            create_time: now_millis(),
            block_size_shift: env.block_size_shift,
            ..Default::default()
        };
        let chunk = FileChunk::new(env, desc);

        let data_dir = chunk.env.layout.chunk_data_dir(chunk_id);
        fs::create_dir_all(&data_dir).context(IoSnafu {
            op:   StoreOp::ChunkCreate,
            path: data_dir.clone(),
        })?;
        let guard = scopeguard::guard(data_dir, |dir| {
            if let Err(e) = fs::remove_dir_all(&dir) {
                warn!(chunk_id, ?dir, "cannot clean up a failed create: {e}");
            }
        });

        if chunk.is_preallocated() {
            let count = object_count(chunk.size, chunk.object_size);
            for index in 0..count {
                let path = chunk.env.layout.object_path(chunk_id, index);
                Object::create_preallocated(&path, chunk.object_size).map_err(|e| {
                    error!(chunk_id, index, "preallocate object failed: {e}");
                    e
                })?;
            }
            debug!(chunk_id, objects = count, "objects preallocated");
        }

        chunk.persist()?;
        scopeguard::ScopeGuard::into_inner(guard);
        info!(
            chunk_id,
            size = chunk.size,
            prealloc = chunk.is_preallocated(),
            "chunk created"
        );
        Ok(chunk)
    }

    /// Read the chunk's descriptor back from disk. The returned chunk has no
    /// open references yet.
    pub(crate) fn load(env: Arc<ChunkEnv>, chunk_id: ChunkId) -> Result<FileChunk> {
        let path = env.layout.chunk_meta_path(chunk_id);
        ensure!(path.exists(), ChunkNotFoundSnafu { chunk_id });

        // A temp file left by an interrupted persist would block the next one.
        let temp = temp_path(&path);
        match fs::remove_file(&temp) {
            Ok(()) => warn!(chunk_id, path = ?temp, "removed a stale temp descriptor"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(chunk_id, path = ?temp, "cannot remove stale temp descriptor: {e}"),
        }

        Self::load_from(env, &path)
    }

    /// Build a chunk from the descriptor at `path`, which need not live in
    /// the store's meta directory.
    pub(crate) fn load_from(env: Arc<ChunkEnv>, path: &Path) -> Result<FileChunk> {
        let desc = ChunkDescriptor::load(path)?;
        let mut chunk = FileChunk::new(env, desc);
        if chunk.env.io_mode.is_async() {
            chunk.io_ctx = chunk
                .env
                .mux
                .as_ref()
                .and_then(|mux| mux.new_context(chunk.chunk_id));
        }
        debug!(chunk_id = chunk.chunk_id, size = chunk.size, "chunk loaded");
        Ok(chunk)
    }

    pub(crate) fn descriptor(&self) -> ChunkDescriptor {
        ChunkDescriptor {
            chunk_id:         self.chunk_id,
            vol_id:           self.vol_id,
            index:            self.index as u64,
            stat:             self.stat as u64,
            spolicy:          self.spolicy as u64,
            flags:            self.flags.bits() as u64,
            size:             self.size,
            used:             self.used(),
            create_time:      self.create_time,
            dst_id:           self.dst_id,
            dst_ctime:        self.dst_ctime,
            block_size_shift: self.block_size_shift,
            read_counter:     self.read_counter(),
            write_counter:    self.write_counter(),
            xattrs:           self
                .xattrs
                .read()
                .iter()
                .map(|x| (x.name.clone(), x.value.clone()))
                .collect(),
        }
    }

    /// Atomically replace the on-disk descriptor with the current state.
    pub fn persist(&self) -> Result<()> {
        let path = self.env.layout.chunk_meta_path(self.chunk_id);
        self.descriptor().store(&path)
    }

    /// Join the store's multiplexer. Only the instance that made it into the
    /// chunk map does this.
    pub(crate) fn attach_io(&self) {
        if let (Some(ctx), Some(mux)) = (&self.io_ctx, &self.env.mux) {
            mux.register(ctx.clone());
        }
    }

    /// Wait out in-flight I/O, persist the descriptor and close every object.
    /// Run by whoever drops the last open reference.
    pub(crate) fn teardown(&self) -> Result<()> {
        if let Some(ctx) = &self.io_ctx {
            ctx.quiesce();
            if let Some(mux) = &self.env.mux {
                mux.deregister(self.chunk_id);
            }
        }
        let persisted = self.persist();
        if let Err(e) = &persisted {
            error!(chunk_id = self.chunk_id, "persist on close failed: {e}");
        }
        self.close_objects();
        debug!(chunk_id = self.chunk_id, "chunk torn down");
        persisted
    }

    fn close_objects(&self) {
        let objects = std::mem::take(&mut *self.objects.write());
        for obj in objects.values() {
            obj.close();
        }
    }

    // Reference counting

    pub(crate) fn ref_add(&self) -> u32 { self.open_ref.fetch_add(1, Ordering::AcqRel) + 1 }

    /// Take another reference unless the chunk is already being closed.
    pub(crate) fn try_acquire(&self) -> bool {
        let mut cur = self.open_ref.load(Ordering::Acquire);
        loop {
            if cur == 0 {
                return false;
            }
            match self.open_ref.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Drop one reference. Returns true for the caller that took the count
    /// to zero; that caller owns the teardown.
    pub(crate) fn release(&self) -> Result<bool> {
        let mut cur = self.open_ref.load(Ordering::Acquire);
        loop {
            ensure!(cur > 0, AlreadyClosedSnafu { chunk_id: self.chunk_id });
            match self.open_ref.compare_exchange_weak(
                cur,
                cur - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(cur == 1),
                Err(actual) => cur = actual,
            }
        }
    }

    pub fn open_ref(&self) -> u32 { self.open_ref.load(Ordering::Acquire) }

    // Objects

    fn object(&self, index: ObjectIndex) -> Result<ObjectRef> {
        if let Some(obj) = self.objects.read().get(&index) {
            return Ok(obj.clone());
        }
        let path = self.env.layout.object_path(self.chunk_id, index);
        let opened = Arc::new(Object::open(
            self.chunk_id,
            index,
            path,
            self.env.direct(),
        )?);
        let mut objects = self.objects.write();
        // Somebody else may have opened it while we did; keep theirs.
        Ok(objects.entry(index).or_insert(opened).clone())
    }

    pub fn open_objects(&self) -> usize { self.objects.read().len() }

    fn check_range(&self, offset: u64, length: u64) -> Result<()> {
        let end = offset.checked_add(length);
        ensure!(
            end.is_some_and(|end| end <= self.size),
            OutOfRangeSnafu {
                chunk_id: self.chunk_id,
                offset,
                length,
                size: self.size,
            }
        );
        Ok(())
    }

    /// The non empty pieces of a range, each paired with its position among
    /// all pieces of the split.
    fn pieces(&self, offset: u64, length: u64) -> Vec<(usize, IoPiece)> {
        split_range(offset, length, self.object_size)
            .into_iter()
            .enumerate()
            .filter(|(_, p)| p.length > 0)
            .collect()
    }

    fn object_path(&self, index: ObjectIndex) -> PathBuf {
        self.env.layout.object_path(self.chunk_id, index)
    }

    // Synchronous I/O

    /// Fill `buf` from the chunk at `offset`, one positioned read per object
    /// in index order.
    pub fn read_sync(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        let length = buf.len() as u64;
        self.check_range(offset, length)?;
        for (seq, piece) in self.pieces(offset, length) {
            let obj = self.object(piece.object)?;
            obj.record_read();
            self.read_counter.fetch_add(1, Ordering::Relaxed);

            let start = piece.buf_offset as usize;
            let dst = &mut buf[start..start + piece.length as usize];
            let n = obj.read_at(dst, piece.offset).context(IoSnafu {
                op:   StoreOp::ChunkRead,
                path: self.object_path(piece.object),
            })?;
            ensure!(
                n as u64 == piece.length,
                ShortTransferSnafu {
                    op:       StoreOp::ChunkRead,
                    chunk_id: self.chunk_id,
                    request:  seq,
                    object:   piece.object,
                    expected: piece.length,
                    actual:   n as u64,
                }
            );
        }
        Ok(())
    }

    pub fn write_sync(&self, data: &[u8], offset: u64) -> Result<()> {
        let length = data.len() as u64;
        self.check_range(offset, length)?;
        for (seq, piece) in self.pieces(offset, length) {
            let obj = self.object(piece.object)?;
            obj.record_write();
            self.write_counter.fetch_add(1, Ordering::Relaxed);

            let start = piece.buf_offset as usize;
            let src = &data[start..start + piece.length as usize];
            let n = obj.write_at(src, piece.offset).context(IoSnafu {
                op:   StoreOp::ChunkWrite,
                path: self.object_path(piece.object),
            })?;
            ensure!(
                n as u64 == piece.length,
                ShortTransferSnafu {
                    op:       StoreOp::ChunkWrite,
                    chunk_id: self.chunk_id,
                    request:  seq,
                    object:   piece.object,
                    expected: piece.length,
                    actual:   n as u64,
                }
            );
        }
        Ok(())
    }

    // Asynchronous I/O

    fn async_ctx(&self) -> Result<&Arc<IoContext>> {
        self.io_ctx.as_ref().context(WrongIoModeSnafu {
            chunk_id: self.chunk_id,
            mode:     self.env.io_mode,
        })
    }

    fn check_async(&self, offset: u64, length: u64) -> Result<&Arc<IoContext>> {
        let ctx = self.async_ctx()?;
        self.check_range(offset, length)?;
        if self.env.direct() {
            check_direct_alignment(self.chunk_id, offset, length)?;
        }
        Ok(ctx)
    }

    /// Submit a read of `length` bytes at `offset`. `cb` receives the bytes on
    /// the reactor thread once every piece has completed.
    ///
    /// An error returned here means nothing was submitted and `cb` is dropped
    /// without being called.
    pub fn read_async(&self, offset: u64, length: u64, cb: ReadCallback) -> Result<()> {
        let ctx = self.check_async(offset, length)?;
        let pieces = self.pieces(offset, length);
        if pieces.is_empty() {
            cb(Ok(Bytes::new()));
            return Ok(());
        }
        let request = AsyncRequest::read(self.chunk_id, length as usize, cb);
        let mut subs = Vec::with_capacity(pieces.len());
        for (seq, piece) in pieces {
            let obj = self.object(piece.object)?;
            obj.record_read();
            self.read_counter.fetch_add(1, Ordering::Relaxed);
            subs.push(SubIo {
                request: request.clone(),
                seq,
                piece,
                object: obj,
                payload: None,
            });
        }
        ctx.submit(subs)
    }

    pub fn write_async(&self, data: Bytes, offset: u64, cb: WriteCallback) -> Result<()> {
        let ctx = self.check_async(offset, data.len() as u64)?;
        let pieces = self.pieces(offset, data.len() as u64);
        if pieces.is_empty() {
            cb(Ok(()));
            return Ok(());
        }
        let request = AsyncRequest::write(self.chunk_id, cb);
        let mut subs = Vec::with_capacity(pieces.len());
        for (seq, piece) in pieces {
            let obj = self.object(piece.object)?;
            obj.record_write();
            self.write_counter.fetch_add(1, Ordering::Relaxed);
            let start = piece.buf_offset as usize;
            subs.push(SubIo {
                request: request.clone(),
                seq,
                piece,
                object: obj,
                payload: Some(data.slice(start..start + piece.length as usize)),
            });
        }
        ctx.submit(subs)
    }

    // Mode dispatch

    /// Read in whatever mode the store runs. In sync mode `cb` runs before
    /// this returns, on the calling thread.
    pub fn read_chunk(&self, offset: u64, length: u64, cb: ReadCallback) -> Result<()> {
        match self.env.io_mode {
            IoMode::Async => self.read_async(offset, length, cb),
            IoMode::Sync => {
                self.check_range(offset, length)?;
                let mut buf = vec![0u8; length as usize];
                cb(self.read_sync(&mut buf, offset).map(|_| Bytes::from(buf)));
                Ok(())
            }
        }
    }

    pub fn write_chunk(&self, data: Bytes, offset: u64, cb: WriteCallback) -> Result<()> {
        match self.env.io_mode {
            IoMode::Async => self.write_async(data, offset, cb),
            IoMode::Sync => {
                self.check_range(offset, data.len() as u64)?;
                cb(self.write_sync(&data, offset));
                Ok(())
            }
        }
    }

    // Extended attributes

    pub fn get_xattr(&self, name: &str) -> Result<String> {
        self.xattrs
            .read()
            .iter()
            .find(|x| x.name == name)
            .map(|x| x.value.clone())
            .context(XattrNotFoundSnafu {
                chunk_id: self.chunk_id,
                name,
            })
    }

    /// Update `name` in place, or append it after the last attribute.
    pub fn set_xattr(&self, name: &str, value: &str) -> Result<()> {
        check_xattr_len(self.chunk_id, name, value)?;
        let mut xattrs = self.xattrs.write();
        if let Some(x) = xattrs.iter_mut().find(|x| x.name == name) {
            x.value = value.to_string();
            return Ok(());
        }
        let index = xattrs.iter().map(|x| x.index + 1).max().unwrap_or(0);
        xattrs.push(Xattr {
            index,
            name: name.to_string(),
            value: value.to_string(),
        });
        Ok(())
    }

    pub fn remove_xattr(&self, name: &str) -> Result<()> {
        let mut xattrs = self.xattrs.write();
        let pos = xattrs
            .iter()
            .position(|x| x.name == name)
            .context(XattrNotFoundSnafu {
                chunk_id: self.chunk_id,
                name,
            })?;
        xattrs.remove(pos);
        Ok(())
    }

    pub fn xattrs(&self) -> Vec<Xattr> { self.xattrs.read().clone() }

    pub fn xattr_count(&self) -> usize { self.xattrs.read().len() }

    // Accessors

    pub fn chunk_id(&self) -> ChunkId { self.chunk_id }

    pub fn size(&self) -> u64 { self.size }

    /// Preallocated chunks occupy their whole size from the start; thin
    /// chunks report nothing.
    pub fn used(&self) -> u64 {
        if self.is_preallocated() {
            self.size
        } else {
            0
        }
    }

    pub fn stat(&self) -> u32 { self.stat }

    pub fn vol_id(&self) -> u64 { self.vol_id }

    pub fn vol_index(&self) -> u32 { self.index }

    pub fn spolicy(&self) -> u32 { self.spolicy }

    pub fn is_preallocated(&self) -> bool { self.flags.contains(ChunkFlags::PREALLOC) }

    pub fn object_size(&self) -> u64 { self.object_size }

    pub fn create_time(&self) -> u64 { self.create_time }

    pub fn read_counter(&self) -> u64 { self.read_counter.load(Ordering::Relaxed) }

    pub fn write_counter(&self) -> u64 { self.write_counter.load(Ordering::Relaxed) }

    pub fn io_mode(&self) -> IoMode { self.env.io_mode }

    pub fn info(&self) -> ChunkInfo {
        ChunkInfo {
            chk_id:    self.chunk_id,
            vol_id:    self.vol_id,
            index:     self.index,
            stat:      self.stat,
            spolicy:   self.spolicy,
            flags:     self.flags,
            size:      self.size,
            used:      self.used(),
            ctime:     self.create_time,
            dst_id:    self.dst_id,
            dst_ctime: self.dst_ctime,
        }
    }
}
