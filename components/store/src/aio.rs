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

//! Per chunk asynchronous I/O context.
//!
//! Sub requests run on the blocking pool of the store's io runtime. A
//! finished sub request is queued on its chunk's [IoContext] and counted on
//! the context's [Notifier], which wakes the reactor through the shared
//! readiness channel. The reactor, or a closing chunk, drains the queue and
//! completes the logical [AsyncRequest]s.

use std::{
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::Bytes;
use crossbeam::{channel::Sender, queue::SegQueue};
use parking_lot::{Condvar, Mutex};
use snafu::IntoError;
use tokio::runtime::Handle;
use tracing::{debug, error, trace};
use tsumiki_common::{ChunkId, DIRECT_IO_ALIGN};
use tsumiki_utils::align::{is_aligned, AlignedBuf};

use crate::{
    err::{AsyncSubmitSnafu, Error, IoSnafu, Result, ShortTransferSnafu, StoreOp},
    object::ObjectRef,
    split::IoPiece,
};

pub type ReadCallback = Box<dyn FnOnce(Result<Bytes>) + Send + 'static>;
pub type WriteCallback = Box<dyn FnOnce(Result<()>) + Send + 'static>;

enum Callback {
    Read(ReadCallback),
    Write(WriteCallback),
}

/// One continuation record per logical read or write, shared by all of its
/// sub requests. The callback fires exactly once, after the last sub request
/// has been drained.
pub(crate) struct AsyncRequest {
    chunk_id:    ChunkId,
    op:          StoreOp,
    remaining:   AtomicUsize,
    first_error: Mutex<Option<Error>>,
    buf:         Mutex<Vec<u8>>,
    callback:    Mutex<Option<Callback>>,
}

impl AsyncRequest {
    pub(crate) fn read(chunk_id: ChunkId, length: usize, cb: ReadCallback) -> Arc<Self> {
        Arc::new(AsyncRequest {
            chunk_id,
            op: StoreOp::ChunkRead,
            remaining: AtomicUsize::new(0),
            first_error: Mutex::new(None),
            buf: Mutex::new(vec![0u8; length]),
            callback: Mutex::new(Some(Callback::Read(cb))),
        })
    }

    pub(crate) fn write(chunk_id: ChunkId, cb: WriteCallback) -> Arc<Self> {
        Arc::new(AsyncRequest {
            chunk_id,
            op: StoreOp::ChunkWrite,
            remaining: AtomicUsize::new(0),
            first_error: Mutex::new(None),
            buf: Mutex::new(Vec::new()),
            callback: Mutex::new(Some(Callback::Write(cb))),
        })
    }

    fn record_error(&self, err: Error) {
        let mut slot = self.first_error.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    fn sub_done(&self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.finish();
        }
    }

    /// Hand the outcome to the caller. Only the first call does anything.
    pub(crate) fn finish(&self) {
        let Some(callback) = self.callback.lock().take() else {
            return;
        };
        let err = self.first_error.lock().take();
        trace!(chunk_id = self.chunk_id, op = %self.op, ok = err.is_none(), "request done");
        match callback {
            Callback::Read(cb) => match err {
                Some(e) => cb(Err(e)),
                None => {
                    let buf = std::mem::take(&mut *self.buf.lock());
                    cb(Ok(Bytes::from(buf)))
                }
            },
            Callback::Write(cb) => match err {
                Some(e) => cb(Err(e)),
                None => cb(Ok(())),
            },
        }
    }
}

enum IoBuf {
    Plain(Vec<u8>),
    Aligned(AlignedBuf),
}

impl IoBuf {
    fn zeroed(len: usize, direct: bool) -> Self {
        if direct {
            IoBuf::Aligned(AlignedBuf::zeroed(len, DIRECT_IO_ALIGN))
        } else {
            IoBuf::Plain(vec![0u8; len])
        }
    }

    fn as_slice(&self) -> &[u8] {
        match self {
            IoBuf::Plain(v) => v,
            IoBuf::Aligned(a) => a.as_slice(),
        }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            IoBuf::Plain(v) => v,
            IoBuf::Aligned(a) => a.as_mut_slice(),
        }
    }
}

/// One per object piece of an [AsyncRequest].
pub(crate) struct SubIo {
    pub(crate) request: Arc<AsyncRequest>,
    /// [seq] is the position of this piece within its request.
    pub(crate) seq:     usize,
    pub(crate) piece:   IoPiece,
    pub(crate) object:  ObjectRef,
    /// [payload] is the data to write, `None` for reads.
    pub(crate) payload: Option<Bytes>,
}

struct Completion {
    sub:    SubIo,
    result: std::io::Result<usize>,
    data:   Option<IoBuf>,
}

impl SubIo {
    fn run(self) -> Completion {
        let direct = self.object.is_direct();
        match &self.payload {
            None => {
                let mut buf = IoBuf::zeroed(self.piece.length as usize, direct);
                let result = self.object.read_at(buf.as_mut_slice(), self.piece.offset);
                Completion {
                    sub: self,
                    result,
                    data: Some(buf),
                }
            }
            Some(payload) => {
                let result = if direct {
                    let buf = AlignedBuf::copy_from(payload, DIRECT_IO_ALIGN);
                    self.object.write_at(buf.as_slice(), self.piece.offset)
                } else {
                    self.object.write_at(payload, self.piece.offset)
                };
                Completion {
                    sub: self,
                    result,
                    data: None,
                }
            }
        }
    }
}

impl Completion {
    fn process(self) {
        let Completion { sub, result, data } = self;
        let request = &sub.request;
        match result {
            Ok(n) if n as u64 == sub.piece.length => {
                if let Some(data) = data {
                    let start = sub.piece.buf_offset as usize;
                    let mut buf = request.buf.lock();
                    buf[start..start + n].copy_from_slice(&data.as_slice()[..n]);
                }
            }
            Ok(n) => {
                request.record_error(
                    ShortTransferSnafu {
                        op:       request.op,
                        chunk_id: request.chunk_id,
                        request:  sub.seq,
                        object:   sub.piece.object,
                        expected: sub.piece.length,
                        actual:   n as u64,
                    }
                    .build(),
                );
            }
            Err(e) => {
                error!(
                    chunk_id = request.chunk_id,
                    object = sub.piece.object,
                    "asynchronous {} failed: {e}",
                    request.op
                );
                request.record_error(
                    IoSnafu {
                        op:   request.op,
                        path: sub.object.path().to_path_buf(),
                    }
                    .into_error(e),
                );
            }
        }
        sub.request.sub_done();
    }
}

/// Counts completions not yet drained and raises one readiness event per
/// transition from zero.
pub(crate) struct Notifier {
    chunk_id: ChunkId,
    pending:  AtomicU64,
    ready_tx: Sender<ChunkId>,
}

impl Notifier {
    fn signal(&self) {
        if self.pending.fetch_add(1, Ordering::AcqRel) == 0 {
            // The reactor may already be gone while a chunk is torn down; the
            // closing thread drains by itself then.
            let _ = self.ready_tx.send(self.chunk_id);
        }
    }

    /// Read and reset the pending count.
    pub(crate) fn take(&self) -> u64 { self.pending.swap(0, Ordering::AcqRel) }
}

/// [IoContext] is the asynchronous I/O context owned by one chunk.
pub(crate) struct IoContext {
    chunk_id:    ChunkId,
    capacity:    usize,
    in_flight:   AtomicUsize,
    completions: SegQueue<Completion>,
    notifier:    Notifier,
    idle_lock:   Mutex<()>,
    idle:        Condvar,
    runtime:     Handle,
}

impl IoContext {
    pub(crate) fn new(
        chunk_id: ChunkId,
        capacity: usize,
        ready_tx: Sender<ChunkId>,
        runtime: Handle,
    ) -> Self {
        IoContext {
            chunk_id,
            capacity,
            in_flight: AtomicUsize::new(0),
            completions: SegQueue::new(),
            notifier: Notifier {
                chunk_id,
                pending: AtomicU64::new(0),
                ready_tx,
            },
            idle_lock: Mutex::new(()),
            idle: Condvar::new(),
            runtime,
        }
    }

    pub(crate) fn chunk_id(&self) -> ChunkId { self.chunk_id }

    pub(crate) fn in_flight(&self) -> usize { self.in_flight.load(Ordering::Acquire) }

    fn reserve(&self, n: usize) -> Result<()> {
        let mut cur = self.in_flight.load(Ordering::Acquire);
        loop {
            if cur + n > self.capacity {
                return AsyncSubmitSnafu {
                    chunk_id:  self.chunk_id,
                    submitted: 0usize,
                    expected:  n,
                }
                .fail();
            }
            match self.in_flight.compare_exchange_weak(
                cur,
                cur + n,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => cur = actual,
            }
        }
    }

    /// Submit all sub requests of one logical request, in order. Either all
    /// of them are queued or none is.
    pub(crate) fn submit(self: &Arc<Self>, subs: Vec<SubIo>) -> Result<()> {
        let Some(first) = subs.first() else {
            return Ok(());
        };
        let request = first.request.clone();
        self.reserve(subs.len())?;
        request.remaining.store(subs.len(), Ordering::Release);
        trace!(chunk_id = self.chunk_id, op = %request.op, n = subs.len(), "submit");
        for sub in subs {
            let ctx = self.clone();
            self.runtime.spawn_blocking(move || {
                let completion = sub.run();
                ctx.complete(completion);
            });
        }
        Ok(())
    }

    fn complete(&self, completion: Completion) {
        self.completions.push(completion);
        self.notifier.signal();
        let _guard = self.idle_lock.lock();
        self.idle.notify_all();
    }

    /// Drain up to `max` queued completions, firing finished requests'
    /// callbacks on the calling thread.
    pub(crate) fn drain(&self, max: u64) -> usize {
        let mut drained = 0;
        for _ in 0..max {
            let Some(completion) = self.completions.pop() else {
                break;
            };
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            completion.process();
            drained += 1;
        }
        if drained > 0 {
            let _guard = self.idle_lock.lock();
            self.idle.notify_all();
        }
        drained
    }

    /// What the reactor does on a readiness event for this chunk.
    pub(crate) fn on_ready(&self) -> usize {
        let pending = self.notifier.take();
        self.drain(pending)
    }

    /// Wait until nothing is in flight, draining completions on the calling
    /// thread so that this works from inside a callback as well.
    pub(crate) fn quiesce(&self) {
        loop {
            self.on_ready();
            if self.in_flight() == 0 {
                break;
            }
            let mut guard = self.idle_lock.lock();
            if self.in_flight() > 0 && self.notifier.pending.load(Ordering::Acquire) == 0 {
                self.idle.wait_for(&mut guard, Duration::from_millis(10));
            }
        }
        debug!(chunk_id = self.chunk_id, "io context quiesced");
    }
}

/// Check a request against the direct I/O alignment rules.
pub(crate) fn check_direct_alignment(chunk_id: ChunkId, offset: u64, length: u64) -> Result<()> {
    let align = DIRECT_IO_ALIGN as u64;
    snafu::ensure!(
        is_aligned(offset, align) && is_aligned(length, align),
        crate::err::UnalignedSnafu {
            chunk_id,
            offset,
            length,
            align: DIRECT_IO_ALIGN,
        }
    );
    Ok(())
}
