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

use std::{collections::HashMap, sync::Arc, thread::JoinHandle};

use crossbeam::channel::{self, select, Receiver, Sender};
use parking_lot::RwLock;
use snafu::ResultExt;
use tokio::runtime::Runtime;
use tracing::{debug, info, trace, warn};
use tsumiki_common::ChunkId;
use tsumiki_utils::runtime::build_io_runtime;

use crate::{
    aio::IoContext,
    err::{IoRuntimeSnafu, ReactorPanickedSnafu, ReactorSpawnSnafu, Result},
};

const REACTOR_THREAD_NAME: &str = "tsumiki-reactor";

/// [Multiplexer] joins the readiness notifications of every open chunk's
/// [IoContext] into one channel, and owns the runtime whose blocking pool
/// runs the object I/O.
pub(crate) struct Multiplexer {
    registry: RwLock<HashMap<ChunkId, Arc<IoContext>>>,
    ready_tx: Sender<ChunkId>,
    ready_rx: Receiver<ChunkId>,
    io_depth: usize,
    runtime:  Option<Runtime>,
}

impl Multiplexer {
    pub(crate) fn new(io_depth: usize) -> Result<Arc<Multiplexer>> {
        let runtime = build_io_runtime("tsumiki-io", io_depth).context(IoRuntimeSnafu)?;
        let (ready_tx, ready_rx) = channel::unbounded();
        Ok(Arc::new(Multiplexer {
            registry: RwLock::new(HashMap::new()),
            ready_tx,
            ready_rx,
            io_depth,
            runtime: Some(runtime),
        }))
    }

    /// A fresh, unregistered context for `chunk_id`.
    pub(crate) fn new_context(&self, chunk_id: ChunkId) -> Option<Arc<IoContext>> {
        let handle = self.runtime.as_ref()?.handle().clone();
        Some(Arc::new(IoContext::new(
            chunk_id,
            self.io_depth,
            self.ready_tx.clone(),
            handle,
        )))
    }

    pub(crate) fn register(&self, ctx: Arc<IoContext>) {
        let chunk_id = ctx.chunk_id();
        if self.registry.write().insert(chunk_id, ctx).is_some() {
            warn!(chunk_id, "replaced a registered io context");
        }
        debug!(chunk_id, "io context registered");
    }

    pub(crate) fn deregister(&self, chunk_id: ChunkId) {
        if self.registry.write().remove(&chunk_id).is_some() {
            debug!(chunk_id, "io context deregistered");
        }
    }

    pub(crate) fn registered(&self) -> usize { self.registry.read().len() }

    fn lookup(&self, chunk_id: ChunkId) -> Option<Arc<IoContext>> {
        self.registry.read().get(&chunk_id).cloned()
    }

    fn dispatch(&self, chunk_id: ChunkId) {
        // A chunk that closed meanwhile drained its own completions.
        let Some(ctx) = self.lookup(chunk_id) else {
            trace!(chunk_id, "readiness for an unregistered chunk");
            return;
        };
        let drained = ctx.on_ready();
        trace!(chunk_id, drained, "drained completions");
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

/// The completion thread of a mounted store in async mode.
pub(crate) struct Reactor {
    shutdown_tx: Sender<()>,
    handle:      Option<JoinHandle<()>>,
}

impl Reactor {
    pub(crate) fn start(mux: Arc<Multiplexer>) -> Result<Reactor> {
        let (shutdown_tx, shutdown_rx) = channel::bounded::<()>(1);
        let handle = std::thread::Builder::new()
            .name(REACTOR_THREAD_NAME.to_string())
            .spawn(move || run(mux, shutdown_rx))
            .context(ReactorSpawnSnafu)?;
        info!("completion reactor started");
        Ok(Reactor {
            shutdown_tx,
            handle: Some(handle),
        })
    }

    /// Stop the thread and wait for it. Completions already signalled are
    /// not drained; callers stop the reactor only once no chunk is open.
    pub(crate) fn stop(mut self) -> Result<()> { self.shutdown() }

    fn shutdown(&mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        let _ = self.shutdown_tx.send(());
        if handle.join().is_err() {
            return ReactorPanickedSnafu.fail();
        }
        info!("completion reactor stopped");
        Ok(())
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("{e}");
        }
    }
}

fn run(mux: Arc<Multiplexer>, shutdown_rx: Receiver<()>) {
    loop {
        select! {
            recv(mux.ready_rx) -> msg => match msg {
                Ok(chunk_id) => mux.dispatch(chunk_id),
                Err(_) => break,
            },
            recv(shutdown_rx) -> _ => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use tsumiki_utils::logger::install_fmt_log;

    use super::*;
    use crate::{
        aio::{AsyncRequest, SubIo},
        object::Object,
        split::IoPiece,
    };

    #[test]
    fn callbacks_fire_on_the_reactor_thread() {
        install_fmt_log();
        let dir = tempfile::tempdir().unwrap();
        let mux = Multiplexer::new(16).unwrap();
        let reactor = Reactor::start(mux.clone()).unwrap();

        let ctx = mux.new_context(7).unwrap();
        mux.register(ctx.clone());
        assert_eq!(mux.registered(), 1);

        let obj = Arc::new(Object::open(7, 0, dir.path().join("0"), false).unwrap());
        let (tx, rx) = channel::unbounded();
        let request = AsyncRequest::write(
            7,
            Box::new(move |r| {
                let name = std::thread::current().name().map(str::to_string);
                tx.send((r.is_ok(), name)).unwrap();
            }),
        );
        ctx.submit(vec![SubIo {
            request,
            seq: 0,
            piece: IoPiece {
                object:     0,
                offset:     0,
                length:     3,
                buf_offset: 0,
            },
            object: obj,
            payload: Some(Bytes::from_static(b"abc")),
        }])
        .unwrap();

        let (ok, thread) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(ok);
        assert_eq!(thread.as_deref(), Some(REACTOR_THREAD_NAME));

        ctx.quiesce();
        mux.deregister(7);
        assert_eq!(mux.registered(), 0);
        reactor.stop().unwrap();
    }

    #[test]
    fn unknown_chunk_is_ignored() {
        let mux = Multiplexer::new(4).unwrap();
        let reactor = Reactor::start(mux.clone()).unwrap();
        mux.ready_tx.send(99).unwrap();
        reactor.stop().unwrap();
    }
}
