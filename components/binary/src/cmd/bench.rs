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


use std::{str::FromStr, time::Instant};

use bytes::Bytes;
use clap::Args;
use crossbeam::channel::{self, Receiver};
use snafu::{whatever, ResultExt, Whatever};
use tracing::{info, warn};
use tsumiki_common::ChunkId;
use tsumiki_store::{ChunkHandle, ChunkStore};
use tsumiki_types::ChunkCreateOpts;
use tsumiki_utils::readable_size::ReadableSize;

use super::StoreArgs;

const BENCH_OPTIONS_HEADER: &str = "Bench options";

#[derive(Debug, Clone, Args)]
#[command(long_about = r"

Create a scratch chunk on a formatted store, write it from start to end, read
it back, and print the throughput of both passes. The chunk is removed
afterwards.
")]
pub struct BenchArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    #[arg(
        long,
        help = "Id of the scratch chunk, decimal or 0x hex",
        help_heading = BENCH_OPTIONS_HEADER,
        value_parser = clap_num::maybe_hex::<u64>,
        default_value = "0xbe4c",
    )]
    pub chunk: ChunkId,

    #[arg(
        long,
        help = "Size of the scratch chunk",
        help_heading = BENCH_OPTIONS_HEADER,
        value_parser = parse_size,
        default_value = "256MiB",
    )]
    pub size: ReadableSize,

    #[arg(
        long,
        help = "Bytes moved by one request",
        help_heading = BENCH_OPTIONS_HEADER,
        value_parser = parse_size,
        default_value = "1MiB",
    )]
    pub io_size: ReadableSize,

    #[arg(
        long,
        help = "Requests kept in flight",
        help_heading = BENCH_OPTIONS_HEADER,
        value_parser = validate_depth,
        default_value = "32",
    )]
    pub depth: usize,

    #[arg(long, help = "Create every object up front", help_heading = BENCH_OPTIONS_HEADER)]
    pub prealloc: bool,
}

fn parse_size(s: &str) -> Result<ReadableSize, String> {
    let size = ReadableSize::from_str(s)?;
    if size.as_bytes() == 0 {
        return Err(format!("{s:?} is zero"));
    }
    Ok(size)
}

fn validate_depth(s: &str) -> Result<usize, String> { clap_num::number_range(s, 1, 1024) }

impl BenchArgs {
    pub fn run(&self) -> Result<(), Whatever> {
        let store = self.store.open()?;
        store.dev_mount().whatever_context("mount failed")?;
        let result = self.bench(&store);
        if let Err(e) = store.chunk_remove(self.chunk) {
            warn!(chunk_id = self.chunk, "scratch chunk left behind: {e}");
        }
        store.dev_unmount().whatever_context("unmount failed")?;
        result
    }

    fn bench(&self, store: &ChunkStore) -> Result<(), Whatever> {
        let opts = ChunkCreateOpts::default()
            .with_size(self.size.as_bytes())
            .with_prealloc(self.prealloc);
        store
            .chunk_create(self.chunk, &opts)
            .with_whatever_context(|e| format!("cannot create chunk {:x}: {e}", self.chunk))?;
        let chunk = store
            .chunk_open(self.chunk)
            .with_whatever_context(|e| format!("cannot open chunk {:x}: {e}", self.chunk))?;
        info!(
            chunk_id = self.chunk,
            size = %self.size,
            io_size = %self.io_size,
            depth = self.depth,
            io_mode = %store.io_mode(),
            "bench started"
        );

        let passes = self.write_pass(&chunk).and_then(|w| Ok((w, self.read_pass(&chunk)?)));
        store
            .chunk_close(chunk)
            .whatever_context("cannot close the scratch chunk")?;
        let (write_secs, read_secs) = passes?;

        let bytes = self.size.as_bytes() as f64;
        println!(
            "write: {} in {:.3}s, {}/s",
            self.size,
            write_secs,
            ReadableSize((bytes / write_secs) as u64)
        );
        println!(
            "read:  {} in {:.3}s, {}/s",
            self.size,
            read_secs,
            ReadableSize((bytes / read_secs) as u64)
        );
        Ok(())
    }

    /// The requests of one pass, as (offset, length).
    fn requests(&self) -> impl Iterator<Item = (u64, u64)> {
        let size = self.size.as_bytes();
        let step = self.io_size.as_bytes();
        (0..size.div_ceil(step)).map(move |i| {
            let offset = i * step;
            (offset, step.min(size - offset))
        })
    }

    fn write_pass(&self, chunk: &ChunkHandle) -> Result<f64, Whatever> {
        let data = Bytes::from(vec![0x5au8; self.io_size.as_bytes_usize()]);
        let (tx, rx) = channel::unbounded();
        let mut in_flight = 0;
        let start = Instant::now();
        for (offset, length) in self.requests() {
            if in_flight == self.depth {
                wait_one(&rx)?;
                in_flight -= 1;
            }
            let tx = tx.clone();
            chunk
                .write_chunk(
                    data.slice(..length as usize),
                    offset,
                    Box::new(move |r| {
                        let _ = tx.send(r.map(|_| length));
                    }),
                )
                .with_whatever_context(|e| format!("write at {offset} not submitted: {e}"))?;
            in_flight += 1;
        }
        for _ in 0..in_flight {
            wait_one(&rx)?;
        }
        Ok(start.elapsed().as_secs_f64())
    }

    fn read_pass(&self, chunk: &ChunkHandle) -> Result<f64, Whatever> {
        let (tx, rx) = channel::unbounded();
        let mut in_flight = 0;
        let start = Instant::now();
        for (offset, length) in self.requests() {
            if in_flight == self.depth {
                wait_one(&rx)?;
                in_flight -= 1;
            }
            let tx = tx.clone();
            chunk
                .read_chunk(
                    offset,
                    length,
                    Box::new(move |r| {
                        let _ = tx.send(r.map(|b| b.len() as u64));
                    }),
                )
                .with_whatever_context(|e| format!("read at {offset} not submitted: {e}"))?;
            in_flight += 1;
        }
        for _ in 0..in_flight {
            wait_one(&rx)?;
        }
        Ok(start.elapsed().as_secs_f64())
    }
}

fn wait_one(rx: &Receiver<tsumiki_store::Result<u64>>) -> Result<u64, Whatever> {
    let Ok(done) = rx.recv() else {
        whatever!("completion channel closed");
    };
    done.whatever_context("request failed")
}
