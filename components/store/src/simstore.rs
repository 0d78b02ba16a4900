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

//! The in-memory chunk store.
//!
//! [SimStore] keeps every chunk in process memory and moves no data: reads
//! hand back zeroes and writes only bump per block counters. When a backup
//! file is configured the whole store is written to it as text at unmount
//! and read back at mount:
//!
//! ```text
//! @kv
//! id=0
//! cluster_name=flame
//! ...
//! @table
//! chk_id;vol_id;index;stat;spolicy;flags;size;used;ctime;dst_id;dst_ctime;xattr;blocks;
//! 1;0;0;0;0;0;8388608;0;1700000000000;0;0;owner=a,;0/2/1/,0/0/0/,;
//! @end
//! ```
//!
//! Lines starting with `#` are comments.

use std::{
    collections::BTreeMap,
    fs,
    io::ErrorKind,
    ops::Range,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use bytes::Bytes;
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use snafu::{ensure, OptionExt, ResultExt};
use tracing::{debug, info, warn};
use tsumiki_common::{ChunkId, SIM_BLOCK_SIZE};
use tsumiki_types::{ChunkCreateOpts, ChunkFlags, ChunkInfo, DevStatus, IoMode, StoreInfo};
use tsumiki_utils::{
    readable_size::{ReadableSize, UnitSize},
    time::now_millis,
};

use crate::{
    aio::{ReadCallback, WriteCallback},
    context::StoreContext,
    err::{
        AlreadyMountedSnafu, ChunkBusySnafu, ChunkExistsSnafu, ChunkNotFoundSnafu,
        CorruptBackupSnafu, Error, InvalidUrlSnafu, InvalidXattrSnafu, IoSnafu, NoSuperblockSnafu,
        NotMountedSnafu, OutOfRangeSnafu, Result, StoreOp, XattrNotFoundSnafu,
    },
    layout::temp_path,
};

pub const SIMSTORE_DRIVER: &str = "SimStore";

const SEP_FIELD: char = ';';
const SEP_ITEM: char = ',';
const SEP_SUB: char = '/';
const SEP_KV: char = '=';

const COLUMNS: [&str; 13] = [
    "chk_id",
    "vol_id",
    "index",
    "stat",
    "spolicy",
    "flags",
    "size",
    "used",
    "ctime",
    "dst_id",
    "dst_ctime",
    "xattr",
    "blocks",
];

static URL_PARAMS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+[tgmTGM])(?::(.+))?$").expect("simstore url pattern"));

/// Access counters of one simulated block.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SimBlock {
    /// [ctime] is when the block was first written, zero if never.
    pub ctime: u64,
    pub rd:    u64,
    pub wr:    u64,
}

fn block_count(size: u64) -> usize { size.div_ceil(SIM_BLOCK_SIZE) as usize }

/// A chunk of a [SimStore]. Every opener shares the one instance held by
/// the store.
pub struct SimChunk {
    info:   ChunkInfo,
    xattrs: RwLock<BTreeMap<String, String>>,
    blocks: Mutex<Vec<SimBlock>>,
}

impl SimChunk {
    fn new(chunk_id: ChunkId, opts: &ChunkCreateOpts) -> SimChunk {
        let info = ChunkInfo {
            chk_id:    chunk_id,
            vol_id:    opts.vol_id,
            index:     opts.index,
            stat:      0,
            spolicy:   opts.spolicy,
            flags:     opts.flags,
            size:      opts.size,
            used:      if opts.is_prealloc() { opts.size } else { 0 },
            ctime:     now_millis(),
            dst_id:    0,
            dst_ctime: 0,
        };
        SimChunk::restore(info, BTreeMap::new(), Vec::new())
    }

    /// Rebuild a chunk from its backup row. Missing blocks start zeroed and
    /// blocks past the end of the chunk are dropped.
    fn restore(
        info: ChunkInfo,
        xattrs: BTreeMap<String, String>,
        mut blocks: Vec<SimBlock>,
    ) -> SimChunk {
        blocks.resize(block_count(info.size), SimBlock::default());
        SimChunk {
            info,
            xattrs: RwLock::new(xattrs),
            blocks: Mutex::new(blocks),
        }
    }

    pub fn chunk_id(&self) -> ChunkId { self.info.chk_id }

    pub fn info(&self) -> ChunkInfo { self.info.clone() }

    pub fn size(&self) -> u64 { self.info.size }

    pub fn used(&self) -> u64 { self.info.used }

    pub fn stat(&self) -> u32 { self.info.stat }

    pub fn vol_id(&self) -> u64 { self.info.vol_id }

    pub fn vol_index(&self) -> u32 { self.info.index }

    pub fn spolicy(&self) -> u32 { self.info.spolicy }

    pub fn is_preallocated(&self) -> bool { self.info.is_preallocated() }

    pub fn create_time(&self) -> u64 { self.info.ctime }

    pub fn io_mode(&self) -> IoMode { IoMode::Async }

    pub fn block_count(&self) -> usize { self.blocks.lock().len() }

    pub fn block(&self, index: usize) -> Option<SimBlock> { self.blocks.lock().get(index).copied() }

    fn check_range(&self, offset: u64, length: u64) -> Result<()> {
        let end = offset.checked_add(length);
        ensure!(
            end.is_some_and(|end| end <= self.info.size),
            OutOfRangeSnafu {
                chunk_id: self.info.chk_id,
                offset,
                length,
                size: self.info.size,
            }
        );
        Ok(())
    }

    fn blocks_of(offset: u64, length: u64) -> Range<usize> {
        if length == 0 {
            return 0..0;
        }
        let begin = offset / SIM_BLOCK_SIZE;
        let end = (offset + length).div_ceil(SIM_BLOCK_SIZE);
        begin as usize..end as usize
    }

    fn count_read(&self, offset: u64, length: u64) {
        let mut blocks = self.blocks.lock();
        for blk in &mut blocks[Self::blocks_of(offset, length)] {
            blk.rd += 1;
        }
    }

    fn count_write(&self, offset: u64, length: u64) {
        let now = now_millis();
        let mut blocks = self.blocks.lock();
        for blk in &mut blocks[Self::blocks_of(offset, length)] {
            if blk.ctime == 0 {
                blk.ctime = now;
            }
            blk.wr += 1;
        }
    }

    pub fn read_sync(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        self.check_range(offset, buf.len() as u64)?;
        buf.fill(0);
        self.count_read(offset, buf.len() as u64);
        Ok(())
    }

    pub fn write_sync(&self, data: &[u8], offset: u64) -> Result<()> {
        self.check_range(offset, data.len() as u64)?;
        self.count_write(offset, data.len() as u64);
        Ok(())
    }

    /// Complete a read of zeroes. `cb` runs before this returns, on the
    /// calling thread.
    pub fn read_async(&self, offset: u64, length: u64, cb: ReadCallback) -> Result<()> {
        self.check_range(offset, length)?;
        self.count_read(offset, length);
        cb(Ok(Bytes::from(vec![0u8; length as usize])));
        Ok(())
    }

    pub fn write_async(&self, data: Bytes, offset: u64, cb: WriteCallback) -> Result<()> {
        self.check_range(offset, data.len() as u64)?;
        self.count_write(offset, data.len() as u64);
        cb(Ok(()));
        Ok(())
    }

    pub fn read_chunk(&self, offset: u64, length: u64, cb: ReadCallback) -> Result<()> {
        self.read_async(offset, length, cb)
    }

    pub fn write_chunk(&self, data: Bytes, offset: u64, cb: WriteCallback) -> Result<()> {
        self.write_async(data, offset, cb)
    }

    pub fn get_xattr(&self, name: &str) -> Result<String> {
        self.xattrs
            .read()
            .get(name)
            .cloned()
            .context(XattrNotFoundSnafu {
                chunk_id: self.info.chk_id,
                name,
            })
    }

    /// Attributes end up in the backup text, so names and values may not
    /// contain its separators.
    pub fn set_xattr(&self, name: &str, value: &str) -> Result<()> {
        let invalid = |reason: &'static str| {
            InvalidXattrSnafu {
                chunk_id: self.info.chk_id,
                name,
                reason,
            }
            .fail()
        };
        if name.is_empty() {
            return invalid("empty name");
        }
        if name.contains([SEP_FIELD, SEP_ITEM, SEP_KV, '\n', '\r']) {
            return invalid("name contains a separator");
        }
        if value.contains([SEP_FIELD, SEP_ITEM, '\n', '\r']) {
            return invalid("value contains a separator");
        }
        self.xattrs
            .write()
            .insert(name.to_string(), value.to_string());
        Ok(())
    }

    pub fn remove_xattr(&self, name: &str) -> Result<()> {
        self.xattrs
            .write()
            .remove(name)
            .map(|_| ())
            .context(XattrNotFoundSnafu {
                chunk_id: self.info.chk_id,
                name,
            })
    }

    pub fn xattr_count(&self) -> usize { self.xattrs.read().len() }

    fn render_row(&self, out: &mut String) {
        let i = &self.info;
        for v in [
            i.chk_id,
            i.vol_id,
            i.index as u64,
            i.stat as u64,
            i.spolicy as u64,
            i.flags.bits() as u64,
            i.size,
            i.used,
            i.ctime,
            i.dst_id,
            i.dst_ctime,
        ] {
            out.push_str(&v.to_string());
            out.push(SEP_FIELD);
        }
        for (k, v) in self.xattrs.read().iter() {
            out.push_str(k);
            out.push(SEP_KV);
            out.push_str(v);
            out.push(SEP_ITEM);
        }
        out.push(SEP_FIELD);
        for blk in self.blocks.lock().iter() {
            out.push_str(&format!(
                "{}{SEP_SUB}{}{SEP_SUB}{}{SEP_SUB}{SEP_ITEM}",
                blk.ctime, blk.rd, blk.wr
            ));
        }
        out.push(SEP_FIELD);
        out.push('\n');
    }
}

impl std::fmt::Debug for SimChunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimChunk")
            .field("chunk_id", &self.info.chk_id)
            .field("size", &self.info.size)
            .finish()
    }
}

pub type SimChunkRef = Arc<SimChunk>;

type SimChunkMap = BTreeMap<ChunkId, SimChunkRef>;

/// [SimStore] is the chunk store that lives in memory.
pub struct SimStore {
    ctx:     StoreContext,
    size:    UnitSize,
    backup:  Option<PathBuf>,
    info:    Mutex<StoreInfo>,
    mounted: AtomicBool,
    chunks:  RwLock<SimChunkMap>,
}

impl SimStore {
    pub fn new(ctx: StoreContext, size: UnitSize, backup: Option<PathBuf>) -> Self {
        let info = StoreInfo {
            size: size.as_bytes(),
            ..Default::default()
        };
        SimStore {
            ctx,
            size,
            backup,
            info: Mutex::new(info),
            mounted: AtomicBool::new(false),
            chunks: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn backup_path(&self) -> Option<&Path> { self.backup.as_deref() }

    pub fn get_info(&self) -> StoreInfo { self.info.lock().clone() }

    pub fn set_info(&self, info: StoreInfo) { *self.info.lock() = info; }

    pub fn driver_name(&self) -> &'static str { SIMSTORE_DRIVER }

    pub fn config_info(&self) -> String {
        match &self.backup {
            Some(path) => format!("simstore://{}:{}", self.size, path.display()),
            None => format!("simstore://{}", self.size),
        }
    }

    pub fn runtime_info(&self) -> String {
        let info = self.get_info();
        format!(
            "mounted={} open_chunks={} chunks={} used={} size={}",
            self.is_mounted(),
            self.open_chunks(),
            info.chunk_count,
            ReadableSize(info.used),
            ReadableSize(info.size)
        )
    }

    pub fn io_mode(&self) -> IoMode { IoMode::Async }

    pub fn is_support_mem_persist(&self) -> bool { false }

    pub fn is_mounted(&self) -> bool { self.mounted.load(Ordering::Acquire) }

    /// Chunks some caller still holds a handle of.
    pub fn open_chunks(&self) -> usize {
        self.chunks
            .read()
            .values()
            .filter(|c| Arc::strong_count(c) > 1)
            .count()
    }

    fn fresh_info(&self, prev: &StoreInfo) -> StoreInfo {
        let pick = |cur: &str, ctx: &str| {
            if cur.is_empty() {
                ctx.to_string()
            } else {
                cur.to_string()
            }
        };
        StoreInfo {
            id:           prev.id,
            cluster_name: pick(&prev.cluster_name, &self.ctx.cluster_name),
            name:         pick(&prev.name, &self.ctx.node_name),
            size:         self.size.as_bytes(),
            used:         0,
            ftime:        now_millis(),
            chunk_count:  0,
        }
    }

    // Device lifecycle

    /// Without a backup file there is nothing to check. With one, its store
    /// info decides the status.
    pub fn dev_check(&self) -> DevStatus {
        let Some(path) = &self.backup else {
            return DevStatus::ClusterIn;
        };
        match load_backup(path) {
            Ok((info, _)) => {
                if !info.cluster_name.is_empty() && info.cluster_name != self.ctx.cluster_name {
                    DevStatus::ClusterOut
                } else {
                    DevStatus::ClusterIn
                }
            }
            Err(e) if e.is_not_found() => DevStatus::None,
            Err(e) => {
                warn!(?path, "unreadable simstore backup: {e}");
                DevStatus::Unknown
            }
        }
    }

    /// Drop every chunk and reset the accounting. The backup file, if any,
    /// is rewritten right away.
    pub fn dev_format(&self) -> Result<()> {
        let mut chunks = self.chunks.write();
        let info = {
            let mut info = self.info.lock();
            *info = self.fresh_info(&info);
            info.clone()
        };
        let dropped = std::mem::take(&mut *chunks);
        if let Some(path) = &self.backup {
            store_backup(path, &info, &chunks)?;
        }
        info!(dropped = dropped.len(), size = %ReadableSize(info.size), "simstore formatted");
        Ok(())
    }

    pub fn dev_mount(&self) -> Result<()> {
        let mut chunks = self.chunks.write();
        ensure!(!self.is_mounted(), AlreadyMountedSnafu);
        match &self.backup {
            Some(path) => {
                let (info, loaded) = load_backup(path)?;
                *self.info.lock() = info;
                *chunks = loaded;
            }
            None => {
                let mut info = self.info.lock();
                if info.ftime == 0 {
                    *info = self.fresh_info(&info);
                }
            }
        }
        self.mounted.store(true, Ordering::Release);
        info!(chunks = chunks.len(), "simstore mounted");
        Ok(())
    }

    /// Write the backup file. Open handles stay usable, they share their
    /// state with the store.
    pub fn dev_unmount(&self) -> Result<()> {
        let chunks = self.chunks.write();
        ensure!(self.is_mounted(), NotMountedSnafu);
        let open = chunks
            .values()
            .filter(|c| Arc::strong_count(c) > 1)
            .count();
        if open > 0 {
            warn!(open, "unmounting simstore with open chunks");
        }
        if let Some(path) = &self.backup {
            store_backup(path, &self.get_info(), &chunks)?;
        }
        self.mounted.store(false, Ordering::Release);
        info!(chunks = chunks.len(), "simstore unmounted");
        Ok(())
    }

    fn ensure_mounted(&self) -> Result<()> {
        ensure!(self.is_mounted(), NotMountedSnafu);
        Ok(())
    }

    // Chunks

    pub fn chunk_exist(&self, chunk_id: ChunkId) -> Result<bool> {
        self.ensure_mounted()?;
        Ok(self.chunks.read().contains_key(&chunk_id))
    }

    pub fn chunk_create(&self, chunk_id: ChunkId, opts: &ChunkCreateOpts) -> Result<()> {
        self.ensure_mounted()?;
        let mut chunks = self.chunks.write();
        ensure!(
            !chunks.contains_key(&chunk_id),
            ChunkExistsSnafu { chunk_id }
        );
        chunks.insert(chunk_id, Arc::new(SimChunk::new(chunk_id, opts)));

        let mut info = self.info.lock();
        info.chunk_count += 1;
        info.used += opts.size;
        debug!(chunk_id, size = opts.size, "sim chunk created");
        Ok(())
    }

    /// Remove a chunk nobody holds a handle of.
    pub fn chunk_remove(&self, chunk_id: ChunkId) -> Result<()> {
        self.ensure_mounted()?;
        let mut chunks = self.chunks.write();
        let chunk = chunks.get(&chunk_id).context(ChunkNotFoundSnafu { chunk_id })?;
        ensure!(Arc::strong_count(chunk) == 1, ChunkBusySnafu { chunk_id });
        let size = chunk.size();
        chunks.remove(&chunk_id);

        let mut info = self.info.lock();
        info.chunk_count = info.chunk_count.saturating_sub(1);
        info.used = info.used.saturating_sub(size);
        debug!(chunk_id, size, "sim chunk removed");
        Ok(())
    }

    pub fn chunk_open(&self, chunk_id: ChunkId) -> Result<SimChunkRef> {
        self.ensure_mounted()?;
        self.chunks
            .read()
            .get(&chunk_id)
            .cloned()
            .context(ChunkNotFoundSnafu { chunk_id })
    }

    /// Give back a handle from [SimStore::chunk_open].
    pub fn chunk_close(&self, chunk: SimChunkRef) -> Result<()> {
        debug!(chunk_id = chunk.chunk_id(), "sim chunk closed");
        drop(chunk);
        Ok(())
    }
}

impl std::fmt::Debug for SimStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimStore")
            .field("size", &self.size)
            .field("backup", &self.backup)
            .field("mounted", &self.is_mounted())
            .finish()
    }
}

/// Build the store a `simstore://<size>[:<backup file>]` url points at. The
/// size takes a `T`, `G` or `M` unit in either case.
pub(crate) fn from_url_params(ctx: StoreContext, params: &str) -> Result<SimStore> {
    let url = || format!("simstore://{}", params);
    let caps = URL_PARAMS
        .captures(params)
        .context(InvalidUrlSnafu { url: url() })?;
    let size: UnitSize = caps[1]
        .parse()
        .ok()
        .context(InvalidUrlSnafu { url: url() })?;
    let backup = caps.get(2).map(|m| PathBuf::from(m.as_str()));
    Ok(SimStore::new(ctx, size, backup))
}

// Backup file

fn render_backup(info: &StoreInfo, chunks: &SimChunkMap) -> String {
    let mut out = String::new();
    out.push_str("# simstore backup\n@kv\n");
    for (k, v) in [
        ("id", info.id.to_string()),
        ("cluster_name", info.cluster_name.clone()),
        ("name", info.name.clone()),
        ("size", info.size.to_string()),
        ("used", info.used.to_string()),
        ("ftime", info.ftime.to_string()),
        ("chk_num", info.chunk_count.to_string()),
    ] {
        out.push_str(&format!("{k}{SEP_KV}{v}\n"));
    }
    out.push_str("@table\n");
    for col in COLUMNS {
        out.push_str(col);
        out.push(SEP_FIELD);
    }
    out.push('\n');
    for chunk in chunks.values() {
        chunk.render_row(&mut out);
    }
    out.push_str("@end\n");
    out
}

fn store_backup(path: &Path, info: &StoreInfo, chunks: &SimChunkMap) -> Result<()> {
    let text = render_backup(info, chunks);
    let temp = temp_path(path);
    let ctx = |p: &Path| IoSnafu {
        op:   StoreOp::Backup,
        path: p.to_path_buf(),
    };
    fs::write(&temp, text).context(ctx(&temp))?;
    fs::rename(&temp, path).context(ctx(path))?;
    debug!(?path, chunks = chunks.len(), "simstore backup written");
    Ok(())
}

fn load_backup(path: &Path) -> Result<(StoreInfo, SimChunkMap)> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return NoSuperblockSnafu { path }.fail();
        }
        Err(e) => {
            return Err(e).context(IoSnafu {
                op:   StoreOp::LoadSuper,
                path: path.to_path_buf(),
            })
        }
    };
    parse_backup(path, &text)
}

enum Section {
    Top,
    Kv,
    Header,
    Rows,
}

fn parse_backup(path: &Path, text: &str) -> Result<(StoreInfo, SimChunkMap)> {
    let corrupt = |line: usize, reason: String| -> Error {
        CorruptBackupSnafu {
            path: path.to_path_buf(),
            line,
            reason,
        }
        .build()
    };

    let mut section = Section::Top;
    let mut header: Vec<&str> = Vec::new();
    let mut info = StoreInfo::default();
    let mut chunks = SimChunkMap::new();
    let mut ended = false;

    for (n, raw) in text.lines().enumerate() {
        let line_no = n + 1;
        let line = raw.trim_end_matches('\r');
        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(name) = line.strip_prefix('@') {
            section = match name.trim() {
                "kv" => Section::Kv,
                "table" => Section::Header,
                "end" => {
                    ended = true;
                    break;
                }
                other => return Err(corrupt(line_no, format!("unknown section @{other}"))),
            };
            continue;
        }
        match section {
            Section::Top => return Err(corrupt(line_no, "data outside a section".into())),
            Section::Kv => {
                let (key, value) = line
                    .split_once(SEP_KV)
                    .ok_or_else(|| corrupt(line_no, format!("{line:?} is not key=value")))?;
                set_info_field(&mut info, key, value).map_err(|r| corrupt(line_no, r))?;
            }
            Section::Header => {
                header = parse_header(line).map_err(|r| corrupt(line_no, r))?;
                section = Section::Rows;
            }
            Section::Rows => {
                let chunk = parse_row(&header, line).map_err(|r| corrupt(line_no, r))?;
                let chunk_id = chunk.chunk_id();
                if chunks.insert(chunk_id, Arc::new(chunk)).is_some() {
                    return Err(corrupt(line_no, format!("chunk {chunk_id:x} listed twice")));
                }
            }
        }
    }
    if !ended {
        return Err(corrupt(text.lines().count(), "missing @end".into()));
    }
    if info.chunk_count as usize != chunks.len() {
        warn!(
            ?path,
            recorded = info.chunk_count,
            found = chunks.len(),
            "chunk count in simstore backup is off"
        );
        info.chunk_count = chunks.len() as u32;
    }
    Ok((info, chunks))
}

fn parse_num<T: std::str::FromStr>(value: &str) -> std::result::Result<T, String>
where
    T::Err: std::fmt::Display,
{
    value.parse::<T>().map_err(|e| format!("{value:?}: {e}"))
}

fn set_info_field(info: &mut StoreInfo, key: &str, value: &str) -> std::result::Result<(), String> {
    match key {
        "id" => info.id = parse_num(value)?,
        "cluster_name" => info.cluster_name = value.to_string(),
        "name" => info.name = value.to_string(),
        "size" => info.size = parse_num(value)?,
        "used" => info.used = parse_num(value)?,
        "ftime" => info.ftime = parse_num(value)?,
        "chk_num" => info.chunk_count = parse_num(value)?,
        _ => return Err(format!("unknown key {key:?}")),
    }
    Ok(())
}

fn parse_header(line: &str) -> std::result::Result<Vec<&str>, String> {
    let line = line
        .strip_suffix(SEP_FIELD)
        .ok_or_else(|| format!("header must end with {SEP_FIELD:?}"))?;
    let mut header = Vec::new();
    for col in line.split(SEP_FIELD) {
        // older writers spelled it dst_time
        let col = if col == "dst_time" { "dst_ctime" } else { col };
        if !COLUMNS.contains(&col) {
            return Err(format!("unknown column {col:?}"));
        }
        header.push(col);
    }
    if !header.contains(&"chk_id") {
        return Err("no chk_id column".into());
    }
    Ok(header)
}

fn parse_row(header: &[&str], line: &str) -> std::result::Result<SimChunk, String> {
    let line = line
        .strip_suffix(SEP_FIELD)
        .ok_or_else(|| format!("row must end with {SEP_FIELD:?}"))?;
    let fields: Vec<&str> = line.split(SEP_FIELD).collect();
    if fields.len() != header.len() {
        return Err(format!("{} fields for {} columns", fields.len(), header.len()));
    }

    let mut info = ChunkInfo::default();
    let mut xattrs = BTreeMap::new();
    let mut blocks = Vec::new();
    for (&col, &value) in header.iter().zip(&fields) {
        match col {
            "chk_id" => info.chk_id = parse_num(value)?,
            "vol_id" => info.vol_id = parse_num(value)?,
            "index" => info.index = parse_num(value)?,
            "stat" => info.stat = parse_num(value)?,
            "spolicy" => info.spolicy = parse_num(value)?,
            "flags" => info.flags = ChunkFlags::from_bits_retain(parse_num(value)?),
            "size" => info.size = parse_num(value)?,
            "used" => info.used = parse_num(value)?,
            "ctime" => info.ctime = parse_num(value)?,
            "dst_id" => info.dst_id = parse_num(value)?,
            "dst_ctime" => info.dst_ctime = parse_num(value)?,
            "xattr" => {
                for item in value.split(SEP_ITEM).filter(|i| !i.is_empty()) {
                    let (k, v) = item
                        .split_once(SEP_KV)
                        .ok_or_else(|| format!("xattr {item:?} is not name=value"))?;
                    if k.is_empty() {
                        return Err(format!("xattr {item:?} has no name"));
                    }
                    xattrs.insert(k.to_string(), v.to_string());
                }
            }
            "blocks" => {
                for item in value.split(SEP_ITEM).filter(|i| !i.is_empty()) {
                    let parts: Vec<&str> = item.trim_end_matches(SEP_SUB).split(SEP_SUB).collect();
                    let [ctime, rd, wr] = parts[..] else {
                        return Err(format!("block {item:?} is not ctime/rd/wr/"));
                    };
                    blocks.push(SimBlock {
                        ctime: parse_num(ctime)?,
                        rd:    parse_num(rd)?,
                        wr:    parse_num(wr)?,
                    });
                }
            }
            _ => unreachable!("header columns are checked"),
        }
    }
    Ok(SimChunk::restore(info, xattrs, blocks))
}

#[cfg(test)]
mod tests {
    use crossbeam::channel;
    use tsumiki_utils::{logger::install_fmt_log, readable_size::SizeUnit};

    use super::*;
    use crate::err::ErrorKind as StoreErrorKind;

    fn ctx() -> StoreContext { StoreContext::new("flame", "sim-1") }

    fn mounted(backup: Option<PathBuf>) -> SimStore {
        let store = SimStore::new(ctx(), UnitSize::new(1, SizeUnit::Giga), backup);
        store.dev_format().unwrap();
        store.dev_mount().unwrap();
        store
    }

    #[test]
    fn url_params() {
        let store = from_url_params(ctx(), "10G").unwrap();
        assert_eq!(store.get_info().size, 10 << 30);
        assert!(store.backup_path().is_none());
        assert_eq!(store.config_info(), "simstore://10G");

        let store = from_url_params(ctx(), "512m:/tmp/sim.bk").unwrap();
        assert_eq!(store.get_info().size, 512 << 20);
        assert_eq!(store.backup_path(), Some(Path::new("/tmp/sim.bk")));
        assert_eq!(store.config_info(), "simstore://512M:/tmp/sim.bk");

        for bad in ["", "10", "10K", "G", "10G:", "x10G"] {
            let err = from_url_params(ctx(), bad).unwrap_err();
            assert_eq!(err.kind(), StoreErrorKind::Config, "{bad}");
        }
    }

    #[test]
    fn chunk_lifecycle_and_accounting() {
        install_fmt_log();
        let store = mounted(None);
        assert_eq!(store.driver_name(), SIMSTORE_DRIVER);
        assert_eq!(store.io_mode(), IoMode::Async);

        let opts = ChunkCreateOpts::default()
            .with_size(10 << 20)
            .with_volume(3, 4)
            .with_prealloc(true);
        store.chunk_create(1, &opts).unwrap();
        assert!(store.chunk_exist(1).unwrap());
        assert!(matches!(
            store.chunk_create(1, &opts),
            Err(Error::ChunkExists { .. })
        ));
        assert_eq!(store.get_info().chunk_count, 1);
        assert_eq!(store.get_info().used, 10 << 20);

        let a = store.chunk_open(1).unwrap();
        let b = store.chunk_open(1).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.vol_id(), 3);
        assert_eq!(a.vol_index(), 4);
        assert!(a.is_preallocated());
        assert_eq!(a.used(), 10 << 20);
        assert_eq!(a.block_count(), 3);
        assert_eq!(store.open_chunks(), 1);

        assert!(store.chunk_remove(1).unwrap_err().is_busy());
        store.chunk_close(a).unwrap();
        store.chunk_close(b).unwrap();
        store.chunk_remove(1).unwrap();
        assert!(!store.chunk_exist(1).unwrap());
        assert!(store.chunk_open(1).unwrap_err().is_not_found());
        assert!(store.chunk_remove(1).unwrap_err().is_not_found());
        assert_eq!(store.get_info().chunk_count, 0);
        assert_eq!(store.get_info().used, 0);
    }

    #[test]
    fn io_counts_blocks() {
        let store = mounted(None);
        let size = 3 * SIM_BLOCK_SIZE;
        store
            .chunk_create(2, &ChunkCreateOpts::default().with_size(size))
            .unwrap();
        let chunk = store.chunk_open(2).unwrap();

        let mut buf = vec![0xffu8; 16];
        chunk.read_sync(&mut buf, SIM_BLOCK_SIZE - 8).unwrap();
        assert!(buf.iter().all(|b| *b == 0));
        assert_eq!(chunk.block(0).unwrap().rd, 1);
        assert_eq!(chunk.block(1).unwrap().rd, 1);
        assert_eq!(chunk.block(2).unwrap().rd, 0);

        chunk.write_sync(b"abc", 2 * SIM_BLOCK_SIZE).unwrap();
        let blk = chunk.block(2).unwrap();
        assert_eq!(blk.wr, 1);
        assert!(blk.ctime > 0);
        assert_eq!(chunk.block(1).unwrap().wr, 0);

        chunk.write_sync(&[], 0).unwrap();
        assert_eq!(chunk.block(0).unwrap().wr, 0);

        assert!(matches!(
            chunk.read_sync(&mut buf, size - 8),
            Err(Error::OutOfRange { .. })
        ));
    }

    #[test]
    fn async_callbacks_run_inline() {
        let store = mounted(None);
        store
            .chunk_create(3, &ChunkCreateOpts::default().with_size(1 << 20))
            .unwrap();
        let chunk = store.chunk_open(3).unwrap();
        let (tx, rx) = channel::unbounded();

        let read_tx = tx.clone();
        chunk
            .read_chunk(
                0,
                32,
                Box::new(move |r| read_tx.send(r.unwrap().len()).unwrap()),
            )
            .unwrap();
        assert_eq!(rx.try_recv().unwrap(), 32);

        chunk
            .write_chunk(
                Bytes::from_static(b"hello"),
                8,
                Box::new(move |r| {
                    r.unwrap();
                    tx.send(5).unwrap();
                }),
            )
            .unwrap();
        assert_eq!(rx.try_recv().unwrap(), 5);
        assert_eq!(chunk.block(0).unwrap().wr, 1);

        assert!(chunk
            .read_async(1 << 20, 1, Box::new(|_| panic!("not submitted")))
            .is_err());
    }

    #[test]
    fn xattrs() {
        let store = mounted(None);
        store
            .chunk_create(4, &ChunkCreateOpts::default().with_size(1 << 20))
            .unwrap();
        let chunk = store.chunk_open(4).unwrap();
        chunk.set_xattr("owner", "a").unwrap();
        chunk.set_xattr("owner", "b=c").unwrap();
        assert_eq!(chunk.get_xattr("owner").unwrap(), "b=c");
        assert_eq!(chunk.xattr_count(), 1);

        for (name, value) in [("", "v"), ("a;b", "v"), ("a=b", "v"), ("k", "x,y"), ("k", "l\n")] {
            assert!(matches!(
                chunk.set_xattr(name, value),
                Err(Error::InvalidXattr { .. })
            ));
        }
        chunk.remove_xattr("owner").unwrap();
        assert!(chunk.get_xattr("owner").unwrap_err().is_not_found());
        assert!(chunk.remove_xattr("owner").is_err());
    }

    #[test]
    fn needs_mount() {
        let store = SimStore::new(ctx(), UnitSize::new(1, SizeUnit::Giga), None);
        assert!(matches!(store.chunk_exist(1), Err(Error::NotMounted { .. })));
        assert!(matches!(store.dev_unmount(), Err(Error::NotMounted { .. })));
        store.dev_mount().unwrap();
        assert_eq!(store.get_info().cluster_name, "flame");
        assert!(matches!(store.dev_mount(), Err(Error::AlreadyMounted { .. })));
        store.dev_unmount().unwrap();
    }

    #[test]
    fn backup_round_trip() {
        install_fmt_log();
        let dir = tempfile::tempdir().unwrap();
        let backup = dir.path().join("sim.bk");
        let size = UnitSize::new(1, SizeUnit::Giga);

        let store = SimStore::new(ctx(), size, Some(backup.clone()));
        assert_eq!(store.dev_check(), DevStatus::None);
        assert!(store.dev_mount().unwrap_err().is_not_found());
        store.dev_format().unwrap();
        assert_eq!(store.dev_check(), DevStatus::ClusterIn);
        store.dev_mount().unwrap();

        let opts = ChunkCreateOpts::default()
            .with_size(SIM_BLOCK_SIZE + 1)
            .with_spolicy(7);
        store.chunk_create(0x10, &opts).unwrap();
        store.chunk_create(0x11, &opts).unwrap();
        let chunk = store.chunk_open(0x10).unwrap();
        chunk.set_xattr("owner", "a").unwrap();
        chunk.set_xattr("tier", "").unwrap();
        chunk.write_sync(b"x", SIM_BLOCK_SIZE).unwrap();
        let mut one = [0u8; 1];
        chunk.read_sync(&mut one, 0).unwrap();
        let ctime = chunk.block(1).unwrap().ctime;

        // open handles do not keep unmount from writing the backup
        store.dev_unmount().unwrap();
        drop(chunk);

        let again = SimStore::new(ctx(), size, Some(backup.clone()));
        again.dev_mount().unwrap();
        let info = again.get_info();
        assert_eq!(info.chunk_count, 2);
        assert_eq!(info.used, 2 * (SIM_BLOCK_SIZE + 1));
        assert_eq!(info.cluster_name, "flame");
        assert_eq!(info.name, "sim-1");

        let chunk = again.chunk_open(0x10).unwrap();
        assert_eq!(chunk.spolicy(), 7);
        assert_eq!(chunk.size(), SIM_BLOCK_SIZE + 1);
        assert_eq!(chunk.get_xattr("owner").unwrap(), "a");
        assert_eq!(chunk.get_xattr("tier").unwrap(), "");
        assert_eq!(
            chunk.block(1).unwrap(),
            SimBlock {
                ctime,
                rd: 0,
                wr: 1,
            }
        );
        assert_eq!(chunk.block(0).unwrap().rd, 1);
        assert!(again.chunk_exist(0x11).unwrap());

        let other = SimStore::new(StoreContext::new("other", "n"), size, Some(backup));
        assert_eq!(other.dev_check(), DevStatus::ClusterOut);
    }

    #[test]
    fn backup_parsing() {
        let path = Path::new("/backup");
        let text = "\
# hand written
@kv
id=9
cluster_name=flame
name=n
size=1073741824
used=10
ftime=1
chk_num=5
@table
chk_id;vol_id;index;stat;spolicy;flags;size;used;ctime;dst_id;dst_time;xattr;blocks;
1;2;3;0;0;1;10;10;5;0;0;;7/1/2/,;
@end
ignored after the end
";
        let (info, chunks) = parse_backup(path, text).unwrap();
        assert_eq!(info.id, 9);
        // the recorded count is fixed up to the rows found
        assert_eq!(info.chunk_count, 1);
        let chunk = &chunks[&1];
        assert!(chunk.is_preallocated());
        assert_eq!(chunk.vol_id(), 2);
        assert_eq!(chunk.xattr_count(), 0);
        assert_eq!(chunk.block(0).unwrap(), SimBlock { ctime: 7, rd: 1, wr: 2 });

        for (bad, line) in [
            ("@kv\nid=x\n@end\n", 2),
            ("@kv\nbogus=1\n@end\n", 2),
            ("@kv\nid\n@end\n", 2),
            ("id=1\n", 1),
            ("@what\n", 1),
            ("@kv\nid=1\n", 2),
            ("@table\nchk_id;size;\n1;\n@end\n", 3),
            ("@table\nchk_id;size\n", 2),
            ("@table\nchk_id;nope;\n", 2),
            ("@table\nchk_id;blocks;\n1;1/2;\n@end\n", 3),
            ("@table\nchk_id;\n1;\n1;\n@end\n", 4),
        ] {
            match parse_backup(path, bad) {
                Err(Error::CorruptBackup { line: l, .. }) => assert_eq!(l, line, "{bad:?}"),
                other => panic!("{bad:?} parsed as {other:?}"),
            }
        }
    }

    #[test]
    fn format_drops_chunks_and_keeps_identity() {
        let store = mounted(None);
        let mut info = store.get_info();
        info.id = 42;
        store.set_info(info);
        store
            .chunk_create(5, &ChunkCreateOpts::default().with_size(1 << 20))
            .unwrap();
        store.dev_format().unwrap();
        let info = store.get_info();
        assert_eq!(info.id, 42);
        assert_eq!(info.chunk_count, 0);
        assert!(!store.chunk_exist(5).unwrap());
        assert!(store.runtime_info().contains("mounted=true"));
    }
}
