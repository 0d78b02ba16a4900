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

//! The chunk descriptor file.
//!
//! A descriptor is one base record followed by `xattr_num` attribute records,
//! packed little endian with no padding:
//!
//! ```text
//! base:  type(u8)=1 length(u32) chunk_id vol_id index stat spolicy flags size
//!        used create_time dst_id dst_ctime xattr_num (u64 each)
//!        block_size_shift(u8) read_counter(u64) write_counter(u64)
//! xattr: type(u8)=2 length(u32) name_len(u16) value_len(u16) name value
//! ```
//!
//! Descriptors are replaced atomically: the new content goes to
//! `<path>.temp` which is then renamed over `<path>`.

use std::{
    fs::{self, OpenOptions},
    os::unix::fs::{FileExt, OpenOptionsExt},
    path::Path,
};

use rustix::fs::XattrFlags;
use scopeguard::ScopeGuard;
use snafu::{ensure, OptionExt, ResultExt};
use tracing::{debug, warn};
use tsumiki_common::{ChunkId, CHUNK_SIZE_XATTR};

use crate::{
    codec::{Decoder, Encoder},
    err::{CorruptDescriptorSnafu, IoSnafu, Result, StoreOp, XattrTooLongSnafu},
    layout::temp_path,
};

const TYPE_BASE: u8 = 0x01;
const TYPE_XATTR: u8 = 0x02;

pub(crate) const BASE_RECORD_LEN: usize = 118;
pub(crate) const XATTR_HEADER_LEN: usize = 9;

const DESCRIPTOR_FILE_MODE: u32 = 0o660;

/// Everything a chunk persists about itself.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ChunkDescriptor {
    pub chunk_id:         ChunkId,
    pub vol_id:           u64,
    pub index:            u64,
    pub stat:             u64,
    pub spolicy:          u64,
    pub flags:            u64,
    pub size:             u64,
    pub used:             u64,
    pub create_time:      u64,
    pub dst_id:           u64,
    pub dst_ctime:        u64,
    pub block_size_shift: u8,
    pub read_counter:     u64,
    pub write_counter:    u64,
    /// Attribute name and value pairs, in insertion order.
    pub xattrs:           Vec<(String, String)>,
}

/// Reject attributes whose name or value does not fit the u16 length fields.
pub(crate) fn check_xattr_len(chunk_id: ChunkId, name: &str, value: &str) -> Result<()> {
    ensure!(
        name.len() <= u16::MAX as usize && value.len() <= u16::MAX as usize,
        XattrTooLongSnafu {
            chunk_id,
            name_len: name.len(),
            value_len: value.len(),
        }
    );
    Ok(())
}

impl ChunkDescriptor {
    fn encode_base(&self) -> Vec<u8> {
        let mut enc = Encoder::with_capacity(BASE_RECORD_LEN);
        enc.put_u8(TYPE_BASE);
        enc.put_u32(BASE_RECORD_LEN as u32);
        enc.put_u64(self.chunk_id);
        enc.put_u64(self.vol_id);
        enc.put_u64(self.index);
        enc.put_u64(self.stat);
        enc.put_u64(self.spolicy);
        enc.put_u64(self.flags);
        enc.put_u64(self.size);
        enc.put_u64(self.used);
        enc.put_u64(self.create_time);
        enc.put_u64(self.dst_id);
        enc.put_u64(self.dst_ctime);
        enc.put_u64(self.xattrs.len() as u64);
        enc.put_u8(self.block_size_shift);
        enc.put_u64(self.read_counter);
        enc.put_u64(self.write_counter);
        debug_assert_eq!(enc.len(), BASE_RECORD_LEN);
        enc.finish()
    }

    fn encode_xattr(&self, name: &str, value: &str) -> Result<Vec<u8>> {
        check_xattr_len(self.chunk_id, name, value)?;
        let len = XATTR_HEADER_LEN + name.len() + value.len();
        let mut enc = Encoder::with_capacity(len);
        enc.put_u8(TYPE_XATTR);
        enc.put_u32(len as u32);
        enc.put_u16(name.len() as u16);
        enc.put_u16(value.len() as u16);
        enc.put_bytes(name.as_bytes());
        enc.put_bytes(value.as_bytes());
        Ok(enc.finish())
    }

    /// Serialize into the list of records, base record first.
    pub(crate) fn encode(&self) -> Result<Vec<Vec<u8>>> {
        let mut records = Vec::with_capacity(1 + self.xattrs.len());
        records.push(self.encode_base());
        for (name, value) in &self.xattrs {
            records.push(self.encode_xattr(name, value)?);
        }
        Ok(records)
    }

    /// Atomically replace the descriptor at `path`.
    ///
    /// On any failure the temp file is removed and whatever was at `path`
    /// before is left untouched.
    pub fn store(&self, path: &Path) -> Result<()> {
        let records = self.encode()?;
        let temp = temp_path(path);
        let persist_err = |p: &Path| IoSnafu {
            op:   StoreOp::ChunkPersist,
            path: p.to_path_buf(),
        };

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(DESCRIPTOR_FILE_MODE)
            .open(&temp)
            .context(persist_err(&temp))?;
        let temp_guard = scopeguard::guard(temp.clone(), |t| {
            if let Err(e) = fs::remove_file(&t) {
                warn!(path = ?t, "failed to remove temp descriptor: {e}");
            }
        });

        let mut offset = 0u64;
        for record in &records {
            let n = file
                .write_at(record, offset)
                .context(persist_err(&temp))?;
            if n != record.len() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    format!("wrote {} of {} bytes at offset {}", n, record.len(), offset),
                ))
                .context(persist_err(&temp));
            }
            offset += n as u64;
        }
        file.sync_data().context(persist_err(&temp))?;

        let size_hex = format!("{:x}", self.size);
        if let Err(e) =
            rustix::fs::fsetxattr(&file, CHUNK_SIZE_XATTR, size_hex.as_bytes(), XattrFlags::empty())
        {
            warn!(chunk_id = self.chunk_id, path = ?temp, "cannot record chunk size xattr: {e}");
        }
        drop(file);

        fs::rename(&temp, path).context(persist_err(path))?;
        ScopeGuard::into_inner(temp_guard);
        debug!(chunk_id = self.chunk_id, ?path, bytes = offset, "descriptor stored");
        Ok(())
    }

    pub fn load(path: &Path) -> Result<ChunkDescriptor> {
        let load_err = || IoSnafu {
            op:   StoreOp::ChunkLoad,
            path: path.to_path_buf(),
        };
        let corrupt = |reason: String| CorruptDescriptorSnafu {
            path: path.to_path_buf(),
            reason,
        };

        let file = fs::File::open(path).context(load_err())?;
        let mut base = [0u8; BASE_RECORD_LEN];
        file.read_exact_at(&mut base, 0).context(load_err())?;

        let mut dec = Decoder::new(&base);
        let short = || corrupt("truncated base record".to_string());
        let typ = dec.get_u8().with_context(short)?;
        ensure!(
            typ == TYPE_BASE,
            corrupt(format!("base record has type {:#x}", typ))
        );
        let length = dec.get_u32().with_context(short)?;
        ensure!(
            length as usize == BASE_RECORD_LEN,
            corrupt(format!("base record claims {} bytes", length))
        );

        let mut desc = ChunkDescriptor {
            chunk_id: dec.get_u64().with_context(short)?,
            vol_id: dec.get_u64().with_context(short)?,
            index: dec.get_u64().with_context(short)?,
            stat: dec.get_u64().with_context(short)?,
            spolicy: dec.get_u64().with_context(short)?,
            flags: dec.get_u64().with_context(short)?,
            size: dec.get_u64().with_context(short)?,
            used: dec.get_u64().with_context(short)?,
            create_time: dec.get_u64().with_context(short)?,
            dst_id: dec.get_u64().with_context(short)?,
            dst_ctime: dec.get_u64().with_context(short)?,
            ..Default::default()
        };
        let xattr_num = dec.get_u64().with_context(short)?;
        desc.block_size_shift = dec.get_u8().with_context(short)?;
        desc.read_counter = dec.get_u64().with_context(short)?;
        desc.write_counter = dec.get_u64().with_context(short)?;
        ensure!(
            desc.block_size_shift < 64,
            corrupt(format!("object shift {} is too large", desc.block_size_shift))
        );

        let mut offset = BASE_RECORD_LEN as u64;
        for i in 0..xattr_num {
            let mut header = [0u8; XATTR_HEADER_LEN];
            file.read_exact_at(&mut header, offset)
                .context(load_err())?;
            let mut dec = Decoder::new(&header);
            let short = || corrupt(format!("truncated xattr header {}", i));
            let typ = dec.get_u8().with_context(short)?;
            ensure!(
                typ == TYPE_XATTR,
                corrupt(format!("xattr record {} has type {:#x}", i, typ))
            );
            let _length = dec.get_u32().with_context(short)?;
            let name_len = dec.get_u16().with_context(short)? as usize;
            let value_len = dec.get_u16().with_context(short)? as usize;
            offset += XATTR_HEADER_LEN as u64;

            let mut kv = vec![0u8; name_len + value_len];
            file.read_exact_at(&mut kv, offset).context(load_err())?;
            offset += kv.len() as u64;

            let value = kv.split_off(name_len);
            let name = String::from_utf8(kv)
                .map_err(|_| corrupt(format!("xattr {} name is not utf-8", i)).build())?;
            let value = String::from_utf8(value)
                .map_err(|_| corrupt(format!("xattr {} value is not utf-8", i)).build())?;
            desc.xattrs.push((name, value));
        }
        Ok(desc)
    }
}

/// The chunk size recorded on a descriptor file at persistence time.
pub fn read_size_xattr(path: &Path) -> Option<u64> {
    let mut buf = [0u8; 64];
    let n = rustix::fs::getxattr(path, CHUNK_SIZE_XATTR, &mut buf).ok()?;
    let text = std::str::from_utf8(&buf[..n]).ok()?;
    u64::from_str_radix(text.trim_end_matches('\0').trim(), 16).ok()
}
