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
    fs::{self, OpenOptions},
    io::ErrorKind,
    os::unix::fs::{FileExt, OpenOptionsExt},
    path::Path,
};

use scopeguard::ScopeGuard;
use snafu::{OptionExt, ResultExt};
use tracing::{debug, warn};
use tsumiki_types::StoreInfo;

use crate::{
    codec::{Decoder, Encoder},
    err::{CorruptDescriptorSnafu, IoSnafu, NoSuperblockSnafu, Result, StoreOp},
    layout::temp_path,
};

const NAME_WIDTH: usize = 256;
pub(crate) const SUPERBLOCK_LEN: usize = NAME_WIDTH * 2 + 8 * 5;

fn encode(info: &StoreInfo) -> Vec<u8> {
    let mut enc = Encoder::with_capacity(SUPERBLOCK_LEN);
    enc.put_fixed_str(&info.cluster_name, NAME_WIDTH);
    enc.put_fixed_str(&info.name, NAME_WIDTH);
    enc.put_u64(info.id);
    enc.put_u64(info.size);
    enc.put_u64(info.used);
    enc.put_u64(info.ftime);
    enc.put_u64(info.chunk_count as u64);
    enc.finish()
}

/// Write the store info as one fixed size record, through a temp file and a
/// rename like chunk descriptors.
pub(crate) fn persist_super(path: &Path, info: &StoreInfo) -> Result<()> {
    let buf = encode(info);
    let temp = temp_path(path);
    let ctx = |p: &Path| IoSnafu {
        op:   StoreOp::PersistSuper,
        path: p.to_path_buf(),
    };

    // A temp file left by a crashed writer is ours to replace.
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o660)
        .open(&temp)
        .context(ctx(&temp))?;
    let guard = scopeguard::guard(temp.clone(), |t| {
        if let Err(e) = fs::remove_file(&t) {
            warn!(path = ?t, "failed to remove temp superblock: {e}");
        }
    });
    let n = file.write_at(&buf, 0).context(ctx(&temp))?;
    if n != buf.len() {
        return Err(std::io::Error::new(
            ErrorKind::WriteZero,
            format!("wrote {} of {} superblock bytes", n, buf.len()),
        ))
        .context(ctx(&temp));
    }
    file.sync_data().context(ctx(&temp))?;
    drop(file);
    fs::rename(&temp, path).context(ctx(path))?;
    ScopeGuard::into_inner(guard);
    debug!(?path, id = info.id, chunks = info.chunk_count, "superblock persisted");
    Ok(())
}

pub(crate) fn load_super(path: &Path) -> Result<StoreInfo> {
    let file = match fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return NoSuperblockSnafu { path }.fail();
        }
        Err(e) => {
            return Err(e).context(IoSnafu {
                op: StoreOp::LoadSuper,
                path,
            })
        }
    };
    let mut buf = [0u8; SUPERBLOCK_LEN];
    file.read_exact_at(&mut buf, 0).context(IoSnafu {
        op: StoreOp::LoadSuper,
        path,
    })?;

    let short = || CorruptDescriptorSnafu {
        path,
        reason: "truncated superblock",
    };
    let mut dec = Decoder::new(&buf);
    let cluster_name = dec.get_fixed_str(NAME_WIDTH).with_context(short)?;
    let name = dec.get_fixed_str(NAME_WIDTH).with_context(short)?;
    Ok(StoreInfo {
        cluster_name,
        name,
        id: dec.get_u64().with_context(short)?,
        size: dec.get_u64().with_context(short)?,
        used: dec.get_u64().with_context(short)?,
        ftime: dec.get_u64().with_context(short)?,
        chunk_count: dec.get_u64().with_context(short)? as u32,
    })
}
