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

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use tsumiki_common::{ChunkId, VolumeId, DEFAULT_CHUNK_SIZE};

bitflags! {
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ChunkFlags: u32 {
        /// Every object is created and sized at chunk creation time.
        const PREALLOC = 0x01;
    }
}

/// [ChunkInfo] is the public view of a chunk's metadata.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub chk_id:    ChunkId,
    pub vol_id:    VolumeId,
    /// [index] of this chunk within its volume.
    pub index:     u32,
    pub stat:      u32,
    /// [spolicy] is opaque to the store, interpreted by the volume layer.
    pub spolicy:   u32,
    pub flags:     ChunkFlags,
    pub size:      u64,
    pub used:      u64,
    /// [ctime] creation time, in milliseconds since the epoch.
    pub ctime:     u64,
    /// [dst_id] and [dst_ctime] are reserved for migration and are only
    /// carried through persistence.
    pub dst_id:    u64,
    pub dst_ctime: u64,
}

impl ChunkInfo {
    pub fn is_preallocated(&self) -> bool { self.flags.contains(ChunkFlags::PREALLOC) }
}

/// Options accepted by `chunk_create`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkCreateOpts {
    pub vol_id:  VolumeId,
    pub index:   u32,
    pub spolicy: u32,
    pub flags:   ChunkFlags,
    pub size:    u64,
}

impl Default for ChunkCreateOpts {
    fn default() -> Self {
        ChunkCreateOpts {
            vol_id:  0,
            index:   0,
            spolicy: 0,
            flags:   ChunkFlags::empty(),
            size:    DEFAULT_CHUNK_SIZE,
        }
    }
}

impl ChunkCreateOpts {
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    pub fn with_volume(mut self, vol_id: VolumeId, index: u32) -> Self {
        self.vol_id = vol_id;
        self.index = index;
        self
    }

    pub fn with_spolicy(mut self, spolicy: u32) -> Self {
        self.spolicy = spolicy;
        self
    }

    pub fn is_prealloc(&self) -> bool { self.flags.contains(ChunkFlags::PREALLOC) }

    pub fn set_prealloc(&mut self, v: bool) { self.flags.set(ChunkFlags::PREALLOC, v); }

    pub fn with_prealloc(mut self, v: bool) -> Self {
        self.set_prealloc(v);
        self
    }
}

/// One extended attribute of a chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Xattr {
    pub index: u32,
    pub name:  String,
    pub value: String,
}
