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

pub const TSUMIKI: &str = "tsumiki";

// Every chunk is cut into objects of 2^22 bytes unless its descriptor says
// otherwise.
pub const DEFAULT_BLOCK_SIZE_SHIFT: u8 = 22;
pub const DEFAULT_OBJECT_SIZE: u64 = 1 << DEFAULT_BLOCK_SIZE_SHIFT; // 4 MiB

pub const DEFAULT_CHUNK_SIZE: u64 = 1 << 32; // 4 GiB

// Capacity of a chunk's asynchronous I/O context.
pub const DEFAULT_IO_DEPTH: usize = 1024;

// O_DIRECT requests must be aligned to this on offset, length and memory.
pub const DIRECT_IO_ALIGN: usize = 4096;

pub const SUPERBLOCK_FILE: &str = "superblock";
pub const CONFIG_FILE: &str = "config";
pub const TEMP_SUFFIX: &str = ".temp";
pub const CHUNK_SIZE_XATTR: &str = "user.chunk_size";

pub const DEFAULT_DATA_DIR: &str = "store";
pub const DEFAULT_META_DIR: &str = "meta";
pub const DEFAULT_JOURNAL_DIR: &str = "journal";
pub const DEFAULT_BACKUP_DIR: &str = "backup";

// The simulated backend keeps per-block counters at this granularity.
pub const SIM_BLOCK_SIZE: u64 = 1 << 22;

pub type ChunkId = u64;
pub type VolumeId = u64;
pub type ObjectIndex = u64;
pub type ObjectOffset = u64;
pub type ChunkOffset = u64;

pub fn object_size(block_size_shift: u8) -> u64 { 1u64 << block_size_shift }

pub fn cal_object_idx(offset: ChunkOffset, object_size: u64) -> ObjectIndex {
    offset / object_size
}

pub fn cal_object_offset(offset: ChunkOffset, object_size: u64) -> ObjectOffset {
    offset % object_size
}

/// Number of objects backing a chunk of `chunk_size` bytes.
pub fn object_count(chunk_size: u64, object_size: u64) -> u64 {
    chunk_size.div_ceil(object_size)
}

/// File name used for chunk descriptors and data directories.
pub fn chunk_file_name(chunk_id: ChunkId) -> String { format!("{:x}", chunk_id) }

/// File name of an object inside a chunk's data directory.
pub fn object_file_name(index: ObjectIndex) -> String { format!("{:x}", index) }
