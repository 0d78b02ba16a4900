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


//! Chunk storage: fixed size chunks striped over object files, with an
//! in-memory backend for running without real storage.

mod aio;
mod backend;
mod chunk;
mod chunk_map;
mod codec;
mod config;
mod context;
mod descriptor;
pub mod err;
mod filestore;
mod layout;
mod object;
mod reactor;
mod simstore;
pub mod split;
mod superblock;

pub use aio::{ReadCallback, WriteCallback};
pub use backend::{open_store, ChunkHandle, ChunkStore, StoreKind};
pub use chunk::{ChunkRef, FileChunk};
pub use chunk_map::ChunkMap;
pub use config::FileStoreConfig;
pub use context::StoreContext;
pub use descriptor::ChunkDescriptor;
pub use err::{Error, ErrorKind, Result};
pub use filestore::{FileStore, FileStoreState, FILESTORE_DRIVER};
pub use layout::StoreLayout;
pub use object::{Object, ObjectRef, ObjectState};
pub use simstore::{SimBlock, SimChunk, SimChunkRef, SimStore, SIMSTORE_DRIVER};
