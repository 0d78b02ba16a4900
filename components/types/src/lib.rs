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

pub mod chunk;
pub mod store;

pub use chunk::{ChunkCreateOpts, ChunkFlags, ChunkInfo, Xattr};
pub use store::{DevStatus, IoMode, StoreInfo};

/// Maps an error onto the small integer result code of the backend that
/// produced it. Zero is reserved for success and is never returned.
pub trait ToCode {
    fn to_code(&self) -> u8;
}
