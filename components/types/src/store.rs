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

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

/// [StoreInfo] is the store-wide record kept in the superblock.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreInfo {
    /// [id] assigned by whoever registers the store.
    pub id:           u64,
    pub cluster_name: String,
    pub name:         String,
    /// [size] is the configured capacity in bytes.
    pub size:         u64,
    /// [used] is the sum of the sizes of all created chunks.
    pub used:         u64,
    /// [ftime] format time, in milliseconds since the epoch.
    pub ftime:        u64,
    pub chunk_count:  u32,
}

impl StoreInfo {
    pub fn available(&self) -> u64 { self.size.saturating_sub(self.used) }
}

/// How chunk reads and writes are dispatched.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
pub enum IoMode {
    #[default]
    #[strum(to_string = "sync", serialize = "Sync")]
    Sync,
    #[strum(to_string = "async", serialize = "Async")]
    Async,
}

impl IoMode {
    pub fn is_async(&self) -> bool { matches!(self, IoMode::Async) }
}

/// What [dev_check] found on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum DevStatus {
    /// Empty or unusable device, or an invalid configuration.
    None = 0,
    /// Data of an unknown layout.
    Unknown = 1,
    /// A valid store belonging to another cluster.
    ClusterOut = 2,
    /// A valid store of the configured cluster.
    ClusterIn = 3,
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn io_mode_tokens() {
        assert_eq!(IoMode::from_str("sync").unwrap(), IoMode::Sync);
        assert_eq!(IoMode::from_str("Sync").unwrap(), IoMode::Sync);
        assert_eq!(IoMode::from_str("async").unwrap(), IoMode::Async);
        assert_eq!(IoMode::from_str("Async").unwrap(), IoMode::Async);
        assert!(IoMode::from_str("ASYNC").is_err());
        assert_eq!(IoMode::Async.to_string(), "async");
    }
}
