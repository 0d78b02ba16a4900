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

use tsumiki_common::TSUMIKI;

/// [StoreContext] carries the identity of the node a store runs on. It is
/// handed to every store constructor and lives as long as the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreContext {
    /// [cluster_name] seeds the store info at format time.
    pub cluster_name: String,
    /// [node_name] becomes the store name at format time.
    pub node_name:    String,
}

impl Default for StoreContext {
    fn default() -> Self {
        StoreContext {
            cluster_name: String::from(TSUMIKI),
            node_name:    String::from("localhost"),
        }
    }
}

impl StoreContext {
    pub fn new(cluster_name: impl Into<String>, node_name: impl Into<String>) -> Self {
        StoreContext {
            cluster_name: cluster_name.into(),
            node_name:    node_name.into(),
        }
    }
}
