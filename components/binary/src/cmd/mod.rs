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


pub mod bench;
pub mod check;
pub mod format;
pub mod info;

use clap::Args;
use snafu::{ResultExt, Whatever};
use tsumiki_common::TSUMIKI;
use tsumiki_store::{open_store, ChunkStore, StoreContext};
use tsumiki_utils::logger::init_logging;

const STORE_OPTIONS_HEADER: &str = "Store options";

/// Arguments every subcommand takes to find its store.
#[derive(Debug, Clone, Args)]
pub struct StoreArgs {
    #[arg(
        value_name = "STORE_URL",
        help = r"The store to work on, like 'filestore:///data/store/config' or 'simstore://10G:/tmp/sim.bk'"
    )]
    pub url: String,

    #[arg(
        long,
        help = "Cluster the store belongs to",
        help_heading = STORE_OPTIONS_HEADER,
        default_value = TSUMIKI,
    )]
    pub cluster: String,

    #[arg(
        long,
        help = "Name of this node",
        help_heading = STORE_OPTIONS_HEADER,
        default_value = "localhost",
    )]
    pub node: String,

    #[arg(long, help = "Default log level when TSUMIKI_LOG is unset", default_value = "info")]
    pub log_level: String,
}

impl StoreArgs {
    pub fn open(&self) -> Result<ChunkStore, Whatever> {
        init_logging(&self.log_level)?;
        let ctx = StoreContext::new(&self.cluster, &self.node);
        open_store(ctx, &self.url).with_whatever_context(|e| format!("cannot open {}: {e}", self.url))
    }
}
