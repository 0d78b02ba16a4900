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


use clap::Args;
use snafu::{ResultExt, Whatever};
use tsumiki_utils::readable_size::ReadableSize;

use super::StoreArgs;
use crate::build_info;

#[derive(Debug, Clone, Args)]
#[command(long_about = r"

Mount the store, print what it knows about itself and unmount it again.
")]
pub struct InfoArgs {
    #[command(flatten)]
    pub store: StoreArgs,
}

impl InfoArgs {
    pub fn run(&self) -> Result<(), Whatever> {
        let store = self.store.open()?;
        store.dev_mount().whatever_context("mount failed")?;
        let info = store.get_info();
        let config = store
            .config_info()
            .whatever_context("cannot render the config")?;
        println!("build:        {}", build_info::BUILD);
        println!("driver:       {}", store.driver_name());
        println!("config:       {}", config);
        println!("io mode:      {}", store.io_mode());
        println!("id:           {}", info.id);
        println!("cluster:      {}", info.cluster_name);
        println!("name:         {}", info.name);
        println!("size:         {}", ReadableSize(info.size));
        println!("used:         {}", ReadableSize(info.used));
        println!("available:    {}", ReadableSize(info.available()));
        println!("chunks:       {}", info.chunk_count);
        println!("formatted at: {}", info.ftime);
        println!("runtime:      {}", store.runtime_info());
        store.dev_unmount().whatever_context("unmount failed")
    }
}
