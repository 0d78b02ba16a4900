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
use snafu::{whatever, ResultExt, Whatever};
use tracing::info;
use tsumiki_types::DevStatus;

use super::StoreArgs;

#[derive(Debug, Clone, Args)]
#[command(long_about = r"

Wipe the store and write fresh store info. Every chunk on it is lost.
")]
pub struct FormatArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    #[arg(long, short, help = "Format a store that belongs to another cluster")]
    pub force: bool,
}

impl FormatArgs {
    pub fn run(&self) -> Result<(), Whatever> {
        let store = self.store.open()?;
        match store.dev_check() {
            DevStatus::ClusterOut if !self.force => {
                whatever!("{} belongs to another cluster, pass --force to format it", self.store.url)
            }
            DevStatus::Unknown if !self.force => {
                whatever!("{} holds unknown data, pass --force to format it", self.store.url)
            }
            _ => {}
        }
        store
            .dev_format()
            .whatever_context("format failed")?;
        let info = store.get_info();
        info!(
            url = %self.store.url,
            cluster = %info.cluster_name,
            name = %info.name,
            "store formatted"
        );
        Ok(())
    }
}
