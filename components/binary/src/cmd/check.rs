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
use snafu::Whatever;
use tracing::info;

use super::StoreArgs;

#[derive(Debug, Clone, Args)]
#[command(long_about = r"

Inspect the store configuration and device without changing anything, and
print one of None, Unknown, ClusterOut or ClusterIn.
")]
pub struct CheckArgs {
    #[command(flatten)]
    pub store: StoreArgs,
}

impl CheckArgs {
    pub fn run(&self) -> Result<(), Whatever> {
        let store = self.store.open()?;
        let status = store.dev_check();
        info!(url = %self.store.url, ?status, "store checked");
        println!("{:?}", status);
        Ok(())
    }
}
