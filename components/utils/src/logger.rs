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

use snafu::{whatever, Whatever};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Environment variable consulted for the log filter, e.g.
/// `TSUMIKI_LOG=tsumiki_store=debug`.
pub const LOG_ENV: &str = "TSUMIKI_LOG";

fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Install a pretty stdout subscriber for tests and local runs.
///
/// Safe to call many times: only the first call installs anything, later
/// calls are no-ops.
pub fn install_fmt_log() {
    let stdout_log = tracing_subscriber::fmt::layer().pretty().with_test_writer();
    let _ = Registry::default()
        .with(env_filter("info"))
        .with(stdout_log)
        .try_init();
}

/// Initialize logging to stderr for the command line tools.
///
/// The filter comes from [`LOG_ENV`] and falls back to `default_level`.
pub fn init_logging(default_level: &str) -> Result<(), Whatever> {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_target(false)
        .with_writer(std::io::stderr);

    if let Err(e) = Registry::default()
        .with(env_filter(default_level))
        .with(fmt_layer)
        .try_init()
    {
        whatever!("failed to install the log subscriber: {e}");
    }
    tracing::debug!("logging started");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_twice() {
        install_fmt_log();
        install_fmt_log();
        tracing::info!("still alive");
    }
}
