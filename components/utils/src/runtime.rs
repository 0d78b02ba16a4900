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

use tokio::runtime::Runtime;
use tracing::debug;

/// Build the runtime whose blocking pool executes submitted object I/O.
///
/// Workers only park; all the work happens on blocking threads, of which at
/// most `max_blocking` run at once.
pub fn build_io_runtime(name: &str, max_blocking: usize) -> std::io::Result<Runtime> {
    let workers = crate::num_cpus::get().clamp(1, 4);
    debug!(name, workers, max_blocking, "start io runtime");
    tokio::runtime::Builder::new_multi_thread()
        .thread_name(name)
        .worker_threads(workers)
        .max_blocking_threads(max_blocking.max(1))
        .enable_all()
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_blocking_on_io_runtime() {
        let rt = build_io_runtime("test-io", 4).unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        rt.spawn_blocking(move || tx.send(42).unwrap());
        assert_eq!(rx.recv().unwrap(), 42);
        rt.shutdown_background();
    }
}
