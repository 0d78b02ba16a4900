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


use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tsumiki_store::split::split_range;

const OBJECT_SIZE: u64 = 4 << 20;

fn split(c: &mut Criterion) {
    let mut group = c.benchmark_group("split-range");
    for length in [4u64 << 10, 1 << 20, 16 << 20, 256 << 20] {
        group.throughput(Throughput::Elements(length.div_ceil(OBJECT_SIZE) + 1));
        group.bench_with_input(BenchmarkId::from_parameter(length), &length, |b, &length| {
            // start one page into an object so both ends are partial
            b.iter(|| split_range(4096, length, OBJECT_SIZE))
        });
    }
    group.finish();
}

criterion_group!(benches, split);
criterion_main!(benches);
