// Copyright (C) 2024 Quickwit, Inc.
//
// Quickwit is offered under the AGPL v3.0 and as commercial software.
// For commercial licensing, contact us at hello@quickwit.io.
//
// AGPL:
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <http://www.gnu.org/licenses/>.

use std::sync::Arc;
use std::time::Duration;

use tracing::error;

use crate::counters::MemoryCounters;
use crate::herder::AppHerder;

pub const DEFAULT_MEMORY_POLLING_INTERVAL: Duration = Duration::from_secs(1);

/// Periodically publishes the process resident memory into
/// [`MemoryCounters`] and nudges gated batch workers whenever it shrank.
///
/// `sample_resident_bytes` is supplied by the embedding binary: jemalloc
/// `stats.resident`, a cgroup memory file, `/proc/self/statm`, whichever
/// source that binary trusts. A failed sample is logged and skipped; the
/// last published value stays in place.
pub async fn memory_watcher_loop(
    herder: Arc<AppHerder>,
    counters: Arc<MemoryCounters>,
    sample_resident_bytes: impl Fn() -> anyhow::Result<u64> + Send + 'static,
    poll_interval: Duration,
) {
    let mut interval = tokio::time::interval(poll_interval);
    let mut prev_memory_used = 0u64;

    loop {
        interval.tick().await;

        let cur_memory_used = match sample_resident_bytes() {
            Ok(num_bytes) => num_bytes,
            Err(error) => {
                error!(%error, "failed to sample resident memory");
                continue;
            }
        };
        counters.set_process_memory_used(cur_memory_used);

        if cur_memory_used < prev_memory_used {
            herder.on_memory_used_dropped(cur_memory_used, prev_memory_used);
        }
        prev_memory_used = cur_memory_used;
    }
}

/// Spawns [`memory_watcher_loop`] on the current tokio runtime and returns
/// its join handle. Abort the handle to stop the watcher.
pub fn start_memory_watcher(
    herder: Arc<AppHerder>,
    counters: Arc<MemoryCounters>,
    sample_resident_bytes: impl Fn() -> anyhow::Result<u64> + Send + 'static,
    poll_interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::task::spawn(memory_watcher_loop(
        herder,
        counters,
        sample_resident_bytes,
        poll_interval,
    ))
}
