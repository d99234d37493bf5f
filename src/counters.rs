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

use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide memory counters fed by collaborators and read by the herder.
///
/// - `process_memory_used` is the resident set size, published by the memory
///   watcher (or any other sampler the embedding service prefers).
/// - `batch_bytes_added` / `batch_bytes_removed` are maintained by the
///   batching layer: added when documents are queued into a batch, removed
///   once the batch has been merged into an engine's in-memory state.
///
/// The herder treats all three as advisory inputs; they are shared as plain
/// atomics so producers never contend on the herder lock.
#[derive(Debug, Default)]
pub struct MemoryCounters {
    process_memory_used: AtomicU64,
    batch_bytes_added: AtomicU64,
    batch_bytes_removed: AtomicU64,
}

impl MemoryCounters {
    pub fn set_process_memory_used(&self, num_bytes: u64) {
        self.process_memory_used.store(num_bytes, Ordering::Relaxed);
    }

    pub fn process_memory_used(&self) -> u64 {
        self.process_memory_used.load(Ordering::Relaxed)
    }

    pub fn add_batch_bytes(&self, num_bytes: u64) {
        self.batch_bytes_added.fetch_add(num_bytes, Ordering::Relaxed);
    }

    pub fn remove_batch_bytes(&self, num_bytes: u64) {
        self.batch_bytes_removed
            .fetch_add(num_bytes, Ordering::Relaxed);
    }

    /// Bytes sitting in batches that have not yet been merged into an
    /// engine's in-memory state.
    ///
    /// This can overlap with what engines report for batches actively being
    /// drained. The overlap is kept: it biases admission toward caution
    /// exactly while memory is in flight.
    pub fn pre_indexing_memory(&self) -> u64 {
        self.batch_bytes_added
            .load(Ordering::Relaxed)
            .saturating_sub(self.batch_bytes_removed.load(Ordering::Relaxed))
    }
}
