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

//! Memory-pressure admission control for a process that runs indexing and
//! search side by side.
//!
//! A single [`AppHerder`] instance coordinates every memory-hungry actor in
//! the process: index batch workers block in a condition-variable gate until
//! accounting says they fit under the memory quota, incoming queries are
//! admitted or rejected up front based on their estimated footprint, and
//! progress events (persister, merger, index close, query completion,
//! resident-memory drops) wake gated workers so they re-check.
//!
//! The herder deliberately prefers forward progress over strict enforcement:
//! if every registered engine reports zero in-memory bytes, or no
//! size-estimated query is running, work is admitted even while the process
//! is over quota. Refusing in those states could wedge the process forever,
//! because the events that would normally release memory can no longer
//! happen.

pub mod adapters;
mod config;
mod counters;
mod error;
mod herder;
mod metrics;
mod watcher;


pub use adapters::kv::{KvEventBridge, KvStore, KvStoreEvent, KvStoreStats};
pub use adapters::segment::{
    SegmentEpochs, SegmentEventBridge, SegmentIndex, SegmentIndexEvent,
};
pub use config::{HerderConfig, MemoryQuotas};
pub use counters::MemoryCounters;
pub use error::HerderError;
pub use herder::{AppHerder, EngineHandle, HerderStatsSnapshot, SizeFn};
pub use watcher::{memory_watcher_loop, start_memory_watcher, DEFAULT_MEMORY_POLLING_INTERVAL};

/// Refer to this as `app_herder::Result<T>`.
pub type Result<T> = std::result::Result<T, HerderError>;
