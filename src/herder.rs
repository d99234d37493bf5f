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

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{HerderConfig, MemoryQuotas};
use crate::counters::MemoryCounters;
use crate::error::HerderError;
use crate::metrics::HERDER_METRICS;

/// Callback returning an engine's current in-memory footprint in bytes.
///
/// Invoked with the herder lock held: it must be cheap and must not call
/// back into the herder.
pub type SizeFn = Box<dyn Fn() -> u64 + Send + Sync + 'static>;

/// Opaque identity of a live engine instance in the herder registry.
///
/// Derived from the engine's shared pointer, so every event carrying the
/// same live engine maps to the same registry entry.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct EngineHandle(usize);

impl EngineHandle {
    pub fn of<T: ?Sized>(engine: &Arc<T>) -> Self {
        EngineHandle(Arc::as_ptr(engine) as *const () as usize)
    }
}

#[derive(Debug, Default)]
struct HerderStats {
    tot_waiting_in: AtomicU64,
    tot_waiting_out: AtomicU64,
    tot_on_batch_execute_start_beg: AtomicU64,
    tot_on_batch_execute_start_end: AtomicU64,
}

/// Point-in-time view of the herder's monotonic counters.
///
/// Serialized field names match the counter names consumers scrape
/// (`TotWaitingIn`, `TotWaitingOut`, ...).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct HerderStatsSnapshot {
    pub tot_waiting_in: u64,
    pub tot_waiting_out: u64,
    pub tot_on_batch_execute_start_beg: u64,
    pub tot_on_batch_execute_start_end: u64,
}

/// State guarded by the herder mutex.
struct MutableState {
    indexes: HashMap<EngineHandle, SizeFn>,
    waiting: u64,
    running_query_used: u64,
}

/// Coordinates the memory appetite of every indexing and querying actor in
/// the process against a single quota bundle.
///
/// Index batch workers call [`on_batch_execute_start`](Self::on_batch_execute_start)
/// and may park in a condition-variable gate until memory accounting clears.
/// Queries call [`on_query_start`](Self::on_query_start) and are admitted or
/// rejected without ever blocking. Progress hooks broadcast to parked
/// workers whenever memory plausibly got released.
pub struct AppHerder {
    quotas: MemoryQuotas,
    counters: Arc<MemoryCounters>,
    over_quota_tx: Option<mpsc::Sender<()>>,
    state: Mutex<MutableState>,
    batch_may_proceed: Condvar,
    stats: HerderStats,
}

impl AppHerder {
    /// `over_quota_tx`, when provided, receives a best-effort advisory
    /// signal each time work is gated or rejected. Consumers typically react
    /// by forcing a persister flush.
    pub fn new(
        config: &HerderConfig,
        counters: Arc<MemoryCounters>,
        over_quota_tx: Option<mpsc::Sender<()>>,
    ) -> Self {
        let quotas = config.quotas();
        info!(
            mem_quota = quotas.mem_quota,
            app_quota = quotas.app_quota,
            index_quota = quotas.index_quota,
            query_quota = quotas.query_quota,
            "memory admission control configured"
        );
        if quotas.app_quota <= 0 {
            info!("app quota disabled");
        }
        if quotas.index_quota <= 0 {
            info!("index quota disabled");
        }
        if quotas.index_quota < 0 {
            info!("indexing also ignores the app quota");
        }
        if quotas.query_quota <= 0 {
            info!("query quota disabled");
        }
        if quotas.query_quota < 0 {
            info!("querying also ignores the app quota");
        }
        AppHerder {
            quotas,
            counters,
            over_quota_tx,
            state: Mutex::new(MutableState {
                indexes: HashMap::new(),
                waiting: 0,
                running_query_used: 0,
            }),
            batch_may_proceed: Condvar::new(),
            stats: HerderStats::default(),
        }
    }

    pub fn quotas(&self) -> MemoryQuotas {
        self.quotas
    }

    pub fn stats(&self) -> HerderStatsSnapshot {
        HerderStatsSnapshot {
            tot_waiting_in: self.stats.tot_waiting_in.load(Ordering::Relaxed),
            tot_waiting_out: self.stats.tot_waiting_out.load(Ordering::Relaxed),
            tot_on_batch_execute_start_beg: self
                .stats
                .tot_on_batch_execute_start_beg
                .load(Ordering::Relaxed),
            tot_on_batch_execute_start_end: self
                .stats
                .tot_on_batch_execute_start_end
                .load(Ordering::Relaxed),
        }
    }

    /// Estimated bytes of all currently admitted queries.
    pub fn running_query_memory(&self) -> u64 {
        self.state.lock().unwrap().running_query_used
    }

    /// Number of live engines currently registered.
    pub fn num_registered_engines(&self) -> usize {
        self.state.lock().unwrap().indexes.len()
    }

    /// Gates an index batch behind the memory quota.
    ///
    /// Registers the engine on first sight so its own footprint counts
    /// against the check, then parks the calling worker until accounting
    /// clears. Never fails: the worker either proceeds immediately or blocks
    /// until a progress event releases it.
    pub fn on_batch_execute_start(&self, handle: EngineHandle, size_fn: SizeFn) {
        // A negative index quota admits everything without accounting; zero
        // skips the index check but leaves the app quota enforced.
        if self.quotas.index_quota < 0 {
            return;
        }
        self.stats
            .tot_on_batch_execute_start_beg
            .fetch_add(1, Ordering::Relaxed);

        let mut state = self.state.lock().unwrap();
        state.indexes.insert(handle, size_fn);

        let mut was_waiting = false;
        while self.over_mem_quota_for_indexing(&state) {
            was_waiting = true;
            self.stats.tot_waiting_in.fetch_add(1, Ordering::Relaxed);
            state.waiting += 1;
            HERDER_METRICS.blocked_batch_workers.inc();
            info!(
                indexes = state.indexes.len(),
                waiting = state.waiting,
                "indexing over memory quota, waiting for progress"
            );
            self.signal_over_quota();

            state = self.batch_may_proceed.wait(state).unwrap();

            state.waiting -= 1;
            HERDER_METRICS.blocked_batch_workers.dec();
            self.stats.tot_waiting_out.fetch_add(1, Ordering::Relaxed);
            debug!(
                indexes = state.indexes.len(),
                waiting = state.waiting,
                "re-checking memory quota"
            );
        }
        if was_waiting {
            info!(
                indexes = state.indexes.len(),
                waiting = state.waiting,
                "indexing proceeding"
            );
        }
        drop(state);

        self.stats
            .tot_on_batch_execute_start_end
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Drops the engine from the registry and wakes gated workers.
    pub fn on_close(&self, handle: EngineHandle) {
        let mut state = self.state.lock().unwrap();
        state.indexes.remove(&handle);
        self.awake_waiters_locked(&state, "closing index");
    }

    pub fn on_persister_progress(&self) {
        self.awake_waiters("persister progress");
    }

    pub fn on_merger_progress(&self) {
        self.awake_waiters("merger progress");
    }

    /// Called by the memory watcher when resident memory shrank. The values
    /// are informational; any decrease is reason enough to re-check.
    pub fn on_memory_used_dropped(&self, cur_memory_used: u64, prev_memory_used: u64) {
        debug!(
            cur = cur_memory_used,
            prev = prev_memory_used,
            "process memory usage dropped"
        );
        self.awake_waiters("memory used dropped");
    }

    fn awake_waiters(&self, reason: &'static str) {
        let state = self.state.lock().unwrap();
        self.awake_waiters_locked(&state, reason);
    }

    fn awake_waiters_locked(&self, state: &MutableState, reason: &'static str) {
        if state.waiting > 0 {
            info!(
                reason,
                indexes = state.indexes.len(),
                waiting = state.waiting,
                "waking gated batch workers"
            );
            HERDER_METRICS.waiter_wakeups_total.inc();
            self.batch_may_proceed.notify_all();
        }
    }

    fn indexing_memory(&self, state: &MutableState) -> u64 {
        state.indexes.values().map(|size_fn| size_fn()).sum()
    }

    fn over_mem_quota_for_indexing(&self, state: &MutableState) -> bool {
        // If every registered engine reports zero in-memory bytes, all
        // indexed data has been persisted. Admit: no persister or merger
        // progress is coming to wake us.
        if self.indexing_memory(state) == 0 {
            return false;
        }
        let pre_indexing_memory = self.counters.pre_indexing_memory();
        let mem_used = self.counters.process_memory_used() as i64 + pre_indexing_memory as i64;
        if self.quotas.index_quota > 0 && mem_used > self.quotas.index_quota {
            info!(
                index_quota = self.quotas.index_quota,
                mem_used, pre_indexing_memory, "indexing over index quota"
            );
            return true;
        }
        self.quotas.app_quota > 0 && mem_used > self.quotas.app_quota
    }

    /// Admits or rejects a query based on its estimated footprint.
    ///
    /// Only top-level queries (`depth == 0`) can be rejected: a sub-query's
    /// parent already holds accounting, and turning the child away would
    /// strand the parent mid-execution. The first size-estimated query also
    /// always passes, so the node stays able to serve at least one query
    /// under pressure. Queries never block.
    pub fn on_query_start(&self, depth: u32, size: u64) -> crate::Result<()> {
        // A negative query quota admits everything without accounting; zero
        // skips the query check but leaves the app quota enforced.
        if self.quotas.query_quota < 0 {
            return Ok(());
        }
        let mut state = self.state.lock().unwrap();
        if depth == 0 && state.running_query_used > 0 {
            let mem_used = self.counters.process_memory_used() as i64 + size as i64;
            let exceeded_quota = if self.quotas.query_quota > 0 && mem_used > self.quotas.query_quota
            {
                Some(("query", self.quotas.query_quota))
            } else if self.quotas.app_quota > 0 && mem_used > self.quotas.app_quota {
                Some(("app", self.quotas.app_quota))
            } else {
                None
            };
            if let Some((quota_kind, quota)) = exceeded_quota {
                warn!(
                    quota_kind,
                    quota,
                    estimated_size = size,
                    running_query_used = state.running_query_used,
                    mem_used,
                    "rejecting query over memory quota"
                );
                drop(state);
                HERDER_METRICS.queries_rejected_total.inc();
                self.signal_over_quota();
                return Err(HerderError::SearchRequestRejected);
            }
        }
        state.running_query_used += size;
        Ok(())
    }

    /// Releases the accounting taken at query start and wakes gated workers.
    ///
    /// Always honored, whatever the depth, to keep the accumulator paired
    /// with admissions.
    pub fn on_query_end(&self, depth: u32, size: u64) {
        let mut state = self.state.lock().unwrap();
        debug_assert!(
            state.running_query_used >= size,
            "query start/end accounting out of pairs"
        );
        state.running_query_used = state.running_query_used.saturating_sub(size);
        debug!(
            depth,
            size,
            running_query_used = state.running_query_used,
            "query ended"
        );
        self.awake_waiters_locked(&state, "query ended");
    }

    fn signal_over_quota(&self) {
        if let Some(over_quota_tx) = &self.over_quota_tx {
            // Must not block: progress callbacks take the herder lock too.
            if over_quota_tx.try_send(()).is_ok() {
                HERDER_METRICS.over_quota_signals_total.inc();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HerderConfig;
    use bytesize::ByteSize;

    fn herder(
        mem_quota: u64,
        ratios: (f64, f64, f64),
        rss: u64,
    ) -> (AppHerder, Arc<MemoryCounters>) {
        let counters = Arc::new(MemoryCounters::default());
        counters.set_process_memory_used(rss);
        let config = HerderConfig {
            mem_quota: ByteSize(mem_quota),
            app_ratio: ratios.0,
            index_ratio: ratios.1,
            query_ratio: ratios.2,
        };
        (AppHerder::new(&config, counters.clone(), None), counters)
    }

    fn constant_size(num_bytes: u64) -> SizeFn {
        Box::new(move || num_bytes)
    }

    fn test_handle(id: usize) -> EngineHandle {
        EngineHandle(id)
    }

    #[test]
    fn test_stats_snapshot_field_names() {
        let (herder, _) = herder(0, (1.0, 1.0, 1.0), 0);
        let stats_json = serde_json::to_value(herder.stats()).unwrap();
        for key in [
            "TotWaitingIn",
            "TotWaitingOut",
            "TotOnBatchExecuteStartBeg",
            "TotOnBatchExecuteStartEnd",
        ] {
            assert!(stats_json.get(key).is_some(), "missing key {key}");
        }
    }

    #[test]
    fn test_negative_index_quota_bypasses_gate_entirely() {
        let (herder, _) = herder(1_000_000_000, (1.0, -1.0, 1.0), 10_000_000_000);
        herder.on_batch_execute_start(test_handle(1), constant_size(u64::MAX / 2));
        // The bypass path does not even register the engine.
        assert_eq!(herder.num_registered_engines(), 0);
        let stats = herder.stats();
        assert_eq!(stats.tot_on_batch_execute_start_beg, 0);
        assert_eq!(stats.tot_on_batch_execute_start_end, 0);
        assert_eq!(stats.tot_waiting_in, 0);
    }

    #[test]
    fn test_zero_engine_memory_admits_despite_high_rss() {
        let (herder, _) = herder(100, (1.0, 1.0, 1.0), 1_000_000);
        herder.on_batch_execute_start(test_handle(1), constant_size(0));
        let stats = herder.stats();
        assert_eq!(stats.tot_on_batch_execute_start_beg, 1);
        assert_eq!(stats.tot_on_batch_execute_start_end, 1);
        assert_eq!(stats.tot_waiting_in, 0);
    }

    #[test]
    fn test_admits_under_quota() {
        let (herder, _) = herder(1_000, (1.0, 1.0, 1.0), 100);
        herder.on_batch_execute_start(test_handle(1), constant_size(50));
        assert_eq!(herder.num_registered_engines(), 1);
        assert_eq!(herder.stats().tot_waiting_in, 0);
    }

    #[test]
    fn test_registration_is_idempotent() {
        let (herder, _) = herder(1_000, (1.0, 1.0, 1.0), 100);
        herder.on_batch_execute_start(test_handle(7), constant_size(10));
        herder.on_batch_execute_start(test_handle(7), constant_size(20));
        assert_eq!(herder.num_registered_engines(), 1);
    }

    #[test]
    fn test_broadcast_without_waiters_is_noop() {
        let (herder, _) = herder(1_000, (1.0, 1.0, 1.0), 100);
        herder.on_persister_progress();
        herder.on_merger_progress();
        herder.on_memory_used_dropped(10, 20);
        herder.on_close(test_handle(1));
        assert_eq!(herder.stats().tot_waiting_out, 0);
    }

    #[test]
    fn test_negative_query_quota_admits_everything() {
        let (herder, _) = herder(100, (1.0, 1.0, -1.0), 1_000_000);
        for _ in 0..10 {
            herder.on_query_start(0, u64::MAX / 16).unwrap();
        }
        // The bypass path does not account either.
        assert_eq!(herder.running_query_memory(), 0);
    }

    #[test]
    fn test_first_query_always_admitted() {
        let (herder, _) = herder(100, (1.0, 1.0, 0.5), 1_000_000);
        herder.on_query_start(0, 1_000_000).unwrap();
        assert_eq!(herder.running_query_memory(), 1_000_000);
    }

    #[test]
    fn test_second_query_rejected_over_quota() {
        let (herder, _) = herder(100, (1.0, 1.0, 0.5), 45);
        herder.on_query_start(0, 10).unwrap();
        let rejection = herder.on_query_start(0, 20).unwrap_err();
        assert_eq!(rejection, HerderError::SearchRequestRejected);
        assert_eq!(herder.running_query_memory(), 10);
    }

    #[test]
    fn test_query_rejected_by_app_quota_when_query_quota_zero() {
        // query_quota == 0 skips the query check but not the app one.
        let (herder, _) = herder(100, (1.0, 1.0, 0.0), 95);
        herder.on_query_start(0, 2).unwrap();
        assert!(herder.on_query_start(0, 50).is_err());
    }

    #[test]
    fn test_nested_query_never_rejected() {
        let (herder, _) = herder(100, (1.0, 1.0, 0.5), 1_000_000);
        herder.on_query_start(0, 1_000).unwrap();
        herder.on_query_start(2, 1_000_000).unwrap();
        assert_eq!(herder.running_query_memory(), 1_001_000);
    }

    #[test]
    fn test_query_pairing_returns_accumulator_to_zero() {
        let (herder, _) = herder(1_000_000, (1.0, 1.0, 1.0), 10);
        let sizes = [10u64, 200, 3_000, 40_000];
        for &size in &sizes {
            herder.on_query_start(0, size).unwrap();
        }
        for &size in sizes.iter().rev() {
            herder.on_query_end(0, size);
        }
        assert_eq!(herder.running_query_memory(), 0);
    }

    #[test]
    fn test_engine_handle_identity() {
        let engine_a = Arc::new(42u64);
        let engine_b = Arc::new(42u64);
        assert_eq!(EngineHandle::of(&engine_a), EngineHandle::of(&engine_a.clone()));
        assert_ne!(EngineHandle::of(&engine_a), EngineHandle::of(&engine_b));
    }
}
