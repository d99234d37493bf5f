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

// See https://prometheus.io/docs/practices/naming/

use once_cell::sync::Lazy;
use prometheus::{IntCounter, IntGauge, Opts};

fn new_counter(name: &str, description: &str, namespace: &str) -> IntCounter {
    let counter_opts = Opts::new(name, description).namespace(namespace);
    let counter = IntCounter::with_opts(counter_opts).expect("Failed to create counter");
    prometheus::register(Box::new(counter.clone())).expect("Failed to register counter");
    counter
}

fn new_gauge(name: &str, description: &str, namespace: &str) -> IntGauge {
    let gauge_opts = Opts::new(name, description).namespace(namespace);
    let gauge = IntGauge::with_opts(gauge_opts).expect("Failed to create gauge");
    prometheus::register(Box::new(gauge.clone())).expect("Failed to register gauge");
    gauge
}

pub struct HerderMetrics {
    pub blocked_batch_workers: IntGauge,
    pub queries_rejected_total: IntCounter,
    pub over_quota_signals_total: IntCounter,
    pub waiter_wakeups_total: IntCounter,
}

impl Default for HerderMetrics {
    fn default() -> Self {
        HerderMetrics {
            blocked_batch_workers: new_gauge(
                "blocked_batch_workers",
                "Number of index batch workers currently parked in the admission gate.",
                "herder",
            ),
            queries_rejected_total: new_counter(
                "queries_rejected_total",
                "Total number of queries rejected because the node was over its memory quota.",
                "herder",
            ),
            over_quota_signals_total: new_counter(
                "over_quota_signals_total",
                "Total number of advisory over-quota signals emitted.",
                "herder",
            ),
            waiter_wakeups_total: new_counter(
                "waiter_wakeups_total",
                "Total number of broadcasts that woke at least one gated batch worker.",
                "herder",
            ),
        }
    }
}

/// `HERDER_METRICS` exposes admission gate activity through the process
/// prometheus endpoint.
pub static HERDER_METRICS: Lazy<HerderMetrics> = Lazy::new(HerderMetrics::default);
