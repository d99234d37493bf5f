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

use anyhow::ensure;
use bytesize::ByteSize;
use serde::{Deserialize, Serialize};

/// Memory admission control configuration.
///
/// The total budget is split into a shared application ceiling and two
/// per-workload ceilings through ratios. Ratios may be negative: a negative
/// derived quota turns admission into a no-op for that workload (see
/// [`MemoryQuotas`]).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct HerderConfig {
    /// Total memory budget for the process. `0` disables admission control
    /// entirely.
    pub mem_quota: ByteSize,
    /// Fraction of `mem_quota` usable by indexing and querying combined.
    pub app_ratio: f64,
    /// Fraction of the app quota reserved as the indexing ceiling.
    pub index_ratio: f64,
    /// Fraction of the app quota reserved as the querying ceiling.
    pub query_ratio: f64,
}

impl Default for HerderConfig {
    fn default() -> Self {
        Self {
            mem_quota: ByteSize(0),
            app_ratio: 1.0,
            index_ratio: 0.75,
            query_ratio: 0.25,
        }
    }
}

impl HerderConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(
            self.app_ratio.is_finite()
                && self.index_ratio.is_finite()
                && self.query_ratio.is_finite(),
            "herder ratios must be finite, got app: {}, index: {}, query: {}",
            self.app_ratio,
            self.index_ratio,
            self.query_ratio
        );
        Ok(())
    }

    /// Derives the signed quota bundle used for admission decisions.
    pub fn quotas(&self) -> MemoryQuotas {
        let mem_quota = self.mem_quota.as_u64() as i64;
        let app_quota = (mem_quota as f64 * self.app_ratio) as i64;
        let index_quota = (app_quota as f64 * self.index_ratio) as i64;
        let query_quota = (app_quota as f64 * self.query_ratio) as i64;
        MemoryQuotas {
            mem_quota,
            app_quota,
            index_quota,
            query_quota,
        }
    }
}

/// Derived quotas, in bytes, signed to encode the disabled/bypass
/// conventions:
///
/// - a quota `<= 0` is not checked;
/// - `index_quota < 0` (resp. `query_quota < 0`) additionally skips the
///   `app_quota` check for batches (resp. queries), making admission a
///   no-op for that workload.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MemoryQuotas {
    pub mem_quota: i64,
    pub app_quota: i64,
    pub index_quota: i64,
    pub query_quota: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_disables_admission() {
        let config = HerderConfig::default();
        config.validate().unwrap();
        let quotas = config.quotas();
        assert_eq!(quotas.app_quota, 0);
        assert_eq!(quotas.index_quota, 0);
        assert_eq!(quotas.query_quota, 0);
    }

    #[test]
    fn test_quota_derivation() {
        let config = HerderConfig {
            mem_quota: ByteSize(1_000),
            app_ratio: 0.8,
            index_ratio: 0.5,
            query_ratio: 0.25,
        };
        let quotas = config.quotas();
        assert_eq!(quotas.mem_quota, 1_000);
        assert_eq!(quotas.app_quota, 800);
        assert_eq!(quotas.index_quota, 400);
        assert_eq!(quotas.query_quota, 200);
    }

    #[test]
    fn test_negative_ratio_yields_bypass_quota() {
        let config = HerderConfig {
            mem_quota: ByteSize::gb(1),
            app_ratio: 1.0,
            index_ratio: -1.0,
            query_ratio: 1.0,
        };
        config.validate().unwrap();
        let quotas = config.quotas();
        assert!(quotas.index_quota < 0);
        assert!(quotas.query_quota > 0);
    }

    #[test]
    fn test_non_finite_ratio_rejected() {
        let config = HerderConfig {
            query_ratio: f64::NAN,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_deserialization() {
        let config: HerderConfig = serde_json::from_str(
            r#"{"mem_quota": "2GB", "app_ratio": 0.9, "index_ratio": 0.5, "query_ratio": 0.25}"#,
        )
        .unwrap();
        assert_eq!(config.mem_quota, ByteSize::gb(2));
        assert_eq!(config.app_ratio, 0.9);

        let partial: HerderConfig = serde_json::from_str(r#"{"mem_quota": "512MB"}"#).unwrap();
        assert_eq!(partial.mem_quota, ByteSize::mb(512));
        assert_eq!(partial.index_ratio, 0.75);

        let unknown = serde_json::from_str::<HerderConfig>(r#"{"mem_quotaa": "512MB"}"#);
        assert!(unknown.is_err());
    }
}
