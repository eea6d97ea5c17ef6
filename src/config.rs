//! Configuration inputs: the tier table, limiter tunables, and breaker settings.
//!
//! All types deserialize with `serde`; durations are written in milliseconds
//! (`cache_ttl_ms`, `call_timeout_ms`, ...). Everything is validated before use, and
//! validation failures surface as [`ConfigError`].

use serde::{Deserialize, Deserializer};
use std::time::Duration;

use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerConfigBuilder};
use crate::error::ConfigError;

fn millis<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
    u64::deserialize(d).map(Duration::from_millis)
}

/// One tier: its degraded-mode quota and its cache trust parameters.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TierSpec {
    pub name: String,
    /// Tokens admitted per degraded window while the store is unreachable.
    pub quota: f64,
    /// Degraded-mode cost multiplier (>= 1).
    pub cost_multiplier: f64,
    /// How long an L1 entry may be served.
    #[serde(rename = "cache_ttl_ms", deserialize_with = "millis")]
    pub cache_ttl: Duration,
    /// L1 serves only while `remaining >= cost * headroom_multiplier`.
    pub headroom_multiplier: f64,
    #[serde(default)]
    pub allow_replica: bool,
    #[serde(rename = "max_replica_lag_ms", deserialize_with = "millis", default)]
    pub max_replica_lag: Duration,
    /// Replica answers count only while `estimated >= cost * replica_safety_margin`.
    #[serde(default = "one")]
    pub replica_safety_margin: f64,
}

fn one() -> f64 {
    1.0
}

impl TierSpec {
    pub fn new(name: impl Into<String>, quota: f64, cost_multiplier: f64) -> Self {
        Self {
            name: name.into(),
            quota,
            cost_multiplier,
            cache_ttl: Duration::from_secs(1),
            headroom_multiplier: 1.0,
            allow_replica: false,
            max_replica_lag: Duration::ZERO,
            replica_safety_margin: 1.0,
        }
    }

    pub fn with_cache(mut self, ttl: Duration, headroom_multiplier: f64) -> Self {
        self.cache_ttl = ttl;
        self.headroom_multiplier = headroom_multiplier;
        self
    }

    pub fn with_replica(mut self, max_lag: Duration, safety_margin: f64) -> Self {
        self.allow_replica = true;
        self.max_replica_lag = max_lag;
        self.replica_safety_margin = safety_margin;
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |what: &str| {
            ConfigError::InvalidTierTable(format!("tier '{}': {}", self.name, what))
        };
        if self.name.is_empty() {
            return Err(ConfigError::InvalidTierTable("tier name must not be empty".into()));
        }
        if !self.quota.is_finite() || self.quota < 0.0 {
            return Err(invalid("quota must be finite and >= 0"));
        }
        if !self.cost_multiplier.is_finite() || self.cost_multiplier < 1.0 {
            return Err(invalid("cost_multiplier must be finite and >= 1"));
        }
        if !self.headroom_multiplier.is_finite() || self.headroom_multiplier < 1.0 {
            return Err(invalid("headroom_multiplier must be finite and >= 1"));
        }
        if !self.replica_safety_margin.is_finite() || self.replica_safety_margin < 1.0 {
            return Err(invalid("replica_safety_margin must be finite and >= 1"));
        }
        Ok(())
    }
}

/// Ordered tiers, most valuable first.
///
/// Lower tiers must never get a larger degraded quota or a smaller cost multiplier than
/// the tier above them.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "Vec<TierSpec>")]
pub struct TierTable {
    tiers: Vec<TierSpec>,
}

impl TierTable {
    /// Build and validate a table.
    pub fn new(tiers: Vec<TierSpec>) -> Result<Self, ConfigError> {
        let table = Self { tiers };
        table.validate()?;
        Ok(table)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tiers.is_empty() {
            return Err(ConfigError::InvalidTierTable("at least one tier is required".into()));
        }
        for (i, tier) in self.tiers.iter().enumerate() {
            tier.validate()?;
            if self.tiers[..i].iter().any(|t| t.name == tier.name) {
                return Err(ConfigError::InvalidTierTable(format!("duplicate tier '{}'", tier.name)));
            }
        }
        for pair in self.tiers.windows(2) {
            let (higher, lower) = (&pair[0], &pair[1]);
            if lower.quota > higher.quota {
                return Err(ConfigError::InvalidTierTable(format!(
                    "tier '{}' has a larger degraded quota than '{}'",
                    lower.name, higher.name
                )));
            }
            if lower.cost_multiplier < higher.cost_multiplier {
                return Err(ConfigError::InvalidTierTable(format!(
                    "tier '{}' has a smaller cost multiplier than '{}'",
                    lower.name, higher.name
                )));
            }
        }
        Ok(())
    }

    /// Look up a tier by name.
    pub fn get(&self, name: &str) -> Result<&TierSpec, ConfigError> {
        self.tiers
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| ConfigError::UnknownTier(name.to_string()))
    }

    pub fn tiers(&self) -> &[TierSpec] {
        &self.tiers
    }
}

impl TryFrom<Vec<TierSpec>> for TierTable {
    type Error = ConfigError;

    fn try_from(tiers: Vec<TierSpec>) -> Result<Self, Self::Error> {
        Self::new(tiers)
    }
}

impl Default for TierTable {
    /// `enterprise`, `pro`, `free`, `anonymous` (per-IP).
    fn default() -> Self {
        Self {
            tiers: vec![
                TierSpec::new("enterprise", 1000.0, 1.0)
                    .with_cache(Duration::from_millis(500), 1.1)
                    .with_replica(Duration::from_millis(250), 1.2),
                TierSpec::new("pro", 100.0, 1.2)
                    .with_cache(Duration::from_secs(1), 1.25)
                    .with_replica(Duration::from_millis(500), 1.5),
                TierSpec::new("free", 10.0, 1.5)
                    .with_cache(Duration::from_secs(2), 1.5)
                    .with_replica(Duration::from_secs(1), 2.0),
                TierSpec::new("anonymous", 5.0, 2.0)
                    .with_cache(Duration::from_secs(5), 2.0)
                    .with_replica(Duration::from_secs(2), 2.0),
            ],
        }
    }
}

/// Limiter tunables that are not tier specific.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LimiterSettings {
    /// Added to `window_seconds` when setting a bucket's TTL.
    #[serde(rename = "ttl_safety_margin_ms", deserialize_with = "millis")]
    pub ttl_safety_margin: Duration,
    /// Bound on L1 entries per process.
    pub max_cache_entries: usize,
    /// Length of a degraded-mode fixed window.
    #[serde(rename = "degraded_window_ms", deserialize_with = "millis")]
    pub degraded_window: Duration,
    /// Validity of a degraded answer.
    #[serde(rename = "degraded_ttl_ms", deserialize_with = "millis")]
    pub degraded_ttl: Duration,
    pub recovery: RecoveryThresholds,
    /// Degradation windows untouched for this long are swept.
    #[serde(rename = "degradation_idle_ttl_ms", deserialize_with = "millis")]
    pub degradation_idle_ttl: Duration,
    /// Recovery entries untouched for this long are swept.
    #[serde(rename = "recovery_idle_ttl_ms", deserialize_with = "millis")]
    pub recovery_idle_ttl: Duration,
    /// Locally admitted tokens not yet paid to the store are forgotten after this long
    /// without traffic on the key.
    #[serde(rename = "unsettled_idle_ttl_ms", deserialize_with = "millis")]
    pub unsettled_idle_ttl: Duration,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            ttl_safety_margin: crate::store::DEFAULT_TTL_SAFETY_MARGIN,
            max_cache_entries: 10_000,
            degraded_window: Duration::from_secs(60),
            degraded_ttl: Duration::from_secs(1),
            recovery: RecoveryThresholds::default(),
            degradation_idle_ttl: Duration::from_secs(300),
            recovery_idle_ttl: Duration::from_secs(900),
            unsettled_idle_ttl: crate::cache::local::DEFAULT_UNSETTLED_TTL,
        }
    }
}

impl LimiterSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_cache_entries == 0 {
            return Err(ConfigError::InvalidSettings("max_cache_entries must be > 0".into()));
        }
        if self.degraded_window.is_zero() {
            return Err(ConfigError::InvalidSettings("degraded_window must be > 0".into()));
        }
        self.recovery.validate()
    }
}

/// Consecutive successes needed to leave each recovery phase.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct RecoveryThresholds {
    /// TESTING → PARTIAL.
    pub partial: u32,
    /// PARTIAL → STABILIZING.
    pub stabilizing: u32,
    /// STABILIZING → NORMAL, together with `min_success_ratio`.
    pub normal: u32,
    pub min_success_ratio: f64,
}

impl Default for RecoveryThresholds {
    fn default() -> Self {
        Self { partial: 5, stabilizing: 15, normal: 30, min_success_ratio: 0.95 }
    }
}

impl RecoveryThresholds {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.partial == 0 || self.partial > self.stabilizing || self.stabilizing > self.normal {
            return Err(ConfigError::InvalidSettings(format!(
                "recovery thresholds must rise: {} -> {} -> {}",
                self.partial, self.stabilizing, self.normal
            )));
        }
        if !(0.0..=1.0).contains(&self.min_success_ratio) {
            return Err(ConfigError::InvalidSettings(format!(
                "min_success_ratio must be within [0, 1] (got {})",
                self.min_success_ratio
            )));
        }
        Ok(())
    }
}

/// Serializable circuit breaker settings; see [`CircuitBreakerConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    pub failure_threshold: usize,
    pub success_threshold: usize,
    pub half_open_max_calls: usize,
    pub call_timeout_ms: u64,
    pub min_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub max_jitter_ms: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            half_open_max_calls: 1,
            call_timeout_ms: 250,
            min_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
            max_jitter_ms: 100,
        }
    }
}

impl BreakerSettings {
    pub fn into_config(self) -> Result<CircuitBreakerConfig, ConfigError> {
        CircuitBreakerConfigBuilder::default()
            .failure_threshold(self.failure_threshold)
            .success_threshold(self.success_threshold)
            .half_open_max_calls(self.half_open_max_calls)
            .call_timeout(Duration::from_millis(self.call_timeout_ms))
            .backoff(Duration::from_millis(self.min_backoff_ms), Duration::from_millis(self.max_backoff_ms))
            .max_jitter(Duration::from_millis(self.max_jitter_ms))
            .build()
            .map_err(|e| ConfigError::InvalidBreaker(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_table_is_valid_and_ordered() {
        let table = TierTable::default();
        table.validate().unwrap();
        let names: Vec<_> = table.tiers().iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["enterprise", "pro", "free", "anonymous"]);
        let free = table.get("free").unwrap();
        assert_eq!(free.quota, 10.0);
        assert_eq!(free.cost_multiplier, 1.5);
    }

    #[test]
    fn unknown_tier_is_a_config_error() {
        let err = TierTable::default().get("platinum").unwrap_err();
        assert_eq!(err, ConfigError::UnknownTier("platinum".into()));
    }

    #[test]
    fn lower_tiers_must_be_stricter() {
        let err = TierTable::new(vec![TierSpec::new("pro", 10.0, 1.0), TierSpec::new("free", 20.0, 1.5)])
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidTierTable(msg) if msg.contains("larger degraded quota")));

        let err = TierTable::new(vec![TierSpec::new("pro", 10.0, 2.0), TierSpec::new("free", 5.0, 1.5)])
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidTierTable(msg) if msg.contains("smaller cost multiplier")));
    }

    #[test]
    fn rejects_duplicates_and_bad_multipliers() {
        let dup = TierTable::new(vec![TierSpec::new("a", 1.0, 1.0), TierSpec::new("a", 1.0, 1.0)]);
        assert!(dup.is_err());
        let low = TierTable::new(vec![TierSpec::new("a", 1.0, 0.5)]);
        assert!(low.is_err());
        let nan = TierTable::new(vec![TierSpec::new("a", 1.0, 1.0).with_cache(Duration::ZERO, f64::NAN)]);
        assert!(nan.is_err());
        assert!(TierTable::new(vec![]).is_err());
    }

    #[test]
    fn table_deserializes_and_validates() {
        let json = r#"[
            {"name": "pro", "quota": 50, "cost_multiplier": 1.0, "cache_ttl_ms": 1000,
             "headroom_multiplier": 1.2, "allow_replica": true, "max_replica_lag_ms": 300,
             "replica_safety_margin": 1.5},
            {"name": "free", "quota": 10, "cost_multiplier": 1.5, "cache_ttl_ms": 2000,
             "headroom_multiplier": 1.5}
        ]"#;
        let table: TierTable = serde_json::from_str(json).unwrap();
        let pro = table.get("pro").unwrap();
        assert_eq!(pro.max_replica_lag, Duration::from_millis(300));
        assert!(!table.get("free").unwrap().allow_replica);

        let bad = r#"[{"name": "x", "quota": 1, "cost_multiplier": 0.1, "cache_ttl_ms": 0,
                       "headroom_multiplier": 1}]"#;
        assert!(serde_json::from_str::<TierTable>(bad).is_err());
    }

    #[test]
    fn settings_defaults_and_overrides() {
        let settings: LimiterSettings =
            serde_json::from_str(r#"{"max_cache_entries": 5, "degraded_ttl_ms": 250}"#).unwrap();
        assert_eq!(settings.max_cache_entries, 5);
        assert_eq!(settings.degraded_ttl, Duration::from_millis(250));
        assert_eq!(settings.degraded_window, Duration::from_secs(60));
        assert_eq!(settings.recovery.normal, 30);
        assert_eq!(settings.unsettled_idle_ttl, Duration::from_secs(300));
        settings.validate().unwrap();

        let bad = LimiterSettings {
            recovery: RecoveryThresholds { partial: 20, ..RecoveryThresholds::default() },
            ..LimiterSettings::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn breaker_settings_map_to_config() {
        let config = BreakerSettings { failure_threshold: 3, ..BreakerSettings::default() }
            .into_config()
            .unwrap();
        assert_eq!(config.failure_threshold(), 3);
        assert_eq!(config.call_timeout(), Duration::from_millis(250));

        let err = BreakerSettings { min_backoff_ms: 0, ..BreakerSettings::default() }
            .into_config()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidBreaker(_)));
    }
}
