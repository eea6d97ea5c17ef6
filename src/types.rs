//! Core data model: identifiers, limit definitions, and admission results.

use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::ConfigError;

/// What kind of caller an [`Identifier`] names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentifierKind {
    /// Authenticated user id.
    User,
    /// API key.
    ApiKey,
    /// Client IP address (anonymous callers).
    Ip,
    /// Session token.
    Session,
    /// Anything else, named by the caller.
    Custom(String),
}

impl IdentifierKind {
    fn as_str(&self) -> &str {
        match self {
            Self::User => "user",
            Self::ApiKey => "api_key",
            Self::Ip => "ip",
            Self::Session => "session",
            Self::Custom(name) => name,
        }
    }
}

/// A `(kind, key)` pair naming a caller. Only ever used as a lookup key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identifier {
    kind: IdentifierKind,
    key: String,
}

impl Identifier {
    /// Build an identifier.
    pub fn new(kind: IdentifierKind, key: impl Into<String>) -> Self {
        Self { kind, key: key.into() }
    }

    /// Shorthand for a user identifier.
    pub fn user(key: impl Into<String>) -> Self {
        Self::new(IdentifierKind::User, key)
    }

    /// Shorthand for an API key identifier.
    pub fn api_key(key: impl Into<String>) -> Self {
        Self::new(IdentifierKind::ApiKey, key)
    }

    /// Shorthand for an IP identifier.
    pub fn ip(key: impl Into<String>) -> Self {
        Self::new(IdentifierKind::Ip, key)
    }

    pub fn kind(&self) -> &IdentifierKind {
        &self.kind
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.key)
    }
}

/// Advisory operation scope of a limit. Only `Read` limits may be answered by a replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    #[default]
    Read,
    Write,
}

/// How much staleness a limit tolerates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criticality {
    #[default]
    Normal,
    /// Never cached, never answered by a replica.
    Critical,
}

/// A named token bucket limit. Owned by configuration; immutable once loaded.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LimitConfig {
    pub name: String,
    /// Maximum tokens held by the bucket.
    pub capacity: f64,
    /// Tokens added per second.
    pub refill_rate: f64,
    /// Basis for the stored key's TTL.
    pub window_seconds: u64,
    #[serde(default)]
    pub scope: Scope,
    #[serde(default)]
    pub criticality: Criticality,
    /// Forbids replica and degraded answers for this limit.
    #[serde(default)]
    pub requires_primary: bool,
}

impl LimitConfig {
    /// A normal-criticality read limit.
    pub fn new(name: impl Into<String>, capacity: f64, refill_rate: f64, window_seconds: u64) -> Self {
        Self {
            name: name.into(),
            capacity,
            refill_rate,
            window_seconds,
            scope: Scope::Read,
            criticality: Criticality::Normal,
            requires_primary: false,
        }
    }

    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_criticality(mut self, criticality: Criticality) -> Self {
        self.criticality = criticality;
        self
    }

    pub fn requiring_primary(mut self) -> Self {
        self.requires_primary = true;
        self
    }

    /// Check the numeric constraints of the limit.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidLimit {
            name: self.name.clone(),
            reason: reason.to_string(),
        };
        if self.name.is_empty() {
            return Err(invalid("name must not be empty"));
        }
        if !self.capacity.is_finite() || self.capacity < 0.0 {
            return Err(invalid("capacity must be finite and >= 0"));
        }
        if !self.refill_rate.is_finite() || self.refill_rate <= 0.0 {
            return Err(invalid("refill_rate must be finite and > 0"));
        }
        if self.window_seconds == 0 {
            return Err(invalid("window_seconds must be > 0"));
        }
        Ok(())
    }

    pub fn is_critical(&self) -> bool {
        self.criticality == Criticality::Critical
    }
}

/// Composite `(identifier, limit)` key; one bucket is stored per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey(Arc<str>);

impl BucketKey {
    pub fn new(identifier: &Identifier, limit: &LimitConfig) -> Self {
        Self(Arc::from(format!("rl:{}:{}", identifier, limit.name)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BucketKey {
    fn from(value: &str) -> Self {
        Self(Arc::from(value))
    }
}

/// Where an admission answer came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// Served from the in-process cache; the cost is owed to the store.
    L1Cache,
    /// Estimated from a lagging read replica; the cost is owed to the store.
    Replica,
    /// Authoritative answer from the backing store.
    Primary,
    /// Fallback quota while the backing store is unreachable.
    Degraded,
}

impl Source {
    pub fn as_str(self) -> &'static str {
        match self {
            Source::L1Cache => "l1-cache",
            Source::Replica => "replica",
            Source::Primary => "primary",
            Source::Degraded => "degraded",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of an admission check. Timestamps are milliseconds.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitResult {
    pub allowed: bool,
    /// Tokens left after this check; never above `limit`.
    pub remaining: f64,
    pub limit: f64,
    /// When the bucket is expected to be full again.
    pub reset_at: u64,
    /// Set on denials when a wait can be computed.
    pub retry_after: Option<Duration>,
    pub source: Source,
    /// How long this answer may be reused.
    pub expires_at: u64,
}

impl RateLimitResult {
    pub fn is_degraded(&self) -> bool {
        self.source == Source::Degraded
    }

    /// True if `self` should win over `other` when combining per-limit answers:
    /// denials first, then the smaller remaining quota.
    pub(crate) fn more_restrictive_than(&self, other: &RateLimitResult) -> bool {
        match (self.allowed, other.allowed) {
            (false, true) => true,
            (true, false) => false,
            _ => self.remaining < other.remaining,
        }
    }
}
