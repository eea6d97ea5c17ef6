#![forbid(unsafe_code)]

//! # tollgate
//!
//! Distributed, tier-aware rate limiting for async Rust.
//!
//! ## Features
//!
//! - **Atomic token buckets** refilled on the store's clock, one critical section per key
//! - **Tiered caching**: a process-local L1 bounded by headroom, plus lag-bounded replica reads
//! - **Circuit breaking** around the backing store with jittered exponential backoff
//! - **Degraded mode** with tier-indexed fallback quotas while the store is down
//! - **Phased recovery** so a flapping store never regains full trust in one step
//! - **Tower middleware** for admitting requests in a service stack
//!
//! ## Quick Start
//!
//! ```rust
//! use tollgate::store::InMemoryStore;
//! use tollgate::{Identifier, LimitConfig, RateLimiter, Source};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let limiter = RateLimiter::builder(InMemoryStore::new()).build()?;
//!     let limits = [LimitConfig::new("api", 10.0, 1.0, 60)];
//!
//!     let result = limiter
//!         .check_and_consume(&Identifier::user("alice"), "pro", &limits, 1.0)
//!         .await?;
//!     assert!(result.allowed);
//!     assert_eq!(result.source, Source::Primary);
//!     Ok(())
//! }
//! ```

pub mod adaptive;
pub mod backoff;
pub mod bucket;
pub mod cache;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod degradation;
pub mod error;
pub mod limiter;
pub mod middleware;
pub mod recovery;
pub mod store;
pub mod sweeper;
pub mod types;

// Re-exports
pub use adaptive::DynamicConfig;
pub use cache::{CachePolicy, CachePolicyProvider, TierCachePolicies};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use clock::{Clock, ManualClock, MonotonicClock, SystemClock};
pub use config::{BreakerSettings, LimiterSettings, TierSpec, TierTable};
pub use degradation::{DegradationHandler, FixedWindowDegradation};
pub use error::{ConfigError, RateLimitError, StoreError};
pub use limiter::{RateLimiter, RateLimiterBuilder};
pub use middleware::{Admission, Classify, LimitedError, RateLimitLayer, RateLimitService};
pub use recovery::{RecoveryPhase, RecoveryTracker};
pub use store::{InMemoryStore, StoreClient};
pub use sweeper::{Sweep, Sweeper, SweeperHandle};
pub use types::{Identifier, IdentifierKind, LimitConfig, RateLimitResult, Source};
