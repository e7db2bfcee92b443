//! Cache configuration.
//!
//! The global caches read their configuration from the environment once, on
//! first use. Explicit caches built with [`ProxyCache::with_config`] take a
//! [`CacheConfig`] directly.
//!
//! | Variable | Values | Default |
//! |----------|--------|---------|
//! | `TAU_PROXY_ALLOC` | `locked`, `optimistic` | `locked` |
//! | `TAU_PROXY_CAPACITY` | initial map capacity | `64` |
//!
//! [`ProxyCache::with_config`]: crate::proxy_cache::ProxyCache::with_config

use std::str::FromStr;

pub const ENV_ALLOC_POLICY: &str = "TAU_PROXY_ALLOC";
pub const ENV_CAPACITY: &str = "TAU_PROXY_CAPACITY";

pub const DEFAULT_CAPACITY: usize = 64;

/// How the cache behaves when two threads miss on the same identity at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AllocPolicy {
    /// Lookup, allocation and registration happen under one lock. Only one
    /// proxy is ever allocated per miss. An allocator that re-enters the same
    /// cache deadlocks.
    #[default]
    Locked,
    /// The allocator runs outside the lock. On a lost race the freshly
    /// allocated proxy is dropped and the winner returned, so the allocator
    /// must be side-effect-free. Re-entrant allocators are safe.
    Optimistic,
}

impl FromStr for AllocPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "locked" => Ok(AllocPolicy::Locked),
            "optimistic" => Ok(AllocPolicy::Optimistic),
            other => Err(format!("unknown allocation policy '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    pub alloc_policy: AllocPolicy,
    pub initial_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            alloc_policy: AllocPolicy::Locked,
            initial_capacity: DEFAULT_CAPACITY,
        }
    }
}

impl CacheConfig {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unparseable values keep the
    /// default and log a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = CacheConfig::default();

        if let Some(raw) = lookup(ENV_ALLOC_POLICY) {
            match raw.parse::<AllocPolicy>() {
                Ok(policy) => config.alloc_policy = policy,
                Err(e) => log::warn!("{}: {}, using {:?}", ENV_ALLOC_POLICY, e, config.alloc_policy),
            }
        }

        if let Some(raw) = lookup(ENV_CAPACITY) {
            match raw.trim().parse::<usize>() {
                Ok(capacity) => config.initial_capacity = capacity,
                Err(e) => log::warn!("{}='{}': {}, using {}", ENV_CAPACITY, raw, e, config.initial_capacity),
            }
        }

        config
    }

    pub fn with_policy(mut self, policy: AllocPolicy) -> Self {
        self.alloc_policy = policy;
        self
    }
}
