//! Core rate limiter implementation.

use std::sync::Arc;
use tracing::{debug, info, trace, warn};

use super::clock::{Clock, SystemClock};
use super::counter::AcquireResult;
use super::key::CompositeKey;
use super::rules::RuleTable;
use super::store::CounterStore;
use crate::config::RateLimitingConfig;
use crate::error::{RateLimitExceeded, Result};

/// The admission-control entry point.
///
/// This struct is thread-safe and can be shared across request handlers.
/// Checks run on the caller's thread, never block on I/O, and only contend
/// with other checks for the same caller and endpoint.
#[derive(Debug)]
pub struct RateLimiter {
    /// Compiled rules and path normalizer
    rules: RuleTable,
    /// Rate limit counters indexed by composite key
    store: CounterStore,
    /// Time source for window arithmetic
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Create a rate limiter on the wall clock.
    pub fn new(rules: RuleTable, store: CounterStore) -> Self {
        Self::with_clock(rules, store, Arc::new(SystemClock))
    }

    /// Create a rate limiter with an injected clock.
    pub fn with_clock(rules: RuleTable, store: CounterStore, clock: Arc<dyn Clock>) -> Self {
        if store.idle_timeout() < rules.longest_window() {
            warn!(
                idle_timeout_secs = store.idle_timeout().as_secs(),
                longest_window_secs = rules.longest_window().as_secs(),
                "Idle timeout is shorter than the longest rule window; idle callers may get their quota back early"
            );
        }
        info!(
            rules = rules.rules().count(),
            max_entries = store.max_entries(),
            idle_timeout_secs = store.idle_timeout().as_secs(),
            "Rate limiter initialized"
        );
        Self { rules, store, clock }
    }

    /// Build a limiter from settings, loading rules from `rules_path` or
    /// falling back to the built-in table.
    pub fn from_config(config: &RateLimitingConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let rules = match &config.rules_path {
            Some(path) => RuleTable::from_file(path)?,
            None => RuleTable::builtin()?,
        };
        Ok(Self::with_clock(rules, CounterStore::from_config(config), clock))
    }

    /// Admit or reject one request.
    ///
    /// On success the caller's counter for this endpoint is incremented. On
    /// rejection nothing changes and the error says how long to back off.
    /// `caller_id` must be non-empty; callers without an identity are
    /// expected to be filtered out before reaching the limiter.
    pub fn check(
        &self,
        caller_id: &str,
        method: &str,
        raw_path: &str,
    ) -> std::result::Result<(), RateLimitExceeded> {
        let path = self.rules.normalizer().normalize(raw_path);
        let rule = self.rules.find_limit(method, &path);
        let key = CompositeKey::new(caller_id, method, &path);

        trace!(
            key = %key,
            rule = %rule.pattern,
            limit = rule.limit,
            window_secs = rule.window_seconds,
            "Checking rate limit"
        );

        let now = self.clock.now_millis();
        let counter = self.store.get_or_create(&key, now);

        match counter.try_acquire(now, rule.limit, rule.window_seconds) {
            AcquireResult::Allowed => Ok(()),
            AcquireResult::Denied { retry_after_seconds } => {
                debug!(
                    key = %key,
                    limit = rule.limit,
                    retry_after_secs = retry_after_seconds,
                    "Rate limit exceeded"
                );
                Err(RateLimitExceeded {
                    endpoint: key.endpoint(),
                    limit: rule.limit,
                    window_seconds: rule.window_seconds,
                    retry_after_seconds,
                })
            }
        }
    }

    /// Get the current counter value for a request.
    ///
    /// Returns `None` if no counter exists for it. Does not count as a hit.
    pub fn counter_value(&self, caller_id: &str, method: &str, raw_path: &str) -> Option<u64> {
        let path = self.rules.normalizer().normalize(raw_path);
        let rule = self.rules.find_limit(method, &path);
        let key = CompositeKey::new(caller_id, method, &path);
        self.store.peek(&key, self.clock.now_millis(), rule.window_seconds)
    }

    /// The compiled rule table.
    pub fn rules(&self) -> &RuleTable {
        &self.rules
    }

    /// Clear all counters.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        self.store.clear();
    }

    /// Get the number of active counters.
    pub fn counter_count(&self) -> usize {
        self.store.len()
    }
}
