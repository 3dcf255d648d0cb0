use crate::key::CacheKey;
use crate::policy::CachePolicy;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A validated response body held by the store.
#[derive(Clone, Debug)]
pub struct CachedEntry {
    pub key: CacheKey,
    pub body: Arc<Value>,
    pub fetched_at: Instant,
    pub policy: CachePolicy,
}

impl CachedEntry {
    pub fn new(key: CacheKey, body: Arc<Value>, policy: CachePolicy) -> Self {
        Self {
            key,
            body,
            fetched_at: Instant::now(),
            policy,
        }
    }

    pub fn age(&self) -> Duration {
        self.fetched_at.elapsed()
    }

    /// Past the policy it was written under, including the stale window.
    pub fn is_expired(&self) -> bool {
        self.age() > self.policy.lifetime()
    }
}
