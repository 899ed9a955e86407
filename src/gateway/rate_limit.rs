//! Per-host token buckets. Buckets are keyed by canonical hostname, never
//! by full URL, so every endpoint of a service shares one budget.

use std::collections::HashMap;

use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy)]
pub struct HostPolicy {
    /// Tokens added per second.
    pub per_sec: f64,
    /// Bucket capacity.
    pub burst: f64,
}

impl HostPolicy {
    pub const fn new(per_sec: f64, burst: f64) -> Self {
        Self { per_sec, burst }
    }
}

impl Default for HostPolicy {
    fn default() -> Self {
        // Conservative default for hosts without an explicit policy.
        Self::new(2.0, 4.0)
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Debug, PartialEq, Eq)]
pub enum AcquireError {
    /// No token became available before the deadline.
    DeadlineExceeded,
    Cancelled,
}

#[derive(Debug)]
pub struct HostBuckets {
    policies: HashMap<String, HostPolicy>,
    default_policy: HostPolicy,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl HostBuckets {
    pub fn new(policies: HashMap<String, HostPolicy>) -> Self {
        Self {
            policies,
            default_policy: HostPolicy::default(),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy_for(&self, host: &str) -> HostPolicy {
        self.policies
            .get(host)
            .copied()
            .unwrap_or(self.default_policy)
    }

    /// Take one token for `host`, waiting up to `deadline`.
    pub async fn acquire(
        &self,
        host: &str,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<(), AcquireError> {
        let policy = self.policy_for(host);
        loop {
            let wait = {
                let mut buckets = self.buckets.lock().await;
                let now = Instant::now();
                let bucket = buckets.entry(host.to_string()).or_insert(Bucket {
                    tokens: policy.burst,
                    last_refill: now,
                });
                let elapsed = now.saturating_duration_since(bucket.last_refill);
                bucket.tokens =
                    (bucket.tokens + elapsed.as_secs_f64() * policy.per_sec).min(policy.burst);
                bucket.last_refill = now;
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return Ok(());
                }
                Duration::from_secs_f64((1.0 - bucket.tokens) / policy.per_sec)
            };

            let now = Instant::now();
            if now >= deadline {
                return Err(AcquireError::DeadlineExceeded);
            }
            let sleep_for = wait.min(deadline.saturating_duration_since(now));
            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = cancel.cancelled() => return Err(AcquireError::Cancelled),
            }
            if sleep_for < wait && Instant::now() >= deadline {
                return Err(AcquireError::DeadlineExceeded);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buckets_with(host: &str, policy: HostPolicy) -> HostBuckets {
        let mut policies = HashMap::new();
        policies.insert(host.to_string(), policy);
        HostBuckets::new(policies)
    }

    #[tokio::test(start_paused = true)]
    async fn burst_is_granted_immediately() {
        let buckets = buckets_with("api.example.org", HostPolicy::new(1.0, 3.0));
        let cancel = CancellationToken::new();
        let deadline = Instant::now() + Duration::from_secs(10);
        for _ in 0..3 {
            buckets
                .acquire("api.example.org", deadline, &cancel)
                .await
                .unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fourth_request_waits_for_refill() {
        let buckets = buckets_with("api.example.org", HostPolicy::new(1.0, 3.0));
        let cancel = CancellationToken::new();
        let deadline = Instant::now() + Duration::from_secs(10);
        for _ in 0..3 {
            buckets
                .acquire("api.example.org", deadline, &cancel)
                .await
                .unwrap();
        }
        let start = Instant::now();
        buckets
            .acquire("api.example.org", deadline, &cancel)
            .await
            .unwrap();
        let waited = Instant::now().saturating_duration_since(start);
        assert!(waited >= Duration::from_millis(900), "waited {waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_produces_rate_limit_timeout() {
        let buckets = buckets_with("api.example.org", HostPolicy::new(0.1, 1.0));
        let cancel = CancellationToken::new();
        let far = Instant::now() + Duration::from_secs(60);
        buckets
            .acquire("api.example.org", far, &cancel)
            .await
            .unwrap();
        let deadline = Instant::now() + Duration::from_millis(200);
        let err = buckets
            .acquire("api.example.org", deadline, &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, AcquireError::DeadlineExceeded);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_the_wait() {
        let buckets = buckets_with("api.example.org", HostPolicy::new(0.1, 1.0));
        let cancel = CancellationToken::new();
        let deadline = Instant::now() + Duration::from_secs(60);
        buckets
            .acquire("api.example.org", deadline, &cancel)
            .await
            .unwrap();
        cancel.cancel();
        let err = buckets
            .acquire("api.example.org", deadline, &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, AcquireError::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_host_uses_default_policy() {
        let buckets = HostBuckets::new(HashMap::new());
        let cancel = CancellationToken::new();
        let deadline = Instant::now() + Duration::from_secs(10);
        buckets.acquire("anywhere.org", deadline, &cancel).await.unwrap();
    }
}
