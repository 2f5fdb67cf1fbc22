//! Per-domain politeness: a concurrency cap plus a jittered minimum gap
//! between consecutive requests to the same domain.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use regtruth_shared::{RateLimitsConfig, domain_of};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::debug;

use crate::fetch::FetchError;

/// Delay bounds and concurrency cap for one domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomainPolicy {
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub max_concurrent: u32,
}

impl DomainPolicy {
    /// A delay drawn uniformly from `[min_delay, max_delay]`.
    pub fn jittered_delay(&self) -> Duration {
        let min = self.min_delay.as_millis() as u64;
        let max = self.max_delay.as_millis() as u64;
        if max <= min {
            return Duration::from_millis(min);
        }
        Duration::from_millis(fastrand::u64(min..=max))
    }
}

struct DomainState {
    policy: DomainPolicy,
    slots: Arc<Semaphore>,
    last_request: Mutex<Option<Instant>>,
}

/// Held for the duration of one request; dropping it frees the domain slot.
#[derive(Debug)]
pub struct DomainPermit {
    pub domain: String,
    _slot: OwnedSemaphorePermit,
}

/// Shared across every fetch in the process so that politeness holds
/// regardless of which stage or producer issues the request.
pub struct DomainRateLimiter {
    config: RateLimitsConfig,
    domains: Mutex<HashMap<String, Arc<DomainState>>>,
}

impl DomainRateLimiter {
    pub fn new(config: RateLimitsConfig) -> Self {
        Self {
            config,
            domains: Mutex::new(HashMap::new()),
        }
    }

    /// Policy for a host: the most specific override, else the defaults.
    pub fn policy_for(&self, host: &str) -> DomainPolicy {
        let host = host.to_ascii_lowercase();
        let matched = self
            .config
            .domains
            .iter()
            .filter(|d| {
                let d = d.domain.to_ascii_lowercase();
                host == d || host.ends_with(&format!(".{d}"))
            })
            .max_by_key(|d| d.domain.len());

        match matched {
            Some(d) => DomainPolicy {
                min_delay: Duration::from_millis(d.min_delay_ms),
                max_delay: Duration::from_millis(d.max_delay_ms.max(d.min_delay_ms)),
                max_concurrent: d.max_concurrent.max(1),
            },
            None => DomainPolicy {
                min_delay: Duration::from_millis(self.config.min_delay_ms),
                max_delay: Duration::from_millis(
                    self.config.max_delay_ms.max(self.config.min_delay_ms),
                ),
                max_concurrent: self.config.max_concurrent.max(1),
            },
        }
    }

    /// Wait for a free slot on the URL's domain, then until the jittered
    /// gap since the previous request to that domain has elapsed.
    pub async fn acquire(&self, url: &str) -> Result<DomainPermit, FetchError> {
        let domain = domain_of(url).unwrap_or_default();
        let state = self.state_for(&domain).await;

        let slot = state
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| FetchError::Transient(format!("{domain}: request slots closed")))?;

        let mut last = state.last_request.lock().await;
        if let Some(previous) = *last {
            let gap = state.policy.jittered_delay();
            let elapsed = previous.elapsed();
            if elapsed < gap {
                let wait = gap - elapsed;
                debug!(%domain, wait_ms = wait.as_millis() as u64, "rate limiting");
                tokio::time::sleep(wait).await;
            }
        }
        *last = Some(Instant::now());
        drop(last);

        Ok(DomainPermit {
            domain,
            _slot: slot,
        })
    }

    async fn state_for(&self, domain: &str) -> Arc<DomainState> {
        let mut domains = self.domains.lock().await;
        domains
            .entry(domain.to_string())
            .or_insert_with(|| {
                let policy = self.policy_for(domain);
                Arc::new(DomainState {
                    policy,
                    slots: Arc::new(Semaphore::new(policy.max_concurrent as usize)),
                    last_request: Mutex::new(None),
                })
            })
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regtruth_shared::DomainRateLimit;

    fn config(min: u64, max: u64) -> RateLimitsConfig {
        RateLimitsConfig {
            min_delay_ms: min,
            max_delay_ms: max,
            max_concurrent: 1,
            domains: vec![DomainRateLimit {
                domain: "gov.example".into(),
                min_delay_ms: 5,
                max_delay_ms: 10,
                max_concurrent: 2,
            }],
        }
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = DomainPolicy {
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(200),
            max_concurrent: 1,
        };
        for _ in 0..200 {
            let d = policy.jittered_delay();
            assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(200));
        }
    }

    #[test]
    fn override_matches_subdomains() {
        let limiter = DomainRateLimiter::new(config(1000, 3000));
        let policy = limiter.policy_for("www.gov.example");
        assert_eq!(policy.max_concurrent, 2);
        assert_eq!(policy.min_delay, Duration::from_millis(5));

        let default = limiter.policy_for("other.example");
        assert_eq!(default.min_delay, Duration::from_millis(1000));
        assert_eq!(default.max_concurrent, 1);
    }

    #[tokio::test]
    async fn consecutive_requests_are_spaced() {
        let limiter = DomainRateLimiter::new(config(60, 80));
        let start = std::time::Instant::now();
        drop(limiter.acquire("https://a.example/1").await.unwrap());
        drop(limiter.acquire("https://a.example/2").await.unwrap());
        assert!(start.elapsed() >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn domains_do_not_wait_on_each_other() {
        let limiter = DomainRateLimiter::new(config(500, 500));
        let start = std::time::Instant::now();
        let _a = limiter.acquire("https://a.example/").await.unwrap();
        let _b = limiter.acquire("https://b.example/").await.unwrap();
        assert!(start.elapsed() < Duration::from_millis(400));
    }

    #[tokio::test]
    async fn concurrency_cap_blocks_until_release() {
        let limiter = Arc::new(DomainRateLimiter::new(config(0, 0)));
        let first = limiter.acquire("https://a.example/1").await.unwrap();

        let l = limiter.clone();
        let waiter = tokio::spawn(async move { l.acquire("https://a.example/2").await });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!waiter.is_finished());

        drop(first);
        let second = waiter.await.unwrap().unwrap();
        assert_eq!(second.domain, "a.example");
    }

    #[tokio::test]
    async fn closed_domain_slots_fail_transiently() {
        let limiter = DomainRateLimiter::new(config(0, 0));
        limiter.state_for("a.example").await.slots.close();

        let err = limiter.acquire("https://a.example/1").await.unwrap_err();
        assert!(err.is_transient());
        assert!(limiter.acquire("https://b.example/1").await.is_ok());
    }
}
