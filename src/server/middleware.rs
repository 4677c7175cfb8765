//! Per-IP rate limiting.

use std::net::{IpAddr, Ipv6Addr};
use std::num::NonZeroU32;
use std::sync::Arc;

use governor::{Quota, RateLimiter};
use lru::LruCache;
use tokio::sync::Mutex;

use super::types::ServerConfig;

pub type IpRateLimiter = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Maximum number of per-IP rate limiter entries to keep in the LRU cache.
const MAX_RATE_LIMITER_ENTRIES: usize = 10_000;

/// Get or create a rate limiter for the given IP.
/// IPv6 addresses are masked to /64 to prevent per-address evasion.
pub async fn get_rate_limiter(
    config: &ServerConfig,
    rate_limiters: &Mutex<LruCache<IpAddr, Arc<IpRateLimiter>>>,
    ip: IpAddr,
) -> Option<Arc<IpRateLimiter>> {
    let rpm = NonZeroU32::new(config.rate_limit_rpm)?;

    // Aggregate IPv6 addresses to /64 prefix
    let key = match ip {
        IpAddr::V4(_) => ip,
        IpAddr::V6(v6) => {
            let seg = v6.segments();
            IpAddr::V6(Ipv6Addr::new(seg[0], seg[1], seg[2], seg[3], 0, 0, 0, 0))
        }
    };

    let mut limiters = rate_limiters.lock().await;

    if let Some(limiter) = limiters.get(&key) {
        return Some(Arc::clone(limiter));
    }

    let quota = Quota::per_minute(rpm);
    let limiter = Arc::new(RateLimiter::direct(quota));
    limiters.push(key, Arc::clone(&limiter));

    Some(limiter)
}

pub fn new_rate_limiter_cache() -> Mutex<LruCache<IpAddr, Arc<IpRateLimiter>>> {
    Mutex::new(LruCache::new(
        std::num::NonZeroUsize::new(MAX_RATE_LIMITER_ENTRIES)
            .expect("nonzero cache capacity constant"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn zero_rpm_disables_limiting() {
        let config = ServerConfig {
            rate_limit_rpm: 0,
            ..Default::default()
        };
        let cache = new_rate_limiter_cache();
        let limiter = get_rate_limiter(&config, &cache, "1.2.3.4".parse().unwrap()).await;
        assert!(limiter.is_none());
    }

    #[tokio::test]
    async fn ipv6_addresses_share_a_prefix_limiter() {
        let config = ServerConfig {
            rate_limit_rpm: 2,
            ..Default::default()
        };
        let cache = new_rate_limiter_cache();
        let a = get_rate_limiter(&config, &cache, "2001:db8::1".parse().unwrap())
            .await
            .unwrap();
        let b = get_rate_limiter(&config, &cache, "2001:db8::2".parse().unwrap())
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b), "same /64 must share one limiter");
    }

    #[tokio::test]
    async fn limiter_trips_after_quota() {
        let config = ServerConfig {
            rate_limit_rpm: 2,
            ..Default::default()
        };
        let cache = new_rate_limiter_cache();
        let limiter = get_rate_limiter(&config, &cache, "9.9.9.9".parse().unwrap())
            .await
            .unwrap();
        assert!(limiter.check().is_ok());
        assert!(limiter.check().is_ok());
        assert!(limiter.check().is_err());
    }
}
