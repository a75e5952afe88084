//! Per-license AI rate limiting: a daily counter (24 h TTL) and a per-minute
//! counter (60 s TTL), backed by Redis when configured so the caps hold
//! across workers, with an in-process fallback otherwise. A separate global
//! cooldown flag is set by whichever worker hits a provider 429.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use rasil_core::types::LicenseId;
use redis::AsyncCommands;
use tracing::debug;

use crate::error::Result;

const DAILY_TTL_SECS: u64 = 86_400;
const MINUTE_TTL_SECS: u64 = 60;

#[derive(Debug, Clone, Copy)]
pub struct RateCaps {
    pub per_day: u32,
    pub per_minute: u32,
}

pub struct RateLimiter {
    caps: RateCaps,
    backend: Backend,
}

enum Backend {
    Redis(redis::aio::ConnectionManager),
    Memory(DashMap<String, Counter>),
}

struct Counter {
    count: u32,
    expires_at: Instant,
}

impl RateLimiter {
    pub fn in_memory(caps: RateCaps) -> Self {
        Self {
            caps,
            backend: Backend::Memory(DashMap::new()),
        }
    }

    pub async fn redis(url: &str, caps: RateCaps) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let manager = redis::aio::ConnectionManager::new(client).await?;
        Ok(Self {
            caps,
            backend: Backend::Redis(manager),
        })
    }

    /// Read both counters; does not mutate them.
    pub async fn check(&self, license_id: LicenseId) -> Result<(bool, Option<String>)> {
        let daily = self.get(&daily_key(license_id)).await?;
        let minute = self.get(&minute_key(license_id)).await?;

        if daily >= self.caps.per_day {
            return Ok((
                false,
                Some(format!("Daily limit reached ({}/day)", self.caps.per_day)),
            ));
        }
        if minute >= self.caps.per_minute {
            return Ok((
                false,
                Some(format!("Minute limit reached ({}/min)", self.caps.per_minute)),
            ));
        }
        Ok((true, None))
    }

    /// Increment both counters, initializing each window's TTL on the first
    /// increment.
    pub async fn increment(&self, license_id: LicenseId) -> Result<()> {
        let d = self
            .incr(&daily_key(license_id), Duration::from_secs(DAILY_TTL_SECS))
            .await?;
        let m = self
            .incr(&minute_key(license_id), Duration::from_secs(MINUTE_TTL_SECS))
            .await?;
        debug!(
            license_id,
            daily = d,
            minute = m,
            "rate counters incremented"
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<u32> {
        match &self.backend {
            Backend::Redis(manager) => {
                let mut conn = manager.clone();
                let v: Option<u32> = conn.get(key).await?;
                Ok(v.unwrap_or(0))
            }
            Backend::Memory(map) => Ok(map
                .get(key)
                .filter(|c| c.expires_at > Instant::now())
                .map(|c| c.count)
                .unwrap_or(0)),
        }
    }

    async fn incr(&self, key: &str, ttl: Duration) -> Result<u32> {
        match &self.backend {
            Backend::Redis(manager) => {
                let mut conn = manager.clone();
                let v: u32 = conn.incr(key, 1).await?;
                if v == 1 {
                    let _: () = conn.expire(key, ttl.as_secs() as i64).await?;
                }
                Ok(v)
            }
            Backend::Memory(map) => {
                let now = Instant::now();
                let mut entry = map.entry(key.to_string()).or_insert(Counter {
                    count: 0,
                    expires_at: now + ttl,
                });
                if entry.expires_at <= now {
                    entry.count = 0;
                    entry.expires_at = now + ttl;
                }
                entry.count += 1;
                Ok(entry.count)
            }
        }
    }
}

fn daily_key(license_id: LicenseId) -> String {
    format!("rate_limit:daily:{}", license_id)
}

fn minute_key(license_id: LicenseId) -> String {
    format!("rate_limit:minute:{}", license_id)
}

/// Shared deadline after which LLM calls may resume. Written by whichever
/// worker receives a provider 429.
#[derive(Default)]
pub struct Cooldown {
    until: std::sync::Mutex<Option<Instant>>,
}

impl Cooldown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, duration: Duration) {
        let mut until = self.until.lock().unwrap();
        let deadline = Instant::now() + duration;
        // Never shorten an existing cooldown.
        if until.map(|u| u < deadline).unwrap_or(true) {
            *until = Some(deadline);
        }
    }

    pub fn is_active(&self) -> bool {
        self.remaining().is_some()
    }

    pub fn remaining(&self) -> Option<Duration> {
        let until = self.until.lock().unwrap();
        until.and_then(|u| u.checked_duration_since(Instant::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn daily_cap_blocks_only_that_license() {
        let limiter = RateLimiter::in_memory(RateCaps {
            per_day: 3,
            per_minute: 100,
        });
        for _ in 0..3 {
            limiter.increment(7).await.unwrap();
        }
        let (allowed, reason) = limiter.check(7).await.unwrap();
        assert!(!allowed);
        assert!(reason.unwrap().contains("Daily"));

        let (other_allowed, _) = limiter.check(8).await.unwrap();
        assert!(other_allowed, "a different license is unaffected");
    }

    #[tokio::test]
    async fn minute_cap_reports_its_own_reason() {
        let limiter = RateLimiter::in_memory(RateCaps {
            per_day: 100,
            per_minute: 1,
        });
        limiter.increment(1).await.unwrap();
        let (allowed, reason) = limiter.check(1).await.unwrap();
        assert!(!allowed);
        assert!(reason.unwrap().contains("Minute"));
    }

    #[test]
    fn cooldown_never_shrinks() {
        let cd = Cooldown::new();
        cd.set(Duration::from_secs(60));
        cd.set(Duration::from_secs(1));
        assert!(cd.remaining().unwrap() > Duration::from_secs(30));
    }

    #[test]
    fn cooldown_starts_inactive() {
        assert!(!Cooldown::new().is_active());
    }
}
