use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

use crate::guardrails::{check_rate_limit, RateLimitCounts, RequestQuota};

/// Every this many admissions, keys with no hit in the last hour are dropped.
const SWEEP_EVERY: u64 = 256;

type Hits = VecDeque<DateTime<Utc>>;

#[derive(Default)]
struct Windows {
    hits: HashMap<String, Hits>,
    calls: u64,
}

fn prune(times: &mut Hits, now: DateTime<Utc>) {
    let hour_ago = now - Duration::hours(1);
    while times.front().is_some_and(|t| *t <= hour_ago) {
        times.pop_front();
    }
}

fn tally(times: &Hits, now: DateTime<Utc>) -> RateLimitCounts {
    let minute_ago = now - Duration::minutes(1);
    RateLimitCounts {
        per_minute: times.iter().filter(|t| **t > minute_ago).count() as u32,
        per_hour: times.len() as u32,
    }
}

/// Sliding one-minute / one-hour request counts per caller key.
#[derive(Default)]
pub struct InMemoryQuota {
    windows: Mutex<Windows>,
}

impl InMemoryQuota {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counts_at(&self, key: &str, now: DateTime<Utc>) -> RateLimitCounts {
        let mut windows = self.windows.lock();
        let Some(times) = windows.hits.get_mut(key) else {
            return RateLimitCounts::default();
        };
        prune(times, now);
        let counts = tally(times, now);
        if times.is_empty() {
            windows.hits.remove(key);
        }
        counts
    }

    pub fn try_record_at(&self, key: &str, now: DateTime<Utc>) -> RateLimitCounts {
        let mut windows = self.windows.lock();
        windows.calls += 1;
        if windows.calls % SWEEP_EVERY == 0 {
            windows.hits.retain(|_, times| {
                prune(times, now);
                !times.is_empty()
            });
        }

        let times = windows.hits.entry(key.to_string()).or_default();
        prune(times, now);
        let counts = tally(times, now);
        if check_rate_limit(counts).allowed {
            times.push_back(now);
        }
        counts
    }

    pub fn record_at(&self, key: &str, at: DateTime<Utc>) {
        self.windows.lock().hits.entry(key.to_string()).or_default().push_back(at);
    }

    /// Number of caller keys currently tracked.
    pub fn len(&self) -> usize {
        self.windows.lock().hits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RequestQuota for InMemoryQuota {
    fn counts(&self, key: &str) -> RateLimitCounts {
        self.counts_at(key, Utc::now())
    }

    fn try_record(&self, key: &str) -> RateLimitCounts {
        self.try_record_at(key, Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guardrails::MAX_REQUESTS_PER_MINUTE;
    use pretty_assertions::assert_eq;

    #[test]
    fn counts_sliding_windows_per_key() {
        let quota = InMemoryQuota::new();
        let now = Utc::now();
        quota.record_at("ana", now - Duration::minutes(90));
        quota.record_at("ana", now - Duration::minutes(30));
        quota.record_at("ana", now - Duration::seconds(20));
        quota.record_at("ana", now - Duration::seconds(5));
        quota.record_at("bia", now);

        assert_eq!(quota.counts_at("ana", now), RateLimitCounts { per_minute: 2, per_hour: 3 });
        assert_eq!(quota.counts_at("bia", now), RateLimitCounts { per_minute: 1, per_hour: 1 });
        assert_eq!(quota.counts_at("caio", now), RateLimitCounts::default());
    }

    #[test]
    fn rejected_requests_are_not_recorded() {
        let quota = InMemoryQuota::new();
        let now = Utc::now();
        for i in 0..MAX_REQUESTS_PER_MINUTE {
            assert_eq!(quota.try_record_at("ana", now).per_minute, i);
        }
        let full = RateLimitCounts { per_minute: MAX_REQUESTS_PER_MINUTE, per_hour: MAX_REQUESTS_PER_MINUTE };
        assert_eq!(quota.try_record_at("ana", now), full);
        assert_eq!(quota.try_record_at("ana", now), full);
    }

    #[test]
    fn concurrent_callers_cannot_exceed_the_minute_limit() {
        let quota = InMemoryQuota::new();
        let now = Utc::now();
        let admitted: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..32)
                .map(|_| scope.spawn(|| check_rate_limit(quota.try_record_at("ana", now)).allowed))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).filter(|allowed| *allowed).count()
        });
        assert_eq!(admitted, MAX_REQUESTS_PER_MINUTE as usize);
    }

    #[test]
    fn expired_keys_are_dropped() {
        let quota = InMemoryQuota::new();
        let now = Utc::now();
        quota.record_at("stale", now - Duration::hours(2));
        assert_eq!(quota.counts_at("stale", now), RateLimitCounts::default());
        assert!(quota.is_empty());

        quota.record_at("idle", now - Duration::hours(2));
        for i in 0..SWEEP_EVERY {
            quota.try_record_at(&format!("user-{i}"), now);
        }
        assert_eq!(quota.len(), SWEEP_EVERY as usize);
        assert_eq!(quota.counts_at("idle", now), RateLimitCounts::default());
    }
}
