use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

/// Per-source poll stamps.
#[derive(Debug, Default, Clone)]
pub struct Scheduler {
    last_poll: HashMap<String, DateTime<Utc>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` and stamps `now` when the source has never been polled
    /// or at least `interval` has passed since its last poll.
    pub fn should_poll(&mut self, label: &str, interval: Duration, now: DateTime<Utc>) -> bool {
        let due = match self.last_poll.get(label) {
            Some(last) => now - *last >= interval,
            None => true,
        };
        if due {
            self.last_poll.insert(label.to_string(), now);
        }
        due
    }

    pub fn reset(&mut self, label: &str) {
        self.last_poll.remove(label);
    }

    pub fn last_poll(&self, label: &str) -> Option<DateTime<Utc>> {
        self.last_poll.get(label).copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::seconds(5),
            max: Duration::seconds(300),
        }
    }
}

impl BackoffPolicy {
    /// `min(base * 2^(failures - 1), max)`; zero failures means no backoff.
    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::zero();
        }
        let base_ms = self.base.num_milliseconds().max(0);
        let max_ms = self.max.num_milliseconds().max(0);
        let scaled = 1_i64
            .checked_shl(failures - 1)
            .filter(|factor| *factor > 0)
            .and_then(|factor| base_ms.checked_mul(factor))
            .unwrap_or(max_ms);
        Duration::milliseconds(scaled.min(max_ms))
    }
}

#[derive(Debug, Clone, Default)]
struct FailureRecord {
    consecutive: u32,
    quarantined_until: Option<DateTime<Utc>>,
}

/// Consecutive-failure counters with exponential quarantine.
#[derive(Debug, Clone, Default)]
pub struct ErrorTracker {
    policy: BackoffPolicy,
    records: HashMap<String, FailureRecord>,
}

impl ErrorTracker {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            records: HashMap::new(),
        }
    }

    pub fn policy(&self) -> BackoffPolicy {
        self.policy
    }

    /// Records one failure and returns the instant the source leaves quarantine.
    pub fn record_error(&mut self, label: &str, now: DateTime<Utc>) -> DateTime<Utc> {
        let record = self.records.entry(label.to_string()).or_default();
        record.consecutive = record.consecutive.saturating_add(1);
        let until = now + self.policy.delay_for(record.consecutive);
        record.quarantined_until = Some(until);
        until
    }

    pub fn record_success(&mut self, label: &str) {
        self.records.remove(label);
    }

    pub fn is_quarantined(&self, label: &str, now: DateTime<Utc>) -> bool {
        self.records
            .get(label)
            .and_then(|record| record.quarantined_until)
            .map(|until| now < until)
            .unwrap_or(false)
    }

    pub fn consecutive_errors(&self, label: &str) -> u32 {
        self.records
            .get(label)
            .map(|record| record.consecutive)
            .unwrap_or(0)
    }

    pub fn quarantined_until(&self, label: &str) -> Option<DateTime<Utc>> {
        self.records
            .get(label)
            .and_then(|record| record.quarantined_until)
    }
}
