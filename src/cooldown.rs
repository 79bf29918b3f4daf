use std::collections::HashMap;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::debug;

/// Per-category alert rate limiter.
///
/// A category with no recorded alert is eligible immediately, and that first evaluation
/// already consumes it. After that a category becomes eligible again once `cooldown` has
/// elapsed since its last alert. Categories never affect each other.
///
/// The gate is owned by the detection loop and mutated only through `&mut self`, so two
/// evaluations for the same category are always serialized in frame order.
#[derive(Debug, Clone)]
pub struct CooldownGate {
    cooldown: TimeDelta,
    last_alert: HashMap<String, DateTime<Utc>>,
}

impl CooldownGate {
    pub fn new(cooldown_seconds: u64) -> Self {
        Self {
            cooldown: i64::try_from(cooldown_seconds)
                .ok()
                .and_then(TimeDelta::try_seconds)
                .unwrap_or(TimeDelta::MAX),
            last_alert: HashMap::new(),
        }
    }

    pub fn should_alert(&mut self, label: &str, now: DateTime<Utc>) -> bool {
        match self.last_alert.get(label) {
            None => {
                self.last_alert.insert(label.to_string(), now);
                true
            }
            Some(last) if now.signed_duration_since(*last) >= self.cooldown => {
                self.last_alert.insert(label.to_string(), now);
                true
            }
            Some(last) => {
                debug!(
                    "Suppressing {} alert, last one was {}s ago",
                    label,
                    now.signed_duration_since(*last).num_seconds()
                );
                false
            }
        }
    }

    pub fn last_alert(&self, label: &str) -> Option<DateTime<Utc>> {
        self.last_alert.get(label).copied()
    }

    pub fn cooldown(&self) -> TimeDelta {
        self.cooldown
    }
}
