//! Auto-restart budget for tracked components.
//!
//! A component that dies unexpectedly may be restarted at most `max_count`
//! times per sliding `window`, no sooner than `retry_gap` after the previous
//! attempt, and at most `max_lifetime_count` times overall.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RecoveryConfig {
    pub enabled: bool,
    pub max_count: u32,
    pub window_mins: u64,
    pub retry_gap_mins: u64,
    pub max_lifetime_count: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        RecoveryConfig {
            enabled: true,
            max_count: 6,
            window_mins: 60,
            retry_gap_mins: 5,
            max_lifetime_count: 12,
        }
    }
}

impl RecoveryConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_mins * 60)
    }

    pub fn retry_gap(&self) -> Duration {
        Duration::from_secs(self.retry_gap_mins * 60)
    }

    /// Why this configuration cannot work, if it cannot.
    pub fn problem(&self) -> Option<&'static str> {
        if self.max_count == 0 {
            Some("max_count must be positive")
        } else if self.window_mins == 0 {
            Some("window_mins must be positive")
        } else if self.retry_gap_mins >= self.window_mins {
            Some("retry_gap_mins must be smaller than window_mins")
        } else if self.max_lifetime_count < self.max_count {
            Some("max_lifetime_count must be at least max_count")
        } else {
            None
        }
    }
}

#[derive(Debug, Default)]
struct History {
    recent: VecDeque<Instant>,
    lifetime: u32,
}

#[derive(Debug)]
pub struct RecoveryTracker {
    config: RecoveryConfig,
    enabled: bool,
    history: HashMap<String, History>,
}

impl RecoveryTracker {
    pub fn new(config: RecoveryConfig) -> Self {
        let mut enabled = config.enabled;
        if enabled {
            if let Some(problem) = config.problem() {
                warn!(problem, "invalid recovery configuration, auto-restart disabled");
                enabled = false;
            }
        }
        RecoveryTracker {
            config,
            enabled,
            history: HashMap::new(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Whether `component` may be restarted at `now`.
    pub fn may_execute(&mut self, component: &str, now: Instant) -> bool {
        if !self.enabled {
            return false;
        }
        let window = self.config.window();
        let Some(history) = self.history.get_mut(component) else {
            return true;
        };
        while let Some(&first) = history.recent.front() {
            if now.saturating_duration_since(first) >= window {
                history.recent.pop_front();
            } else {
                break;
            }
        }
        if history.lifetime >= self.config.max_lifetime_count {
            return false;
        }
        if history.recent.len() as u32 >= self.config.max_count {
            return false;
        }
        match history.recent.back() {
            Some(&last) => now.saturating_duration_since(last) >= self.config.retry_gap(),
            None => true,
        }
    }

    pub fn record_attempt(&mut self, component: &str, now: Instant) {
        let history = self.history.entry(component.to_string()).or_default();
        history.recent.push_back(now);
        history.lifetime += 1;
    }

    /// Forget the windowed history (lifetime count is kept).
    pub fn reset(&mut self, component: &str) {
        if let Some(h) = self.history.get_mut(component) {
            h.recent.clear();
        }
    }

    pub fn lifetime_count(&self, component: &str) -> u32 {
        self.history.get(component).map(|h| h.lifetime).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mins(m: u64) -> Duration {
        Duration::from_secs(m * 60)
    }

    fn config(max_count: u32, window: u64, gap: u64, lifetime: u32) -> RecoveryConfig {
        RecoveryConfig {
            enabled: true,
            max_count,
            window_mins: window,
            retry_gap_mins: gap,
            max_lifetime_count: lifetime,
        }
    }

    #[test]
    fn retry_gap_is_enforced() {
        let mut t = RecoveryTracker::new(config(3, 60, 5, 10));
        let start = Instant::now();
        assert!(t.may_execute("datanode", start));
        t.record_attempt("datanode", start);
        assert!(!t.may_execute("datanode", start + mins(2)));
        assert!(t.may_execute("datanode", start + mins(5)));
        assert!(t.may_execute("other", start));
    }

    #[test]
    fn window_budget_slides() {
        let mut t = RecoveryTracker::new(config(2, 30, 1, 10));
        let start = Instant::now();
        t.record_attempt("c", start);
        t.record_attempt("c", start + mins(2));
        assert!(!t.may_execute("c", start + mins(10)));
        assert!(t.may_execute("c", start + mins(31)));
    }

    #[test]
    fn lifetime_cap() {
        let mut t = RecoveryTracker::new(config(2, 10, 1, 3));
        let start = Instant::now();
        for i in 0..3 {
            t.record_attempt("c", start + mins(20 * i));
        }
        assert_eq!(t.lifetime_count("c"), 3);
        assert!(!t.may_execute("c", start + mins(200)));
        t.reset("c");
        assert!(!t.may_execute("c", start + mins(200)));
    }

    #[test]
    fn invalid_config_disables() {
        assert!(!RecoveryTracker::new(config(0, 60, 5, 12)).enabled());
        assert!(!RecoveryTracker::new(config(6, 60, 60, 12)).enabled());
        assert!(!RecoveryTracker::new(config(6, 60, 5, 3)).enabled());
        let mut off = RecoveryTracker::new(RecoveryConfig {
            enabled: false,
            ..Default::default()
        });
        assert!(!off.may_execute("c", Instant::now()));
    }

    #[test]
    fn default_is_valid() {
        assert_eq!(RecoveryConfig::default().problem(), None);
        assert!(RecoveryTracker::new(RecoveryConfig::default()).enabled());
    }
}
