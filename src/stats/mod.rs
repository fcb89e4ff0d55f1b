use chrono::{DateTime, Utc};
use log::info;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize)]
pub struct MonitorStats {
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub rounds: usize,
    pub checks: usize,
    pub skipped: usize,
    pub slots_found: usize,
    pub session_recoveries: usize,
    pub failed_recoveries: usize,
    pub mail_failures: usize,
    pub outcomes: HashMap<String, usize>,
    pub notices: HashMap<String, usize>,
}

#[derive(Debug, Clone)]
pub struct StatsTracker {
    stats: Arc<RwLock<MonitorStats>>,
}

impl StatsTracker {
    pub fn new() -> Self {
        Self {
            stats: Arc::new(RwLock::new(MonitorStats {
                start_time: Utc::now(),
                end_time: None,
                rounds: 0,
                checks: 0,
                skipped: 0,
                slots_found: 0,
                session_recoveries: 0,
                failed_recoveries: 0,
                mail_failures: 0,
                outcomes: HashMap::new(),
                notices: HashMap::new(),
            })),
        }
    }

    pub fn record_round(&self) {
        self.stats.write().rounds += 1;
    }

    pub fn record_check(&self, outcome: String, found_slot: bool) {
        let mut stats = self.stats.write();
        stats.checks += 1;
        if found_slot {
            stats.slots_found += 1;
        }
        *stats.outcomes.entry(outcome).or_insert(0) += 1;
    }

    pub fn record_skip(&self) {
        self.stats.write().skipped += 1;
    }

    pub fn record_notice(&self, notice: String) {
        *self.stats.write().notices.entry(notice).or_insert(0) += 1;
    }

    pub fn record_recovery(&self, succeeded: bool) {
        let mut stats = self.stats.write();
        if succeeded {
            stats.session_recoveries += 1;
        } else {
            stats.failed_recoveries += 1;
        }
    }

    pub fn record_mail_failure(&self) {
        self.stats.write().mail_failures += 1;
    }

    pub fn finish(&self) {
        self.stats.write().end_time = Some(Utc::now());
    }

    pub fn get_stats(&self) -> MonitorStats {
        self.stats.read().clone()
    }

    pub fn log_summary(&self) {
        let stats = self.stats.read();
        let duration = stats
            .end_time
            .unwrap_or_else(Utc::now)
            .signed_duration_since(stats.start_time);

        info!(
            "Ran {} round(s) in {}s: {} check(s), {} skipped, {} with slots",
            stats.rounds,
            duration.num_seconds(),
            stats.checks,
            stats.skipped,
            stats.slots_found
        );

        let mut outcomes: Vec<_> = stats.outcomes.iter().collect();
        outcomes.sort();
        for (outcome, count) in outcomes {
            info!("  outcome {}: {}", outcome, count);
        }

        let mut notices: Vec<_> = stats.notices.iter().collect();
        notices.sort();
        for (notice, count) in notices {
            info!("  notice {}: {}", notice, count);
        }

        if stats.session_recoveries + stats.failed_recoveries > 0 {
            info!(
                "Session recoveries: {} ({} failed)",
                stats.session_recoveries, stats.failed_recoveries
            );
        }
        if stats.mail_failures > 0 {
            info!("Undelivered mails: {}", stats.mail_failures);
        }
    }
}

impl Default for StatsTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate_across_clones() {
        let tracker = StatsTracker::new();
        let shared = tracker.clone();

        tracker.record_round();
        tracker.record_check("no_slot".into(), false);
        shared.record_check("slot_found".into(), true);
        shared.record_check("no_slot".into(), false);
        tracker.record_skip();
        tracker.record_notice("slot_found".into());
        tracker.record_recovery(true);
        tracker.record_recovery(false);
        tracker.finish();

        let stats = tracker.get_stats();
        assert_eq!(stats.rounds, 1);
        assert_eq!(stats.checks, 3);
        assert_eq!(stats.slots_found, 1);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.outcomes["no_slot"], 2);
        assert_eq!(stats.notices["slot_found"], 1);
        assert_eq!(stats.session_recoveries, 1);
        assert_eq!(stats.failed_recoveries, 1);
        assert!(stats.end_time.is_some());
    }
}
