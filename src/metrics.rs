//! Engine counters, exported in Prometheus text format

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

pub struct EngineMetrics {
    start_time: Instant,
    pub sessions_created: AtomicU64,
    pub sessions_resolved: AtomicU64,
    pub sessions_cancelled: AtomicU64,
    pub sessions_expired: AtomicU64,
    pub plays_total: AtomicU64,
    pub wagered_total: AtomicU64,
    pub paid_out_total: AtomicU64,
    pub ledger_conflicts: AtomicU64,
    pub commitment_failures: AtomicU64,
    pub http_requests_total: AtomicU64,
    pub errors_total: AtomicU64,
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            sessions_created: AtomicU64::new(0),
            sessions_resolved: AtomicU64::new(0),
            sessions_cancelled: AtomicU64::new(0),
            sessions_expired: AtomicU64::new(0),
            plays_total: AtomicU64::new(0),
            wagered_total: AtomicU64::new(0),
            paid_out_total: AtomicU64::new(0),
            ledger_conflicts: AtomicU64::new(0),
            commitment_failures: AtomicU64::new(0),
            http_requests_total: AtomicU64::new(0),
            errors_total: AtomicU64::new(0),
        }
    }

    pub fn record_created(&self, bet_amount: u64) {
        self.sessions_created.fetch_add(1, Ordering::Relaxed);
        self.wagered_total.fetch_add(bet_amount, Ordering::Relaxed);
    }

    pub fn record_play(&self) {
        self.plays_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_resolved(&self, payout: u64) {
        self.sessions_resolved.fetch_add(1, Ordering::Relaxed);
        self.paid_out_total.fetch_add(payout, Ordering::Relaxed);
    }

    pub fn record_cancelled(&self, expired: bool) {
        self.sessions_cancelled.fetch_add(1, Ordering::Relaxed);
        if expired {
            self.sessions_expired.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_error(&self, error: &crate::errors::EngineError) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
        match error {
            crate::errors::EngineError::LedgerConflict(_) => {
                self.ledger_conflicts.fetch_add(1, Ordering::Relaxed);
            }
            crate::errors::EngineError::CommitmentFailure(_) => {
                self.commitment_failures.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    pub fn record_request(&self) {
        self.http_requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Prometheus exposition format
    pub fn render_prometheus(&self) -> String {
        let counters: [(&str, &str, &AtomicU64); 11] = [
            ("fairplay_sessions_created_total", "Sessions created", &self.sessions_created),
            ("fairplay_sessions_resolved_total", "Sessions resolved", &self.sessions_resolved),
            ("fairplay_sessions_cancelled_total", "Sessions cancelled", &self.sessions_cancelled),
            ("fairplay_sessions_expired_total", "Sessions cancelled by the idle sweeper", &self.sessions_expired),
            ("fairplay_plays_total", "Play actions applied", &self.plays_total),
            ("fairplay_wagered_total", "Sum of accepted bets", &self.wagered_total),
            ("fairplay_paid_out_total", "Sum of payouts", &self.paid_out_total),
            ("fairplay_ledger_conflicts_total", "Version conflicts surfaced to callers", &self.ledger_conflicts),
            ("fairplay_commitment_failures_total", "Seed commitments that failed", &self.commitment_failures),
            ("fairplay_http_requests_total", "HTTP requests served", &self.http_requests_total),
            ("fairplay_errors_total", "Engine errors returned", &self.errors_total),
        ];

        let mut output = String::new();
        for (name, help, value) in counters {
            output.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} counter\n{name} {}\n\n",
                value.load(Ordering::Relaxed)
            ));
        }
        output.push_str(&format!(
            "# HELP fairplay_uptime_seconds Process uptime\n\
             # TYPE fairplay_uptime_seconds gauge\n\
             fairplay_uptime_seconds {}\n",
            self.uptime().as_secs()
        ));
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::EngineError;

    #[test]
    fn test_counters_render() {
        let metrics = EngineMetrics::new();
        metrics.record_created(100);
        metrics.record_created(50);
        metrics.record_resolved(198);
        metrics.record_cancelled(true);
        metrics.record_error(&EngineError::LedgerConflict("x".into()));

        let text = metrics.render_prometheus();
        assert!(text.contains("fairplay_sessions_created_total 2"));
        assert!(text.contains("fairplay_wagered_total 150"));
        assert!(text.contains("fairplay_paid_out_total 198"));
        assert!(text.contains("fairplay_sessions_expired_total 1"));
        assert!(text.contains("fairplay_ledger_conflicts_total 1"));
        assert!(text.contains("# TYPE fairplay_errors_total counter"));
    }
}
