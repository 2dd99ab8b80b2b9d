//! Idle-session sweeper: cancels `playing` sessions nobody has touched for
//! `engine.session_idle_timeout_secs`, refunding their bets.

use crate::session::GameEngine;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub struct IdleSessionSweeper {
    engine: Arc<GameEngine>,
    interval: Duration,
    running: Arc<AtomicBool>,
    sweeps: AtomicU64,
}

impl IdleSessionSweeper {
    /// Start sweeping on the current tokio runtime
    pub fn spawn(engine: Arc<GameEngine>, interval: Duration) -> Arc<Self> {
        let sweeper = Arc::new(Self {
            engine,
            interval: interval.max(Duration::from_millis(10)),
            running: Arc::new(AtomicBool::new(true)),
            sweeps: AtomicU64::new(0),
        });

        sweeper.clone().spawn_task();
        sweeper
    }

    fn spawn_task(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(self.interval);
            // First tick fires immediately; skip it so startup is not a sweep
            tick.tick().await;

            while self.running.load(Ordering::SeqCst) {
                tick.tick().await;
                if !self.running.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(e) = self.sweep_once().await {
                    tracing::warn!("Idle session sweep failed: {}", e);
                }
            }
            tracing::debug!("Idle session sweeper stopped");
        });
    }

    /// Run one sweep on the blocking pool; returns how many sessions expired
    pub async fn sweep_once(&self) -> Result<usize, String> {
        let engine = self.engine.clone();
        let expired = tokio::task::spawn_blocking(move || engine.expire_idle(chrono::Utc::now()))
            .await
            .map_err(|e| e.to_string())?
            .map_err(|e| e.to_string())?;

        self.sweeps.fetch_add(1, Ordering::Relaxed);
        Ok(expired.len())
    }

    pub fn sweeps(&self) -> u64 {
        self.sweeps.load(Ordering::Relaxed)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}
