//! Worker loop
//!
//! Thin supervisor around the coordinator: repeatedly invokes `step`,
//! applies idle backoff when the source is quiet, and guarantees a single
//! graceful shutdown on every exit path. Processing errors are not retried
//! here; they surface to the caller, which exits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::error::Result;

use super::Coordinator;

/// Consecutive idle steps before backoff kicks in
const IDLE_THRESHOLD: u32 = 10;
const IDLE_BASE_SLEEP_SECS: f64 = 0.1;
const IDLE_MAX_SLEEP_SECS: f64 = 5.0;

pub struct Worker {
    coordinator: Coordinator,
    shutdown: Arc<AtomicBool>,
}

impl Worker {
    pub fn new(coordinator: Coordinator) -> Self {
        Worker {
            coordinator,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag observed by the run loop; hand this to signal handlers
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Signal the worker to stop after the current step. Idempotent.
    pub fn stop(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            log::debug!("Stop already in progress, ignoring duplicate call");
        } else {
            log::info!("Stop signal received");
        }
    }

    /// Run the pipeline until stopped or until a processing error escapes.
    pub fn run(&mut self) -> Result<()> {
        log::info!("Worker started");

        if let Err(e) = self.coordinator.start() {
            log::error!("Worker failed to start: {}", e);
            self.coordinator.stop();
            return Err(e);
        }

        let mut idle_count: u32 = 0;
        let result = loop {
            if self.shutdown.load(Ordering::Acquire) {
                break Ok(());
            }

            match self.coordinator.step() {
                Ok(true) => idle_count = 0,
                Ok(false) => {
                    idle_count += 1;
                    if idle_count >= IDLE_THRESHOLD {
                        thread::sleep(idle_backoff(idle_count - IDLE_THRESHOLD));
                    }
                }
                Err(e) => {
                    log::error!("Worker error: {}", e);
                    break Err(e);
                }
            }
        };

        self.coordinator.stop();
        if result.is_ok() {
            log::info!("Worker stopped gracefully");
        }
        result
    }
}

/// Capped exponential backoff, `k` counted from the threshold crossing
fn idle_backoff(k: u32) -> Duration {
    let secs = IDLE_BASE_SLEEP_SECS * 1.5f64.powi(k.min(10) as i32);
    Duration::from_secs_f64(secs.min(IDLE_MAX_SLEEP_SECS))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_backoff_starts_at_base() {
        assert_eq!(idle_backoff(0), Duration::from_secs_f64(0.1));
    }

    #[test]
    fn test_idle_backoff_grows_geometrically() {
        assert!(idle_backoff(1) > idle_backoff(0));
        assert!(idle_backoff(2) > idle_backoff(1));
        let ratio = idle_backoff(1).as_secs_f64() / idle_backoff(0).as_secs_f64();
        assert!((ratio - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_idle_backoff_is_capped() {
        assert_eq!(idle_backoff(10), Duration::from_secs_f64(5.0));
        assert_eq!(idle_backoff(100), Duration::from_secs_f64(5.0));
    }
}
