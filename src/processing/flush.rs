//! Flush policies
//!
//! A flush policy is a stateless predicate over the buffer length and the
//! time since the last flush. An empty buffer is never flushed.

use std::time::{Duration, Instant};

use crate::error::{CdcError, Result};

/// Decides when the coordinator should flush its buffer
pub trait FlushPolicy: Send {
    /// `true` when the buffer should be flushed now
    fn should_flush(&self, buffered: usize, last_flush: Instant) -> bool;

    /// Hook for stateful variants; the built-in policy has nothing to reset
    fn reset(&mut self) {}
}

/// Flush when the buffer reaches a size threshold or when enough time has
/// passed since the last flush.
#[derive(Debug, Clone)]
pub struct BatchSizeAndTimePolicy {
    batch_size: usize,
    flush_interval: Duration,
}

impl BatchSizeAndTimePolicy {
    pub fn new(batch_size: usize, flush_interval: Duration) -> Result<Self> {
        if batch_size == 0 {
            return Err(CdcError::Configuration(
                "Flush batch size must be at least 1".to_string(),
            ));
        }
        if flush_interval.is_zero() {
            return Err(CdcError::Configuration(
                "Flush interval must be greater than zero".to_string(),
            ));
        }
        Ok(BatchSizeAndTimePolicy {
            batch_size,
            flush_interval,
        })
    }
}

impl FlushPolicy for BatchSizeAndTimePolicy {
    fn should_flush(&self, buffered: usize, last_flush: Instant) -> bool {
        if buffered == 0 {
            return false;
        }
        buffered >= self.batch_size || last_flush.elapsed() >= self.flush_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_buffer_never_flushes() {
        let policy = BatchSizeAndTimePolicy::new(1, Duration::from_millis(1)).unwrap();
        let last_flush = Instant::now();
        std::thread::sleep(Duration::from_millis(5));
        // Time threshold long exceeded, but the buffer is empty
        assert!(!policy.should_flush(0, last_flush));
    }

    #[test]
    fn test_flushes_at_batch_size() {
        let policy = BatchSizeAndTimePolicy::new(3, Duration::from_secs(60)).unwrap();
        let now = Instant::now();
        assert!(!policy.should_flush(1, now));
        assert!(!policy.should_flush(2, now));
        assert!(policy.should_flush(3, now));
        assert!(policy.should_flush(4, now));
    }

    #[test]
    fn test_flushes_after_interval() {
        let policy = BatchSizeAndTimePolicy::new(100, Duration::from_millis(10)).unwrap();
        let last_flush = Instant::now();
        assert!(!policy.should_flush(1, last_flush));
        std::thread::sleep(Duration::from_millis(15));
        assert!(policy.should_flush(1, last_flush));
    }

    #[test]
    fn test_invalid_parameters_rejected() {
        assert!(BatchSizeAndTimePolicy::new(0, Duration::from_secs(1)).is_err());
        assert!(BatchSizeAndTimePolicy::new(1, Duration::ZERO).is_err());
    }

    #[test]
    fn test_reset_is_a_noop() {
        let mut policy = BatchSizeAndTimePolicy::new(3, Duration::from_secs(60)).unwrap();
        policy.reset();
        assert!(policy.should_flush(3, Instant::now()));
    }
}
