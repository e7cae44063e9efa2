//! Coordinator
//!
//! Owns the buffer and drives the pipeline: pull a bounded number of events
//! from the data source, process each into a message, and flush to the
//! stream under the flush policy. The flush sub-protocol publishes before
//! checkpointing, so the stored position can never get ahead of what the
//! queue has accepted; a crash between the two replays duplicates but
//! never leaves a gap.

use std::time::{Duration, Instant};

use crate::datasource::{DataSource, EventStream};
use crate::error::Result;
use crate::processing::{EventProcessor, FlushPolicy};
use crate::state::StateManager;
use crate::stream::Stream;
use crate::types::{Message, Position};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    Started,
    Stopped,
}

pub struct Coordinator {
    datasource: Box<dyn DataSource>,
    state_manager: Box<dyn StateManager>,
    stream: Box<dyn Stream>,
    processor: EventProcessor,
    flush_policy: Box<dyn FlushPolicy>,
    /// Upper bound on events collected per step
    batch_size: usize,
    /// Upper bound on time spent waiting for events within one step
    collect_wait: Duration,
    buffer: Vec<Message>,
    /// Committed position of the latest event admitted to the buffer
    last_admitted: Position,
    /// Last position actually written to the state manager
    last_checkpointed: Option<Position>,
    last_flush: Instant,
    events: Option<Box<dyn EventStream>>,
    lifecycle: Lifecycle,
}

impl Coordinator {
    pub fn new(
        datasource: Box<dyn DataSource>,
        state_manager: Box<dyn StateManager>,
        stream: Box<dyn Stream>,
        processor: EventProcessor,
        flush_policy: Box<dyn FlushPolicy>,
        batch_size: usize,
        flush_interval: Duration,
    ) -> Self {
        Coordinator {
            datasource,
            state_manager,
            stream,
            processor,
            flush_policy,
            batch_size: batch_size.max(1),
            collect_wait: flush_interval,
            buffer: Vec::new(),
            last_admitted: Position::empty(),
            last_checkpointed: None,
            last_flush: Instant::now(),
            events: None,
            lifecycle: Lifecycle::Idle,
        }
    }

    /// Load the stored position, point the source at it and connect.
    /// Idempotent; a failure leaves the coordinator idle.
    pub fn start(&mut self) -> Result<()> {
        match self.lifecycle {
            Lifecycle::Started => {
                log::debug!("Coordinator already started");
                return Ok(());
            }
            Lifecycle::Stopped => {
                log::warn!("Coordinator already stopped, ignoring start");
                return Ok(());
            }
            Lifecycle::Idle => {}
        }

        self.load_state();
        self.datasource.connect().map_err(|e| {
            log::error!("Failed to start coordinator: {}", e);
            e.into_processing()
        })?;
        self.lifecycle = Lifecycle::Started;
        self.last_flush = Instant::now();
        log::info!("Connected to data source");
        Ok(())
    }

    fn load_state(&mut self) {
        let position = self
            .state_manager
            .read(self.datasource.source_type(), self.datasource.source_id());
        if position.is_empty() {
            log::info!("No saved state found, starting from default position");
        } else {
            log::info!("Resuming from saved position: {}", position);
            self.datasource.set_start_position(position);
        }
    }

    /// Perform one bounded unit of work. Returns whether any event was
    /// processed, so the worker can apply idle backoff.
    pub fn step(&mut self) -> Result<bool> {
        if self.lifecycle != Lifecycle::Started {
            log::debug!("Coordinator is not running, skipping step");
            return Ok(false);
        }

        let mut events = match self.events.take() {
            Some(stream) => stream,
            None => self.datasource.listen().map_err(|e| {
                log::error!("Failed to obtain event stream: {}", e);
                e.into_processing()
            })?,
        };

        let mut collected: Vec<Message> = Vec::new();
        let deadline = Instant::now() + self.collect_wait;
        while collected.len() < self.batch_size {
            let wait = deadline.saturating_duration_since(Instant::now());
            if wait.is_zero() {
                break;
            }
            match events.next_event(wait) {
                Ok(Some(event)) => collected.push(self.processor.process(&event)),
                Ok(None) => break,
                Err(e) => {
                    // Stream is exhausted; the next successful step after a
                    // reconnect obtains a fresh one.
                    log::error!("Error processing events: {}", e);
                    return Err(e.into_processing());
                }
            }
        }
        self.events = Some(events);

        let processed = collected.len();
        if processed > 0 {
            self.buffer.append(&mut collected);
            // Read after appending so the token reflects committed
            // transactions covering everything buffered so far.
            self.last_admitted = self.datasource.current_position();
            log::debug!(
                "Processed {} events, buffer size: {}",
                processed,
                self.buffer.len()
            );
        }

        if self.flush_policy.should_flush(self.buffer.len(), self.last_flush) {
            self.flush().map_err(|e| e.into_processing())?;
        }

        Ok(processed > 0)
    }

    /// Publish the buffer, then advance the checkpoint.
    ///
    /// On a send failure the buffer and positions are untouched and the
    /// error surfaces. When the send succeeds but the checkpoint write
    /// fails, the buffer is kept: the next flush re-sends it, and
    /// downstream consumers dedupe.
    fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        let position = self.last_admitted.clone();
        log::debug!(
            "Prepared {} messages for sending (position {})",
            self.buffer.len(),
            position
        );

        self.stream.send(&self.buffer)?;

        if self.save_position(&position) {
            self.buffer.clear();
            self.last_flush = Instant::now();
            self.flush_policy.reset();
        } else {
            log::warn!(
                "Checkpoint write failed, keeping {} published messages for re-send",
                self.buffer.len()
            );
        }
        Ok(())
    }

    /// Store the position unless it is empty or identical to the last
    /// written value. Returns whether the buffer may be cleared.
    fn save_position(&mut self, position: &Position) -> bool {
        if position.is_empty() {
            log::debug!("No committed position available yet, skipping checkpoint");
            return true;
        }
        if self.last_checkpointed.as_ref() == Some(position) {
            log::debug!("Position {} already saved, skipping duplicate save", position);
            return true;
        }

        let stored = self.state_manager.store(
            self.datasource.source_type(),
            self.datasource.source_id(),
            position,
        );
        if stored {
            log::debug!(
                "Updated state for {}:{} to {}",
                self.datasource.source_type(),
                self.datasource.source_id(),
                position
            );
            self.last_checkpointed = Some(position.clone());
        }
        stored
    }

    /// Attempt one final flush, then release the sink and the source.
    /// Idempotent; cleanup failures are logged, never raised.
    pub fn stop(&mut self) {
        if self.lifecycle == Lifecycle::Stopped {
            log::debug!("Coordinator already stopped");
            return;
        }
        let was_started = self.lifecycle == Lifecycle::Started;
        self.lifecycle = Lifecycle::Stopped;
        log::debug!("Stopping coordinator");

        if was_started {
            if let Err(e) = self.flush() {
                // No checkpoint was written for these events, so they are
                // re-delivered on the next start.
                log::error!("Final flush failed, events will be re-sent after restart: {}", e);
            }
        }

        self.events = None;
        self.stream.close();
        self.datasource.disconnect();
        log::info!("Coordinator stopped");
    }
}
