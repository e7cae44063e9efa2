//! Event processing pipeline
//!
//! The coordinator pulls events from the data source, runs them through
//! the event processor, buffers the results, and flushes to the stream
//! under the flush policy. The worker supervises the coordinator loop.

mod coordinator;
mod flush;
mod processor;
mod worker;

pub use coordinator::Coordinator;
pub use flush::{BatchSizeAndTimePolicy, FlushPolicy};
pub use processor::EventProcessor;
pub use worker::Worker;
