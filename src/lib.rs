//! MiniCDC - a minimal MySQL change-data-capture pipeline
//!
//! Tails a MySQL binlog, turns each row change into a self-describing JSON
//! message, batches messages to SQS, and checkpoints the replication
//! position in DynamoDB only after the queue has accepted the batch.
//! Delivery is at-least-once: a crash between publish and checkpoint
//! replays duplicates, never leaves gaps.
//!
//! Data flow:
//!
//! ```text
//! MySQL binlog --> DataSource --> EventProcessor --> buffer
//!                                                      |
//!                                            FlushPolicy decides
//!                                                      |
//!                                                      v
//!                              Stream (SQS) --> StateManager (DynamoDB)
//!                              publish first       checkpoint after
//! ```
//!
//! The `Coordinator` owns the buffer and enforces the ordering contract;
//! the `Worker` drives it in a loop with idle backoff and handles
//! shutdown.

pub mod aws;
pub mod config;
pub mod datasource;
pub mod error;
pub mod filters;
pub mod processing;
pub mod serializer;
pub mod state;
pub mod stream;
pub mod types;

pub use error::{CdcError, Result};
