//! MiniCDC entry point
//!
//! Wires the pipeline together from environment configuration: data source,
//! stream and state manager come from their factories, the worker drives
//! the coordinator until a shutdown signal or an unrecovered error.

use std::process;
use std::sync::Arc;

use log::{error, info};

use minicdc::config::AppConfig;
use minicdc::datasource::DataSourceFactory;
use minicdc::error::CdcError;
use minicdc::filters::{FilterChain, RedactFields};
use minicdc::processing::{BatchSizeAndTimePolicy, Coordinator, EventProcessor, Worker};
use minicdc::state::StateManagerFactory;
use minicdc::stream::StreamFactory;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::new().filter_or("LOG_LEVEL", "info")).init();

    if let Err(e) = run() {
        error!("{}", e);
        process::exit(1);
    }
}

fn run() -> minicdc::Result<()> {
    let config = AppConfig::from_env()?;

    let datasource = DataSourceFactory::create(&config.datasource_type)?;
    let stream = StreamFactory::create(&config.stream_type)?;
    let state_manager = StateManagerFactory::create(&config.state_manager_type)?;

    let mut filters = FilterChain::new();
    if !config.redact_paths.is_empty() {
        let paths: Vec<&str> = config.redact_paths.iter().map(String::as_str).collect();
        filters.add_filter(Box::new(RedactFields::new(&paths)));
        info!("Redacting {} field paths from outgoing messages", paths.len());
    }

    let processor = EventProcessor::new(datasource.source_type(), datasource.source_id(), filters);
    let flush_policy = BatchSizeAndTimePolicy::new(config.batch_size, config.flush_interval)?;

    let coordinator = Coordinator::new(
        datasource,
        state_manager,
        stream,
        processor,
        Box::new(flush_policy),
        config.batch_size,
        config.flush_interval,
    );
    let mut worker = Worker::new(coordinator);

    // SIGINT and SIGTERM flip the worker's shutdown flag; redundant
    // deliveries are harmless.
    let shutdown = worker.shutdown_flag();
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register(signal, Arc::clone(&shutdown)).map_err(|e| {
            CdcError::Configuration(format!("Failed to register signal handler: {}", e))
        })?;
    }

    info!("Starting MiniCDC worker");
    worker.run()
}
