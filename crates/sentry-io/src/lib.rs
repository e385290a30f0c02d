//! # Sentry I/O - Source and Sink Implementations
//!
//! This crate provides the concrete sources and sinks for watchtower-sentry
//! pipelines.
//!
//! ## Sources
//! - **Realtime**: live `(key, value, time)` ingest from a TSK kafka service
//! - **Historical**: paged ingest from an HTTP time-series API
//! - **JsonIn**: newline-delimited JSON from a file or stdin
//! - **DataIn**: in-memory samples, for tests
//!
//! ## Sinks
//! - **AlertKafka**: thresholding state machine producing alert objects to kafka
//! - **JsonOut**: newline-delimited JSON to a file or stdout
//! - **DataOut**: in-memory collection, for tests
//!
//! The long-running sources feed the pipeline through the bounded single-slot
//! [`handoff`] between a background reader task and the pipeline consumer.

use sentry_core::{config::StageSpec, Context, SentryError, Sink, Source};

/// Bounded reader-to-pipeline batch handoff
pub mod handoff;

/// Live TSK kafka source
pub mod source_realtime;

/// Historical HTTP API source
pub mod source_historical;

/// JSON-lines source
pub mod source_json;

/// In-memory source for tests
pub mod source_data;

/// Alerting kafka sink
pub mod sink_alert_kafka;

/// JSON-lines sink
pub mod sink_json;

/// In-memory sink for tests
pub mod sink_data;

/// Build a source from its configuration entry.
pub fn create_source(spec: &StageSpec, ctx: &mut Context) -> Result<Box<dyn Source>, SentryError> {
    match spec {
        StageSpec::Realtime(s) => Ok(Box::new(source_realtime::Realtime::new(s.clone())?)),
        StageSpec::Historical(s) => Ok(Box::new(source_historical::Historical::new(
            s.clone(),
            ctx,
        )?)),
        StageSpec::JsonIn(s) => Ok(Box::new(source_json::JsonIn::new(s.clone(), ctx))),
        other => Err(SentryError::user(format!(
            "{} is not a Source",
            other.module()
        ))),
    }
}

/// Build a sink from its configuration entry.
pub fn create_sink(spec: &StageSpec, ctx: &Context) -> Result<Box<dyn Sink>, SentryError> {
    match spec {
        StageSpec::AlertKafka(s) => Ok(Box::new(sink_alert_kafka::AlertKafka::new(
            s.clone(),
            ctx,
        )?)),
        StageSpec::JsonOut(s) => Ok(Box::new(sink_json::JsonOut::new(s.clone()))),
        other => Err(SentryError::user(format!(
            "{} is not a Sink",
            other.module()
        ))),
    }
}
