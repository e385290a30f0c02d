//! # Sentry Core - Streaming Anomaly Detection Core Library
//!
//! This crate provides the foundational types, traits, and abstractions for building
//! watchtower-sentry detection pipelines. It defines the sample messaging system,
//! the operator interfaces, the key-pattern glob language, and the configuration
//! structures used throughout the sentry ecosystem.
//!
//! ## Key Components
//!
//! - **Sample System**: `(key, value, time)` samples passed between pipeline operators
//! - **Operator Traits**: Source, Filter, and Sink abstractions for building pipelines
//! - **Glob Language**: DBATS-style key patterns compiled to anchored regexes
//! - **Configuration**: YAML-based pipeline specification with per-stage validation
//! - **Runner**: linear channel-connected pipeline execution
//!
//! ## Example Usage
//!
//! ```rust
//! use sentry_core::{Sample, Value};
//!
//! let sample = Sample::new("bgp.routers.sjc.visible", Value::Num(1042.0), 1_600_000_000);
//! assert_eq!(sample.value.as_f64(), Some(1042.0));
//! ```

use anyhow::Result;
use arcstr::ArcStr;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub mod config;
pub mod glob;
pub mod pipeline;

/// Sample keys are ASCII identifiers joined by `.`, shared cheaply between stages.
pub type Key = ArcStr;

/// Type alias for the sender side of a sample channel between pipeline operators
pub type SampleTx = mpsc::Sender<Message>;

/// Type alias for the receiver side of a sample channel between pipeline operators
pub type SampleRx = mpsc::Receiver<Message>;

/// Default buffer size for the channels connecting neighbouring stages.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 8;

/// The value carried by a [`Sample`].
///
/// Most of the pipeline deals in plain numbers. `None` is the "missing
/// observation" sentinel that sources may forward and aggregators count but do
/// not sum. `Triple` only appears downstream of a normalizing statistic filter
/// configured to include absolute values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    /// Missing observation
    None,
    /// A scalar observation. Integer inputs are carried as f64; sums and order
    /// statistics over inputs below 2^53 stay exact.
    Num(f64),
    /// `(ratio, actual, predicted)` produced by a normalizing statistic filter
    Triple(Triple),
}

/// The relative-plus-absolute payload emitted by `MovingStat` with `includeabsolute`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Triple {
    /// `actual / predicted`, or `None` when the prediction was zero
    pub ratio: Option<f64>,
    /// The observed value
    pub actual: f64,
    /// The statistic over the history window
    pub predicted: f64,
}

impl Value {
    /// The scalar payload, if this is a plain number.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Num(v) => Some(*v),
            _ => None,
        }
    }

    /// True for the missing-observation sentinel.
    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }
}

/// The universal payload on every edge of the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Series key, e.g. `bgp.prefix-visibility.NA.v4.visible_slash24_cnt`
    pub key: Key,
    /// Observation for this key at this time
    pub value: Value,
    /// Seconds since the epoch
    pub time: i64,
}

impl Sample {
    pub fn new(key: impl Into<Key>, value: Value, time: i64) -> Self {
        Self {
            key: key.into(),
            value,
            time,
        }
    }
}

/// Messages passed between pipeline operators.
#[derive(Debug, Clone)]
pub enum Message {
    /// One sample flowing down the pipeline
    Sample(Sample),
    /// End-of-stream marker
    ///
    /// Signals that no more samples will be sent through this channel. Stages
    /// flush any buffered state, forward the marker, and return. A closed
    /// channel is treated the same way.
    Eos,
}

/// Error types for sentry pipeline operations.
///
/// `User` errors are reported without a backtrace and map to exit code 1;
/// anything else is treated as an internal error (exit code 255).
#[derive(Debug, thiserror::Error)]
pub enum SentryError {
    /// Configuration or usage error, attributable to the operator of the program
    #[error("{0}")]
    User(String),

    /// Generic error wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SentryError {
    pub fn user(msg: impl Into<String>) -> Self {
        SentryError::User(msg.into())
    }
}

/// Shared construction-time parameter bag.
///
/// Stages read and write these entries while the pipeline is being built,
/// never during streaming. Sources record the `expression` they serve;
/// a statistic filter records the `method` a downstream alert sink labels
/// its alerts with. A stage that needs an entry fails construction when the
/// upstream stages did not provide it.
#[derive(Debug, Clone, Default)]
pub struct Context {
    /// Set by sources: the expression (or input name) this pipeline watches
    pub expression: Option<String>,
    /// Set by statistic filters: identifies the detection algorithm
    pub method: Option<String>,
}

/// Base trait for all pipeline operators
#[async_trait]
pub trait Operator: Send + Sync {
    /// Returns the module name of this operator, used for logging and errors
    fn name(&self) -> &str;
}

/// Trait for source operators
///
/// Sources are the entry points of pipelines. They produce samples without
/// consuming any, sending them downstream until their input is exhausted.
#[async_trait]
pub trait Source: Operator {
    /// Run the source until exhaustion or cancellation.
    ///
    /// Sends [`Message::Eos`] downstream on a clean end of stream. Errors
    /// propagate to the pipeline runner and terminate the run.
    async fn run(&mut self, tx: SampleTx, cancel: CancellationToken) -> Result<()>;
}

/// Trait for filter operators
///
/// Filters consume and produce. A filter may emit zero or more samples per
/// input and may buffer state between inputs; buffered state is flushed when
/// the end-of-stream marker arrives.
#[async_trait]
pub trait Filter: Operator {
    async fn run(&mut self, rx: SampleRx, tx: SampleTx, cancel: CancellationToken) -> Result<()>;
}

/// Trait for sink operators
///
/// Sinks consume only. They drive the pipeline by pulling their input channel
/// to exhaustion and release external resources on every exit path.
#[async_trait]
pub trait Sink: Operator {
    async fn run(&mut self, rx: SampleRx, cancel: CancellationToken) -> Result<()>;
}

/// Convert a time string in `YYYY-mm-dd [HH:MM[:SS]]` format (UTC) to a unix timestamp.
pub fn strtimegm(s: &str) -> Result<i64, SentryError> {
    use chrono::{NaiveDate, NaiveDateTime};

    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(dt.and_utc().timestamp());
        }
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        if let Some(dt) = d.and_hms_opt(0, 0, 0) {
            return Ok(dt.and_utc().timestamp());
        }
    }
    Err(SentryError::user(format!(
        "Invalid date '{s}'; expected 'YYYY-mm-dd [HH:MM[:SS]]'"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strtimegm_formats() {
        assert_eq!(strtimegm("1970-01-01").unwrap(), 0);
        assert_eq!(strtimegm("1970-01-02 00:01").unwrap(), 86460);
        assert_eq!(strtimegm("1970-01-01 00:00:30").unwrap(), 30);
        assert_eq!(strtimegm("2020-01-01").unwrap(), 1577836800);
        assert!(strtimegm("01/01/2020").is_err());
        assert!(strtimegm("2020-13-01").is_err());
    }

    #[test]
    fn value_accessors() {
        assert_eq!(Value::Num(2.5).as_f64(), Some(2.5));
        assert_eq!(Value::None.as_f64(), None);
        assert!(Value::None.is_none());
        let triple = Value::Triple(Triple {
            ratio: Some(0.5),
            actual: 5.0,
            predicted: 10.0,
        });
        assert_eq!(triple.as_f64(), None);
    }
}
