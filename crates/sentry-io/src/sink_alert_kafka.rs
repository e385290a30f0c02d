//! Sink that detects extreme values and sends alert objects to a kafka
//! cluster.
//!
//! Incoming values (usually ratios from a statistic filter) are thresholded
//! against `min` and `max` into three statuses: low, normal, high. A status
//! change to non-normal raises an alert; with `minduration` configured the
//! alert is held back until the event has lasted that long, and events that
//! end sooner are discarded silently. A return to normal after an emitted
//! alert produces a "normal" alert; `waitnormal` applies the same hold-back
//! on the way down.
//!
//! Alerts are JSON objects in the watchtower-alert legacy format, produced
//! with the series key as the kafka message key. Delivery failures are
//! logged but never abort the run; the producer is flushed on exit.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use sentry_core::config::AlertKafkaSpec;
use sentry_core::{Context, Key, Message, Operator, Sample, SampleRx, SentryError, Sink, Value};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Low,
    Normal,
    High,
}

/// A status change waiting out `minduration`.
#[derive(Debug, Clone, Copy)]
struct Pending {
    time: i64,
    value: f64,
    actual: Option<f64>,
    predicted: Option<f64>,
}

/// One alert to be produced.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertEvent {
    status_normal: bool,
    condition: String,
    pub key: Key,
    pub time: i64,
    pub value: f64,
    pub actual: Option<f64>,
    pub predicted: Option<f64>,
}

pub struct AlertKafka {
    spec: AlertKafkaSpec,
    method: String,
    minduration: Option<f64>,
    status: HashMap<Key, Status>,
    pending_alert: HashMap<Key, Pending>,
    pending_normal: HashMap<Key, Pending>,
    producer: Option<FutureProducer>,
}

impl AlertKafka {
    pub fn new(spec: AlertKafkaSpec, ctx: &Context) -> Result<Self, SentryError> {
        let method = ctx.method.clone().ok_or_else(|| {
            SentryError::user(
                "sinks.AlertKafka expects the method context entry to be set by a previous module",
            )
        })?;
        let producer = if spec.disable {
            None
        } else {
            let producer = ClientConfig::new()
                .set("bootstrap.servers", &spec.brokers)
                .create()
                .map_err(|e| SentryError::user(format!("kafka producer: {e}")))?;
            Some(producer)
        };
        // minduration of zero behaves as if unset
        let minduration = spec.minduration.filter(|d| *d > 0.0);
        Ok(Self {
            spec,
            method,
            minduration,
            status: HashMap::new(),
            pending_alert: HashMap::new(),
            pending_normal: HashMap::new(),
            producer,
        })
    }

    fn classify(&self, value: f64) -> Status {
        if self.spec.min.is_some_and(|min| value < min) {
            Status::Low
        } else if self.spec.max.is_some_and(|max| value > max) {
            Status::High
        } else {
            Status::Normal
        }
    }

    fn condition_label(&self, status: Status) -> String {
        match status {
            Status::Low => format!("< {}", self.spec.min.unwrap_or(f64::NAN)),
            Status::Normal => "normal".to_string(),
            Status::High => format!("> {}", self.spec.max.unwrap_or(f64::NAN)),
        }
    }

    fn event(
        &self,
        status: Status,
        time: i64,
        key: &Key,
        value: f64,
        actual: Option<f64>,
        predicted: Option<f64>,
    ) -> AlertEvent {
        AlertEvent {
            status_normal: status == Status::Normal,
            condition: self.condition_label(status),
            key: key.clone(),
            time,
            value,
            actual,
            predicted,
        }
    }

    /// Advance the per-key state machine by one sample.
    pub fn observe(&mut self, sample: &Sample) -> Option<AlertEvent> {
        let (value, actual, predicted) = match sample.value {
            Value::Num(v) => (v, None, None),
            Value::Triple(t) => (t.ratio?, Some(t.actual), Some(t.predicted)),
            Value::None => return None,
        };
        let (key, t) = (&sample.key, sample.time);
        let status = self.classify(value);
        let current = *self.status.entry(key.clone()).or_insert(Status::Normal);

        if status != current {
            self.status.insert(key.clone(), status);

            let Some(minduration) = self.minduration else {
                // no hold-back configured, alert now
                return Some(self.event(status, t, key, value, actual, predicted));
            };
            if status == Status::Normal {
                if let Some(pending) = self.pending_alert.remove(key) {
                    // the event ended before reaching minduration
                    info!(
                        "Discarding suppressed alert for '{}' (init_t: {}, t: {}, minduration: {})",
                        key, pending.time, t, minduration
                    );
                    if (t - pending.time) as f64 > minduration {
                        warn!(
                            "Discarding suppressed alert for '{}' that exceeds minduration \
                             (init_t: {}, t: {}, minduration: {})",
                            key, pending.time, t, minduration
                        );
                    }
                } else if self.spec.waitnormal && !self.pending_normal.contains_key(key) {
                    // possibly back to normal, wait for more observations
                    self.pending_normal.insert(
                        key.clone(),
                        Pending {
                            time: t,
                            value,
                            actual,
                            predicted,
                        },
                    );
                    info!("Suppressing normal alert for {}", key);
                } else if !self.spec.waitnormal {
                    info!("Creating normal alert for {} at {}", key, t);
                    return Some(self.event(status, t, key, value, actual, predicted));
                }
            } else if self.spec.waitnormal && self.pending_normal.contains_key(key) {
                // the return to normal did not hold, stay alerted
                if let Some(pending) = self.pending_normal.remove(key) {
                    info!(
                        "Discarding suppressed normal alert for '{}' (init_t: {}, t: {}, \
                         minduration: {})",
                        key, pending.time, t, minduration
                    );
                    if (t - pending.time) as f64 > minduration {
                        warn!(
                            "Discarding suppressed normal alert for '{}' that exceeds \
                             minduration (init_t: {}, t: {}, minduration: {})",
                            key, pending.time, t, minduration
                        );
                    }
                }
            } else {
                self.pending_alert.insert(
                    key.clone(),
                    Pending {
                        time: t,
                        value,
                        actual,
                        predicted,
                    },
                );
                info!("Suppressing alert for {}", key);
            }
        } else if status != Status::Normal {
            // continuation of a non-normal event
            if let Some(minduration) = self.minduration {
                if let Some(pending) = self.pending_alert.get(key).copied() {
                    if pending.time as f64 + minduration <= t as f64 {
                        info!(
                            "Suppressed alert for '{}' passed minduration (init_t: {}, t: {}, \
                             minduration: {})",
                            key, pending.time, t, minduration
                        );
                        self.pending_alert.remove(key);
                        return Some(self.event(
                            status,
                            pending.time,
                            key,
                            pending.value,
                            pending.actual,
                            pending.predicted,
                        ));
                    }
                    info!(
                        "Continuing to suppress alert for {} (duration: {})",
                        key,
                        t - pending.time
                    );
                }
            }
        } else {
            // continuation of normal
            if let (Some(minduration), true) = (self.minduration, self.spec.waitnormal) {
                if let Some(pending) = self.pending_normal.get(key).copied() {
                    if pending.time as f64 + minduration <= t as f64 {
                        info!(
                            "Suppressed normal alert for '{}' passed minduration (init_t: {}, \
                             t: {}, minduration: {})",
                            key, pending.time, t, minduration
                        );
                        self.pending_normal.remove(key);
                        return Some(self.event(
                            Status::Normal,
                            pending.time,
                            key,
                            pending.value,
                            pending.actual,
                            pending.predicted,
                        ));
                    }
                    info!(
                        "Continuing to suppress normal alert for {} (duration: {})",
                        key,
                        t - pending.time
                    );
                }
            }
        }
        None
    }

    /// Cram the alert data into the watchtower-alert legacy format.
    fn record_json(&self, ev: &AlertEvent) -> String {
        json!({
            "fqid": self.spec.fqid,
            "name": self.spec.name,
            "level": if ev.status_normal { "normal" } else { "critical" },
            "time": ev.time,
            "expression": null,
            "history_expression": null,
            "method": self.method,
            "violations": [{
                "expression": ev.key.as_str(),
                "condition": ev.condition,
                "value": ev.actual.unwrap_or(ev.value),
                "history_value": ev.predicted,
                "history": null,
                "time": ev.time,
            }],
        })
        .to_string()
    }

    async fn deliver(&self, ev: &AlertEvent) {
        let payload = self.record_json(ev);
        match &self.producer {
            None => println!("{payload}"),
            Some(producer) => {
                let record = FutureRecord::to(&self.spec.topic)
                    .key(ev.key.as_bytes())
                    .payload(&payload);
                match producer.send(record, Duration::from_secs(5)).await {
                    Ok((partition, offset)) => {
                        debug!("message delivered to partition {partition} at offset {offset}");
                    }
                    Err((e, _)) => error!("message delivery failed: {e}"),
                }
            }
        }
    }
}

#[async_trait]
impl Operator for AlertKafka {
    fn name(&self) -> &str {
        "sinks.AlertKafka"
    }
}

#[async_trait]
impl Sink for AlertKafka {
    async fn run(&mut self, mut rx: SampleRx, _cancel: CancellationToken) -> Result<()> {
        debug!("AlertKafka.run()");
        while let Some(msg) = rx.recv().await {
            match msg {
                Message::Sample(sample) => {
                    if let Some(ev) = self.observe(&sample) {
                        self.deliver(&ev).await;
                    }
                }
                Message::Eos => break,
            }
        }
        if let Some(producer) = &self.producer {
            if let Err(e) = producer.flush(Duration::from_secs(10)) {
                error!("flush failed: {e}");
            }
        }
        debug!("AlertKafka.run() done");
        Ok(())
    }
}
