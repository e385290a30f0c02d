//! Live source reading `(key, value, time)` tuples from a TSK (Time Series
//! Kafka) service.
//!
//! Each kafka message payload is a batch of newline-separated
//! `key value timestamp` lines that share one timestamp. Keys are filtered
//! against the configured glob expressions before entering the pipeline, so
//! downstream stages only ever see matching series. Output will include some
//! amount (perhaps several days worth) of buffered data prior to the
//! near-realtime data.

use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::Message as KafkaMessage;
use regex::Regex;
use sentry_core::config::RealtimeSpec;
use sentry_core::{glob, Key, Message, Operator, Sample, SampleTx, SentryError, Source, Value};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::handoff::{handoff, BatchSender};

/// How often the reader logs its ingest rate.
const STATS_INTERVAL: Duration = Duration::from_secs(60);

pub struct Realtime {
    spec: RealtimeSpec,
    regexes: Vec<Regex>,
    topic: String,
}

impl Realtime {
    pub fn new(spec: RealtimeSpec) -> Result<Self, SentryError> {
        let regexes = spec
            .expressions
            .iter()
            .map(|e| glob::compile(e))
            .collect::<Result<Vec<_>, _>>()?;
        debug!("expressions: {:?}", spec.expressions);
        let topic = format!("{}.{}", spec.topicprefix, spec.channelname);
        Ok(Self {
            spec,
            regexes,
            topic,
        })
    }

    fn consumer(&self) -> Result<StreamConsumer, KafkaError> {
        ClientConfig::new()
            .set("bootstrap.servers", &self.spec.brokers)
            .set(
                "group.id",
                format!("{}.{}", self.spec.consumergroup, self.topic),
            )
            .set("auto.offset.reset", "earliest")
            .set("heartbeat.interval.ms", "3000")
            .set("api.version.request", "true")
            .set("enable.auto.commit", "true")
            .set("enable.partition.eof", "false")
            .create()
    }
}

/// Kafka "errors" that are not really errors.
fn is_benign(err: &KafkaError) -> bool {
    matches!(err, KafkaError::PartitionEOF(_))
        || matches!(
            err,
            KafkaError::MessageConsumption(RDKafkaErrorCode::OperationTimedOut)
        )
}

/// Parse one TSK payload: newline-separated `key value timestamp` lines, all
/// carrying the same timestamp. Matching samples are appended to `batch`.
fn parse_payload(
    payload: &[u8],
    regexes: &[Regex],
    batch: &mut Vec<Sample>,
    kv_cnt: &mut u64,
    kv_match_cnt: &mut u64,
) {
    let mut msg_time: Option<i64> = None;
    for line in payload.split(|&b| b == b'\n') {
        if line.is_empty() {
            continue;
        }
        let text = String::from_utf8_lossy(line);
        let mut fields = text.split(' ');
        let (Some(key), Some(val), Some(ts), None) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            debug!("Unexpected message format: {}", text);
            continue;
        };
        let (Ok(val), Ok(ts)) = (val.parse::<f64>(), ts.parse::<i64>()) else {
            debug!("Unexpected message format: {}", text);
            continue;
        };
        match msg_time {
            None => msg_time = Some(ts),
            Some(t) if t != ts => {
                warn!("timestamp {} differs from batch timestamp {}", ts, t);
            }
            _ => {}
        }
        *kv_cnt += 1;
        if regexes.iter().any(|re| re.is_match(key)) {
            *kv_match_cnt += 1;
            batch.push(Sample::new(Key::from(key), Value::Num(val), ts));
        }
    }
}

async fn read_loop(
    consumer: StreamConsumer,
    regexes: &[Regex],
    sender: &BatchSender,
    cancel: CancellationToken,
) -> Result<()> {
    let mut stream = consumer.stream();
    let mut kv_cnt = 0u64;
    let mut kv_match_cnt = 0u64;
    let mut last_log = Instant::now();
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = stream.next() => msg,
        };
        let now = Instant::now();
        if now.duration_since(last_log) >= STATS_INTERVAL {
            let secs = now.duration_since(last_log).as_secs_f64();
            info!(
                "Realtime: {} KVs ({:.1} per sec.), {} matched KVs ({:.1} per sec.)",
                kv_cnt,
                kv_cnt as f64 / secs,
                kv_match_cnt,
                kv_match_cnt as f64 / secs
            );
            kv_cnt = 0;
            kv_match_cnt = 0;
            last_log = now;
        }
        match msg {
            None => break,
            Some(Ok(m)) => {
                let Some(payload) = m.payload() else {
                    continue;
                };
                let mut batch = Vec::new();
                parse_payload(payload, regexes, &mut batch, &mut kv_cnt, &mut kv_match_cnt);
                if batch.is_empty() {
                    continue;
                }
                if !sender.publish(batch).await {
                    break;
                }
            }
            Some(Err(e)) if is_benign(&e) => {
                debug!("Ignoring benign kafka 'error': {}", e);
            }
            Some(Err(e)) => {
                error!("Unhandled kafka error, shutting down: {}", e);
                return Err(anyhow::anyhow!("kafka: {e}"));
            }
        }
    }
    Ok(())
}

#[async_trait]
impl Operator for Realtime {
    fn name(&self) -> &str {
        "sources.Realtime"
    }
}

#[async_trait]
impl Source for Realtime {
    async fn run(&mut self, tx: SampleTx, cancel: CancellationToken) -> Result<()> {
        let consumer = self.consumer()?;
        consumer.subscribe(&[&self.topic])?;
        debug!("subscribed to {}", self.topic);

        let (sender, mut receiver) = handoff(cancel.child_token());
        let regexes = self.regexes.clone();
        let reader_cancel = cancel.child_token();
        let reader = tokio::spawn(async move {
            if let Err(e) = read_loop(consumer, &regexes, &sender, reader_cancel).await {
                sender.fail(e).await;
            }
        });

        let result = async {
            while let Some(batch) = receiver.next().await? {
                for sample in batch {
                    if tx.send(Message::Sample(sample)).await.is_err() {
                        return Ok(());
                    }
                }
            }
            let _ = tx.send(Message::Eos).await;
            Ok(())
        }
        .await;

        // Stop the reader on every exit path and wait for it.
        cancel.cancel();
        let _ = reader.await;
        result
    }
}
