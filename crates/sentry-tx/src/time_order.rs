//! Filter that makes per-key timestamps increase strictly monotonically.
//!
//! Sources can deliver data slightly out of time order. Samples arriving at
//! exactly the expected next timestamp (`last + interval`) pass straight
//! through; samples from the future wait in a per-key buffer; samples at or
//! before the watermark are dropped. Buffered samples drain whenever they
//! chain onto the watermark, and after `timeout` seconds without an emission
//! for a key the next drain tolerates one gap and jumps the watermark
//! forward. Everything still buffered at end of stream drains in ascending
//! time order.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use sentry_core::config::TimeOrderSpec;
use sentry_core::{Filter, Key, Message, Operator, Sample, SampleRx, SampleTx, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Default)]
struct KeyState {
    /// Time of the newest emitted sample
    last_time: Option<i64>,
    /// Future samples waiting for the watermark to catch up
    buffered: BTreeMap<i64, Value>,
    /// Wall clock of the last emission for this key
    last_emit: Option<Instant>,
}

pub struct TimeOrder {
    interval: i64,
    timeout: Duration,
    keys: HashMap<Key, KeyState>,
}

impl TimeOrder {
    pub fn new(spec: TimeOrderSpec) -> Self {
        Self {
            interval: spec.interval,
            timeout: Duration::from_secs_f64(spec.timeout),
            keys: HashMap::new(),
        }
    }

    fn process(&mut self, sample: Sample, now: Instant, out: &mut Vec<Sample>) {
        let Sample { key, value, time: t } = sample;
        let state = self.keys.entry(key.clone()).or_default();

        // A drain is forced when it has been a while since this key last
        // made progress; a single gap may then be jumped.
        let mut force = state
            .last_emit
            .is_some_and(|le| le + self.timeout <= now);
        let mut check_buffer = force;

        let expected = state.last_time.map(|last| last + self.interval);
        if expected.is_none() || Some(t) == expected {
            out.push(Sample::new(key.clone(), value, t));
            state.last_time = Some(t);
            state.last_emit = Some(now);
            force = false;
            check_buffer = true;
        } else if expected.is_some_and(|e| t > e) {
            state.buffered.insert(t, value);
        }
        // otherwise the sample is older than the watermark, drop it

        if check_buffer {
            while let Some((&bt, _)) = state.buffered.first_key_value() {
                let chains = state.last_time.is_some_and(|last| bt == last + self.interval);
                if !(force || chains) {
                    break;
                }
                if let Some(v) = state.buffered.remove(&bt) {
                    out.push(Sample::new(key.clone(), v, bt));
                }
                state.last_time = Some(bt);
                state.last_emit = Some(now);
                force = false;
            }
        }
    }

    /// Flush everything still buffered, in ascending time order per key.
    fn finish(&mut self, out: &mut Vec<Sample>) {
        for (key, state) in self.keys.iter_mut() {
            for (t, v) in std::mem::take(&mut state.buffered) {
                out.push(Sample::new(key.clone(), v, t));
            }
        }
    }
}

#[async_trait]
impl Operator for TimeOrder {
    fn name(&self) -> &str {
        "filters.TimeOrder"
    }
}

#[async_trait]
impl Filter for TimeOrder {
    async fn run(&mut self, mut rx: SampleRx, tx: SampleTx, _cancel: CancellationToken) -> Result<()> {
        debug!("TimeOrder.run()");
        let mut out = Vec::new();
        while let Some(msg) = rx.recv().await {
            match msg {
                Message::Sample(sample) => {
                    self.process(sample, Instant::now(), &mut out);
                }
                Message::Eos => {
                    self.finish(&mut out);
                    for sample in out.drain(..) {
                        if tx.send(Message::Sample(sample)).await.is_err() {
                            return Ok(());
                        }
                    }
                    let _ = tx.send(Message::Eos).await;
                    return Ok(());
                }
            }
            for sample in out.drain(..) {
                if tx.send(Message::Sample(sample)).await.is_err() {
                    return Ok(());
                }
            }
        }
        let _ = tx.send(Message::Eos).await;
        Ok(())
    }
}
