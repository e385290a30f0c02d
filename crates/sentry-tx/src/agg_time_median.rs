//! Filter that aggregates values into time bins and reports the median
//! observed value per key.
//!
//! Useful when a series produces values once per minute but event detection
//! should run on the median of each five minute bin. Data is assumed to
//! arrive in time order: the first sample landing in a later bin closes the
//! current bin for every key.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use sentry_core::config::AggTimeMedianSpec;
use sentry_core::{Filter, Key, Message, Operator, Sample, SampleRx, SampleTx, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

const DEFAULT_TIMEBIN: i64 = 300;

#[derive(Debug, Default)]
struct BinState {
    bin: i64,
    values: Vec<f64>,
}

pub struct AggTimeMedian {
    timebin: i64,
    dropfirst: bool,
    firstbin: Option<i64>,
    currentbin: Option<i64>,
    active: HashMap<Key, BinState>,
}

/// Middle value; the mean of the two middle values for an even count.
fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 1 {
        Some(values[mid])
    } else {
        Some((values[mid - 1] + values[mid]) / 2.0)
    }
}

impl AggTimeMedian {
    pub fn new(spec: AggTimeMedianSpec) -> Self {
        Self {
            timebin: spec.timebin.unwrap_or(DEFAULT_TIMEBIN),
            dropfirst: spec.dropfirst.unwrap_or(true),
            firstbin: None,
            currentbin: None,
            active: HashMap::new(),
        }
    }

    fn bin_of(&self, t: i64) -> i64 {
        t.div_euclid(self.timebin) * self.timebin
    }

    fn process(&mut self, sample: &Sample, out: &mut Vec<Sample>) {
        let tbin = self.bin_of(sample.time);
        let firstbin = *self.firstbin.get_or_insert(tbin);
        let currentbin = *self.currentbin.get_or_insert(tbin);

        self.active.entry(sample.key.clone()).or_insert(BinState {
            bin: tbin,
            values: Vec::new(),
        });

        if tbin < currentbin {
            error!(
                "Seen old data for key {} -- timestamp was {}, but working on bin {}",
                sample.key, sample.time, currentbin
            );
            return;
        }

        if tbin == currentbin {
            if let (Some(v), Some(state)) = (sample.value.as_f64(), self.active.get_mut(&sample.key))
            {
                state.values.push(v);
            }
            return;
        }

        // The first datapoint past the current bin closes it for all keys.
        for (key, state) in self.active.iter_mut() {
            if (!self.dropfirst || currentbin != firstbin) && state.bin == currentbin {
                if let Some(m) = median(&mut state.values) {
                    out.push(Sample::new(key.clone(), Value::Num(m), currentbin));
                }
            }
            state.values.clear();
            state.bin = tbin;
        }
        if let (Some(v), Some(state)) = (sample.value.as_f64(), self.active.get_mut(&sample.key)) {
            state.values.push(v);
        }
        self.currentbin = Some(tbin);
    }
}

#[async_trait]
impl Operator for AggTimeMedian {
    fn name(&self) -> &str {
        "filters.AggTimeMedian"
    }
}

#[async_trait]
impl Filter for AggTimeMedian {
    async fn run(&mut self, mut rx: SampleRx, tx: SampleTx, _cancel: CancellationToken) -> Result<()> {
        debug!("AggTimeMedian.run()");
        let mut out = Vec::new();
        while let Some(msg) = rx.recv().await {
            match msg {
                Message::Sample(sample) => {
                    self.process(&sample, &mut out);
                    for sample in out.drain(..) {
                        if tx.send(Message::Sample(sample)).await.is_err() {
                            return Ok(());
                        }
                    }
                }
                Message::Eos => break,
            }
        }
        let _ = tx.send(Message::Eos).await;
        debug!("AggTimeMedian.run() done");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agg(timebin: i64, dropfirst: bool) -> AggTimeMedian {
        AggTimeMedian::new(AggTimeMedianSpec {
            loglevel: None,
            timebin: Some(timebin),
            dropfirst: Some(dropfirst),
        })
    }

    fn push(f: &mut AggTimeMedian, key: &str, v: f64, t: i64) -> Vec<(String, f64, i64)> {
        let mut out = Vec::new();
        f.process(&Sample::new(key, Value::Num(v), t), &mut out);
        out.iter()
            .map(|s| (s.key.to_string(), s.value.as_f64().unwrap_or(f64::NAN), s.time))
            .collect()
    }

    #[test]
    fn median_helper() {
        assert_eq!(median(&mut []), None);
        assert_eq!(median(&mut [3.0]), Some(3.0));
        assert_eq!(median(&mut [4.0, 1.0, 3.0]), Some(3.0));
        assert_eq!(median(&mut [4.0, 1.0, 3.0, 2.0]), Some(2.5));
    }

    #[test]
    fn bin_close_emits_median() {
        let mut f = agg(300, false);
        push(&mut f, "k", 1.0, 0);
        push(&mut f, "k", 5.0, 60);
        push(&mut f, "k", 3.0, 120);
        let out = push(&mut f, "k", 9.0, 300);
        assert_eq!(out, vec![("k".to_string(), 3.0, 0)]);
    }

    #[test]
    fn dropfirst_skips_the_first_bin() {
        let mut f = agg(300, true);
        push(&mut f, "k", 1.0, 0);
        assert!(push(&mut f, "k", 5.0, 300).is_empty());
        let out = push(&mut f, "k", 9.0, 600);
        assert_eq!(out, vec![("k".to_string(), 5.0, 300)]);
    }

    #[test]
    fn bins_close_for_all_keys_at_once() {
        let mut f = agg(300, false);
        push(&mut f, "a", 1.0, 0);
        push(&mut f, "b", 10.0, 60);
        let mut out = push(&mut f, "a", 7.0, 300);
        out.sort_by(|x, y| x.0.cmp(&y.0));
        assert_eq!(
            out,
            vec![("a".to_string(), 1.0, 0), ("b".to_string(), 10.0, 0)]
        );
    }

    #[test]
    fn old_bins_rejected() {
        let mut f = agg(300, false);
        push(&mut f, "k", 1.0, 600);
        assert!(push(&mut f, "k", 2.0, 100).is_empty());
        // the old sample did not pollute the current bin
        let out = push(&mut f, "k", 9.0, 900);
        assert_eq!(out, vec![("k".to_string(), 1.0, 600)]);
    }
}
