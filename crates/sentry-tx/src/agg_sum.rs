//! Filter that sums values across a group of keys.
//!
//! Input keys are matched against the configured glob expressions in order;
//! the first match wins and its captured substrings form the group id. A
//! bucket accumulates `(count, sum)` per `(expression, group, time)`. A
//! bucket emits when it reaches `groupsize`, or when it has been tracked for
//! `timeout` seconds of wall-clock time. Since data for a given key arrives
//! in time order, a full bucket at time `t` means older incomplete buckets
//! for the same group will never complete; they are emitted (or dropped when
//! `droppartial` is set) first, in ascending time order, so the output for
//! each group key never goes backwards in time. Samples older than a group's
//! emitted watermark are dropped.
//!
//! The emitted key substitutes the captured substrings into the matched
//! expression's parenthesized positions. Null values count toward the group
//! size but add nothing to the sum.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use sentry_core::config::AggSumSpec;
use sentry_core::glob::{self, GroupTemplate};
use sentry_core::{Filter, Key, Message, Operator, Sample, SampleRx, SampleTx, SentryError, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Captured substrings identifying an aggregation group.
type GroupId = Vec<String>;

/// Intermediate results of aggregation.
#[derive(Debug)]
struct AggInfo {
    first_seen: Instant,
    count: u32,
    vsum: f64,
}

struct Expression {
    glob: String,
    regex: Regex,
    template: GroupTemplate,
    /// Buckets by group, then bucket time
    groups: HashMap<GroupId, BTreeMap<i64, AggInfo>>,
    /// Most recent complete or expired bucket time per group
    watermark: HashMap<GroupId, i64>,
}

pub struct AggSum {
    expressions: Vec<Expression>,
    groupsize: Option<u32>,
    timeout: Duration,
    droppartial: bool,
    /// `(expression, group, time)` in first-seen order. Entries whose bucket
    /// was already emitted are skipped lazily during the sweep.
    seen: VecDeque<(usize, GroupId, i64)>,
}

impl AggSum {
    pub fn new(spec: AggSumSpec) -> Result<Self, SentryError> {
        let expressions = spec
            .expressions
            .iter()
            .map(|exp| {
                Ok(Expression {
                    glob: exp.clone(),
                    regex: glob::compile(exp)?,
                    template: GroupTemplate::parse(exp)?,
                    groups: HashMap::new(),
                    watermark: HashMap::new(),
                })
            })
            .collect::<Result<Vec<_>, SentryError>>()?;
        debug!("expressions: {:?}", spec.expressions);
        Ok(Self {
            expressions,
            groupsize: spec.groupsize,
            timeout: Duration::from_secs(spec.timeout as u64),
            droppartial: spec.droppartial,
            seen: VecDeque::new(),
        })
    }

    fn process(&mut self, sample: &Sample, now: Instant, out: &mut Vec<Sample>) {
        let Some((idx, group)) = self.match_key(&sample.key) else {
            return;
        };
        let t = sample.time;
        let exp = &mut self.expressions[idx];

        if exp.watermark.get(&group).is_some_and(|&wm| t < wm) {
            error!(
                "unexpected data for old aggregate ({:?}, {}) from {}",
                group, t, sample.key
            );
            return;
        }

        let bucket = exp
            .groups
            .entry(group.clone())
            .or_default()
            .entry(t)
            .or_insert_with(|| {
                self.seen.push_back((idx, group.clone(), t));
                AggInfo {
                    first_seen: now,
                    count: 0,
                    vsum: 0.0,
                }
            });
        bucket.count += 1;
        if let Some(v) = sample.value.as_f64() {
            bucket.vsum += v;
        }
        debug!(
            "exp={}, group={:?}, v={:?}, t={}; count={}, vsum={}",
            exp.glob, group, sample.value, t, bucket.count, bucket.vsum
        );

        if self.groupsize.is_some_and(|gs| bucket.count == gs) {
            let elapsed = now.duration_since(bucket.first_seen);
            debug!(
                "reached groupsize for ({:?}, {}) after {:?}",
                group, t, elapsed
            );
            let Some(full) = remove_bucket(&mut self.expressions[idx], &group, t) else {
                return;
            };
            // Data for a given key arrives in time order, so a full bucket at
            // time t means missing data for earlier times will never arrive.
            // Flushing the older buckets first keeps this group's output in
            // time order.
            self.expire_older(idx, &group, t, out);
            self.emit(idx, &group, t, full.vsum, out);
            self.update_watermark(idx, &group, t);
        }

        self.sweep(now, out);
    }

    fn match_key(&self, key: &Key) -> Option<(usize, GroupId)> {
        for (idx, exp) in self.expressions.iter().enumerate() {
            if let Some(caps) = exp.regex.captures(key) {
                let group = caps
                    .iter()
                    .skip(1)
                    .map(|m| m.map(|m| m.as_str().to_string()).unwrap_or_default())
                    .collect();
                return Some((idx, group));
            }
        }
        None
    }

    /// Remove and emit (or drop) every bucket of this group older than `max_t`.
    fn expire_older(&mut self, idx: usize, group: &GroupId, max_t: i64, out: &mut Vec<Sample>) {
        let expired: Vec<(i64, f64, u32)> = {
            let exp = &mut self.expressions[idx];
            let Some(times) = exp.groups.get_mut(group) else {
                return;
            };
            let old: Vec<i64> = times.range(..max_t).map(|(&t, _)| t).collect();
            old.into_iter()
                .filter_map(|t| times.remove(&t).map(|info| (t, info.vsum, info.count)))
                .collect()
        };
        for (t, vsum, count) in expired {
            debug!(
                "giving up on ({:?}, {}) with {}/{:?} items",
                group, t, count, self.groupsize
            );
            if !self.droppartial {
                self.emit(idx, group, t, vsum, out);
            }
        }
    }

    /// Walk the first-seen index from oldest entry, flushing expired buckets.
    fn sweep(&mut self, now: Instant, out: &mut Vec<Sample>) {
        while let Some((idx, group, t)) = self.seen.front().cloned() {
            let Some(info) = self.expressions[idx]
                .groups
                .get(&group)
                .and_then(|times| times.get(&t))
            else {
                // bucket already emitted through groupsize or group expiry
                self.seen.pop_front();
                continue;
            };
            if now.duration_since(info.first_seen) < self.timeout {
                break;
            }
            self.seen.pop_front();
            let Some(info) = remove_bucket(&mut self.expressions[idx], &group, t) else {
                continue;
            };
            debug!(
                "reached timeout for ({:?}, {}) with {}/{:?} items",
                group, t, info.count, self.groupsize
            );
            self.expire_older(idx, &group, t, out);
            if !self.droppartial {
                self.emit(idx, &group, t, info.vsum, out);
            }
            self.update_watermark(idx, &group, t);
        }
    }

    fn emit(&self, idx: usize, group: &GroupId, t: i64, vsum: f64, out: &mut Vec<Sample>) {
        let parts: Vec<&str> = group.iter().map(String::as_str).collect();
        let key = Key::from(self.expressions[idx].template.render(&parts));
        out.push(Sample::new(key, Value::Num(vsum), t));
    }

    fn update_watermark(&mut self, idx: usize, group: &GroupId, t: i64) {
        let watermark = &mut self.expressions[idx].watermark;
        match watermark.get_mut(group) {
            Some(wm) if *wm >= t => {}
            Some(wm) => *wm = t,
            None => {
                watermark.insert(group.clone(), t);
            }
        }
    }
}

fn remove_bucket(exp: &mut Expression, group: &GroupId, t: i64) -> Option<AggInfo> {
    let times = exp.groups.get_mut(group)?;
    let info = times.remove(&t);
    if times.is_empty() {
        exp.groups.remove(group);
    }
    info
}

#[async_trait]
impl Operator for AggSum {
    fn name(&self) -> &str {
        "filters.AggSum"
    }
}

#[async_trait]
impl Filter for AggSum {
    async fn run(&mut self, mut rx: SampleRx, tx: SampleTx, _cancel: CancellationToken) -> Result<()> {
        debug!("AggSum.run()");
        let mut out = Vec::new();
        while let Some(msg) = rx.recv().await {
            match msg {
                Message::Sample(sample) => {
                    self.process(&sample, Instant::now(), &mut out);
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
        debug!("AggSum.run() done");
        Ok(())
    }
}
