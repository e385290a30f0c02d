//! Filter that calculates relative distance from a moving statistic.
//!
//! Per key, a sliding window holds the last `history` seconds of values and
//! an auxiliary structure keeps the chosen statistic incrementally up to
//! date: a sorted sequence for quantiles, a running sum for the mean. The
//! first `warmup` seconds only accumulate. Each later sample is compared to
//! the statistic over the window before it ("predicted"); the filter emits
//! the ratio `value / predicted`, or the raw prediction when `normalize` is
//! off, or a `(ratio, actual, predicted)` triple with `includeabsolute`.
//!
//! With inpainting configured, a sample whose ratio is outside
//! `[inpainting.min, inpainting.max]` does not enter the window; the
//! prediction is stored in its place, so a transient anomaly cannot corrupt
//! the statistic it is being measured against. The raw values are kept on
//! the side, and once the extreme regime has lasted `maxduration` seconds
//! the window is rebuilt from them: the extreme is the new normal.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use sentry_core::config::{MovingStatSpec, TypeItem};
use sentry_core::{
    Context, Filter, Key, Message, Operator, Sample, SampleRx, SampleTx, SentryError, Triple,
    Value,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How often the number of tracked series is logged.
const SIZE_LOG_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
enum StatKind {
    Mean,
    /// Nearest-rank k'th q-quantile
    Quantile { k: i64, q: i64 },
}

#[derive(Debug, Clone, Copy)]
struct InpaintCfg {
    min: Option<f64>,
    max: Option<f64>,
    maxduration: i64,
}

/// The incrementally maintained statistic over the window's values.
#[derive(Debug)]
enum Aux {
    /// Sorted multiset of the window's values
    Sorted(Vec<f64>),
    /// Running sum of the window's values
    Sum(f64),
}

#[derive(Debug, Default)]
struct SeriesState {
    /// `(value, time)` ordered by time; values may be inpainted
    window: VecDeque<(f64, i64)>,
    /// Raw `(value, time)` collected while inpainting
    raw: Option<VecDeque<(f64, i64)>>,
    /// None until warmup completes, and after a statistic reset
    aux: Option<Aux>,
}

impl SeriesState {
    fn initialize(&mut self, kind: StatKind) {
        self.aux = Some(match kind {
            StatKind::Quantile { .. } => {
                let mut values: Vec<f64> = self.window.iter().map(|&(v, _)| v).collect();
                values.sort_by(f64::total_cmp);
                Aux::Sorted(values)
            }
            StatKind::Mean => Aux::Sum(self.window.iter().map(|&(v, _)| v).sum()),
        });
    }

    fn reset(&mut self) {
        self.aux = None;
    }

    fn insert(&mut self, value: f64) {
        match &mut self.aux {
            Some(Aux::Sorted(values)) => sorted_insert(values, value),
            Some(Aux::Sum(sum)) => *sum += value,
            None => {}
        }
    }

    fn remove(&mut self, value: f64) {
        match &mut self.aux {
            Some(Aux::Sorted(values)) => sorted_remove(values, value),
            Some(Aux::Sum(sum)) => *sum -= value,
            None => {}
        }
    }

    fn insert_remove(&mut self, ins: f64, rm: f64) {
        match &mut self.aux {
            Some(Aux::Sorted(values)) => sorted_replace(values, ins, rm),
            Some(Aux::Sum(sum)) => *sum += ins - rm,
            None => {}
        }
    }

    fn prediction(&self, kind: StatKind) -> Option<f64> {
        match (&self.aux, kind) {
            (Some(Aux::Sorted(values)), StatKind::Quantile { k, q }) => {
                let n = values.len();
                if n == 0 {
                    return None;
                }
                // Nearest rank method: smallest value such that no more than
                // k/q of the data is < value and at least k/q of the data is
                // <= value.
                let rank = if k == 0 {
                    0
                } else {
                    (((n as i64) * k + q - 1) / q - 1) as usize
                };
                values.get(rank).copied()
            }
            (Some(Aux::Sum(sum)), StatKind::Mean) => {
                if self.window.is_empty() {
                    None
                } else {
                    Some(sum / self.window.len() as f64)
                }
            }
            _ => None,
        }
    }
}

fn lower_bound(values: &[f64], v: f64) -> usize {
    values.partition_point(|x| x.total_cmp(&v).is_lt())
}

fn upper_bound(values: &[f64], v: f64) -> usize {
    values.partition_point(|x| x.total_cmp(&v).is_le())
}

fn sorted_insert(values: &mut Vec<f64>, v: f64) {
    let at = upper_bound(values, v);
    values.insert(at, v);
}

fn sorted_remove(values: &mut Vec<f64>, v: f64) {
    let at = lower_bound(values, v);
    if values.get(at).is_some_and(|x| *x == v) {
        values.remove(at);
    } else {
        warn!("value {} not present in the statistic", v);
    }
}

/// Remove one value from a sorted list and add another.
///
/// The values between the removal point and the insertion point shift one
/// slot towards the removed value, overwriting it and opening a hole for the
/// new value. On average this touches about a third of the list, against the
/// whole list for remove-then-insert.
fn sorted_replace(values: &mut [f64], add: f64, rm: f64) {
    if rm < add {
        let left = upper_bound(values, rm);
        let right = left + lower_bound(&values[left..], add);
        values.copy_within(left..right, left - 1);
        values[right - 1] = add;
    } else if add < rm {
        let left = upper_bound(values, add);
        let right = left + lower_bound(&values[left..], rm);
        values.copy_within(left..right, left + 1);
        values[left] = add;
    }
    // removing and inserting the same value is a no-op
}

pub struct MovingStat {
    kind: StatKind,
    warmup: i64,
    history: i64,
    normalize: bool,
    include_absolute: bool,
    min_prediction: Option<f64>,
    inpaint: Option<InpaintCfg>,
    data: HashMap<Key, SeriesState>,
    last_key_time: HashMap<Key, i64>,
    last_size_log: Option<Instant>,
}

fn stat_kind(items: &[TypeItem]) -> Result<(StatKind, String), SentryError> {
    let mut names = Vec::new();
    let mut params = Vec::new();
    for item in items {
        match item {
            TypeItem::Name(n) => names.push(n.clone()),
            TypeItem::Param(p) => params.push(*p),
        }
    }
    let (Some(name), true) = (names.first(), names.len() == 1) else {
        return Err(SentryError::user(
            "module filters.MovingStat: type must start with a statistic name".to_string(),
        ));
    };
    let expected_params = if name == "quantile" { 2 } else { 0 };
    if params.len() != expected_params {
        return Err(SentryError::user(format!(
            "module filters.MovingStat: type {} expects {} parameters (found {})",
            name,
            expected_params,
            params.len()
        )));
    }
    let kind = match name.as_str() {
        "mean" => StatKind::Mean,
        "min" => StatKind::Quantile { k: 0, q: 1 },
        "max" => StatKind::Quantile { k: 1, q: 1 },
        "median" => StatKind::Quantile { k: 1, q: 2 },
        "quantile" => {
            let (k, q) = (params[0], params[1]);
            if k < 0 || q <= 0 || k > q {
                return Err(SentryError::user(format!(
                    "module filters.MovingStat: quantile: first number ({k}) must be >= 0 and <= second ({q})"
                )));
            }
            StatKind::Quantile { k, q }
        }
        other => {
            return Err(SentryError::user(format!(
                "module filters.MovingStat: unknown statistic type {other}"
            )))
        }
    };
    let mut label = vec![name.clone()];
    label.extend(params.iter().map(i64::to_string));
    Ok((kind, label.join(", ")))
}

impl MovingStat {
    pub fn new(spec: MovingStatSpec, ctx: &mut Context) -> Result<Self, SentryError> {
        let normalize = spec.normalize.unwrap_or(true);
        if !normalize && spec.includeabsolute {
            return Err(SentryError::user(
                "module filters.MovingStat: normalize must be set if includeabsolute is set"
                    .to_string(),
            ));
        }
        if spec.history <= spec.warmup {
            return Err(SentryError::user(format!(
                "module filters.MovingStat: history ({}) must be greater than warmup ({})",
                spec.history, spec.warmup
            )));
        }
        let inpaint = spec.inpainting.as_ref().map(|inp| InpaintCfg {
            min: inp.min,
            max: inp.max,
            maxduration: inp.maxduration,
        });
        if let Some(inp) = &inpaint {
            if inp.maxduration < spec.warmup {
                warn!(
                    "module filters.MovingStat: inpainting.maxduration ({}) < warmup ({}), \
                     which may lead to gaps in output",
                    inp.maxduration, spec.warmup
                );
            }
        }
        let (kind, method) = stat_kind(&spec.stat_type)?;
        ctx.method = Some(method);
        Ok(Self {
            kind,
            warmup: spec.warmup,
            history: spec.history,
            normalize,
            include_absolute: spec.includeabsolute,
            min_prediction: spec.minprediction,
            inpaint,
            data: HashMap::new(),
            last_key_time: HashMap::new(),
            last_size_log: None,
        })
    }

    fn extreme(inpaint: &Option<InpaintCfg>, ratio: Option<f64>) -> bool {
        let (Some(cfg), Some(ratio)) = (inpaint, ratio) else {
            return false;
        };
        cfg.min.is_some_and(|min| ratio < min) || cfg.max.is_some_and(|max| ratio > max)
    }

    fn process(&mut self, sample: &Sample, now: Instant) -> Option<Sample> {
        let Some(value) = sample.value.as_f64() else {
            return None;
        };
        let (key, t) = (&sample.key, sample.time);
        let kind = self.kind;
        let inpaint = self.inpaint;

        // Timestamps for a key are expected to increase monotonically; an
        // out-of-order sample is reported but still processed.
        if let Some(&last) = self.last_key_time.get(key) {
            if t <= last {
                warn!(
                    "MovingStat: out-of-order: ({}, {}, {}) last_time: {}",
                    key, value, t, last
                );
            }
        }
        self.last_key_time.insert(key.clone(), t);

        if self
            .last_size_log
            .map_or(true, |last| last + SIZE_LOG_INTERVAL <= now)
        {
            let tracked = self.data.len() + usize::from(!self.data.contains_key(key));
            info!("MovingStat: tracking {} keys", tracked);
            self.last_size_log = Some(now);
        }

        let state = self.data.entry(key.clone()).or_default();

        if state.window.front().map_or(true, |&(_, t0)| t0 > t - self.warmup) {
            // not enough points yet, just store the new value
            state.window.push_back((value, t));
            return None;
        }

        let window_start = t - self.history;

        if state.aux.is_none() {
            // warmup is done; initialize the statistic, not including the
            // new value
            state.initialize(kind);
        }

        // A time gap in arrivals can leave the window overfull.
        while state.window.front().is_some_and(|&(_, t0)| t0 < window_start) {
            if let Some((old, old_t)) = state.window.pop_front() {
                warn!("removing extra old item ({}, {}, {})", key, old, old_t);
                state.remove(old);
            }
        }

        let mut predicted = state.prediction(kind);
        if let (Some(minp), Some(p)) = (self.min_prediction, predicted) {
            if p < minp {
                return None;
            }
        }
        let mut ratio = match predicted {
            Some(p) if p != 0.0 => Some(value / p),
            _ => None,
        };
        debug!("predicted={:?}, value={}, ratio={:?}", predicted, value, ratio);

        let mut newval = value;

        let inpaint_started = state.raw.as_ref().and_then(|raw| raw.front()).map(|&(_, t0)| t0);
        if Self::extreme(&inpaint, ratio) {
            let maxduration = inpaint.map_or(0, |cfg| cfg.maxduration);
            match inpaint_started {
                None => {
                    debug!("extreme value: start inpainting");
                    let mut raw = VecDeque::new();
                    raw.push_back((value, t));
                    state.raw = Some(raw);
                    newval = predicted.unwrap_or(value);
                }
                Some(t0) if t0 > t - maxduration => {
                    debug!("extreme value: continue inpainting");
                    if let Some(raw) = state.raw.as_mut() {
                        raw.push_back((value, t));
                    }
                    newval = predicted.unwrap_or(value);
                }
                Some(_) => {
                    // The extreme is the new normal. Discard old normal and
                    // inpainted values, and rebuild history from the raw
                    // values that had previously been considered extreme.
                    debug!("extreme value: new normal");
                    if let Some(raw) = state.raw.take() {
                        state.window = raw;
                    }
                    if state.window.front().map_or(true, |&(_, t0)| t0 > t - self.warmup) {
                        // not enough data, back to warmup
                        state.reset();
                        state.window.push_back((value, t));
                        return None;
                    }
                    state.initialize(kind);
                    predicted = state.prediction(kind);
                    ratio = match predicted {
                        Some(p) if p != 0.0 => Some(newval / p),
                        _ => None,
                    };
                    debug!(
                        "new predicted={:?}, value={}, ratio={:?}",
                        predicted, value, ratio
                    );
                }
            }
        } else if inpaint_started.is_some() {
            // The new value is not extreme. Leave old inpainted values in
            // history and forget the buffered raw values.
            debug!("return to normal: cancel inpainting");
            state.raw = None;
        }

        state.window.push_back((newval, t));

        if state.window.front().is_some_and(|&(_, t0)| t0 > window_start) {
            // window is not full yet, the new value is a net insertion
            state.insert(newval);
        } else if let Some((oldest, _)) = state.window.pop_front() {
            state.insert_remove(newval, oldest);
        }

        let out_value = if !self.normalize {
            predicted.map_or(Value::None, Value::Num)
        } else if !self.include_absolute {
            ratio.map_or(Value::None, Value::Num)
        } else {
            match predicted {
                Some(p) => Value::Triple(Triple {
                    ratio,
                    actual: value,
                    predicted: p,
                }),
                None => Value::None,
            }
        };
        Some(Sample::new(key.clone(), out_value, t))
    }
}

#[async_trait]
impl Operator for MovingStat {
    fn name(&self) -> &str {
        "filters.MovingStat"
    }
}

#[async_trait]
impl Filter for MovingStat {
    async fn run(&mut self, mut rx: SampleRx, tx: SampleTx, _cancel: CancellationToken) -> Result<()> {
        debug!("MovingStat.run()");
        while let Some(msg) = rx.recv().await {
            match msg {
                Message::Sample(sample) => {
                    if let Some(out) = self.process(&sample, Instant::now()) {
                        if tx.send(Message::Sample(out)).await.is_err() {
                            return Ok(());
                        }
                    }
                }
                Message::Eos => break,
            }
        }
        let _ = tx.send(Message::Eos).await;
        debug!("MovingStat.run() done");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentry_core::config::InpaintingSpec;

    fn spec(stat: &[&str], warmup: i64, history: i64) -> MovingStatSpec {
        MovingStatSpec {
            loglevel: None,
            stat_type: stat
                .iter()
                .map(|s| match s.parse::<i64>() {
                    Ok(p) => TypeItem::Param(p),
                    Err(_) => TypeItem::Name(s.to_string()),
                })
                .collect(),
            history,
            warmup,
            normalize: Some(true),
            includeabsolute: false,
            minprediction: None,
            inpainting: None,
        }
    }

    fn stat(spec: MovingStatSpec) -> (MovingStat, Context) {
        let mut ctx = Context::default();
        let ms = MovingStat::new(spec, &mut ctx).unwrap();
        (ms, ctx)
    }

    fn push(ms: &mut MovingStat, key: &str, v: f64, t: i64) -> Option<Value> {
        ms.process(&Sample::new(key, Value::Num(v), t), Instant::now())
            .map(|s| s.value)
    }

    #[test]
    fn sorted_replace_matches_remove_insert() {
        let cases = [
            (vec![1.0, 2.0, 3.0, 4.0], 2.5, 3.0),
            (vec![1.0, 2.0, 3.0, 4.0], 5.0, 1.0),
            (vec![1.0, 2.0, 3.0, 4.0], 0.5, 4.0),
            (vec![1.0, 2.0, 2.0, 4.0], 2.0, 2.0),
            (vec![1.0, 1.0, 2.0, 2.0], 1.5, 1.0),
            (vec![5.0], 7.0, 5.0),
        ];
        for (values, add, rm) in cases {
            let mut shifted = values.clone();
            sorted_replace(&mut shifted, add, rm);
            let mut naive = values.clone();
            naive.remove(lower_bound(&naive, rm));
            naive.insert(upper_bound(&naive, add), add);
            assert_eq!(shifted, naive, "values={values:?} add={add} rm={rm}");
        }
    }

    #[test]
    fn nearest_rank_quantiles() {
        let mut state = SeriesState::default();
        for (i, v) in [30.0, 10.0, 50.0, 20.0, 40.0].iter().enumerate() {
            state.window.push_back((*v, i as i64));
        }
        fn q(state: &mut SeriesState, k: i64, q: i64) -> f64 {
            state.initialize(StatKind::Quantile { k, q });
            state.prediction(StatKind::Quantile { k, q }).unwrap()
        }
        assert_eq!(q(&mut state, 0, 1), 10.0); // min
        assert_eq!(q(&mut state, 1, 1), 50.0); // max
        assert_eq!(q(&mut state, 1, 2), 30.0); // median of odd count
        assert_eq!(q(&mut state, 1, 4), 20.0);
        assert_eq!(q(&mut state, 3, 4), 40.0);

        state.window.push_back((60.0, 5));
        // median of an even count picks the lower middle value
        assert_eq!(q(&mut state, 1, 2), 30.0);
    }

    #[test]
    fn mean_prediction() {
        let mut state = SeriesState::default();
        for (i, v) in [10.0, 20.0, 30.0].iter().enumerate() {
            state.window.push_back((*v, i as i64));
        }
        state.initialize(StatKind::Mean);
        assert_eq!(state.prediction(StatKind::Mean), Some(20.0));
        state.window.push_back((40.0, 3));
        state.insert(40.0);
        assert_eq!(state.prediction(StatKind::Mean), Some(25.0));
    }

    #[test]
    fn warmup_suppresses_output() {
        let (mut ms, ctx) = stat(spec(&["median"], 50, 600));
        assert_eq!(ctx.method.as_deref(), Some("median"));
        for i in 0..5 {
            assert_eq!(push(&mut ms, "k", 100.0, 1000 + i * 10), None);
        }
        // oldest is now exactly warmup old, output starts
        let out = push(&mut ms, "k", 110.0, 1050);
        assert_eq!(out, Some(Value::Num(1.1)));
    }

    #[test]
    fn ratio_tracks_window_median() {
        let (mut ms, _) = stat(spec(&["median"], 20, 600));
        push(&mut ms, "k", 10.0, 0);
        push(&mut ms, "k", 20.0, 10);
        push(&mut ms, "k", 30.0, 20); // median of {10,20} = 10 -> 3.0
        let out = push(&mut ms, "k", 40.0, 30); // median of {10,20,30} = 20 -> 2.0
        assert_eq!(out, Some(Value::Num(2.0)));
    }

    #[test]
    fn raw_statistic_without_normalize() {
        let mut s = spec(&["median"], 20, 600);
        s.normalize = Some(false);
        let (mut ms, _) = stat(s);
        push(&mut ms, "k", 10.0, 0);
        push(&mut ms, "k", 20.0, 10);
        let out = push(&mut ms, "k", 30.0, 20);
        assert_eq!(out, Some(Value::Num(10.0)));
    }

    #[test]
    fn include_absolute_emits_triples() {
        let mut s = spec(&["median"], 20, 600);
        s.includeabsolute = true;
        let (mut ms, _) = stat(s);
        push(&mut ms, "k", 10.0, 0);
        push(&mut ms, "k", 10.0, 10);
        let out = push(&mut ms, "k", 25.0, 20);
        assert_eq!(
            out,
            Some(Value::Triple(Triple {
                ratio: Some(2.5),
                actual: 25.0,
                predicted: 10.0,
            }))
        );
    }

    #[test]
    fn include_absolute_requires_normalize() {
        let mut s = spec(&["median"], 20, 600);
        s.normalize = Some(false);
        s.includeabsolute = true;
        let mut ctx = Context::default();
        assert!(MovingStat::new(s, &mut ctx).is_err());
    }

    #[test]
    fn history_must_exceed_warmup() {
        let mut ctx = Context::default();
        assert!(MovingStat::new(spec(&["median"], 600, 600), &mut ctx).is_err());
    }

    #[test]
    fn quantile_params_checked() {
        let mut ctx = Context::default();
        assert!(MovingStat::new(spec(&["quantile", "3", "2"], 10, 600), &mut ctx).is_err());
        assert!(MovingStat::new(spec(&["median", "3"], 10, 600), &mut ctx).is_err());
        assert!(MovingStat::new(spec(&["quantile", "1"], 10, 600), &mut ctx).is_err());
        let (_, ctx) = stat(spec(&["quantile", "1", "4"], 10, 600));
        assert_eq!(ctx.method.as_deref(), Some("quantile, 1, 4"));
    }

    #[test]
    fn min_prediction_skips_output() {
        let mut s = spec(&["median"], 20, 600);
        s.minprediction = Some(100.0);
        let (mut ms, _) = stat(s);
        push(&mut ms, "k", 10.0, 0);
        push(&mut ms, "k", 10.0, 10);
        assert_eq!(push(&mut ms, "k", 10.0, 20), None);
    }

    #[test]
    fn null_values_skipped() {
        let (mut ms, _) = stat(spec(&["median"], 20, 600));
        assert!(ms
            .process(&Sample::new("k", Value::None, 0), Instant::now())
            .is_none());
    }

    #[test]
    fn out_of_order_still_processed() {
        let (mut ms, _) = stat(spec(&["median"], 20, 600));
        push(&mut ms, "k", 10.0, 0);
        push(&mut ms, "k", 10.0, 10);
        push(&mut ms, "k", 10.0, 30);
        // going backwards warns but still yields a result
        assert!(push(&mut ms, "k", 10.0, 25).is_some());
    }

    fn inpaint_spec() -> MovingStatSpec {
        let mut s = spec(&["median"], 20, 600);
        s.normalize = Some(false);
        s.inpainting = Some(InpaintingSpec {
            min: Some(0.8),
            max: Some(2.0),
            maxduration: 40,
        });
        s
    }

    #[test]
    fn outliers_are_inpainted() {
        let (mut ms, _) = stat(inpaint_spec());
        push(&mut ms, "k", 100.0, 0);
        push(&mut ms, "k", 100.0, 10);
        push(&mut ms, "k", 100.0, 20);
        // a crash to 10 is extreme; the prediction keeps tracking 100
        assert_eq!(push(&mut ms, "k", 10.0, 30), Some(Value::Num(100.0)));
        assert_eq!(push(&mut ms, "k", 10.0, 40), Some(Value::Num(100.0)));
        // recovery cancels inpainting and the window never saw the outliers
        assert_eq!(push(&mut ms, "k", 100.0, 50), Some(Value::Num(100.0)));
        assert!(ms.data.get(&Key::from("k")).unwrap().raw.is_none());
    }

    #[test]
    fn extreme_becomes_new_normal_after_maxduration() {
        let (mut ms, _) = stat(inpaint_spec());
        for i in 0..3 {
            push(&mut ms, "k", 100.0, i * 10);
        }
        // a sustained 4x level shift starts at t=30; maxduration is 40
        assert_eq!(push(&mut ms, "k", 400.0, 30), Some(Value::Num(100.0)));
        assert_eq!(push(&mut ms, "k", 400.0, 40), Some(Value::Num(100.0)));
        assert_eq!(push(&mut ms, "k", 400.0, 50), Some(Value::Num(100.0)));
        assert_eq!(push(&mut ms, "k", 400.0, 60), Some(Value::Num(100.0)));
        // t=70: raw started at 30 <= 70 - 40, the raw values take over
        assert_eq!(push(&mut ms, "k", 400.0, 70), Some(Value::Num(400.0)));
        // and the shifted level is no longer extreme
        assert_eq!(push(&mut ms, "k", 400.0, 80), Some(Value::Num(400.0)));
        assert!(ms.data.get(&Key::from("k")).unwrap().raw.is_none());
    }

    #[test]
    fn new_normal_with_short_raw_resets_to_warmup() {
        let mut s = inpaint_spec();
        s.inpainting = Some(InpaintingSpec {
            min: Some(0.8),
            max: Some(2.0),
            maxduration: 10,
        });
        // maxduration (10) < warmup (20): after the switch the raw window
        // is too short and output pauses for a new warmup
        let (mut ms, _) = stat(s);
        for i in 0..3 {
            push(&mut ms, "k", 100.0, i * 10);
        }
        assert_eq!(push(&mut ms, "k", 400.0, 30), Some(Value::Num(100.0)));
        // t=40: raw started at 30 <= 40 - 10, but raw spans 0 seconds
        assert_eq!(push(&mut ms, "k", 400.0, 40), None);
        // warmup over the raw values completes at t=50
        assert_eq!(push(&mut ms, "k", 400.0, 50), Some(Value::Num(400.0)));
    }

    #[test]
    fn keys_do_not_interfere() {
        let (mut ms, _) = stat(spec(&["median"], 20, 600));
        push(&mut ms, "a", 10.0, 0);
        push(&mut ms, "b", 1000.0, 0);
        push(&mut ms, "a", 10.0, 10);
        push(&mut ms, "b", 1000.0, 10);
        assert_eq!(push(&mut ms, "a", 20.0, 20), Some(Value::Num(2.0)));
        assert_eq!(push(&mut ms, "b", 500.0, 20), Some(Value::Num(0.5)));
    }

    #[test]
    fn window_eviction_after_gap() {
        let (mut ms, _) = stat(spec(&["mean"], 20, 100));
        push(&mut ms, "k", 10.0, 0);
        push(&mut ms, "k", 20.0, 10);
        push(&mut ms, "k", 30.0, 20);
        // a long gap: the first two samples fall out of the window
        let out = push(&mut ms, "k", 60.0, 115);
        // window is {30.0 at t=20}; mean = 30
        assert_eq!(out, Some(Value::Num(2.0)));
    }
}
