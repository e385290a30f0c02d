//! End-to-end pipeline scenarios over synthetic prober data.
//!
//! A generator produces two probers per group, each a sine wave over a
//! baseline, with injected anomalies: a transient outage, a missing-data
//! hole, a sustained level shift, and a time-shuffled group. The expected
//! aggregate sums and moving medians are computed independently alongside
//! the input and asserted against the pipeline output.

use std::collections::HashMap;
use std::f64::consts::PI;
use std::sync::{Arc, Mutex};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use sentry_core::config::{
    AggSumSpec, InpaintingSpec, MovingStatSpec, TimeOrderSpec, TypeItem,
};
use sentry_core::pipeline::run_pipeline;
use sentry_core::{Context, Filter, Sample, Value};
use sentry_io::sink_data::{Collected, DataOut};
use sentry_io::source_data::DataIn;
use sentry_tx::{AggSum, MovingStat, TimeOrder};
use tokio_util::sync::CancellationToken;

const TIMEBASE: i64 = 1_000_000_000;
const TIMESTEP: i64 = 10;
const STEPS: usize = 200;
const WARMUP_STEPS: usize = 5;
const HISTORY_STEPS: usize = 60;
const INPAINT_STEPS: usize = 40;
const SHIFT_STEP: usize = 70;

/// group -> [[baseline, period, amplitude]; 2]
const GROUPS: [(&str, [[f64; 3]; 2]); 4] = [
    ("outage", [[14000.0, 15.0, 30.0], [12000.0, 10.0, 10.0]]),
    ("hole", [[23000.0, 20.0, 40.0], [23000.0, 12.0, 10.0]]),
    ("shift", [[35000.0, 30.0, 50.0], [31000.0, 15.0, 10.0]]),
    ("order", [[43000.0, 40.0, 60.0], [39000.0, 17.0, 10.0]]),
];

struct TestData {
    indata: Vec<Sample>,
    /// Expected per-group sum at each step
    exp_aggsum: HashMap<&'static str, Vec<f64>>,
    /// Expected moving median at each step; None during warmup
    exp_median: HashMap<&'static str, Vec<Option<f64>>>,
}

/// Generate prober samples plus the independently computed expectations.
///
/// The expectation models the inpainting protocol: at steps where the group
/// sum is extreme relative to the running median (the outage, the shift
/// until it becomes the new normal, and the hole's partial sums), the
/// median history receives the predicted value instead of the sum. When the
/// shift reaches `maxduration`, the history is rewritten with the raw sums
/// and the window restarts at the shift.
fn generate() -> TestData {
    let base_times: Vec<i64> = (0..STEPS).map(|i| TIMEBASE + i as i64 * TIMESTEP).collect();
    let mut indata = Vec::new();
    let mut exp_aggsum = HashMap::new();
    let mut exp_median = HashMap::new();

    for (group, probers) in GROUPS {
        let times = if group == "order" {
            let mut shuffled = base_times.clone();
            let mut rng = StdRng::seed_from_u64(1);
            shuffled.shuffle(&mut rng);
            shuffled
        } else {
            base_times.clone()
        };

        let mut history: Vec<f64> = Vec::new();
        let mut history_start = 0usize;
        let mut aggsums: Vec<f64> = Vec::new();
        let mut medians: Vec<Option<f64>> = Vec::new();

        for i in 0..STEPS {
            let mut aggsum = 0.0;
            let mut inpaint = false;

            for (p, [baseline, period, amplitude]) in probers.iter().enumerate() {
                let prober = p + 1;
                let mut value = baseline + amplitude * (i as f64 * 2.0 * PI / period).sin();

                if group == "outage" && prober == 1 && (50..60).contains(&i) {
                    value *= 0.3;
                    inpaint = true;
                }
                if group == "shift" && prober == 2 && i >= SHIFT_STEP {
                    value += 3.0 * baseline;
                    if i < SHIFT_STEP + INPAINT_STEPS {
                        inpaint = true;
                    } else if i == SHIFT_STEP + INPAINT_STEPS {
                        // the extreme became the new normal: rebuild the
                        // median history from the raw sums
                        for j in SHIFT_STEP..history.len() {
                            history[j] = aggsums[j];
                        }
                        history_start = SHIFT_STEP;
                    }
                }
                if group == "hole" && prober == 2 && (73..76).contains(&i) {
                    // prober 2 goes silent; the remaining partial sum is
                    // roughly half the running median, which is extreme
                    inpaint = true;
                    continue;
                }

                let value = value.trunc();
                aggsum += value;
                indata.push(Sample::new(
                    format!("aaa.{group}.prober-{prober}.zzz"),
                    Value::Num(value),
                    times[i],
                ));
            }

            let median = if i < WARMUP_STEPS {
                None
            } else {
                let mut start = history_start;
                if i > HISTORY_STEPS && i - HISTORY_STEPS > start {
                    start = i - HISTORY_STEPS;
                }
                let mut mhist: Vec<f64> = history[start..].to_vec();
                mhist.sort_by(f64::total_cmp);
                let n = i - start;
                let rank = (n + 1) / 2 - 1;
                Some(mhist[rank])
            };

            aggsums.push(aggsum);
            medians.push(median);
            history.push(match (inpaint, median) {
                (true, Some(m)) => m,
                _ => aggsum,
            });
        }
        exp_aggsum.insert(group, aggsums);
        exp_median.insert(group, medians);
    }
    TestData {
        indata,
        exp_aggsum,
        exp_median,
    }
}

fn group_of(sample: &Sample) -> String {
    sample.key.split('.').nth(1).unwrap_or("").to_string()
}

fn step_of(sample: &Sample) -> usize {
    ((sample.time - TIMEBASE) / TIMESTEP) as usize
}

fn time_order() -> Box<dyn Filter> {
    Box::new(TimeOrder::new(TimeOrderSpec {
        loglevel: None,
        interval: TIMESTEP,
        timeout: (TIMESTEP * 2) as f64,
    }))
}

fn agg_sum() -> Box<dyn Filter> {
    Box::new(
        AggSum::new(AggSumSpec {
            loglevel: None,
            expressions: vec!["aaa.(*).*.zzz".into()],
            groupsize: Some(2),
            timeout: 5,
            droppartial: false,
        })
        .unwrap(),
    )
}

fn moving_median(ctx: &mut Context) -> Box<dyn Filter> {
    Box::new(
        MovingStat::new(
            MovingStatSpec {
                loglevel: None,
                stat_type: vec![TypeItem::Name("median".into())],
                history: HISTORY_STEPS as i64 * TIMESTEP,
                warmup: WARMUP_STEPS as i64 * TIMESTEP,
                normalize: Some(false),
                includeabsolute: false,
                minprediction: None,
                inpainting: Some(InpaintingSpec {
                    min: Some(0.8),
                    max: Some(2.0),
                    maxduration: INPAINT_STEPS as i64 * TIMESTEP,
                }),
            },
            ctx,
        )
        .unwrap(),
    )
}

async fn run_chain(indata: Vec<Sample>, filters: Vec<Box<dyn Filter>>) -> Vec<Sample> {
    let collected: Collected = Arc::new(Mutex::new(Vec::new()));
    let mut ctx = Context::default();
    let source = Box::new(DataIn::new(indata, &mut ctx));
    let sink = Box::new(DataOut::new(collected.clone()));
    run_pipeline(source, filters, sink, 8, CancellationToken::new())
        .await
        .expect("pipeline run failed");
    let out = collected.lock().expect("output lock poisoned").clone();
    out
}

#[tokio::test]
async fn identity_pipeline_preserves_samples() {
    let data = generate();
    let outdata = run_chain(data.indata.clone(), Vec::new()).await;
    assert_eq!(outdata, data.indata);
}

#[tokio::test]
async fn time_order_restores_per_key_monotonicity() {
    let data = generate();
    let outdata = run_chain(data.indata.clone(), vec![time_order()]).await;

    // output timestamps increase strictly per key
    let mut last: HashMap<&str, i64> = HashMap::new();
    for sample in &outdata {
        if let Some(&prev) = last.get(sample.key.as_str()) {
            assert!(
                sample.time > prev,
                "key {}: time {} should be > {}",
                sample.key,
                sample.time,
                prev
            );
        }
        last.insert(sample.key.as_str(), sample.time);
    }

    // input and output match after sorting, except that data older than a
    // key's first observed time is dropped
    let mut first: HashMap<&str, i64> = HashMap::new();
    let mut filtered: Vec<&Sample> = Vec::new();
    for sample in &data.indata {
        let ft = *first.entry(sample.key.as_str()).or_insert(sample.time);
        if sample.time >= ft {
            filtered.push(sample);
        }
    }
    assert_eq!(filtered.len(), outdata.len());

    let sort_key = |s: &Sample| (s.key.clone(), s.time);
    let mut expected: Vec<Sample> = filtered.into_iter().cloned().collect();
    expected.sort_by_key(sort_key);
    let mut actual = outdata;
    actual.sort_by_key(sort_key);
    assert_eq!(expected, actual);
}

#[tokio::test]
async fn agg_sum_produces_per_group_sums() {
    let data = generate();
    let outdata = run_chain(data.indata.clone(), vec![time_order(), agg_sum()]).await;

    let mut results: HashMap<String, HashMap<i64, f64>> = HashMap::new();
    let mut prev: HashMap<&str, i64> = HashMap::new();
    for sample in &outdata {
        let group = group_of(sample);
        results
            .entry(group)
            .or_default()
            .insert(sample.time, sample.value.as_f64().expect("sum is numeric"));
        // output for each group key is ordered by exactly one timestep
        if let Some(&p) = prev.get(sample.key.as_str()) {
            assert_eq!(
                sample.time,
                p + TIMESTEP,
                "key {}: time {} should be {}",
                sample.key,
                sample.time,
                p + TIMESTEP
            );
        }
        prev.insert(sample.key.as_str(), sample.time);
    }

    for (group, _) in GROUPS {
        if group == "order" {
            continue;
        }
        assert_eq!(
            results.get(group).map_or(0, HashMap::len),
            STEPS,
            "group {group}: unexpected result count"
        );
    }

    for sample in &outdata {
        let group = group_of(sample);
        if group == "order" {
            continue;
        }
        let i = step_of(sample);
        assert_eq!(
            sample.value.as_f64(),
            Some(data.exp_aggsum[group.as_str()][i]),
            "group {group}, step {i}"
        );
    }
}

#[tokio::test]
async fn moving_median_tracks_inpainting_and_new_normal() {
    let data = generate();
    let outdata = run_chain(
        data.indata.clone(),
        vec![time_order(), agg_sum(), {
            let mut ctx = Context::default();
            moving_median(&mut ctx)
        }],
    )
    .await;

    let mut results: HashMap<String, HashMap<i64, f64>> = HashMap::new();
    let mut prev: HashMap<&str, i64> = HashMap::new();
    for sample in &outdata {
        let group = group_of(sample);
        results
            .entry(group)
            .or_default()
            .insert(sample.time, sample.value.as_f64().expect("median is numeric"));
        if let Some(&p) = prev.get(sample.key.as_str()) {
            assert!(sample.time > p, "key {}: out of order output", sample.key);
        }
        prev.insert(sample.key.as_str(), sample.time);
    }

    for (group, _) in GROUPS {
        if group == "order" {
            continue;
        }
        assert_eq!(
            results.get(group).map_or(0, HashMap::len),
            STEPS - WARMUP_STEPS,
            "group {group}: unexpected result count"
        );
    }

    for sample in &outdata {
        let group = group_of(sample);
        if group == "order" {
            continue;
        }
        let i = step_of(sample);
        assert_eq!(
            sample.value.as_f64(),
            data.exp_median[group.as_str()][i],
            "group {group}, step {i}"
        );
    }
}
