//! Historic source paging `(key, value, time)` tuples out of an HTTP
//! time-series API.
//!
//! The configured `[starttime, endtime)` range is fetched in `batchduration`
//! slices. Each slice is a `POST {from, until, expression, ...}` whose JSON
//! response carries one series per key; series values are materialized as one
//! sample per step. The reader task requests the next slice while the
//! pipeline consumes the previous one.

use std::collections::HashMap;

use anyhow::{Context as AnyhowContext, Result};
use async_trait::async_trait;
use sentry_core::config::HistoricalSpec;
use sentry_core::{
    strtimegm, Context, Key, Message, Operator, Sample, SampleTx, SentryError, Source, Value,
};
use serde::Deserialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::handoff::{handoff, BatchSender};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(rename = "queryParameters")]
    query_parameters: QueryParameters,
    data: SeriesData,
}

#[derive(Debug, Deserialize)]
struct QueryParameters {
    from: serde_json::Value,
    until: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct SeriesData {
    series: HashMap<String, SeriesRecord>,
}

#[derive(Debug, Deserialize)]
struct SeriesRecord {
    from: i64,
    step: i64,
    values: Vec<Option<f64>>,
}

pub struct Historical {
    spec: HistoricalSpec,
    start_time: i64,
    end_time: i64,
}

impl Historical {
    pub fn new(spec: HistoricalSpec, ctx: &mut Context) -> Result<Self, SentryError> {
        let start_time = strtimegm(&spec.starttime)?;
        let end_time = strtimegm(&spec.endtime)?;
        ctx.expression = Some(spec.expression.clone());
        Ok(Self {
            spec,
            start_time,
            end_time,
        })
    }
}

/// Flatten one API response into samples.
fn response_samples(response: ApiResponse, ignorenull: bool) -> Vec<Sample> {
    debug!(
        "response: {} - {}",
        response.query_parameters.from, response.query_parameters.until
    );
    let mut batch = Vec::new();
    for (key, record) in response.data.series {
        let key = Key::from(key);
        let mut t = record.from;
        for value in record.values {
            match value {
                Some(v) => batch.push(Sample::new(key.clone(), Value::Num(v), t)),
                None if !ignorenull => batch.push(Sample::new(key.clone(), Value::None, t)),
                None => {}
            }
            t += record.step;
        }
    }
    batch
}

async fn read_loop(spec: HistoricalSpec, start_time: i64, end_time: i64, sender: &BatchSender) -> Result<()> {
    let client = reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .context("building http client")?;

    let mut end_batch = start_time;
    while end_batch < end_time && !sender.is_cancelled() {
        let start_batch = end_batch;
        end_batch = (start_batch + spec.batchduration).min(end_time);
        debug!("request: {} - {}", start_batch, end_batch);

        let mut form: Vec<(String, String)> = vec![
            ("from".into(), start_batch.to_string()),
            ("until".into(), end_batch.to_string()),
            ("expression".into(), spec.expression.clone()),
        ];
        if let Some(params) = &spec.queryparams {
            form.extend(params.iter().map(|(k, v)| (k.clone(), v.clone())));
        }

        let response = client
            .post(&spec.url)
            .form(&form)
            .send()
            .await
            .with_context(|| format!("POST {}", spec.url))?
            .error_for_status()
            .with_context(|| format!("POST {}", spec.url))?;
        let response: ApiResponse = response.json().await.context("decoding API response")?;

        if !sender.publish(response_samples(response, spec.ignorenull)).await {
            break;
        }
    }
    debug!("historic done");
    Ok(())
}

#[async_trait]
impl Operator for Historical {
    fn name(&self) -> &str {
        "sources.Historical"
    }
}

#[async_trait]
impl Source for Historical {
    async fn run(&mut self, tx: SampleTx, cancel: CancellationToken) -> Result<()> {
        let (sender, mut receiver) = handoff(cancel.child_token());
        let spec = self.spec.clone();
        let (start_time, end_time) = (self.start_time, self.end_time);
        let reader = tokio::spawn(async move {
            if let Err(e) = read_loop(spec, start_time, end_time, &sender).await {
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

        cancel.cancel();
        let _ = reader.await;
        result
    }
}
