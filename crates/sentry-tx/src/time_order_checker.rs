//! Filter that checks all data points for a given key are in chronological
//! order, passing every sample through.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use sentry_core::config::TimeOrderCheckerSpec;
use sentry_core::{Filter, Key, Message, Operator, Sample, SampleRx, SampleTx};
use tokio_util::sync::CancellationToken;
use tracing::error;

pub struct TimeOrderChecker {
    name: String,
    fatal: bool,
    last_key_time: HashMap<Key, i64>,
}

impl TimeOrderChecker {
    pub fn new(spec: TimeOrderCheckerSpec) -> Self {
        Self {
            name: spec.name.unwrap_or_else(|| "TimeOrderChecker".into()),
            fatal: spec.fatal,
            last_key_time: HashMap::new(),
        }
    }

    fn check(&mut self, sample: &Sample) -> Result<()> {
        match self.last_key_time.get(&sample.key) {
            Some(&last) if last >= sample.time => {
                let msg = format!(
                    "[{}] Out-of-order data for '{}'. Last time: {}, this time: {}",
                    self.name, sample.key, last, sample.time
                );
                if self.fatal {
                    anyhow::bail!(msg);
                }
                error!("{}", msg);
            }
            _ => {}
        }
        self.last_key_time.insert(sample.key.clone(), sample.time);
        Ok(())
    }
}

#[async_trait]
impl Operator for TimeOrderChecker {
    fn name(&self) -> &str {
        "filters.TimeOrderChecker"
    }
}

#[async_trait]
impl Filter for TimeOrderChecker {
    async fn run(&mut self, mut rx: SampleRx, tx: SampleTx, _cancel: CancellationToken) -> Result<()> {
        while let Some(msg) = rx.recv().await {
            match msg {
                Message::Sample(sample) => {
                    self.check(&sample)?;
                    if tx.send(Message::Sample(sample)).await.is_err() {
                        return Ok(());
                    }
                }
                Message::Eos => break,
            }
        }
        let _ = tx.send(Message::Eos).await;
        Ok(())
    }
}
