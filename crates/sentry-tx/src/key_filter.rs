//! Filter that passes through only samples with a matching key.

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use sentry_core::config::KeyfilterSpec;
use sentry_core::{glob, Filter, Message, Operator, SampleRx, SampleTx, SentryError};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub struct Keyfilter {
    regex: Regex,
}

impl Keyfilter {
    pub fn new(spec: KeyfilterSpec) -> Result<Self, SentryError> {
        debug!("expression: {}", spec.expression);
        let regex = glob::compile(&spec.expression)?;
        Ok(Self { regex })
    }
}

#[async_trait]
impl Operator for Keyfilter {
    fn name(&self) -> &str {
        "filters.Keyfilter"
    }
}

#[async_trait]
impl Filter for Keyfilter {
    async fn run(&mut self, mut rx: SampleRx, tx: SampleTx, _cancel: CancellationToken) -> Result<()> {
        while let Some(msg) = rx.recv().await {
            match msg {
                Message::Sample(sample) => {
                    if self.regex.is_match(&sample.key) {
                        if tx.send(Message::Sample(sample)).await.is_err() {
                            return Ok(());
                        }
                    }
                }
                Message::Eos => break,
            }
        }
        let _ = tx.send(Message::Eos).await;
        Ok(())
    }
}
