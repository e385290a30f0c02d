//! Source producing samples from an in-memory vector. Intended for testing.

use anyhow::Result;
use async_trait::async_trait;
use sentry_core::{Context, Message, Operator, Sample, SampleTx, Source};
use tokio_util::sync::CancellationToken;

pub struct DataIn {
    data: Vec<Sample>,
}

impl DataIn {
    pub fn new(data: Vec<Sample>, ctx: &mut Context) -> Self {
        ctx.expression = Some("<data>".into());
        Self { data }
    }
}

#[async_trait]
impl Operator for DataIn {
    fn name(&self) -> &str {
        "sources.DataIn"
    }
}

#[async_trait]
impl Source for DataIn {
    async fn run(&mut self, tx: SampleTx, cancel: CancellationToken) -> Result<()> {
        for sample in self.data.drain(..) {
            if cancel.is_cancelled() {
                break;
            }
            if tx.send(Message::Sample(sample)).await.is_err() {
                break;
            }
        }
        let _ = tx.send(Message::Eos).await;
        Ok(())
    }
}
