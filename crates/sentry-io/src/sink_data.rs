//! Sink collecting samples into a shared in-memory vector. Intended for testing.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use sentry_core::{Message, Operator, Sample, SampleRx, Sink};
use tokio_util::sync::CancellationToken;

/// Handle to the collected output; clone it before building the pipeline.
pub type Collected = Arc<Mutex<Vec<Sample>>>;

pub struct DataOut {
    output: Collected,
}

impl DataOut {
    pub fn new(output: Collected) -> Self {
        Self { output }
    }
}

#[async_trait]
impl Operator for DataOut {
    fn name(&self) -> &str {
        "sinks.DataOut"
    }
}

#[async_trait]
impl Sink for DataOut {
    async fn run(&mut self, mut rx: SampleRx, _cancel: CancellationToken) -> Result<()> {
        while let Some(msg) = rx.recv().await {
            match msg {
                Message::Sample(sample) => {
                    let mut out = self.output.lock().expect("output lock poisoned");
                    out.push(sample);
                }
                Message::Eos => break,
            }
        }
        Ok(())
    }
}
