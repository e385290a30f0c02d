//! Filter that converts 64-bit unsigned values to signed.
//!
//! Counters arrive as unsigned 64-bit magnitudes; values with the top bit
//! set are really negative. Reinterpreting subtracts 2^64 from anything at or
//! above 2^63.

use anyhow::Result;
use async_trait::async_trait;
use sentry_core::config::ToSignedSpec;
use sentry_core::{Filter, Message, Operator, SampleRx, SampleTx, Value};
use tokio_util::sync::CancellationToken;

const SIGN_BIT: f64 = (1u64 << 63) as f64;
const WRAP: f64 = 18446744073709551616.0; // 2^64

pub struct ToSigned {
    _spec: ToSignedSpec,
}

impl ToSigned {
    pub fn new(spec: ToSignedSpec) -> Self {
        Self { _spec: spec }
    }
}

fn unsigned_to_signed64(v: f64) -> f64 {
    if v >= SIGN_BIT {
        v - WRAP
    } else {
        v
    }
}

#[async_trait]
impl Operator for ToSigned {
    fn name(&self) -> &str {
        "filters.ToSigned"
    }
}

#[async_trait]
impl Filter for ToSigned {
    async fn run(&mut self, mut rx: SampleRx, tx: SampleTx, _cancel: CancellationToken) -> Result<()> {
        while let Some(msg) = rx.recv().await {
            match msg {
                Message::Sample(mut sample) => {
                    if let Value::Num(v) = sample.value {
                        sample.value = Value::Num(unsigned_to_signed64(v));
                    }
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
