//! Sink writing `[key, value, time]` JSON lines to a file or stdout.

use std::fs::File;
use std::io::{BufWriter, Write};

use anyhow::{Context as AnyhowContext, Result};
use async_trait::async_trait;
use sentry_core::config::JsonOutSpec;
use sentry_core::{Message, Operator, Sample, SampleRx, Sink, Value};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub struct JsonOut {
    spec: JsonOutSpec,
}

impl JsonOut {
    pub fn new(spec: JsonOutSpec) -> Self {
        Self { spec }
    }
}

fn value_json(value: &Value) -> serde_json::Value {
    match value {
        Value::None => serde_json::Value::Null,
        Value::Num(v) => json!(v),
        Value::Triple(t) => json!([t.ratio, t.actual, t.predicted]),
    }
}

fn sample_json(sample: &Sample, compact: bool) -> String {
    let record = json!([sample.key.as_str(), value_json(&sample.value), sample.time]);
    if compact {
        record.to_string()
    } else {
        serde_json::to_string_pretty(&record).unwrap_or_else(|_| record.to_string())
    }
}

#[async_trait]
impl Operator for JsonOut {
    fn name(&self) -> &str {
        "sinks.JsonOut"
    }
}

#[async_trait]
impl Sink for JsonOut {
    async fn run(&mut self, mut rx: SampleRx, _cancel: CancellationToken) -> Result<()> {
        debug!("JsonOut.run()");
        let file = self.spec.file.as_deref().unwrap_or("-");
        let compact = self.spec.compact.unwrap_or(true);
        let mut out: Box<dyn Write + Send> = if file == "-" {
            Box::new(std::io::stdout())
        } else {
            Box::new(BufWriter::new(
                File::create(file).with_context(|| format!("create {file}"))?,
            ))
        };
        while let Some(msg) = rx.recv().await {
            match msg {
                Message::Sample(sample) => {
                    writeln!(out, "{}", sample_json(&sample, compact))?;
                }
                Message::Eos => break,
            }
        }
        out.flush()?;
        debug!("JsonOut.run() done");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentry_core::Triple;

    #[test]
    fn sample_lines() {
        let s = Sample::new("a.b", Value::Num(5.0), 10);
        assert_eq!(sample_json(&s, true), r#"["a.b",5.0,10]"#);

        let s = Sample::new("a.b", Value::None, 10);
        assert_eq!(sample_json(&s, true), r#"["a.b",null,10]"#);

        let s = Sample::new(
            "a.b",
            Value::Triple(Triple {
                ratio: Some(0.5),
                actual: 5.0,
                predicted: 10.0,
            }),
            10,
        );
        assert_eq!(sample_json(&s, true), r#"["a.b",[0.5,5.0,10.0],10]"#);
    }
}
