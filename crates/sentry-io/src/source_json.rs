//! Source reading `[key, value, time]` JSON lines from a file or stdin.

use anyhow::{Context as AnyhowContext, Result};
use async_trait::async_trait;
use sentry_core::config::JsonInSpec;
use sentry_core::{Context, Key, Message, Operator, Sample, SampleTx, Source, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub struct JsonIn {
    spec: JsonInSpec,
}

impl JsonIn {
    pub fn new(spec: JsonInSpec, ctx: &mut Context) -> Self {
        ctx.expression = Some(spec.file.clone().unwrap_or_else(|| "-".into()));
        Self { spec }
    }
}

/// Decode one `[key, value, time]` line.
fn parse_line(line: &str) -> Result<Sample> {
    let (key, value, time): (String, serde_json::Value, i64) =
        serde_json::from_str(line).with_context(|| format!("bad input line: {line}"))?;
    let value = match value {
        serde_json::Value::Null => Value::None,
        serde_json::Value::Number(n) => Value::Num(
            n.as_f64()
                .ok_or_else(|| anyhow::anyhow!("bad numeric value in line: {line}"))?,
        ),
        other => anyhow::bail!("unsupported value {other} in line: {line}"),
    };
    Ok(Sample::new(Key::from(key), value, time))
}

#[async_trait]
impl Operator for JsonIn {
    fn name(&self) -> &str {
        "sources.JsonIn"
    }
}

#[async_trait]
impl Source for JsonIn {
    async fn run(&mut self, tx: SampleTx, cancel: CancellationToken) -> Result<()> {
        debug!("JsonIn.run()");
        let file = self.spec.file.as_deref().unwrap_or("-");
        let mut lines: Box<dyn tokio::io::AsyncBufRead + Send + Unpin> = if file == "-" {
            Box::new(BufReader::new(tokio::io::stdin()))
        } else {
            Box::new(BufReader::new(
                tokio::fs::File::open(file)
                    .await
                    .with_context(|| format!("open {file}"))?,
            ))
        };
        let mut buf = String::new();
        loop {
            if cancel.is_cancelled() {
                break;
            }
            buf.clear();
            let n = lines.read_line(&mut buf).await?;
            if n == 0 {
                break;
            }
            let line = buf.trim_end();
            if line.is_empty() {
                continue;
            }
            let sample = parse_line(line)?;
            if tx.send(Message::Sample(sample)).await.is_err() {
                break;
            }
        }
        let _ = tx.send(Message::Eos).await;
        debug!("JsonIn.run() done");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_lines() {
        let s = parse_line(r#"["a.b", 5, 1600000000]"#).unwrap();
        assert_eq!(s.key.as_str(), "a.b");
        assert_eq!(s.value, Value::Num(5.0));
        assert_eq!(s.time, 1600000000);

        let s = parse_line(r#"["a.b", null, 1600000000]"#).unwrap();
        assert!(s.value.is_none());

        assert!(parse_line(r#"["a.b", "x", 0]"#).is_err());
        assert!(parse_line("not json").is_err());
    }
}
