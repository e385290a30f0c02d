//! Filter that derives entity types and codes from a key.
//!
//! The key is replaced with a string of the format `entitytype/code`, which
//! can be used to query an entities API for full information about the
//! entity matching that code. The code is the substring matching the first
//! parenthesized subexpression of the first matching pattern.

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use sentry_core::config::KeyEntitySpec;
use sentry_core::{glob, Filter, Key, Message, Operator, Sample, SampleRx, SampleTx, SentryError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

struct EntityPattern {
    regex: Regex,
    metatype: String,
}

pub struct KeyEntity {
    patterns: Vec<EntityPattern>,
}

impl KeyEntity {
    pub fn new(spec: KeyEntitySpec) -> Result<Self, SentryError> {
        let patterns = spec
            .expressions
            .iter()
            .map(|e| {
                Ok(EntityPattern {
                    regex: glob::compile(&e.pattern)?,
                    metatype: e.metatype.clone(),
                })
            })
            .collect::<Result<Vec<_>, SentryError>>()?;
        Ok(Self { patterns })
    }

    fn entity(&self, sample: &Sample) -> Option<Sample> {
        for pattern in &self.patterns {
            let Some(caps) = pattern.regex.captures(&sample.key) else {
                continue;
            };
            let Some(code) = caps.get(1) else {
                error!(
                    "Cannot construct entity from key '{}' using metatype {}",
                    sample.key, pattern.metatype
                );
                return None;
            };
            let entity = format!("{}/{}", pattern.metatype, code.as_str());
            return Some(Sample::new(Key::from(entity), sample.value, sample.time));
        }
        None
    }
}

#[async_trait]
impl Operator for KeyEntity {
    fn name(&self) -> &str {
        "filters.KeyEntity"
    }
}

#[async_trait]
impl Filter for KeyEntity {
    async fn run(&mut self, mut rx: SampleRx, tx: SampleTx, _cancel: CancellationToken) -> Result<()> {
        debug!("KeyEntity.run()");
        while let Some(msg) = rx.recv().await {
            match msg {
                Message::Sample(sample) => {
                    if let Some(out) = self.entity(&sample) {
                        if tx.send(Message::Sample(out)).await.is_err() {
                            return Ok(());
                        }
                    }
                }
                Message::Eos => break,
            }
        }
        let _ = tx.send(Message::Eos).await;
        debug!("KeyEntity.run() done");
        Ok(())
    }
}
