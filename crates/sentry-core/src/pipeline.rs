//! Linear pipeline execution.
//!
//! Stages are spawned as tasks connected by bounded sample channels, one
//! channel per edge. The sink drives the run by pulling its input to
//! exhaustion; every task is joined and the first failure is reported.

use anyhow::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{Filter, Sink, Source};

/// Run a built pipeline to completion.
///
/// `capacity` is the buffer size of each inter-stage channel. Cancelling
/// `cancel` asks the source to stop; downstream stages then finish naturally
/// when their input closes.
pub async fn run_pipeline(
    mut source: Box<dyn Source>,
    filters: Vec<Box<dyn Filter>>,
    mut sink: Box<dyn Sink>,
    capacity: usize,
    cancel: CancellationToken,
) -> Result<()> {
    debug!("pipeline run: {} filter stage(s)", filters.len());

    let mut handles = Vec::new();

    let (source_tx, mut current_rx) = mpsc::channel(capacity);
    let c = cancel.child_token();
    handles.push(tokio::spawn(
        async move { source.run(source_tx, c).await },
    ));

    for mut filter in filters {
        let (tx, next_rx) = mpsc::channel(capacity);
        let rx = current_rx;
        let c = cancel.child_token();
        handles.push(tokio::spawn(async move { filter.run(rx, tx, c).await }));
        current_rx = next_rx;
    }

    let c = cancel.child_token();
    handles.push(tokio::spawn(async move { sink.run(current_rx, c).await }));

    // Join everything; the first stage error wins, join panics are internal.
    let mut first_err = None;
    for handle in handles {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
            Err(e) => {
                if first_err.is_none() {
                    first_err = Some(anyhow::anyhow!("pipeline task panicked: {e}"));
                }
            }
        }
    }
    debug!("pipeline done");
    match first_err {
        None => Ok(()),
        Some(e) => Err(e),
    }
}
