//! Bounded single-slot handoff between an I/O reader task and the pipeline.
//!
//! A long-running source performs its blocking I/O (kafka polling, HTTP
//! paging) in a background reader task. The reader assembles one batch at a
//! time and publishes it into a single-slot buffer; publishing suspends until
//! the consumer has drained the previous batch, and the consumer suspends
//! until a batch is available. The slot is a capacity-one channel, so the two
//! waits are exactly the "producable" and "consumable" halves of the
//! protocol.
//!
//! An error captured in the reader is published in place of a batch and
//! re-raised on the consumer's next wait. Shutdown is cooperative in both
//! directions: cancelling the token wakes a blocked publisher, and a dropped
//! consumer fails the publish, so the reader's loop ends either way.

use anyhow::Result;
use sentry_core::Sample;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// One reader batch.
pub type Batch = Vec<Sample>;

/// Create a connected single-slot handoff pair.
pub fn handoff(cancel: CancellationToken) -> (BatchSender, BatchReceiver) {
    let (tx, rx) = mpsc::channel(1);
    (BatchSender { tx, cancel }, BatchReceiver { rx })
}

/// Reader half: publishes batches, or one final error.
pub struct BatchSender {
    tx: mpsc::Sender<Result<Batch>>,
    cancel: CancellationToken,
}

impl BatchSender {
    /// Publish a batch, waiting for the slot to drain.
    ///
    /// Returns false when the consumer is gone or shutdown was requested;
    /// the reader should stop producing.
    pub async fn publish(&self, batch: Batch) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => {
                debug!("handoff publish aborted: cancelled");
                false
            }
            sent = self.tx.send(Ok(batch)) => sent.is_ok(),
        }
    }

    /// Publish a reader failure to be re-raised on the consumer.
    pub async fn fail(&self, err: anyhow::Error) {
        // Last message from this reader; ignore a consumer that already left.
        let _ = self.tx.send(Err(err)).await;
    }

    /// True once shutdown was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Consumer half: takes batches out of the slot.
pub struct BatchReceiver {
    rx: mpsc::Receiver<Result<Batch>>,
}

impl BatchReceiver {
    /// Wait for the next batch.
    ///
    /// `Ok(None)` is end-of-stream (the reader finished and dropped its
    /// sender); `Err` re-raises a failure captured in the reader.
    pub async fn next(&mut self) -> Result<Option<Batch>> {
        match self.rx.recv().await {
            None => Ok(None),
            Some(Ok(batch)) => Ok(Some(batch)),
            Some(Err(e)) => Err(e),
        }
    }
}
