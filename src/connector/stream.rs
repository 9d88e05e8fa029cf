// SPDX-License-Identifier: Apache-2.0

//! Helpers for adapters that produce rows from a background task.

use futures::stream::{self, StreamExt};
use tokio::sync::mpsc;

use crate::connector::error::SourceResult;
use crate::connector::traits::RowStream;
use crate::connector::types::Row;

/// Sending half handed to an adapter's producer task.
///
/// A failed `send` means the consumer dropped the stream; the producer should
/// stop reading from the store.
pub type RowSender = mpsc::Sender<SourceResult<Row>>;

/// Creates a bounded channel whose receiving half is exposed as a [`RowStream`].
pub fn channel_stream(capacity: usize) -> (RowSender, RowStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let stream = stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    })
    .boxed();
    (tx, stream)
}

/// Wraps an already materialized batch.
pub fn batch_stream(rows: Vec<Row>) -> RowStream {
    stream::iter(rows.into_iter().map(Ok)).boxed()
}
