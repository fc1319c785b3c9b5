//! Outbound write path.
//!
//! Each connection owns one writer task. Writes are queued, applied through
//! the pipeline's outbound stages, written one at a time in submission order
//! and flushed once the queue runs dry. Every write resolves its own
//! acknowledgement so callers observe exactly when a chunk reached the sink.

use std::future::Future;
use std::io;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio::sync::{mpsc, oneshot};

use crate::error::{is_broken_pipe, NetError, Result};
use crate::flow::bridge::BridgeState;
use crate::net::connection::{ConnectionState, ConnectionStatus};
use crate::net::pipeline::Pipeline;

/// Byte sink driven by the writer task.
pub(crate) trait WriteSink: Send + 'static {
    fn write(&mut self, chunk: Bytes) -> impl Future<Output = io::Result<()>> + Send;

    fn flush(&mut self) -> impl Future<Output = io::Result<()>> + Send;

    fn shutdown(&mut self) -> impl Future<Output = io::Result<()>> + Send;
}

#[derive(Debug)]
enum WriteOp {
    Write(Bytes, oneshot::Sender<Result<()>>),
    Close(oneshot::Sender<Result<()>>),
}

/// Handle for queueing writes on a connection.
#[derive(Debug, Clone)]
pub struct Outbound {
    tx: mpsc::UnboundedSender<WriteOp>,
}

impl Outbound {
    /// Start the writer task for `sink` on the current runtime.
    pub(crate) fn spawn<S: WriteSink>(
        sink: S,
        consumer: Arc<BridgeState>,
        pipeline: Pipeline,
        status: Arc<ConnectionStatus>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(sink, rx, consumer, pipeline, status));
        Self { tx }
    }

    /// Queue one chunk. Resolves when it was written (and flushed if it was
    /// the last queued write).
    pub async fn send(&self, chunk: Bytes) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(WriteOp::Write(chunk, ack_tx))
            .map_err(|_| NetError::NotRunning("connection writer closed"))?;
        ack_rx.await.map_err(|_| NetError::RemoteClosed)?
    }

    /// Queue every chunk of a stream, stopping at the first failure.
    pub async fn send_all<S>(&self, chunks: S) -> Result<()>
    where
        S: Stream<Item = Bytes> + Send,
    {
        let mut chunks = std::pin::pin!(chunks);
        while let Some(chunk) = chunks.next().await {
            self.send(chunk).await?;
        }
        Ok(())
    }

    /// Flush and shut the sink down. Closing twice is a no-op.
    pub async fn close(&self) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(WriteOp::Close(ack_tx)).is_err() {
            return Ok(());
        }
        ack_rx.await.unwrap_or(Ok(()))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

async fn run_writer<S: WriteSink>(
    mut sink: S,
    mut rx: mpsc::UnboundedReceiver<WriteOp>,
    consumer: Arc<BridgeState>,
    pipeline: Pipeline,
    status: Arc<ConnectionStatus>,
) {
    let mut dirty = false;
    while let Some(op) = rx.recv().await {
        match op {
            WriteOp::Write(chunk, ack) => {
                let chunk = pipeline.outbound(chunk);
                let mut result = sink.write(chunk).await;
                dirty = true;
                if result.is_ok() && rx.is_empty() {
                    result = sink.flush().await;
                    dirty = false;
                }
                let outcome = settle(result, &consumer, &status);
                let failed = outcome.is_err();
                let _ = ack.send(outcome);
                if failed || status.get() != ConnectionState::Open {
                    break;
                }
            }
            WriteOp::Close(ack) => {
                let mut result = sink.flush().await;
                if result.is_ok() {
                    result = sink.shutdown().await;
                }
                status.mark_closing();
                let _ = ack.send(settle(result, &consumer, &status));
                return;
            }
        }
    }
    if dirty {
        let _ = sink.flush().await;
    }
}

/// Broken pipes with nobody listening are expected teardown noise.
fn settle(result: io::Result<()>, consumer: &BridgeState, status: &ConnectionStatus) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(err) if is_broken_pipe(&err) && !consumer.has_consumer() => {
            status.mark_closing();
            tracing::debug!(error = %err, "Peer closed connection during write");
            Ok(())
        }
        Err(err) => {
            status.mark_closing();
            Err(err.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::bridge::{self, Demand};
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct RecordingSink {
        log: Arc<Mutex<Vec<String>>>,
        fail_with: Option<io::ErrorKind>,
    }

    impl WriteSink for RecordingSink {
        async fn write(&mut self, chunk: Bytes) -> io::Result<()> {
            if let Some(kind) = self.fail_with {
                return Err(kind.into());
            }
            self.log
                .lock()
                .unwrap()
                .push(String::from_utf8_lossy(&chunk).into_owned());
            Ok(())
        }

        async fn flush(&mut self) -> io::Result<()> {
            self.log.lock().unwrap().push("<flush>".into());
            Ok(())
        }

        async fn shutdown(&mut self) -> io::Result<()> {
            self.log.lock().unwrap().push("<shutdown>".into());
            Ok(())
        }
    }

    fn writer(sink: RecordingSink) -> (Outbound, crate::flow::bridge::DemandBridge<Bytes>) {
        let (bridge, _producer) = bridge::channel::<Bytes>();
        let outbound = Outbound::spawn(
            sink,
            bridge.state(),
            Pipeline::default(),
            Arc::new(ConnectionStatus::new()),
        );
        (outbound, bridge)
    }

    #[tokio::test]
    async fn writes_are_ordered_and_flushed() {
        let sink = RecordingSink::default();
        let (outbound, _bridge) = writer(sink.clone());

        outbound.send(Bytes::from_static(b"one")).await.unwrap();
        outbound.send(Bytes::from_static(b"two")).await.unwrap();
        outbound.close().await.unwrap();

        let log = sink.log.lock().unwrap().clone();
        assert_eq!(log, vec!["one", "<flush>", "two", "<flush>", "<flush>", "<shutdown>"]);
    }

    #[tokio::test]
    async fn broken_pipe_without_consumer_is_swallowed() {
        let sink = RecordingSink {
            fail_with: Some(io::ErrorKind::BrokenPipe),
            ..Default::default()
        };
        let (outbound, _bridge) = writer(sink);
        assert!(outbound.send(Bytes::from_static(b"x")).await.is_ok());
    }

    #[tokio::test]
    async fn broken_pipe_with_consumer_is_remote_closed() {
        let sink = RecordingSink {
            fail_with: Some(io::ErrorKind::BrokenPipe),
            ..Default::default()
        };
        let (outbound, bridge) = writer(sink);
        let _inbound = bridge.attach(Demand::Manual).unwrap();

        let err = outbound.send(Bytes::from_static(b"x")).await.unwrap_err();
        assert!(matches!(err, NetError::RemoteClosed));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (outbound, _bridge) = writer(RecordingSink::default());
        outbound.close().await.unwrap();
        outbound.close().await.unwrap();
        assert!(outbound.send(Bytes::from_static(b"late")).await.is_err());
    }
}
