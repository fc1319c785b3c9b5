//! Body plumbing between hyper and the demand bridge.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::{Body, Frame, Incoming, SizeHint};
use tokio::sync::mpsc;

use crate::error::NetError;
use crate::flow::bridge::{BridgeProducer, Readiness};
use crate::flow::outbound::WriteSink;
use crate::net::pipeline::Pipeline;

type Chunk = Result<Bytes, NetError>;

/// Response body fed chunk by chunk from the handler's outbound writer.
#[derive(Debug)]
pub struct ResponseBody {
    rx: Option<mpsc::Receiver<Chunk>>,
}

impl ResponseBody {
    pub fn empty() -> Self {
        Self { rx: None }
    }
}

impl Body for ResponseBody {
    type Data = Bytes;
    type Error = NetError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, NetError>>> {
        let Some(rx) = self.rx.as_mut() else {
            return Poll::Ready(None);
        };
        match rx.poll_recv(cx) {
            Poll::Ready(Some(chunk)) => Poll::Ready(Some(chunk.map(Frame::data))),
            Poll::Ready(None) => {
                self.rx = None;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.rx.is_none()
    }

    fn size_hint(&self) -> SizeHint {
        if self.rx.is_none() {
            SizeHint::with_exact(0)
        } else {
            SizeHint::default()
        }
    }
}

/// Writer-side half of a [`ResponseBody`].
#[derive(Debug)]
pub(crate) struct BodySink {
    tx: Option<mpsc::Sender<Chunk>>,
}

/// A bounded body channel: the writer waits while hyper has not taken the
/// previous chunk.
pub(crate) fn body_channel() -> (BodySink, ResponseBody, mpsc::Sender<Chunk>) {
    let (tx, rx) = mpsc::channel(1);
    let abort = tx.clone();
    (BodySink { tx: Some(tx) }, ResponseBody { rx: Some(rx) }, abort)
}

impl WriteSink for BodySink {
    async fn write(&mut self, chunk: Bytes) -> io::Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| io::Error::from(io::ErrorKind::BrokenPipe))?;
        tx.send(Ok(chunk))
            .await
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))
    }

    async fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        self.tx = None;
        Ok(())
    }
}

/// Feed an incoming hyper body into a bridge, one frame per unit of demand.
pub(crate) async fn pump_body(mut body: Incoming, producer: BridgeProducer<Bytes>, pipeline: Pipeline) {
    loop {
        if producer.ready().await == Readiness::Closed {
            return;
        }
        match body.frame().await {
            Some(Ok(frame)) => {
                let Ok(data) = frame.into_data() else {
                    // Trailers carry no payload.
                    continue;
                };
                if data.is_empty() {
                    continue;
                }
                if let Err(e) = producer.deliver(pipeline.inbound(data)).await {
                    tracing::debug!(error = %e, "Dropping body chunk");
                    return;
                }
            }
            Some(Err(e)) => {
                producer.error(e.into());
                return;
            }
            None => {
                producer.complete();
                return;
            }
        }
    }
}
