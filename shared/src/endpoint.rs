//! Tunnel endpoint
//!
//! Wraps one duplex frame connection. Writers are serialized behind an async
//! mutex so concurrent senders never interleave; the read half has a single
//! consumer. The endpoint does not care what carries the frames: the relay
//! builds it from an axum WebSocket, the agent from a tokio-tungstenite
//! stream, and tests from [`memory_pair`].

use std::pin::Pin;
use std::time::Duration;

use futures_util::{sink, stream, Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::protocol::{Frame, MAX_MESSAGE_SIZE};

type FrameSink = Pin<Box<dyn Sink<Vec<u8>, Error = Error> + Send>>;
type FrameStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>>> + Send>>;

/// How long `close` waits for the transport to flush its close frame
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

pub struct TunnelEndpoint {
    peer: String,
    writer: Mutex<Option<FrameSink>>,
    reader: Mutex<FrameStream>,
    closed: CancellationToken,
}

impl TunnelEndpoint {
    /// Build an endpoint from a frame sink and a frame stream.
    ///
    /// Each item is the raw bytes of exactly one message. The stream ending
    /// means the peer went away.
    pub fn new<Si, St>(peer: impl Into<String>, sink: Si, stream: St) -> Self
    where
        Si: Sink<Vec<u8>, Error = Error> + Send + 'static,
        St: Stream<Item = Result<Vec<u8>>> + Send + 'static,
    {
        Self {
            peer: peer.into(),
            writer: Mutex::new(Some(Box::pin(sink))),
            reader: Mutex::new(Box::pin(stream)),
            closed: CancellationToken::new(),
        }
    }

    /// Label of the remote side, for logs
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the endpoint has been closed, locally or by the peer
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Serialize and write one message.
    ///
    /// A transport error closes the endpoint: the connection is treated as
    /// lost and the reader is woken up.
    pub async fn send(&self, frame: &Frame) -> Result<()> {
        if self.is_closed() {
            return Err(Error::SendFailure("tunnel closed".into()));
        }

        let data = frame.to_bytes()?;
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(Error::Protocol(format!(
                "message of {} bytes exceeds the {} byte limit",
                data.len(),
                MAX_MESSAGE_SIZE
            )));
        }

        let mut writer = self.writer.lock().await;
        let sink = writer
            .as_mut()
            .ok_or_else(|| Error::SendFailure("tunnel closed".into()))?;

        let result = tokio::select! {
            res = sink.send(data) => res,
            _ = self.closed.cancelled() => Err(Error::SendFailure("tunnel closed".into())),
        };

        if let Err(e) = result {
            self.closed.cancel();
            return Err(match e {
                Error::SendFailure(_) => e,
                other => Error::SendFailure(other.to_string()),
            });
        }
        Ok(())
    }

    /// Wait for the next message.
    ///
    /// Fails with `ReceiveFailure` once the connection is gone. A frame that
    /// does not decode yields `Protocol`; the connection stays usable.
    pub async fn receive(&self) -> Result<Frame> {
        let mut reader = self.reader.lock().await;

        let next = tokio::select! {
            biased;
            _ = self.closed.cancelled() => {
                return Err(Error::ReceiveFailure("tunnel closed".into()));
            }
            next = reader.next() => next,
        };

        match next {
            Some(Ok(data)) => Ok(Frame::from_bytes(&data)?),
            Some(Err(e)) => {
                self.closed.cancel();
                Err(match e {
                    Error::ReceiveFailure(_) => e,
                    other => Error::ReceiveFailure(other.to_string()),
                })
            }
            None => {
                self.closed.cancel();
                Err(Error::ReceiveFailure("connection closed by peer".into()))
            }
        }
    }

    /// Release the connection. Safe to call more than once.
    pub async fn close(&self) {
        self.closed.cancel();

        let sink = self.writer.lock().await.take();
        if let Some(mut sink) = sink {
            debug!(peer = %self.peer, "Closing tunnel");
            match tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(peer = %self.peer, "Close handshake failed: {}", e),
                Err(_) => warn!(peer = %self.peer, "Close handshake timed out"),
            }
        }
    }
}

/// Two endpoints wired to each other in memory
pub fn memory_pair(capacity: usize) -> (TunnelEndpoint, TunnelEndpoint) {
    let (a_tx, a_rx) = mpsc::channel(capacity);
    let (b_tx, b_rx) = mpsc::channel(capacity);
    (
        channel_endpoint("memory-a", a_tx, b_rx),
        channel_endpoint("memory-b", b_tx, a_rx),
    )
}

fn channel_endpoint(
    peer: &str,
    tx: mpsc::Sender<Vec<u8>>,
    rx: mpsc::Receiver<Vec<u8>>,
) -> TunnelEndpoint {
    let sink = sink::unfold(tx, |tx, data: Vec<u8>| async move {
        tx.send(data)
            .await
            .map_err(|_| Error::SendFailure("peer dropped".into()))?;
        Ok::<_, Error>(tx)
    });
    let stream = stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|data| (Ok::<_, Error>(data), rx))
    });
    TunnelEndpoint::new(peer, sink, stream)
}
