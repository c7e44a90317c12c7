// mock_worker: a mock store worker for integration testing the proxy.
//
// Binds a Unix request socket and (optionally) a publish socket, accepts
// one connection on each, and exposes a simple recv/send API so a test can
// drive the worker side of the proxy<->worker protocol without spawning a
// real worker process.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use pot_protocol::{ResponseMessage, WorkerRequestMessage};
use tokio::net::{
    unix::{OwnedReadHalf, OwnedWriteHalf},
    UnixListener, UnixStream,
};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

/// The worker side of a store's request socket.
///
/// # Protocol behavior
///
/// A test drives a `MockWorker` directly: `recv_request` waits for the next
/// decoded request, `send_response` answers with an `ACK`/`REP`/`REP+B`
/// descriptor, and `send_raw` writes an unparsed frame (a bulk continuation,
/// or a deliberately malformed one) straight onto the socket.
pub struct MockWorker {
    reader: FramedRead<OwnedReadHalf, LengthDelimitedCodec>,
    writer: FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>,
}

impl MockWorker {
    /// Bind a fresh request socket under `dir` and wait for the proxy to
    /// connect to it.
    pub async fn bind_and_accept(socket_path: &std::path::Path) -> std::io::Result<Self> {
        let listener = UnixListener::bind(socket_path)?;
        let (stream, _) = listener.accept().await?;
        Ok(Self::from_stream(stream))
    }

    /// Connect to a socket the proxy is already listening on (used when the
    /// test plays the role of the supervisor's accept loop itself).
    pub async fn connect(socket_path: &std::path::Path) -> std::io::Result<Self> {
        let stream = UnixStream::connect(socket_path).await?;
        Ok(Self::from_stream(stream))
    }

    /// Wrap a `UnixStream` the test has already connected itself, e.g. one
    /// end of a pair set up to stand in for a Request Relay's worker socket
    /// without going through a real accept loop.
    pub fn from_connected_stream(stream: UnixStream) -> Self {
        Self::from_stream(stream)
    }

    fn from_stream(stream: UnixStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: FramedRead::new(read_half, LengthDelimitedCodec::new()),
            writer: FramedWrite::new(write_half, LengthDelimitedCodec::new()),
        }
    }

    /// Wait for the next request frame and decode it.
    pub async fn recv_request(&mut self) -> Option<WorkerRequestMessage> {
        let frame = self.reader.next().await?.ok()?;
        serde_json::from_slice(&frame).ok()
    }

    pub async fn send_response(&mut self, response: &ResponseMessage) {
        let json = pot_protocol::encode_response(response).unwrap();
        self.writer.send(Bytes::from(json.into_bytes())).await.unwrap();
    }

    /// Send a raw frame unparsed, for tests that want to feed the dispatcher
    /// a malformed or bulk-continuation frame directly.
    pub async fn send_raw(&mut self, bytes: Vec<u8>) {
        self.writer.send(Bytes::from(bytes)).await.unwrap();
    }
}

/// The worker side of a store's publish socket: a plain byte-frame source
/// the test drives directly to exercise fanout.
pub struct MockPublisher {
    writer: FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>,
}

impl MockPublisher {
    pub async fn bind_and_accept(socket_path: &std::path::Path) -> std::io::Result<Self> {
        let listener = UnixListener::bind(socket_path)?;
        let (stream, _) = listener.accept().await?;
        let (_, write_half) = stream.into_split();
        Ok(Self {
            writer: FramedWrite::new(write_half, LengthDelimitedCodec::new()),
        })
    }

    pub async fn publish(&mut self, frame: Vec<u8>) {
        self.writer.send(Bytes::from(frame)).await.unwrap();
    }
}
