// pot-test-utils: shared test doubles for the telemetry broker proxy.
//
// Provides a mock store worker (Unix socket side) and a mock external
// client (WebSocket side) for integration testing the proxy without a real
// worker process or client library.

pub mod mock_external_client;
pub mod mock_worker;

pub use mock_external_client::{MockExternalClient, ReceivedFrame};
pub use mock_worker::{MockPublisher, MockWorker};

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures_util::{SinkExt, StreamExt};
    use pot_protocol::{MessageKind, ResponseMessage, TransactionId, WorkerRequestMessage};
    use tokio::net::UnixStream;
    use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

    /// Exercises `MockWorker` from the other side, standing in for the
    /// proxy's own Unix socket client without pulling in `pot-proxy` itself.
    #[tokio::test]
    async fn mock_worker_round_trips_a_request() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("req.sock");

        let server_path = path.clone();
        let server = tokio::spawn(async move {
            let mut worker = MockWorker::bind_and_accept(&server_path).await.unwrap();
            let request = worker.recv_request().await.unwrap();
            worker
                .send_response(&ResponseMessage {
                    message: MessageKind::Rep,
                    id: request.id,
                    time: 0.0,
                    name: request.name,
                    data: None,
                    error: None,
                })
                .await;
        });

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let stream = UnixStream::connect(&path).await.unwrap();
        let (read_half, write_half) = stream.into_split();
        let mut reader = FramedRead::new(read_half, LengthDelimitedCodec::new());
        let mut writer = FramedWrite::new(write_half, LengthDelimitedCodec::new());

        let request = WorkerRequestMessage {
            request: pot_protocol::RequestKind::Read,
            name: Some("kpfguide.DISP2MSG".to_owned()),
            id: TransactionId(7),
            data: None,
        };
        writer
            .send(Bytes::from(serde_json::to_vec(&request).unwrap()))
            .await
            .unwrap();

        let frame = reader.next().await.unwrap().unwrap();
        let response: ResponseMessage = serde_json::from_slice(&frame).unwrap();
        assert_eq!(response.id, TransactionId(7));
        assert_eq!(response.message, MessageKind::Rep);

        server.await.unwrap();
    }

    /// Exercises `MockPublisher` from the other side, standing in for the
    /// proxy's own publish-socket reader without pulling in `pot-proxy`.
    #[tokio::test]
    async fn mock_publisher_round_trips_a_broadcast_frame() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pub.sock");

        let server_path = path.clone();
        let server = tokio::spawn(async move {
            let mut publisher = MockPublisher::bind_and_accept(&server_path).await.unwrap();
            publisher
                .publish(b"kpfguide.DISP2MSG {\"message\":\"PUB\"}".to_vec())
                .await;
        });

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let stream = UnixStream::connect(&path).await.unwrap();
        let mut reader = FramedRead::new(stream, LengthDelimitedCodec::new());

        let frame = reader.next().await.unwrap().unwrap();
        assert_eq!(frame.as_ref(), b"kpfguide.DISP2MSG {\"message\":\"PUB\"}");

        server.await.unwrap();
    }
}
