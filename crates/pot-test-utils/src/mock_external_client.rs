// mock_external_client: a WebSocket client double for the external request
// and publish endpoints, used to drive the proxy from the outside in
// integration tests without a real client library.

use futures_util::{SinkExt, StreamExt};
use pot_protocol::ClientFrame;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::MaybeTlsStream;

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

pub struct MockExternalClient {
    write: futures_util::stream::SplitSink<WsStream, Message>,
    read: futures_util::stream::SplitStream<WsStream>,
}

/// A frame received from the proxy: either a JSON descriptor (ACK/REP/PUB)
/// or a raw bulk continuation, mirroring `request_relay::OutboundFrame`.
#[derive(Debug)]
pub enum ReceivedFrame {
    Json(String),
    Bulk(Vec<u8>),
}

impl MockExternalClient {
    pub async fn connect(url: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let (ws_stream, _response) = tokio_tungstenite::connect_async(url).await?;
        let (write, read) = ws_stream.split();
        Ok(Self { write, read })
    }

    /// Send a raw command line (`READ foo.bar`, `WRITE {...}`, ...) under an
    /// optional client-chosen correlation id.
    pub async fn send_command(
        &mut self,
        id: Option<&str>,
        body: &str,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let frame = ClientFrame {
            id: id.map(str::to_owned),
            body: body.to_owned(),
        };
        let json = serde_json::to_string(&frame)?;
        self.write.send(Message::Text(json.into())).await?;
        Ok(())
    }

    pub async fn recv_frame(&mut self) -> Result<ReceivedFrame, Box<dyn std::error::Error>> {
        loop {
            match self.read.next().await {
                Some(Ok(Message::Text(text))) => return Ok(ReceivedFrame::Json(text.to_string())),
                Some(Ok(Message::Binary(bytes))) => return Ok(ReceivedFrame::Bulk(bytes.to_vec())),
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) => return Err("connection closed by proxy".into()),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
                None => return Err("connection stream ended".into()),
            }
        }
    }

    pub async fn close(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.write.send(Message::Close(None)).await?;
        Ok(())
    }
}
