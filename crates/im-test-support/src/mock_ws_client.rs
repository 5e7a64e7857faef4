// A thin WebSocket test client speaking the gateway's inbound/outbound
// envelope contract, grounded on `rt-test-utils::MockWsClient` (connect,
// send_message/recv_message, graceful close) but carrying `im_protocol`'s
// envelope types instead of the teacher's `rt_protocol::WsMessage`.

use futures_util::{SinkExt, StreamExt};
use im_protocol::{InEnvelope, OutEnvelope};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::MaybeTlsStream;

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

pub struct MockWsClient {
    write: futures_util::stream::SplitSink<WsStream, Message>,
    read: futures_util::stream::SplitStream<WsStream>,
}

impl MockWsClient {
    pub async fn connect(url: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let (ws_stream, _response) = tokio_tungstenite::connect_async(url).await?;
        let (write, read) = ws_stream.split();
        Ok(Self { write, read })
    }

    pub async fn send(&mut self, req_identifier: i32, msg_incr: &str, data: serde_json::Value) -> Result<(), Box<dyn std::error::Error>> {
        let env = InEnvelope { req_identifier, msg_incr: msg_incr.to_owned(), data };
        let json = serde_json::to_string(&env)?;
        self.write.send(Message::Text(json.into())).await?;
        Ok(())
    }

    pub async fn recv(&mut self) -> Result<OutEnvelope, Box<dyn std::error::Error>> {
        loop {
            match self.read.next().await {
                Some(Ok(Message::Text(text))) => return Ok(serde_json::from_str(&text)?),
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) => return Err("connection closed by server".into()),
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
