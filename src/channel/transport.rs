use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{tungstenite::Message, MaybeTlsStream, WebSocketStream};

use crate::ChannelError;

/// Opens connections to a push endpoint.
///
/// [`WsConnector`] is the WebSocket implementation; tests inject in-memory
/// connectors through [`EventChannel::new`](crate::EventChannel::new).
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> Result<Box<dyn Connection>, ChannelError>;
}

/// One live duplex connection carrying text frames.
#[async_trait]
pub trait Connection: Send {
    /// Writes one text frame.
    async fn send_text(&mut self, text: String) -> Result<(), ChannelError>;

    /// Next inbound text frame, or `None` once the peer closed the connection.
    ///
    /// Must be cancel-safe: the channel polls it alongside its command queue.
    async fn next_text(&mut self) -> Option<Result<String, ChannelError>>;

    /// Sends a keepalive probe. Transports without one accept it as a no-op.
    async fn ping(&mut self) -> Result<(), ChannelError> {
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ChannelError>;
}

/// Connects with `tokio-tungstenite` to `ws://` and `wss://` URLs.
#[derive(Clone, Copy, Debug, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Connection>, ChannelError> {
        let (stream, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|err| ChannelError::Connect(err.to_string()))?;
        Ok(Box::new(WsConnection { stream }))
    }
}

struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Connection for WsConnection {
    async fn send_text(&mut self, text: String) -> Result<(), ChannelError> {
        self.stream
            .send(Message::Text(text.into()))
            .await
            .map_err(|err| ChannelError::Transport(err.to_string()))
    }

    async fn next_text(&mut self) -> Option<Result<String, ChannelError>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(err) => return Some(Err(ChannelError::Transport(err.to_string()))),
            };
            match message {
                Message::Text(text) => return Some(Ok(text.as_str().to_owned())),
                Message::Binary(bytes) => {
                    return Some(String::from_utf8(bytes.to_vec()).map_err(|_| {
                        ChannelError::Protocol("binary frame is not UTF-8 text".to_owned())
                    }))
                }
                Message::Close(_) => return None,
                // tungstenite answers pings itself
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            }
        }
    }

    async fn ping(&mut self) -> Result<(), ChannelError> {
        self.stream
            .send(Message::Ping(Vec::new().into()))
            .await
            .map_err(|err| ChannelError::Transport(err.to_string()))
    }

    async fn close(&mut self) -> Result<(), ChannelError> {
        SinkExt::close(&mut self.stream)
            .await
            .map_err(|err| ChannelError::Transport(err.to_string()))
    }
}
