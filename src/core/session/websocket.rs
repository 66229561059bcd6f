//! WebSocket implementation of the duplex channel.
//!
//! Endpoint shape: `ws://<host>:<port>/ws/<role_name>`. Text frames carry JSON
//! control messages, binary frames carry raw PCM audio.

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

use super::channel::{
    ChannelError, ChannelHalves, ChannelResult, ChannelSink, ChannelStream, Connector, Frame,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens WebSocket channels to a fixed URL.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: Url,
}

impl WebSocketConnector {
    /// Create a connector for the given session URL.
    pub fn new(url: Url) -> Self {
        Self { url }
    }

    /// The session URL this connector dials.
    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self) -> ChannelResult<ChannelHalves> {
        let (ws_stream, _response) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(map_ws_error)?;

        tracing::debug!(url = %self.url, "WebSocket connected");

        let (sink, stream) = ws_stream.split();
        Ok((
            Box::new(WebSocketSink { sink }),
            Box::new(WebSocketFrames { stream }),
        ))
    }

    fn endpoint(&self) -> String {
        self.url.to_string()
    }
}

/// Write half of a WebSocket channel.
pub struct WebSocketSink {
    sink: SplitSink<WsStream, Message>,
}

#[async_trait]
impl ChannelSink for WebSocketSink {
    async fn send(&mut self, frame: Frame) -> ChannelResult<()> {
        let message = match frame {
            Frame::Text(text) => Message::Text(text.into()),
            Frame::Binary(data) => Message::Binary(data),
        };
        self.sink.send(message).await.map_err(map_ws_error)
    }

    async fn close(&mut self) -> ChannelResult<()> {
        match self.sink.close().await {
            Ok(()) => Ok(()),
            Err(e) => match map_ws_error(e) {
                ChannelError::Closed => Ok(()),
                other => Err(other),
            },
        }
    }
}

/// Read half of a WebSocket channel.
pub struct WebSocketFrames {
    stream: SplitStream<WsStream>,
}

#[async_trait]
impl ChannelStream for WebSocketFrames {
    async fn next_frame(&mut self) -> Option<ChannelResult<Frame>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(Frame::Text(text.as_str().to_owned()))),
                Ok(Message::Binary(data)) => return Some(Ok(Frame::Binary(data))),
                Ok(Message::Close(frame)) => {
                    tracing::info!(?frame, "WebSocket closed by back-end");
                    return None;
                }
                // tungstenite queues the pong reply itself; it goes out with the next write
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => continue,
                Err(e) => return Some(Err(map_ws_error(e))),
            }
        }
    }
}

fn map_ws_error(error: tungstenite::Error) -> ChannelError {
    match error {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            ChannelError::Closed
        }
        tungstenite::Error::Protocol(tungstenite::error::ProtocolError::SendAfterClosing)
        | tungstenite::Error::Protocol(
            tungstenite::error::ProtocolError::ResetWithoutClosingHandshake,
        ) => ChannelError::Closed,
        tungstenite::Error::Io(ref io)
            if matches!(
                io.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::UnexpectedEof
            ) =>
        {
            ChannelError::Closed
        }
        other => ChannelError::Transport(other.to_string()),
    }
}
