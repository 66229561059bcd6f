//! Duplex channel abstraction for the conversational back-end.
//!
//! The session layer never talks to a socket directly. A [`Connector`] opens a
//! fresh channel and hands back its two halves: a [`ChannelSink`] for outbound
//! frames and a [`ChannelStream`] for inbound frames. The production
//! implementation lives in [`super::websocket`]; tests plug in an in-memory
//! back-end.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// One message on the duplex channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// JSON control/text message
    Text(String),
    /// Raw PCM audio
    Binary(Bytes),
}

/// Transport-level failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// The peer closed the channel or it was already closed locally
    #[error("Channel closed")]
    Closed,

    /// Any other transport failure
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Result type for channel operations.
pub type ChannelResult<T> = Result<T, ChannelError>;

/// Write half of a duplex channel.
#[async_trait]
pub trait ChannelSink: Send {
    /// Send one frame.
    async fn send(&mut self, frame: Frame) -> ChannelResult<()>;

    /// Close the channel. Closing an already-closed channel is not an error.
    async fn close(&mut self) -> ChannelResult<()>;
}

/// Read half of a duplex channel.
#[async_trait]
pub trait ChannelStream: Send {
    /// Wait for the next inbound frame.
    ///
    /// Returns `None` once the channel has ended.
    async fn next_frame(&mut self) -> Option<ChannelResult<Frame>>;
}

/// Both halves of a freshly opened channel.
pub type ChannelHalves = (Box<dyn ChannelSink>, Box<dyn ChannelStream>);

/// Opens channels to the back-end.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a new channel.
    async fn connect(&self) -> ChannelResult<ChannelHalves>;

    /// Human-readable endpoint, used in logs.
    fn endpoint(&self) -> String;
}
