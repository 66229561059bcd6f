//! Session with the conversational back-end.
//!
//! # Modules
//!
//! - `base` - errors, lifecycle state and timing configuration
//! - `channel` - duplex channel traits implemented by transports
//! - `websocket` - WebSocket transport
//! - `messages` - JSON wire protocol
//! - `reply` - turn-tagged reply assembly
//! - `manager` - connect, handshake, keepalive and teardown

mod base;
pub mod channel;
pub mod manager;
pub mod messages;
pub mod reply;
pub mod websocket;

pub use base::{
    DEFAULT_KEEPALIVE_INTERVAL, DEFAULT_READY_TIMEOUT, SessionConfig, SessionError, SessionResult,
    SessionState,
};
pub use channel::{
    ChannelError, ChannelHalves, ChannelResult, ChannelSink, ChannelStream, Connector, Frame,
};
pub use manager::SessionManager;
pub use messages::{ClientAction, ServerMessage, TEXT_INPUT_TYPE, TURN_END_MARKER};
pub use reply::{REPLY_TIMEOUT_MARKER, ReplyAssembly, ReplyItem};
pub use websocket::WebSocketConnector;
