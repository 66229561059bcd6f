pub mod audio;
pub mod ingress;
pub mod session;
pub mod turn;

// Re-export commonly used types for convenience
pub use audio::{AudioDevice, AudioError, AudioResult, AudioSink, LocalAudioDevice, PcmFormat};

pub use ingress::{ChatEvent, EventIngress, EventSource, IngressOutcome, JsonLinesSource};

pub use session::{
    ChannelError, ChannelResult, Connector, Frame, ReplyAssembly, SessionConfig, SessionError,
    SessionManager, SessionResult, SessionState, WebSocketConnector,
};

pub use turn::{Turn, TurnConfig, TurnOutcome, TurnProcessor, TurnSource};
