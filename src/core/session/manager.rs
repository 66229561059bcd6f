//! Back-end session lifecycle.
//!
//! [`SessionManager`] owns the one live channel to the back-end. Opening a
//! session sends the `start_session` handshake, spawns the receiver and
//! keepalive loops and waits for `session_started`. Inbound frames are
//! demultiplexed by the receiver loop:
//!
//! - binary frames go to the [`AudioSink`] tagged with the current speech id
//! - `audio_chunk` announcements rotate the speech id
//! - reply text and the turn-end notice go to the [`ReplyAssembly`]
//!
//! A failed send marks the session closed; recovery happens on the caller's
//! next use through [`SessionManager::reconnect`] or a fresh `connect`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::base::{SessionConfig, SessionError, SessionResult, SessionState};
use super::channel::{ChannelSink, ChannelStream, Connector, Frame};
use super::messages::{ClientAction, ServerMessage, speech_id_from_value};
use super::reply::ReplyAssembly;
use crate::core::audio::AudioSink;

/// Upper bound on the best-effort `end_session` notice and channel close.
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

type SharedSink = Arc<Mutex<Box<dyn ChannelSink>>>;

/// Resources of one open session.
struct Session {
    sink: SharedSink,
    cancel: CancellationToken,
    /// Set once the channel is known to be closed
    closed: Arc<AtomicBool>,
    receiver: JoinHandle<()>,
    keepalive: JoinHandle<()>,
}

/// Owns the back-end channel and the loops that service it.
pub struct SessionManager {
    connector: Arc<dyn Connector>,
    audio: AudioSink,
    config: SessionConfig,
    replies: Arc<ReplyAssembly>,
    session: Option<Session>,
    state: SessionState,
}

impl SessionManager {
    pub fn new(connector: Arc<dyn Connector>, audio: AudioSink, config: SessionConfig) -> Self {
        Self {
            connector,
            audio,
            config,
            replies: Arc::new(ReplyAssembly::new()),
            session: None,
            state: SessionState::Absent,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether a session exists and its channel has not been seen closed.
    pub fn is_connected(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| !s.closed.load(Ordering::SeqCst))
    }

    /// Reply stream fed by the receiver loop.
    pub fn replies(&self) -> &Arc<ReplyAssembly> {
        &self.replies
    }

    /// Timing configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Open a fresh session, replacing any existing one.
    ///
    /// Returns once `session_started` has been received. If it does not
    /// arrive within the ready timeout, or the channel closes first, the
    /// session is torn down and an error is returned.
    pub async fn connect(&mut self) -> SessionResult<()> {
        self.disconnect().await;

        let endpoint = self.connector.endpoint();
        tracing::info!(%endpoint, "Connecting to back-end");
        self.state = SessionState::Connecting;

        let (mut sink, stream) = match self.connector.connect().await {
            Ok(halves) => halves,
            Err(e) => {
                self.state = SessionState::TornDown;
                tracing::error!(%endpoint, error = %e, "Failed to open back-end channel");
                return Err(SessionError::ConnectionFailed(e.to_string()));
            }
        };

        let handshake = ClientAction::start_text_session()
            .to_json()
            .map_err(|e| SessionError::SerializationError(e.to_string()))?;
        if let Err(e) = sink.send(Frame::Text(handshake)).await {
            let _ = sink.close().await;
            self.state = SessionState::TornDown;
            return Err(SessionError::ConnectionFailed(e.to_string()));
        }

        let (ready_tx, mut ready_rx) = watch::channel(false);
        let cancel = CancellationToken::new();
        let closed = Arc::new(AtomicBool::new(false));
        let sink: SharedSink = Arc::new(Mutex::new(sink));

        let receiver = tokio::spawn(receive_loop(
            stream,
            ReceiverContext {
                audio: self.audio.clone(),
                replies: self.replies.clone(),
                ready: ready_tx,
                closed: closed.clone(),
            },
            cancel.clone(),
        ));
        let keepalive = tokio::spawn(keepalive_loop(
            sink.clone(),
            closed.clone(),
            self.config.keepalive_interval,
            cancel.clone(),
        ));

        self.session = Some(Session {
            sink,
            cancel,
            closed,
            receiver,
            keepalive,
        });

        let ready_timeout = self.config.ready_timeout;
        let ready = tokio::time::timeout(ready_timeout, async {
            ready_rx.wait_for(|ready| *ready).await.map(|_| ())
        })
        .await;

        match ready {
            Ok(Ok(())) => {
                self.state = SessionState::Ready;
                tracing::info!(%endpoint, "Back-end session ready");
                Ok(())
            }
            Ok(Err(_)) => {
                tracing::warn!(%endpoint, "Channel closed before session_started");
                self.disconnect().await;
                Err(SessionError::ConnectionFailed(
                    "channel closed before session_started".to_string(),
                ))
            }
            Err(_) => {
                tracing::warn!(%endpoint, ?ready_timeout, "Timed out waiting for session_started");
                self.disconnect().await;
                Err(SessionError::HandshakeTimeout(ready_timeout))
            }
        }
    }

    /// Close the session if one exists.
    ///
    /// Stops both loops, sends `end_session` if the channel still looks open
    /// (failures ignored) and closes the channel. Calling it with no session
    /// does nothing.
    pub async fn disconnect(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };

        session.cancel.cancel();

        let sink = session.sink.clone();
        let was_closed = session.closed.swap(true, Ordering::SeqCst);
        let goodbye = async move {
            let mut sink = sink.lock().await;
            if !was_closed && let Ok(json) = ClientAction::EndSession.to_json() {
                if let Err(e) = sink.send(Frame::Text(json)).await {
                    tracing::debug!(error = %e, "end_session not delivered");
                }
            }
            if let Err(e) = sink.close().await {
                tracing::debug!(error = %e, "Channel close failed");
            }
        };
        if tokio::time::timeout(DISCONNECT_TIMEOUT, goodbye).await.is_err() {
            tracing::warn!("Timed out closing back-end channel");
        }

        for handle in [session.receiver, session.keepalive] {
            if let Err(e) = handle.await
                && !e.is_cancelled()
            {
                tracing::error!(error = %e, "Session task ended abnormally");
            }
        }

        self.state = SessionState::TornDown;
        tracing::info!("Back-end session closed");
    }

    /// Tear down the current session and open a new one.
    pub async fn reconnect(&mut self) -> SessionResult<()> {
        tracing::info!("Reconnecting to back-end");
        self.connect().await
    }

    /// Submit one text prompt on the open session.
    pub async fn send_prompt(&self, prompt: &str) -> SessionResult<()> {
        let session = self.session.as_ref().ok_or(SessionError::NotConnected)?;
        if session.closed.load(Ordering::SeqCst) {
            return Err(SessionError::ChannelClosed);
        }

        let json = ClientAction::text_prompt(prompt)
            .to_json()
            .map_err(|e| SessionError::SerializationError(e.to_string()))?;

        let result = session.sink.lock().await.send(Frame::Text(json)).await;
        if let Err(e) = result {
            let error = SessionError::from(e);
            if error.is_retryable() {
                session.closed.store(true, Ordering::SeqCst);
            }
            return Err(error);
        }
        Ok(())
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("endpoint", &self.connector.endpoint())
            .field("state", &self.state)
            .field("connected", &self.is_connected())
            .finish()
    }
}

struct ReceiverContext {
    audio: AudioSink,
    replies: Arc<ReplyAssembly>,
    ready: watch::Sender<bool>,
    closed: Arc<AtomicBool>,
}

impl ReceiverContext {
    fn handle_text(&self, text: &str, generation: &mut Option<String>) {
        let Some(message) = ServerMessage::parse(text) else {
            tracing::trace!(len = text.len(), "Dropping malformed frame");
            return;
        };

        if message.is_turn_end() {
            tracing::debug!("Reply complete");
            self.replies.push_end();
            return;
        }

        match message {
            ServerMessage::SessionStarted => {
                tracing::debug!("Received session_started");
                self.ready.send_replace(true);
            }
            ServerMessage::GeminiResponse { text } => self.replies.push_text(text),
            ServerMessage::AudioChunk { speech_id } => match speech_id_from_value(&speech_id) {
                Some(id) => {
                    tracing::debug!(speech_id = %id, "New speech stream");
                    self.audio.set_generation(id.clone());
                    *generation = Some(id);
                }
                None => {
                    self.audio.clear_generation();
                    *generation = None;
                }
            },
            ServerMessage::System { .. } | ServerMessage::Unknown => {
                tracing::trace!("Ignoring back-end message");
            }
        }
    }
}

async fn receive_loop(
    mut stream: Box<dyn ChannelStream>,
    ctx: ReceiverContext,
    cancel: CancellationToken,
) {
    let mut generation: Option<String> = None;

    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            frame = stream.next_frame() => frame,
        };

        match frame {
            Some(Ok(Frame::Binary(data))) => {
                if let Some(id) = &generation {
                    ctx.audio.put(id.clone(), data);
                }
            }
            Some(Ok(Frame::Text(text))) => ctx.handle_text(&text, &mut generation),
            Some(Err(e)) => {
                tracing::error!(error = %e, "Back-end receive failed");
                ctx.closed.store(true, Ordering::SeqCst);
                break;
            }
            None => {
                tracing::info!("Back-end channel ended");
                ctx.closed.store(true, Ordering::SeqCst);
                break;
            }
        }
    }
    tracing::debug!("Receiver loop stopped");
}

async fn keepalive_loop(
    sink: SharedSink,
    closed: Arc<AtomicBool>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let ping = match ClientAction::Ping.to_json() {
        Ok(json) => json,
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode ping");
            return;
        }
    };

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        if closed.load(Ordering::SeqCst) {
            break;
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = async { sink.lock().await.send(Frame::Text(ping.clone())).await } => result,
        };
        if let Err(e) = result {
            tracing::warn!(error = %e, "Keepalive ping failed");
            break;
        }
        tracing::trace!("Keepalive ping sent");
    }
    tracing::debug!("Keepalive loop stopped");
}
