//! In-memory back-end for integration tests
//!
//! `MockBackend` implements `Connector`. Every `connect()` opens a new
//! in-memory connection; frames the bridge sends are parsed and recorded, and
//! the back-end answers the way the real service does:
//!
//! - `start_session` -> `session_started` (unless acks are switched off)
//! - `stream_data` -> the next scripted response, or `"ok"` + turn end

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use waav_chat_bridge::core::audio::{AudioDevice, AudioError, AudioResult};
use waav_chat_bridge::core::session::{
    ChannelError, ChannelHalves, ChannelResult, ChannelSink, ChannelStream, Connector, Frame,
};

// =============================================================================
// Frame builders
// =============================================================================

pub fn text(chunk: &str) -> Frame {
    Frame::Text(json!({"type": "gemini_response", "text": chunk}).to_string())
}

pub fn turn_end() -> Frame {
    Frame::Text(json!({"type": "system", "data": "turn end"}).to_string())
}

pub fn audio_chunk(speech_id: &str) -> Frame {
    Frame::Text(json!({"type": "audio_chunk", "speech_id": speech_id}).to_string())
}

pub fn pcm(tag: &'static str) -> Frame {
    Frame::Binary(Bytes::from_static(tag.as_bytes()))
}

pub fn session_started() -> Frame {
    Frame::Text(json!({"type": "session_started"}).to_string())
}

// =============================================================================
// Mock back-end
// =============================================================================

struct LiveConnection {
    id: usize,
    tx: mpsc::UnboundedSender<Frame>,
    closed: Arc<AtomicBool>,
}

#[derive(Default)]
struct BackendState {
    /// (connection id, parsed client message)
    received: Mutex<Vec<(usize, Value)>>,
    scripts: Mutex<VecDeque<Vec<Frame>>>,
    current: Mutex<Option<LiveConnection>>,
    closed_flags: Mutex<Vec<Arc<AtomicBool>>>,
    connections: AtomicUsize,
    refuse: AtomicBool,
    mute_acks: AtomicBool,
    fail_next_prompt: Mutex<Option<ChannelError>>,
}

/// Scriptable in-memory back-end. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct MockBackend {
    state: Arc<BackendState>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connector handle for a `SessionManager`.
    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(self.clone())
    }

    /// Queue the frames sent in answer to the next `stream_data`.
    pub fn script(&self, frames: Vec<Frame>) {
        self.state.scripts.lock().push_back(frames);
    }

    /// Whether `start_session` is answered with `session_started`.
    pub fn set_acks(&self, enabled: bool) {
        self.state.mute_acks.store(!enabled, Ordering::SeqCst);
    }

    /// Whether new connections are refused.
    pub fn set_refuse(&self, refuse: bool) {
        self.state.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Make the next `stream_data` send fail with `error`.
    pub fn fail_next_prompt(&self, error: ChannelError) {
        *self.state.fail_next_prompt.lock() = Some(error);
    }

    /// Push a frame to the bridge on the live connection.
    pub fn push(&self, frame: Frame) {
        if let Some(live) = self.state.current.lock().as_ref() {
            let _ = live.tx.send(frame);
        }
    }

    /// Drop the live connection from the server side.
    pub fn kill_connection(&self) {
        if let Some(live) = self.state.current.lock().take() {
            live.closed.store(true, Ordering::SeqCst);
        }
    }

    pub fn connection_count(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Whether connection `id` (1-based) has been closed by either side.
    pub fn is_closed(&self, id: usize) -> bool {
        self.state
            .closed_flags
            .lock()
            .get(id - 1)
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    /// All client actions, in order.
    pub fn actions(&self) -> Vec<String> {
        self.state
            .received
            .lock()
            .iter()
            .filter_map(|(_, v)| v["action"].as_str().map(str::to_string))
            .collect()
    }

    /// Client actions received on connection `id`.
    pub fn actions_on(&self, id: usize) -> Vec<String> {
        self.state
            .received
            .lock()
            .iter()
            .filter(|(conn, _)| *conn == id)
            .filter_map(|(_, v)| v["action"].as_str().map(str::to_string))
            .collect()
    }

    /// Prompt texts received, in order.
    pub fn prompts(&self) -> Vec<String> {
        self.state
            .received
            .lock()
            .iter()
            .filter(|(_, v)| v["action"] == "stream_data")
            .filter_map(|(_, v)| v["data"].as_str().map(str::to_string))
            .collect()
    }

    /// Raw recorded messages.
    pub fn received(&self) -> Vec<Value> {
        self.state
            .received
            .lock()
            .iter()
            .map(|(_, v)| v.clone())
            .collect()
    }

    pub fn count_action(&self, action: &str) -> usize {
        self.actions().iter().filter(|a| *a == action).count()
    }

    fn respond(&self, id: usize, frames: Vec<Frame>) {
        let current = self.state.current.lock();
        if let Some(live) = current.as_ref().filter(|live| live.id == id) {
            for frame in frames {
                let _ = live.tx.send(frame);
            }
        }
    }
}

#[async_trait]
impl Connector for MockBackend {
    async fn connect(&self) -> ChannelResult<ChannelHalves> {
        if self.state.refuse.load(Ordering::SeqCst) {
            return Err(ChannelError::Transport("connection refused".to_string()));
        }

        let id = self.state.connections.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        self.state.closed_flags.lock().push(closed.clone());
        *self.state.current.lock() = Some(LiveConnection {
            id,
            tx,
            closed: closed.clone(),
        });

        Ok((
            Box::new(MockSink {
                backend: self.clone(),
                id,
                closed,
            }),
            Box::new(MockStream { rx }),
        ))
    }

    fn endpoint(&self) -> String {
        "memory://backend".to_string()
    }
}

struct MockSink {
    backend: MockBackend,
    id: usize,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl ChannelSink for MockSink {
    async fn send(&mut self, frame: Frame) -> ChannelResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        let Frame::Text(text) = frame else {
            return Ok(());
        };

        let message: Value = serde_json::from_str(&text)
            .map_err(|e| ChannelError::Transport(format!("bad client frame: {e}")))?;
        let action = message["action"].as_str().unwrap_or_default().to_string();

        if action == "stream_data"
            && let Some(error) = self.backend.state.fail_next_prompt.lock().take()
        {
            if error == ChannelError::Closed {
                self.closed.store(true, Ordering::SeqCst);
            }
            return Err(error);
        }

        self.backend
            .state
            .received
            .lock()
            .push((self.id, message));

        match action.as_str() {
            "start_session" if !self.backend.state.mute_acks.load(Ordering::SeqCst) => {
                self.backend.respond(self.id, vec![session_started()]);
            }
            "stream_data" => {
                let frames = self
                    .backend
                    .state
                    .scripts
                    .lock()
                    .pop_front()
                    .unwrap_or_else(|| vec![crate::common::text("ok"), turn_end()]);
                self.backend.respond(self.id, frames);
            }
            _ => {}
        }
        Ok(())
    }

    async fn close(&mut self) -> ChannelResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        let mut current = self.backend.state.current.lock();
        if current.as_ref().is_some_and(|live| live.id == self.id) {
            *current = None;
        }
        Ok(())
    }
}

struct MockStream {
    rx: mpsc::UnboundedReceiver<Frame>,
}

#[async_trait]
impl ChannelStream for MockStream {
    async fn next_frame(&mut self) -> Option<ChannelResult<Frame>> {
        self.rx.recv().await.map(Ok)
    }
}

// =============================================================================
// Recording audio device
// =============================================================================

/// Audio device that records every frame written to it.
#[derive(Default)]
pub struct RecordingDevice {
    frames: Mutex<Vec<Bytes>>,
    reopens: AtomicUsize,
    closed: AtomicBool,
}

impl RecordingDevice {
    pub fn frames(&self) -> Vec<Bytes> {
        self.frames.lock().clone()
    }

    pub fn reopens(&self) -> usize {
        self.reopens.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Poll until at least `count` frames were written.
    pub async fn wait_for_frames(&self, count: usize) {
        for _ in 0..400 {
            if self.frames.lock().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {count} frames, got {:?}", self.frames());
    }
}

impl AudioDevice for RecordingDevice {
    fn write(&self, frame: Bytes) -> AudioResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AudioError::DeviceUnavailable);
        }
        self.frames.lock().push(frame);
        Ok(())
    }

    fn reopen(&self) -> AudioResult<()> {
        self.reopens.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
