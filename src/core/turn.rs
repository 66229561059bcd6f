//! Conversation turns and the single consumer that answers them.
//!
//! Chat messages and room arrivals are queued as [`Turn`]s. The
//! [`TurnProcessor`] is the only reader of that queue and handles one turn at
//! a time, in arrival order:
//!
//! 1. Turns older than the max delay are dropped without contacting the
//!    back-end.
//! 2. The audio sink is reset so nothing from the previous turn can play.
//! 3. The prompt is submitted and the reply collected, reconnecting once if
//!    the channel turns out to be closed.

use std::fmt;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::core::audio::AudioSink;
use crate::core::session::SessionManager;

/// Reply returned when the back-end cannot be reached after one retry.
pub const BACKEND_UNREACHABLE: &str = "(cannot reach back-end)";

/// Reply returned when sending fails for a non-retryable reason.
pub const SEND_FAILED: &str = "(send failed)";

/// Default age beyond which a queued turn is dropped.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Default idle timeout while collecting a reply.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(15);

/// First attempt plus one retry after a reconnect.
const MAX_SEND_ATTEMPTS: usize = 2;

/// Where a turn came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnSource {
    /// A chat message
    Chat,
    /// Someone entered the room
    Arrival,
}

impl fmt::Display for TurnSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TurnSource::Chat => write!(f, "chat"),
            TurnSource::Arrival => write!(f, "arrival"),
        }
    }
}

/// One queued unit of conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub source: TurnSource,
    pub speaker: String,
    /// Message text; empty for arrivals
    pub content: String,
    pub enqueued_at: Instant,
}

impl Turn {
    /// A chat message stamped now.
    pub fn chat(speaker: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            source: TurnSource::Chat,
            speaker: speaker.into(),
            content: content.into(),
            enqueued_at: Instant::now(),
        }
    }

    /// An arrival stamped now.
    pub fn arrival(speaker: impl Into<String>) -> Self {
        Self {
            source: TurnSource::Arrival,
            speaker: speaker.into(),
            content: String::new(),
            enqueued_at: Instant::now(),
        }
    }

    /// Time spent in the queue so far.
    pub fn age(&self) -> Duration {
        self.enqueued_at.elapsed()
    }

    /// Prompt text sent to the back-end.
    pub fn prompt(&self) -> String {
        match self.source {
            TurnSource::Chat => format!("{}: {}", self.speaker, self.content),
            TurnSource::Arrival => format!("{} entered", self.speaker),
        }
    }
}

/// Timing knobs for the turn processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnConfig {
    /// Turns older than this are dropped
    pub max_delay: Duration,
    /// Idle timeout for reply collection
    pub reply_timeout: Duration,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            max_delay: DEFAULT_MAX_DELAY,
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
        }
    }
}

/// What happened to one dequeued turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// Dropped for exceeding the max delay; never sent
    Stale { speaker: String, age: Duration },
    /// Submitted; `reply` may be one of the sentinel strings
    Answered { prompt: String, reply: String },
}

/// Single consumer of the turn queue.
pub struct TurnProcessor {
    session: SessionManager,
    audio: AudioSink,
    queue: mpsc::UnboundedReceiver<Turn>,
    config: TurnConfig,
    outcomes: Option<mpsc::UnboundedSender<TurnOutcome>>,
}

impl TurnProcessor {
    pub fn new(
        session: SessionManager,
        audio: AudioSink,
        queue: mpsc::UnboundedReceiver<Turn>,
        config: TurnConfig,
    ) -> Self {
        Self {
            session,
            audio,
            queue,
            config,
            outcomes: None,
        }
    }

    /// Report every turn outcome on `tx`.
    pub fn with_outcomes(mut self, tx: mpsc::UnboundedSender<TurnOutcome>) -> Self {
        self.outcomes = Some(tx);
        self
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut SessionManager {
        &mut self.session
    }

    /// Consume the queue until `shutdown` fires or every producer is gone,
    /// then close the session and stop audio.
    pub async fn run(mut self, shutdown: CancellationToken) {
        tracing::info!("Turn processor started");

        loop {
            let turn = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                turn = self.queue.recv() => match turn {
                    Some(turn) => turn,
                    None => {
                        tracing::info!("Turn queue closed");
                        break;
                    }
                },
            };

            let outcome = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                outcome = self.handle_turn(turn) => outcome,
            };

            if let Some(tx) = &self.outcomes {
                let _ = tx.send(outcome);
            }
        }

        self.shutdown().await;
    }

    /// Process one dequeued turn.
    pub async fn handle_turn(&mut self, turn: Turn) -> TurnOutcome {
        let age = turn.age();
        if age > self.config.max_delay {
            tracing::warn!(
                speaker = %turn.speaker,
                source = %turn.source,
                ?age,
                "Dropping stale turn"
            );
            return TurnOutcome::Stale {
                speaker: turn.speaker,
                age,
            };
        }

        // Must complete before the prompt goes out
        self.audio.reset().await;

        let prompt = turn.prompt();
        tracing::info!(speaker = %turn.speaker, source = %turn.source, "Processing turn");
        let reply = self.submit(&prompt).await;
        tracing::info!(speaker = %turn.speaker, %reply, "Turn answered");

        TurnOutcome::Answered { prompt, reply }
    }

    /// Send `prompt` and collect the reply.
    ///
    /// Connects first if needed. A closed channel triggers one disconnect and
    /// retry; if that fails too, [`BACKEND_UNREACHABLE`] is returned. Other
    /// send errors return [`SEND_FAILED`].
    pub async fn submit(&mut self, prompt: &str) -> String {
        let replies = self.session.replies().clone();

        for attempt in 0..MAX_SEND_ATTEMPTS {
            if !self.session.is_connected()
                && let Err(e) = self.session.connect().await
            {
                tracing::warn!(attempt, error = %e, "Connect before send failed");
            }

            let turn = replies.begin_turn();
            match self.session.send_prompt(prompt).await {
                Ok(()) => {
                    tracing::debug!(attempt, turn, "Prompt sent");
                    return replies.collect(turn, self.config.reply_timeout).await;
                }
                Err(e) if e.is_retryable() => {
                    tracing::warn!(attempt, error = %e, "Back-end channel unavailable");
                    self.session.disconnect().await;
                }
                Err(e) => {
                    tracing::error!(attempt, error = %e, "Send failed");
                    return SEND_FAILED.to_string();
                }
            }
        }

        BACKEND_UNREACHABLE.to_string()
    }

    /// Close the session and stop audio playback.
    pub async fn shutdown(&mut self) {
        self.session.disconnect().await;
        self.audio.stop().await;
        tracing::info!("Turn processor stopped");
    }
}
