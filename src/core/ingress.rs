//! Live-chat event intake.
//!
//! Producers hand [`ChatEvent`]s to an [`EventIngress`], which filters them,
//! stamps them with the enqueue time and appends them to the turn queue read
//! by the turn processor. Chat messages and arrivals share that one queue, so
//! they are answered in the order they were accepted.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};
use tokio::sync::mpsc;

use crate::core::turn::Turn;

/// Speaker used for arrivals that carry no name.
pub const UNKNOWN_SPEAKER: &str = "unknown user";

/// Interaction code for "entered the room".
pub const INTERACTION_ENTER: u32 = 1;

/// Default keywords marking song requests, which are not answered.
pub fn default_song_keywords() -> Vec<String> {
    vec!["点歌".to_string()]
}

/// An event from the live-chat platform.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    /// A chat message
    #[serde(rename = "chat")]
    Message { speaker: String, text: String },

    /// A room interaction; code 1 means the user entered
    Interaction {
        #[serde(default)]
        speaker: Option<String>,
        #[serde(default)]
        code: u32,
    },
}

/// Result of offering one event to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngressOutcome {
    /// Queued as a turn
    Enqueued,
    /// Chat message matched a filtered keyword
    Filtered,
    /// Interaction type that does not produce a turn
    Ignored,
    /// The turn processor is gone
    QueueClosed,
}

/// Producer side of the turn queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct EventIngress {
    tx: mpsc::UnboundedSender<Turn>,
    keywords: Arc<[String]>,
}

impl EventIngress {
    /// Create the ingress and the queue receiver for the turn processor.
    pub fn new(keywords: Vec<String>) -> (Self, mpsc::UnboundedReceiver<Turn>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let ingress = Self {
            tx,
            keywords: keywords.into(),
        };
        (ingress, rx)
    }

    /// Filter, timestamp and enqueue one event.
    pub fn push(&self, event: ChatEvent) -> IngressOutcome {
        let turn = match event {
            ChatEvent::Message { speaker, text } => {
                if self.is_filtered(&text) {
                    tracing::info!(%speaker, %text, "Filtered song request");
                    return IngressOutcome::Filtered;
                }
                Turn::chat(speaker, text)
            }
            ChatEvent::Interaction { speaker, code } => {
                if code != INTERACTION_ENTER {
                    tracing::trace!(code, "Ignoring interaction");
                    return IngressOutcome::Ignored;
                }
                let speaker = speaker
                    .filter(|name| !name.is_empty())
                    .unwrap_or_else(|| UNKNOWN_SPEAKER.to_string());
                tracing::info!(%speaker, "User entered the room");
                Turn::arrival(speaker)
            }
        };

        match self.tx.send(turn) {
            Ok(()) => IngressOutcome::Enqueued,
            Err(_) => {
                tracing::warn!("Turn queue closed, event dropped");
                IngressOutcome::QueueClosed
            }
        }
    }

    /// Drain `source` into the queue until it ends or the queue closes.
    /// Returns the number of events enqueued.
    pub async fn forward<S>(&self, source: &mut S) -> std::io::Result<usize>
    where
        S: EventSource + ?Sized,
    {
        let mut enqueued = 0;
        while let Some(event) = source.next_event().await? {
            match self.push(event) {
                IngressOutcome::Enqueued => enqueued += 1,
                IngressOutcome::QueueClosed => break,
                IngressOutcome::Filtered | IngressOutcome::Ignored => {}
            }
        }
        Ok(enqueued)
    }

    fn is_filtered(&self, text: &str) -> bool {
        self.keywords
            .iter()
            .any(|keyword| !keyword.is_empty() && text.contains(keyword.as_str()))
    }
}

/// A stream of live-chat events.
#[async_trait]
pub trait EventSource: Send {
    /// Next event, or `None` when the source is exhausted.
    async fn next_event(&mut self) -> std::io::Result<Option<ChatEvent>>;
}

/// Reads one JSON event per line.
///
/// ```text
/// {"type":"chat","speaker":"alice","text":"hello"}
/// {"type":"interaction","speaker":"bob","code":1}
/// ```
///
/// Blank lines are skipped; malformed lines are logged and skipped.
pub struct JsonLinesSource<R> {
    lines: Lines<R>,
}

impl<R: AsyncBufRead + Unpin> JsonLinesSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
        }
    }
}

impl JsonLinesSource<tokio::io::BufReader<tokio::io::Stdin>> {
    /// Events from standard input.
    pub fn stdin() -> Self {
        Self::new(tokio::io::BufReader::new(tokio::io::stdin()))
    }
}

#[async_trait]
impl<R> EventSource for JsonLinesSource<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    async fn next_event(&mut self) -> std::io::Result<Option<ChatEvent>> {
        while let Some(line) = self.lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<ChatEvent>(line) {
                Ok(event) => return Ok(Some(event)),
                Err(e) => tracing::warn!(error = %e, %line, "Skipping malformed event line"),
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::turn::TurnSource;

    fn message(speaker: &str, text: &str) -> ChatEvent {
        ChatEvent::Message {
            speaker: speaker.to_string(),
            text: text.to_string(),
        }
    }

    #[tokio::test]
    async fn test_chat_message_is_enqueued() {
        let (ingress, mut rx) = EventIngress::new(default_song_keywords());
        assert_eq!(
            ingress.push(message("alice", "hello")),
            IngressOutcome::Enqueued
        );

        let turn = rx.recv().await.unwrap();
        assert_eq!(turn.source, TurnSource::Chat);
        assert_eq!(turn.prompt(), "alice: hello");
    }

    #[tokio::test]
    async fn test_song_request_is_filtered() {
        let (ingress, mut rx) = EventIngress::new(default_song_keywords());
        assert_eq!(
            ingress.push(message("carol", "我要点歌 晴天")),
            IngressOutcome::Filtered
        );
        drop(ingress);
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn test_empty_keyword_filters_nothing() {
        let (ingress, _rx) = EventIngress::new(vec![String::new()]);
        assert_eq!(ingress.push(message("a", "anything")), IngressOutcome::Enqueued);
    }

    #[tokio::test]
    async fn test_arrival_defaults_speaker() {
        let (ingress, mut rx) = EventIngress::new(vec![]);
        let outcome = ingress.push(ChatEvent::Interaction {
            speaker: None,
            code: INTERACTION_ENTER,
        });
        assert_eq!(outcome, IngressOutcome::Enqueued);

        let turn = rx.recv().await.unwrap();
        assert_eq!(turn.source, TurnSource::Arrival);
        assert_eq!(turn.prompt(), "unknown user entered");
    }

    #[test]
    fn test_other_interactions_ignored() {
        let (ingress, _rx) = EventIngress::new(vec![]);
        let outcome = ingress.push(ChatEvent::Interaction {
            speaker: Some("dave".into()),
            code: 2,
        });
        assert_eq!(outcome, IngressOutcome::Ignored);
    }

    #[test]
    fn test_closed_queue_reported() {
        let (ingress, rx) = EventIngress::new(vec![]);
        drop(rx);
        assert_eq!(ingress.push(message("a", "b")), IngressOutcome::QueueClosed);
    }

    #[tokio::test]
    async fn test_interleaved_order_is_preserved() {
        let (ingress, mut rx) = EventIngress::new(vec![]);
        ingress.push(message("a", "one"));
        ingress.push(ChatEvent::Interaction {
            speaker: Some("b".into()),
            code: 1,
        });
        ingress.push(message("c", "two"));
        drop(ingress);

        let mut prompts = Vec::new();
        while let Some(turn) = rx.recv().await {
            prompts.push(turn.prompt());
        }
        assert_eq!(prompts, vec!["a: one", "b entered", "c: two"]);
    }

    #[tokio::test]
    async fn test_json_lines_source() {
        let input = concat!(
            "{\"type\":\"chat\",\"speaker\":\"alice\",\"text\":\"hi\"}\n",
            "\n",
            "not json\n",
            "{\"type\":\"interaction\",\"speaker\":\"bob\",\"code\":1}\n",
            "{\"type\":\"interaction\",\"code\":7}\n",
        );
        let mut source = JsonLinesSource::new(input.as_bytes());

        assert_eq!(
            source.next_event().await.unwrap(),
            Some(message("alice", "hi"))
        );
        assert_eq!(
            source.next_event().await.unwrap(),
            Some(ChatEvent::Interaction {
                speaker: Some("bob".into()),
                code: 1
            })
        );
        assert_eq!(
            source.next_event().await.unwrap(),
            Some(ChatEvent::Interaction {
                speaker: None,
                code: 7
            })
        );
        assert_eq!(source.next_event().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_forward_counts_enqueued() {
        let input = concat!(
            "{\"type\":\"chat\",\"speaker\":\"a\",\"text\":\"点歌 x\"}\n",
            "{\"type\":\"chat\",\"speaker\":\"b\",\"text\":\"hello\"}\n",
            "{\"type\":\"interaction\",\"speaker\":\"c\",\"code\":1}\n",
        );
        let (ingress, mut rx) = EventIngress::new(default_song_keywords());
        let mut source = JsonLinesSource::new(input.as_bytes());

        assert_eq!(ingress.forward(&mut source).await.unwrap(), 2);
        assert_eq!(rx.recv().await.unwrap().prompt(), "b: hello");
        assert_eq!(rx.recv().await.unwrap().prompt(), "c entered");
    }
}
