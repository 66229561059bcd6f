//! Reply assembly for the in-flight turn.
//!
//! The receiver loop appends reply items as they arrive; the turn processor
//! collects them into one reply string. Every item is tagged with the turn
//! sequence number that was current when it was appended. A new exchange calls
//! [`ReplyAssembly::begin_turn`] before its prompt goes out, so leftovers from
//! an earlier exchange are recognised by their tag and skipped instead of
//! being drained blindly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;

/// Appended to a reply when no `end` item arrives within the idle timeout.
pub const REPLY_TIMEOUT_MARKER: &str = "(reply timed out)";

/// One piece of an assembled reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyItem {
    /// Reply text chunk
    Text(String),
    /// End of the reply
    End,
}

#[derive(Debug)]
struct TaggedItem {
    turn: u64,
    item: ReplyItem,
}

/// Turn-tagged accumulator shared by the receiver loop and the turn processor.
#[derive(Debug)]
pub struct ReplyAssembly {
    current_turn: AtomicU64,
    tx: mpsc::UnboundedSender<TaggedItem>,
    rx: Mutex<mpsc::UnboundedReceiver<TaggedItem>>,
}

impl Default for ReplyAssembly {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplyAssembly {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            current_turn: AtomicU64::new(0),
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Sequence number of the exchange currently in flight.
    pub fn current_turn(&self) -> u64 {
        self.current_turn.load(Ordering::SeqCst)
    }

    /// Open a new exchange. Items appended from now on carry the returned tag.
    pub fn begin_turn(&self) -> u64 {
        self.current_turn.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Append one item, tagged with the current turn.
    pub fn push(&self, item: ReplyItem) {
        let turn = self.current_turn();
        // The receiver half lives as long as `self`, so this cannot fail.
        let _ = self.tx.send(TaggedItem { turn, item });
    }

    /// Append a text chunk. Empty chunks are ignored.
    pub fn push_text(&self, text: impl Into<String>) {
        let text = text.into();
        if !text.is_empty() {
            self.push(ReplyItem::Text(text));
        }
    }

    /// Append the end-of-reply marker.
    pub fn push_end(&self) {
        self.push(ReplyItem::End);
    }

    /// Collect the reply for `turn`.
    ///
    /// Items tagged with another turn are skipped. A text chunk identical to
    /// the one accepted just before it is dropped. Collection stops at the
    /// first `End` item; if `idle_timeout` passes without an item for `turn`,
    /// the timeout marker is appended and collection stops. Skipped items do
    /// not extend the wait.
    pub async fn collect(&self, turn: u64, idle_timeout: Duration) -> String {
        let mut rx = self.rx.lock().await;
        let mut reply = String::new();
        let mut last_text: Option<String> = None;
        let mut deadline = Instant::now() + idle_timeout;

        loop {
            let received = tokio::time::timeout_at(deadline, rx.recv()).await;
            if matches!(&received, Ok(Some(tagged)) if tagged.turn == turn) {
                deadline = Instant::now() + idle_timeout;
            }
            match received {
                Ok(Some(tagged)) if tagged.turn != turn => {
                    tracing::trace!(
                        item_turn = tagged.turn,
                        turn,
                        "Skipping reply item from another turn"
                    );
                }
                Ok(Some(TaggedItem {
                    item: ReplyItem::Text(text),
                    ..
                })) => {
                    if last_text.as_deref() == Some(text.as_str()) {
                        tracing::trace!("Dropping repeated reply chunk");
                        continue;
                    }
                    reply.push_str(&text);
                    last_text = Some(text);
                }
                Ok(Some(TaggedItem {
                    item: ReplyItem::End,
                    ..
                })) => break,
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(turn, ?idle_timeout, "Reply collection timed out");
                    reply.push_str(REPLY_TIMEOUT_MARKER);
                    break;
                }
            }
        }

        reply
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const IDLE: Duration = Duration::from_secs(15);

    #[tokio::test]
    async fn test_consecutive_duplicates_are_dropped() {
        let replies = ReplyAssembly::new();
        let turn = replies.begin_turn();
        replies.push_text("a");
        replies.push_text("a");
        replies.push_text("b");
        replies.push_end();

        assert_eq!(replies.collect(turn, IDLE).await, "ab");
    }

    #[tokio::test]
    async fn test_non_consecutive_duplicates_are_kept() {
        let replies = ReplyAssembly::new();
        let turn = replies.begin_turn();
        for chunk in ["ha", "!", "ha"] {
            replies.push_text(chunk);
        }
        replies.push_end();

        assert_eq!(replies.collect(turn, IDLE).await, "ha!ha");
    }

    #[tokio::test]
    async fn test_empty_text_is_not_appended() {
        let replies = ReplyAssembly::new();
        let turn = replies.begin_turn();
        replies.push_text("");
        replies.push_text("ok");
        replies.push_end();

        assert_eq!(replies.collect(turn, IDLE).await, "ok");
    }

    #[tokio::test]
    async fn test_items_from_previous_turn_are_skipped() {
        let replies = ReplyAssembly::new();
        let first = replies.begin_turn();
        replies.push_text("late from first");
        replies.push_end();

        let second = replies.begin_turn();
        assert_ne!(first, second);
        replies.push_text("fresh");
        replies.push_end();

        assert_eq!(replies.collect(second, IDLE).await, "fresh");
    }

    #[tokio::test]
    async fn test_first_chunk_after_begin_is_kept() {
        let replies = ReplyAssembly::new();
        let turn = replies.begin_turn();
        // Arrives before the collector starts waiting
        replies.push_text("first");
        tokio::task::yield_now().await;
        replies.push_text(" second");
        replies.push_end();

        assert_eq!(replies.collect(turn, IDLE).await, "first second");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_marker_appended_once() {
        let replies = ReplyAssembly::new();
        let turn = replies.begin_turn();
        replies.push_text("partial");

        let reply = replies.collect(turn, IDLE).await;
        assert_eq!(reply, format!("partial{REPLY_TIMEOUT_MARKER}"));
        assert_eq!(reply.matches(REPLY_TIMEOUT_MARKER).count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_with_no_items() {
        let replies = ReplyAssembly::new();
        let turn = replies.begin_turn();

        let started = tokio::time::Instant::now();
        let reply = replies.collect(turn, IDLE).await;
        assert_eq!(reply, REPLY_TIMEOUT_MARKER);
        assert!(started.elapsed() >= IDLE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_items_from_other_turns_do_not_extend_timeout() {
        let replies = Arc::new(ReplyAssembly::new());
        let turn = replies.begin_turn();
        // Anything pushed from here on belongs to a later exchange
        replies.begin_turn();

        let producer = replies.clone();
        tokio::spawn(async move {
            for _ in 0..4 {
                tokio::time::sleep(Duration::from_secs(10)).await;
                producer.push_text("elsewhere");
            }
        });

        let started = Instant::now();
        let reply = replies.collect(turn, IDLE).await;
        assert_eq!(reply, REPLY_TIMEOUT_MARKER);
        assert_eq!(started.elapsed(), IDLE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_accepted_items_extend_timeout() {
        let replies = Arc::new(ReplyAssembly::new());
        let turn = replies.begin_turn();

        let producer = replies.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            producer.push_text("slow");
            tokio::time::sleep(Duration::from_secs(10)).await;
            producer.push_end();
        });

        assert_eq!(replies.collect(turn, IDLE).await, "slow");
    }

    #[test]
    fn test_begin_turn_is_monotonic() {
        let replies = ReplyAssembly::new();
        assert_eq!(replies.current_turn(), 0);
        assert_eq!(replies.begin_turn(), 1);
        assert_eq!(replies.begin_turn(), 2);
        assert_eq!(replies.current_turn(), 2);
    }
}
