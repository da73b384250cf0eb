pub mod discord;

use anyhow::Result;
use tokio::sync::mpsc::{self, error::TryRecvError};

/// A message posted on the chat platform
#[derive(Debug, Clone, PartialEq)]
pub struct PostedMessage {
    pub author_name: String,
    pub author_is_bot: bool,
    pub author_id: u64,
    pub channel_id: u64,
    /// The raw message text
    pub content: String,
}

/// Anything the chat platform delivers. Only posted messages are interpreted;
/// every other kind is carried through by name and ignored.
#[derive(Debug, Clone, PartialEq)]
pub enum PlatformEvent {
    MessagePosted(PostedMessage),
    Other { kind: String },
}

/// Producer half of the inbound queue, handed to the platform client.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<PlatformEvent>,
}

impl EventSender {
    /// Never blocks. Returns false once the consumer is gone.
    pub fn push(&self, event: PlatformEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// Consumer half of the inbound queue, owned by the tick thread.
#[derive(Debug)]
pub struct InboundEventQueue {
    rx: mpsc::UnboundedReceiver<PlatformEvent>,
}

impl InboundEventQueue {
    pub fn new() -> (EventSender, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (EventSender { tx }, Self { rx })
    }

    /// Pop everything currently queued, oldest first.
    pub fn drain_all(&mut self) -> Vec<PlatformEvent> {
        let mut events = Vec::new();
        loop {
            match self.rx.try_recv() {
                Ok(event) => events.push(event),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        events
    }
}

/// Outbound side of the chat platform. Calls block until the platform answers.
pub trait ChatSink: Send {
    fn post(&self, channel_id: u64, text: &str) -> Result<()>;

    /// Give a member a role in the configured guild.
    fn add_role(&self, member_id: u64, role_id: u64) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn other(kind: &str) -> PlatformEvent {
        PlatformEvent::Other {
            kind: kind.to_string(),
        }
    }

    #[test]
    fn test_drain_all_is_fifo() {
        let (sender, mut queue) = InboundEventQueue::new();
        sender.push(other("a"));
        sender.push(other("b"));
        sender.push(other("c"));

        assert_eq!(queue.drain_all(), vec![other("a"), other("b"), other("c")]);
        assert!(queue.drain_all().is_empty());
    }

    #[test]
    fn test_multiple_producers_from_threads() {
        let (sender, mut queue) = InboundEventQueue::new();
        let handles: Vec<_> = (0..4)
            .map(|n| {
                let sender = sender.clone();
                std::thread::spawn(move || {
                    for i in 0..25 {
                        sender.push(other(&format!("{n}-{i}")));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(queue.drain_all().len(), 100);
    }

    #[test]
    fn test_push_after_consumer_dropped() {
        let (sender, queue) = InboundEventQueue::new();
        drop(queue);
        assert!(!sender.push(other("late")));
    }

    #[test]
    fn test_drain_after_producers_dropped() {
        let (sender, mut queue) = InboundEventQueue::new();
        sender.push(other("last"));
        drop(sender);
        assert_eq!(queue.drain_all(), vec![other("last")]);
        assert!(queue.drain_all().is_empty());
    }
}
