//! Engine event bus.
//!
//! Listeners subscribe through a broadcast channel scoped to the engine's
//! lifetime. Events are dispatched synchronously on whatever thread fires
//! them; subscribers marshal to their own thread as needed.

use tokio::sync::broadcast;

use estafette_shared::types::ConversationRef;
use estafette_store::Message;

/// Everything the engine tells the outside world about messages.
#[derive(Debug, Clone)]
pub enum MessageEvent {
    /// A new message row exists (outgoing queued or incoming accepted).
    Created(Message),
    /// A state-relevant field of an existing message changed.
    Modified(Message),
    /// A message row was removed entirely (cancelled sends).
    Removed {
        conversation: ConversationRef,
        uid: String,
    },
    /// A message was deleted for all receivers; its row survives as a
    /// tombstone.
    DeletedForAll(Message),
    /// The text of a message was edited.
    Edited(Message),
    /// Upload/download progress for a message, in percent.
    ProgressChanged { uid: String, progress: u8 },
}

/// Publish/subscribe channel for [`MessageEvent`]s.
pub struct EventBus {
    tx: broadcast::Sender<MessageEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MessageEvent> {
        self.tx.subscribe()
    }

    /// Fire an event. Lagging or absent subscribers never block the
    /// pipeline.
    pub(crate) fn emit(&self, event: MessageEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("no event subscribers");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_without_subscribers_is_fine() {
        let bus = EventBus::default();
        bus.emit(MessageEvent::ProgressChanged {
            uid: "u".into(),
            progress: 50,
        });
    }

    #[test]
    fn subscriber_receives_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.emit(MessageEvent::ProgressChanged {
            uid: "u".into(),
            progress: 10,
        });

        match rx.try_recv().unwrap() {
            MessageEvent::ProgressChanged { uid, progress } => {
                assert_eq!(uid, "u");
                assert_eq!(progress, 10);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
