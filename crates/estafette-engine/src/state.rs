//! Message lifecycle transitions and reaction handling.
//!
//! The transition table is deliberately strict: delivery progress only
//! moves forward, failure states are reachable from almost anywhere, and
//! the legacy acknowledge/decline pair bypasses the table entirely because
//! it is reaction data, not delivery progress.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use estafette_shared::constants::{REACTION_ACKNOWLEDGE, REACTION_DECLINE};
use estafette_shared::types::{MessageState, ReactionSupport};
use estafette_store::Message;

use crate::error::{Result, ValidationError};
use crate::events::MessageEvent;
use crate::receiver::{DeliveryReceiptKind, MessageReceiver};
use crate::service::MessageService;

/// Whether a message in `from` may transition to `to`.
///
/// Self-transitions are always rejected so callers can treat a `true`
/// return as "something changed".
pub fn can_change_to_state(from: MessageState, to: MessageState) -> bool {
    use MessageState::*;

    if from == to {
        return false;
    }
    match to {
        Pending => matches!(from, SendFailed),
        Transcoding => matches!(from, Pending | SendFailed),
        Uploading => matches!(from, Pending | Transcoding | SendFailed),
        Sending => matches!(
            from,
            Pending | Transcoding | Uploading | SendFailed | FsKeyMismatch
        ),
        Sent => matches!(
            from,
            Pending | Transcoding | Uploading | Sending | SendFailed | FsKeyMismatch
        ),
        Delivered => matches!(from, Pending | Uploading | Sending | Sent | SendFailed),
        Read => matches!(
            from,
            Pending | Uploading | Sending | Sent | Delivered | SendFailed
        ),
        // Failure is reachable from everywhere except a consumed message.
        SendFailed | FsKeyMismatch => from != Consumed,
        Consumed => matches!(
            from,
            Pending | Transcoding | Uploading | Sending | Sent | Delivered
        ),
        // Reaction-class states; gated separately by the caller.
        UserAck | UserDec => true,
    }
}

/// The delivery state a message falls back to when its reaction-class
/// state is cleared.
pub fn cleared_state(message: &Message) -> MessageState {
    if !message.state.is_reaction() {
        return message.state;
    }
    if message.read_at.is_some() {
        MessageState::Read
    } else if message.delivered_at.is_some() {
        MessageState::Delivered
    } else {
        MessageState::Sent
    }
}

impl MessageService {
    /// Apply a delivery-progress state to an outgoing message.
    ///
    /// Timestamps implied by the target state are stamped at most once,
    /// even when the state itself no longer changes (receipts can arrive
    /// out of order). Returns whether anything was persisted.
    pub fn update_outgoing_message_state(
        &self,
        message: &mut Message,
        new_state: MessageState,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        if message.is_deleted() {
            return Ok(false);
        }
        if !message.outbox {
            return Err(ValidationError::NotOutgoing.into());
        }
        if new_state.is_reaction() {
            return Err(ValidationError::ReactionStateNotAllowed.into());
        }

        let mut changed = false;
        match new_state {
            MessageState::Sent => {
                if message.posted_at.is_none() {
                    message.posted_at = Some(at);
                    changed = true;
                }
            }
            MessageState::Delivered => {
                if message.delivered_at.is_none() {
                    message.delivered_at = Some(at);
                    changed = true;
                } else {
                    tracing::warn!(uid = %message.uid, "delivered timestamp already set");
                }
            }
            MessageState::Read => {
                if message.read_at.is_none() {
                    message.read_at = Some(at);
                    changed = true;
                } else {
                    tracing::warn!(uid = %message.uid, "read timestamp already set");
                }
            }
            _ => {}
        }

        if can_change_to_state(message.state, new_state) {
            tracing::debug!(
                uid = %message.uid,
                from = message.state.as_str(),
                to = new_state.as_str(),
                "message state transition"
            );
            message.state = new_state;
            changed = true;
        } else if message.state != new_state {
            tracing::warn!(
                uid = %message.uid,
                from = message.state.as_str(),
                to = new_state.as_str(),
                "ignoring disallowed state transition"
            );
        }

        if changed {
            message.modified_at = Some(at);
            self.store.update(message)?;
            self.cache.put(message);
            self.events.emit(MessageEvent::Modified(message.clone()));
        }
        Ok(changed)
    }

    /// Apply one emoji reaction from one sender.
    ///
    /// The thumbs-up/down pair is mutually exclusive per sender: applying
    /// one withdraws the other. For compatibility those two also set the
    /// legacy acknowledge/decline state on the message itself.
    pub fn apply_message_reaction(
        &self,
        message: &mut Message,
        sender_identity: &str,
        emoji: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        if message.is_deleted() {
            return Err(ValidationError::MessageDeleted.into());
        }

        let opposite = match emoji {
            REACTION_ACKNOWLEDGE => Some(REACTION_DECLINE),
            REACTION_DECLINE => Some(REACTION_ACKNOWLEDGE),
            _ => None,
        };
        if let Some(opposite) = opposite {
            self.store
                .remove_reaction(message.id, sender_identity, opposite)?;
        }
        self.store
            .upsert_reaction(message.id, sender_identity, emoji, at)?;

        let legacy_state = match emoji {
            REACTION_ACKNOWLEDGE => Some(MessageState::UserAck),
            REACTION_DECLINE => Some(MessageState::UserDec),
            _ => None,
        };
        if let Some(state) = legacy_state {
            if message.state != state {
                message.state = state;
            }
        }
        message.modified_at = Some(at);
        self.store.update(message)?;
        self.cache.put(message);
        self.events.emit(MessageEvent::Modified(message.clone()));
        Ok(())
    }

    /// React to a message on behalf of the local user, in whatever form
    /// the receiver's client understands.
    ///
    /// Full-support receivers get the emoji reaction envelope. Partial
    /// receivers only understand the legacy acknowledge/decline receipts,
    /// so the thumbs pair is downgraded to those and anything else is
    /// rejected. Receivers without reaction support reject everything.
    pub fn send_message_reaction(
        &self,
        message: &mut Message,
        receiver: &Arc<dyn MessageReceiver>,
        my_identity: &str,
        emoji: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        if message.is_deleted() {
            return Err(ValidationError::MessageDeleted.into());
        }
        let api_message_id = message
            .api_message_id
            .clone()
            .ok_or(ValidationError::NeverPosted)?;

        let legacy = match emoji {
            REACTION_ACKNOWLEDGE => Some(DeliveryReceiptKind::Acknowledge),
            REACTION_DECLINE => Some(DeliveryReceiptKind::Decline),
            _ => None,
        };
        match receiver.reaction_support() {
            ReactionSupport::None => {
                return Err(ValidationError::ReactionsNotSupported.into());
            }
            ReactionSupport::Partial => {
                let kind = legacy.ok_or(ValidationError::ReactionsNotSupported)?;
                receiver.send_delivery_receipt(kind, std::slice::from_ref(&api_message_id))?;
            }
            ReactionSupport::Full => {
                receiver.send_reaction_envelope(&api_message_id, emoji)?;
            }
        }

        self.apply_message_reaction(message, my_identity, emoji, at)
    }

    /// Drop a legacy acknowledge/decline state, restoring the delivery
    /// state implied by the message's timestamps. No-op for messages not
    /// in a reaction state.
    pub fn clear_message_state(&self, message: &mut Message, at: DateTime<Utc>) -> Result<bool> {
        if !message.state.is_reaction() {
            return Ok(false);
        }
        message.state = cleared_state(message);
        message.modified_at = Some(at);
        self.store.update(message)?;
        self.cache.put(message);
        self.events.emit(MessageEvent::Modified(message.clone()));
        Ok(true)
    }

    /// Withdraw one sender's reaction. Clears the legacy reaction state
    /// when no acknowledge/decline reaction remains on the message.
    pub fn withdraw_message_reaction(
        &self,
        message: &mut Message,
        sender_identity: &str,
        emoji: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let removed = self
            .store
            .remove_reaction(message.id, sender_identity, emoji)?;
        if !removed {
            return Ok(false);
        }

        if message.state.is_reaction() {
            let still_reacted = self
                .store
                .reactions_for_message(message.id)?
                .iter()
                .any(|r| r.emoji == REACTION_ACKNOWLEDGE || r.emoji == REACTION_DECLINE);
            if !still_reacted {
                message.state = cleared_state(message);
            }
        }
        message.modified_at = Some(at);
        self.store.update(message)?;
        self.cache.put(message);
        self.events.emit(MessageEvent::Modified(message.clone()));
        Ok(true)
    }

    /// Process one incoming delivery receipt covering one or more of our
    /// outgoing messages. Unknown wire ids are skipped, not errors.
    pub fn process_incoming_delivery_receipt(
        &self,
        kind: DeliveryReceiptKind,
        api_message_ids: &[String],
        from_identity: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        for api_message_id in api_message_ids {
            let Some(mut message) = self.store.outgoing_by_api_id(api_message_id)? else {
                tracing::warn!(api_message_id, "receipt for unknown outgoing message");
                continue;
            };

            match kind {
                DeliveryReceiptKind::Received => {
                    self.update_outgoing_message_state(&mut message, MessageState::Delivered, at)?;
                }
                DeliveryReceiptKind::Read => {
                    self.update_outgoing_message_state(&mut message, MessageState::Read, at)?;
                }
                DeliveryReceiptKind::Acknowledge => {
                    self.apply_message_reaction(
                        &mut message,
                        from_identity,
                        REACTION_ACKNOWLEDGE,
                        at,
                    )?;
                }
                DeliveryReceiptKind::Decline => {
                    self.apply_message_reaction(&mut message, from_identity, REACTION_DECLINE, at)?;
                }
            }
        }
        Ok(())
    }
}
