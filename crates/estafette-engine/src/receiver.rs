//! Receiver abstraction for outgoing traffic.
//!
//! A receiver represents one destination that can accept wire envelopes: a
//! contact, a group, or a distribution list that fans out to per-member
//! receivers. The engine talks only to this trait; the wire protocol behind
//! it is the embedder's concern.

use std::sync::Arc;

use estafette_shared::types::{ConversationRef, ReactionSupport};
use estafette_store::{BallotRef, FileInfo, LocationInfo, Message};

use crate::error::Result;

/// Receipt class carried in a delivery-receipt envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryReceiptKind {
    Received,
    Read,
    /// Legacy thumbs-up acknowledge.
    Acknowledge,
    /// Legacy thumbs-down decline.
    Decline,
}

/// One destination for outgoing envelopes.
///
/// Envelope-sending methods return the wire message id the transport
/// assigned; that id is what delivery receipts later refer to.
pub trait MessageReceiver: Send + Sync {
    fn conversation(&self) -> ConversationRef;

    fn display_name(&self) -> String;

    /// Whether media payloads are actually transferred to this receiver.
    /// Gateway-style receivers accept the envelope but no blob data.
    fn send_media_data(&self) -> bool {
        true
    }

    /// Whether a failed send to this receiver should be offered for manual
    /// resend instead of being dropped.
    fn offer_retry(&self) -> bool {
        true
    }

    fn reaction_support(&self) -> ReactionSupport {
        ReactionSupport::Full
    }

    /// Receivers a distribution list expands into. `None` for receivers
    /// that are themselves a single destination.
    fn members(&self) -> Option<Vec<Arc<dyn MessageReceiver>>> {
        None
    }

    /// Whether this receiver opted out of delivery receipts.
    fn no_delivery_receipts(&self) -> bool {
        false
    }

    fn send_text(&self, message: &Message, text: &str) -> Result<String>;

    fn send_location(&self, message: &Message, location: &LocationInfo) -> Result<String>;

    fn send_ballot(&self, message: &Message, ballot: &BallotRef) -> Result<String>;

    /// Send the file descriptor envelope. Both blobs must be uploaded
    /// before this is called.
    fn send_file_envelope(&self, message: &Message, info: &FileInfo) -> Result<String>;

    /// Send an emoji reaction envelope. Only called for receivers with
    /// full reaction support; partial receivers get the legacy
    /// acknowledge/decline delivery receipts instead.
    fn send_reaction_envelope(&self, api_message_id: &str, emoji: &str) -> Result<()>;

    fn send_edit_envelope(&self, api_message_id: &str, new_text: &str) -> Result<()>;

    fn send_delete_envelope(&self, api_message_id: &str) -> Result<()>;

    fn send_delivery_receipt(
        &self,
        kind: DeliveryReceiptKind,
        api_message_ids: &[String],
    ) -> Result<()>;
}

/// Expand a receiver into the concrete destinations a send fans out to.
///
/// Distribution lists become their member receivers; everything else is a
/// single destination. An empty list collapses to the list itself so the
/// caller still gets a row to fail on.
pub fn resolve_receivers(receiver: Arc<dyn MessageReceiver>) -> Vec<Arc<dyn MessageReceiver>> {
    match receiver.members() {
        Some(members) if !members.is_empty() => {
            tracing::debug!(
                receiver = %receiver.display_name(),
                count = members.len(),
                "fanning out to list members"
            );
            members
        }
        _ => vec![receiver],
    }
}
