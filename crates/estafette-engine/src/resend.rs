//! Transmit retry and user-initiated resend.
//!
//! Transient transport failures are retried inline with exponential
//! backoff. Once the policy is exhausted the message lands in a failed
//! state and waits for [`resend_message`], which resumes the original
//! send machine so already-finished steps (encryption, blob uploads) are
//! not repeated.
//!
//! [`resend_message`]: MessageService::resend_message

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use estafette_shared::types::MessageState;
use estafette_store::Message;

use crate::error::{Result, ValidationError};
use crate::receiver::MessageReceiver;
use crate::service::MessageService;

/// Inline retry for transient transport failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retrying after the given zero-based attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(1u32 << attempt.min(16))
    }

    /// Run an operation, retrying transport errors only. Validation,
    /// security and cancellation errors surface immediately.
    pub fn run<T>(&self, mut op: impl FnMut() -> Result<T>) -> Result<T> {
        let mut attempt = 0;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transport() && attempt + 1 < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    tracing::debug!(attempt, ?delay, error = %e, "retrying after transport error");
                    if !delay.is_zero() {
                        std::thread::sleep(delay);
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl MessageService {
    /// Resend a message stuck in a failed state.
    ///
    /// Media messages resume their send machine, so blobs that already
    /// reached the server are not uploaded again; only the failed step
    /// onward runs.
    pub fn resend_message(
        &self,
        uid: &str,
        receiver: &Arc<dyn MessageReceiver>,
    ) -> Result<Message> {
        let mut message = self.store.by_uid(uid)?;
        if !message.outbox {
            return Err(ValidationError::NotOutgoing.into());
        }
        if message.is_deleted() {
            return Err(ValidationError::MessageDeleted.into());
        }
        if !message.state.is_resendable() {
            return Err(ValidationError::NotResendable(message.state).into());
        }

        tracing::info!(uid, kind = message.kind.as_str(), "resending message");
        if message.kind.has_data_file() {
            self.resend_media_message(&mut message, receiver)?;
        } else {
            self.update_outgoing_message_state(&mut message, MessageState::Sending, Utc::now())?;
            self.transmit_simple(&mut message, receiver)?;
        }
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::events::MessageEvent;
    use crate::media::MediaItem;
    use crate::testutil::service_with_receiver;

    fn zero_delay() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::ZERO,
        }
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
    }

    #[test]
    fn run_retries_transport_errors_up_to_the_bound() {
        let policy = zero_delay();
        let mut attempts = 0;
        let result: Result<()> = policy.run(|| {
            attempts += 1;
            Err(EngineError::Transport("flaky".into()))
        });
        assert!(result.is_err());
        assert_eq!(attempts, 3);
    }

    #[test]
    fn run_does_not_retry_validation_errors() {
        let policy = zero_delay();
        let mut attempts = 0;
        let result: Result<()> = policy.run(|| {
            attempts += 1;
            Err(ValidationError::EmptyText.into())
        });
        assert!(result.is_err());
        assert_eq!(attempts, 1);
    }

    #[test]
    fn failed_text_message_can_be_resent() {
        let (svc, stub) = service_with_receiver();
        stub.fail_next_sends(usize::MAX);
        let receiver: Arc<dyn MessageReceiver> = stub.clone();
        let mut events = svc.subscribe();

        let _ = svc.send_text(&receiver, "try me");
        let uid = match events.try_recv().unwrap() {
            MessageEvent::Created(m) => m.uid,
            other => panic!("expected created, got {other:?}"),
        };
        assert_eq!(
            svc.store.by_uid(&uid).unwrap().state,
            MessageState::SendFailed
        );

        stub.fail_next_sends(0);
        let message = svc.resend_message(&uid, &receiver).unwrap();
        assert_eq!(message.state, MessageState::Sent);
        assert!(message.api_message_id.is_some());
    }

    #[test]
    fn resend_of_healthy_message_is_rejected() {
        let (svc, stub) = service_with_receiver();
        let receiver: Arc<dyn MessageReceiver> = stub;
        let message = svc.send_text(&receiver, "fine").unwrap();

        let err = svc.resend_message(&message.uid, &receiver).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Validation(ValidationError::NotResendable(MessageState::Sent))
        ));
    }

    #[test]
    fn media_resend_resumes_without_reuploading() {
        let (svc, stub) = service_with_receiver();
        // envelope step fails; encryption and upload already succeeded
        stub.fail_next_sends(usize::MAX);
        let receiver: Arc<dyn MessageReceiver> = stub.clone();

        let mut events = svc.subscribe();
        let item = MediaItem::image("image/jpeg", b"pixels".to_vec());
        let sent = svc.send_media(receiver.clone(), vec![item]).unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].state, MessageState::SendFailed);
        let first_attempt_progress = std::iter::from_fn(|| events.try_recv().ok())
            .filter(|e| matches!(e, MessageEvent::ProgressChanged { .. }))
            .count();
        assert!(first_attempt_progress > 0, "upload ran in the first attempt");
        let blob_id = sent[0].file_info().unwrap().blob_id.unwrap();

        stub.fail_next_sends(0);
        let mut events = svc.subscribe();
        let message = svc.resend_message(&sent[0].uid, &receiver).unwrap();
        assert!(message.saved);
        assert_eq!(message.state, MessageState::Sending);
        assert!(message.api_message_id.is_some());
        assert_eq!(message.file_info().unwrap().blob_id, Some(blob_id));

        // only the envelope and finalize steps ran; no second upload
        let resend_progress = std::iter::from_fn(|| events.try_recv().ok())
            .filter(|e| matches!(e, MessageEvent::ProgressChanged { .. }))
            .count();
        assert_eq!(resend_progress, 0);
        assert_eq!(svc.in_flight(), 0);
    }

    #[test]
    fn media_resend_without_local_payload_fails_cleanly() {
        let (svc, stub) = service_with_receiver();
        stub.fail_next_sends(usize::MAX);
        let receiver: Arc<dyn MessageReceiver> = stub.clone();

        let item = MediaItem::image("image/jpeg", b"pixels".to_vec());
        let sent = svc.send_media(receiver.clone(), vec![item]).unwrap();
        svc.media_repository()
            .remove(&crate::machine::MachineKey::for_message(&sent[0]));

        stub.fail_next_sends(0);
        let err = svc.resend_message(&sent[0].uid, &receiver).unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }
}
