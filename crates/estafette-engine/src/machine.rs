//! Send step sequencer.
//!
//! A [`SendMachine`] drives the network-bound steps of one outgoing media
//! message: each step runs at most once, the sequence can be restarted with
//! already-completed steps skipped, and a sticky abort turns every further
//! step into a no-op. The machine does not retry by itself; retry re-runs
//! the whole sequence against the same machine.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use estafette_shared::types::ConversationScope;
use estafette_store::Message;

use crate::error::Result;

/// Identity of a per-message machine or cancellation handle:
/// conversation scope plus message uid.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MachineKey {
    pub scope: ConversationScope,
    pub uid: String,
}

impl MachineKey {
    pub fn for_message(message: &Message) -> Self {
        Self {
            scope: message.conversation.scope(),
            uid: message.uid.clone(),
        }
    }
}

/// Per-message, abortable, ordered continuation runner.
#[derive(Debug, Default)]
pub struct SendMachine {
    next_step: usize,
    current_step: usize,
    aborted: bool,
}

impl SendMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restart the sequence. Completed steps are skipped on the next run,
    /// not executed again.
    pub fn reset(&mut self) -> &mut Self {
        self.current_step = 0;
        self
    }

    /// Sticky: once aborted, every later `next` call is a no-op.
    pub fn abort(&mut self) -> &mut Self {
        tracing::debug!("send machine aborted");
        self.aborted = true;
        self
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    /// Run the next step if it has not completed yet.
    ///
    /// A step that returns an error does not count as completed; the
    /// sequence stops advancing and a later restart resumes exactly there.
    pub fn next<F>(&mut self, step: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        if self.aborted {
            tracing::debug!("ignore step, aborted");
            return Ok(());
        }

        let step_index = self.current_step;
        self.current_step += 1;

        if self.next_step == step_index {
            step()?;
            self.next_step += 1;
        }
        Ok(())
    }
}

/// Registry holding at most one live machine per message identity.
#[derive(Default)]
pub struct SendMachineRegistry {
    inner: Mutex<HashMap<MachineKey, Arc<Mutex<SendMachine>>>>,
}

impl SendMachineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the machine for a message, creating it lazily on first use.
    pub fn get_or_create(&self, key: &MachineKey) -> Arc<Mutex<SendMachine>> {
        self.lock()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(SendMachine::new())))
            .clone()
    }

    pub fn get(&self, key: &MachineKey) -> Option<Arc<Mutex<SendMachine>>> {
        self.lock().get(key).cloned()
    }

    /// Abort and drop the machine for a message, if any.
    pub fn remove(&self, key: &MachineKey) {
        if let Some(machine) = self.lock().remove(key) {
            tracing::debug!(uid = %key.uid, "remove send machine");
            machine
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .abort();
        }
    }

    /// Drop the machine without aborting it. Used after a successful run.
    pub fn discard(&self, key: &MachineKey) {
        self.lock().remove(key);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<MachineKey, Arc<Mutex<SendMachine>>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;

    #[test]
    fn steps_run_in_order_exactly_once() {
        let mut machine = SendMachine::new();
        let mut log = Vec::new();

        machine.next(|| Ok(log.push("a"))).unwrap();
        machine.next(|| Ok(log.push("b"))).unwrap();
        machine.next(|| Ok(log.push("c"))).unwrap();

        assert_eq!(log, vec!["a", "b", "c"]);
    }

    #[test]
    fn second_full_run_is_a_no_op() {
        let mut machine = SendMachine::new();
        let mut count = 0;

        for _ in 0..2 {
            machine.reset();
            machine.next(|| Ok(count += 1)).unwrap();
            machine.next(|| Ok(count += 1)).unwrap();
            machine.next(|| Ok(count += 1)).unwrap();
        }

        // a, b, c each exactly once in total
        assert_eq!(count, 3);
    }

    #[test]
    fn abort_before_any_step_runs_nothing() {
        let mut machine = SendMachine::new();
        machine.abort();

        let mut ran = false;
        machine.next(|| Ok(ran = true)).unwrap();
        assert!(!ran);
        assert!(machine.is_aborted());
    }

    #[test]
    fn failed_step_is_retried_on_restart_and_done_steps_skipped() {
        let mut machine = SendMachine::new();
        let mut a_runs = 0;
        let mut b_runs = 0;

        machine.next(|| Ok(a_runs += 1)).unwrap();
        let failed = machine.next(|| -> crate::error::Result<()> {
            b_runs += 1;
            Err(EngineError::Transport("boom".into()))
        });
        assert!(failed.is_err());

        machine.reset();
        machine.next(|| Ok(a_runs += 1)).unwrap();
        machine.next(|| Ok(b_runs += 1)).unwrap();

        assert_eq!(a_runs, 1, "completed step must not re-run");
        assert_eq!(b_runs, 2, "failed step resumes");
    }

    #[test]
    fn registry_returns_same_machine_per_key() {
        let registry = SendMachineRegistry::new();
        let key = MachineKey {
            scope: ConversationScope::Contact,
            uid: "u1".into(),
        };

        let a = registry.get_or_create(&key);
        let b = registry.get_or_create(&key);
        assert!(Arc::ptr_eq(&a, &b));

        registry.remove(&key);
        assert!(registry.get(&key).is_none());
        assert!(a.lock().unwrap().is_aborted());
    }
}
