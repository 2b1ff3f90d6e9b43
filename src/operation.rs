//! In-memory operation registry: at most one active operation per target
//! node, process-wide.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use crate::error::{CoordinatorResult, PreconditionError};
use crate::state_machine::InitState;
use crate::NodeId;

/// Cooperative cancellation handle, generalizing the teacher's ad hoc
/// `Arc<AtomicBool>` (`orchestrator.rs`'s `stop_replay`) into a reusable
/// type shared by the copier, snapshot codec, and init manager.
#[derive(Clone, Debug, Default)]
pub struct CancelLatch(Arc<AtomicBool>);

impl CancelLatch {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Which init method produced (or is producing) the current operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitMethod {
    AutomaticSnapshot,
    TwoPhase,
}

/// An in-memory record of a running or just-finished init/reinit/merge
/// operation, keyed by `target_node_id`. Destroyed on terminal state or
/// explicit cancel.
pub struct Operation {
    pub target_node_id: NodeId,
    pub source_node_id: Option<NodeId>,
    pub method: Option<InitMethod>,
    pub worker_count: usize,
    pub started_at: Instant,
    pub cancel: CancelLatch,
    phase: RwLock<InitState>,
    done: AtomicBool,
}

impl Operation {
    pub fn new(
        target_node_id: NodeId,
        source_node_id: Option<NodeId>,
        method: Option<InitMethod>,
        worker_count: usize,
        initial_phase: InitState,
    ) -> Self {
        Self {
            target_node_id,
            source_node_id,
            method,
            worker_count,
            started_at: Instant::now(),
            cancel: CancelLatch::new(),
            phase: RwLock::new(initial_phase),
            done: AtomicBool::new(false),
        }
    }

    pub fn phase(&self) -> InitState {
        *self.phase.read().expect("operation phase lock poisoned")
    }

    pub fn set_phase(&self, phase: InitState) {
        *self.phase.write().expect("operation phase lock poisoned") = phase;
        if phase.is_terminal() {
            self.done.store(true, Ordering::SeqCst);
        }
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }
}

/// Process-wide map from target node id to its active operation. Allows
/// concurrent progress reads and exclusive create/remove.
#[derive(Default)]
pub struct OperationRegistry {
    inner: RwLock<HashMap<NodeId, Arc<Operation>>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new operation for `target`. Fails with
    /// `PreconditionError::AlreadyActive` if one is already registered and
    /// not yet done.
    pub fn start(&self, target: NodeId, operation: Operation) -> CoordinatorResult<Arc<Operation>> {
        let mut guard = self.inner.write().expect("operation registry lock poisoned");
        if let Some(existing) = guard.get(&target) {
            if !existing.is_done() {
                return Err(PreconditionError::AlreadyActive(target.to_string()).into());
            }
        }
        let handle = Arc::new(operation);
        guard.insert(target, handle.clone());
        Ok(handle)
    }

    pub fn get(&self, target: &NodeId) -> Option<Arc<Operation>> {
        self.inner
            .read()
            .expect("operation registry lock poisoned")
            .get(target)
            .cloned()
    }

    /// Idempotent: cancelling a missing or already-done operation is a
    /// no-op success.
    pub fn cancel(&self, target: &NodeId) {
        if let Some(op) = self.get(target) {
            op.cancel.cancel();
        }
    }

    pub fn remove(&self, target: &NodeId) {
        self.inner
            .write()
            .expect("operation registry lock poisoned")
            .remove(target);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_start_for_same_target_is_rejected_while_active() {
        let registry = OperationRegistry::new();
        let target = NodeId::from("node_b");
        registry
            .start(
                target.clone(),
                Operation::new(target.clone(), None, None, 4, InitState::Preparing),
            )
            .unwrap();
        let err = registry
            .start(
                target.clone(),
                Operation::new(target.clone(), None, None, 4, InitState::Preparing),
            )
            .unwrap_err();
        assert!(err.to_string().contains("already in progress"));
    }

    #[test]
    fn start_succeeds_again_once_previous_operation_is_terminal() {
        let registry = OperationRegistry::new();
        let target = NodeId::from("node_b");
        let first = registry
            .start(
                target.clone(),
                Operation::new(target.clone(), None, None, 4, InitState::Preparing),
            )
            .unwrap();
        first.set_phase(InitState::Synchronized);
        assert!(
            registry
                .start(
                    target.clone(),
                    Operation::new(target.clone(), None, None, 4, InitState::Preparing),
                )
                .is_ok()
        );
    }

    #[test]
    fn cancel_on_unknown_target_is_a_no_op() {
        let registry = OperationRegistry::new();
        registry.cancel(&NodeId::from("ghost"));
    }

    #[test]
    fn cancel_latch_observed_across_clones() {
        let latch = CancelLatch::new();
        let clone = latch.clone();
        assert!(!clone.is_cancelled());
        latch.cancel();
        assert!(clone.is_cancelled());
    }
}
