use std::collections::HashMap;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::watch;
use uuid::Uuid;

use crate::cache::Digest;
use crate::operations::operation::{ExecutionStage, Operation, OperationId, Transition};
use crate::operations::watch::OperationWatch;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Operation not found: {0}")]
    NotFound(OperationId),

    #[error("Invalid transition for operation {id}: {from} -> {to}")]
    InvalidTransition {
        id: OperationId,
        from: ExecutionStage,
        to: ExecutionStage,
    },
}

/// Append-only transition history of one operation. The last element is the
/// current state.
type History = Vec<Operation>;

/// Concurrency-safe map from operation id to operation state.
///
/// Each id owns a `watch` channel carrying its transition history. Updates
/// are checked and appended inside the channel's lock, so transitions on one
/// id are atomic and totally ordered while distinct ids only share a map
/// shard for the duration of a lookup.
///
/// Entries live for the lifetime of the process.
#[derive(Debug, Default)]
pub struct OperationRegistry {
    operations: DashMap<OperationId, Arc<watch::Sender<History>>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new QUEUED operation and return its id. The id can be
    /// watched immediately.
    pub fn create(&self, action_digest: Digest) -> OperationId {
        loop {
            let id = Uuid::new_v4();
            if let Entry::Vacant(slot) = self.operations.entry(id) {
                let (tx, _rx) = watch::channel(vec![Operation::new(id, action_digest)]);
                slot.insert(Arc::new(tx));
                tracing::debug!(operation_id = %id, "Operation registered");
                return id;
            }
        }
    }

    fn sender(&self, id: &OperationId) -> Result<Arc<watch::Sender<History>>, RegistryError> {
        self.operations
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or(RegistryError::NotFound(*id))
    }

    /// Current snapshot of an operation.
    pub fn get(&self, id: &OperationId) -> Result<Operation, RegistryError> {
        let sender = self.sender(id)?;
        let current = sender.borrow().last().cloned();
        current.ok_or(RegistryError::NotFound(*id))
    }

    /// Atomically apply `transition` and publish the new snapshot to watchers.
    ///
    /// Fails with `InvalidTransition` when the state machine doesn't allow it
    /// from the current state, which includes every update after a terminal
    /// state.
    pub fn update(
        &self,
        id: &OperationId,
        transition: Transition,
    ) -> Result<Operation, RegistryError> {
        let sender = self.sender(id)?;
        let mut outcome = Err(RegistryError::NotFound(*id));

        sender.send_if_modified(|history| {
            let Some(current) = history.last() else {
                return false;
            };
            match current.apply(&transition) {
                Some(next) => {
                    history.push(next.clone());
                    outcome = Ok(next);
                    true
                }
                None => {
                    outcome = Err(RegistryError::InvalidTransition {
                        id: *id,
                        from: current.stage(),
                        to: transition.target(),
                    });
                    false
                }
            }
        });

        match &outcome {
            Ok(op) => tracing::debug!(operation_id = %id, stage = %op.stage(), "Operation transitioned"),
            Err(e) => tracing::warn!(operation_id = %id, error = %e, "Rejected operation transition"),
        }
        outcome
    }

    /// Attach a watcher to an existing operation.
    pub fn subscribe(&self, id: &OperationId) -> Result<OperationWatch, RegistryError> {
        let sender = self.sender(id)?;
        Ok(OperationWatch::new(*id, sender.subscribe()))
    }

    /// Every registered id. Diagnostic only.
    pub fn list(&self) -> Vec<OperationId> {
        self.operations.iter().map(|entry| *entry.key()).collect()
    }

    /// Current snapshots of all operations, oldest first.
    pub fn snapshots(&self) -> Vec<Operation> {
        let mut ops: Vec<Operation> = self
            .operations
            .iter()
            .filter_map(|entry| entry.value().borrow().last().cloned())
            .collect();
        ops.sort_by_key(|op| op.metadata.queued_at);
        ops
    }

    /// Number of operations currently in each stage.
    pub fn stage_counts(&self) -> HashMap<ExecutionStage, usize> {
        let mut counts = HashMap::new();
        for entry in self.operations.iter() {
            if let Some(op) = entry.value().borrow().last() {
                *counts.entry(op.stage()).or_insert(0) += 1;
            }
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}
