use futures::Stream;
use tokio::sync::watch;

use crate::operations::operation::{Operation, OperationId};

/// One subscriber's view of an operation.
///
/// Yields the current snapshot first, then every later transition in the
/// order the registry applied them, and ends after the terminal snapshot.
/// The watcher keeps its own cursor into the operation's append-only
/// history, so slow watchers never miss a transition and never hold a lock
/// while waiting. Dropping it releases only this subscription.
pub struct OperationWatch {
    id: OperationId,
    receiver: watch::Receiver<Vec<Operation>>,
    /// Index of the next history entry to yield.
    cursor: usize,
    finished: bool,
}

impl OperationWatch {
    /// The attach point is the snapshot current at this call, not at the
    /// first poll.
    pub(crate) fn new(id: OperationId, receiver: watch::Receiver<Vec<Operation>>) -> Self {
        let cursor = receiver.borrow().len().saturating_sub(1);
        Self {
            id,
            receiver,
            cursor,
            finished: false,
        }
    }

    pub fn operation_id(&self) -> OperationId {
        self.id
    }

    /// Next snapshot, or `None` once the terminal snapshot has been yielded.
    pub async fn next(&mut self) -> Option<Operation> {
        if self.finished {
            return None;
        }

        loop {
            let next = {
                let history = self.receiver.borrow_and_update();
                if self.cursor < history.len() {
                    self.cursor += 1;
                    Some(history[self.cursor - 1].clone())
                } else {
                    None
                }
            };

            if let Some(op) = next {
                if op.is_terminal() {
                    self.finished = true;
                }
                return Some(op);
            }

            if self.receiver.changed().await.is_err() {
                // Sender gone and the history fully drained.
                if self.cursor >= self.receiver.borrow().len() {
                    self.finished = true;
                    return None;
                }
            }
        }
    }

    /// Wait for the terminal snapshot, skipping intermediate ones.
    pub async fn wait_terminal(mut self) -> Option<Operation> {
        let mut last = None;
        while let Some(op) = self.next().await {
            last = Some(op);
        }
        last.filter(Operation::is_terminal)
    }

    pub fn into_stream(self) -> impl Stream<Item = Operation> + Send + 'static {
        futures::stream::unfold(self, |mut watch| async move {
            watch.next().await.map(|op| (op, watch))
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::StreamExt;

    use crate::action::{ActionResult, ExecutionMetadata};
    use crate::cache::Digest;
    use crate::operations::operation::{ErrorKind, ExecutionStage, OperationError, Transition};
    use crate::operations::OperationRegistry;

    fn result() -> ActionResult {
        ActionResult {
            output_files: Vec::new(),
            exit_code: 0,
            stdout_digest: Digest::empty(),
            stderr_digest: Digest::empty(),
            execution_metadata: ExecutionMetadata::default(),
        }
    }

    #[tokio::test]
    async fn attach_before_execution_sees_every_stage() {
        let registry = OperationRegistry::new();
        let id = registry.create(Digest::of(b"a"));
        let watch = registry.subscribe(&id).unwrap();

        registry.update(&id, Transition::Start).unwrap();
        registry
            .update(
                &id,
                Transition::Complete {
                    result: result(),
                    cached: false,
                },
            )
            .unwrap();

        let stages: Vec<ExecutionStage> = watch.into_stream().map(|op| op.stage()).collect().await;
        assert_eq!(
            stages,
            vec![
                ExecutionStage::Queued,
                ExecutionStage::Executing,
                ExecutionStage::Completed
            ]
        );
    }

    #[tokio::test]
    async fn attach_mid_execution_starts_at_current_snapshot() {
        let registry = OperationRegistry::new();
        let id = registry.create(Digest::of(b"a"));
        registry.update(&id, Transition::Start).unwrap();
        let watch = registry.subscribe(&id).unwrap();
        registry
            .update(
                &id,
                Transition::Complete {
                    result: result(),
                    cached: false,
                },
            )
            .unwrap();

        let stages: Vec<ExecutionStage> = watch.into_stream().map(|op| op.stage()).collect().await;
        assert_eq!(
            stages,
            vec![ExecutionStage::Executing, ExecutionStage::Completed]
        );
    }

    #[tokio::test]
    async fn attach_after_terminal_yields_one_snapshot() {
        let registry = OperationRegistry::new();
        let id = registry.create(Digest::of(b"a"));
        registry
            .update(
                &id,
                Transition::Fail(OperationError::new(ErrorKind::MissingInput, "gone")),
            )
            .unwrap();

        let mut watch = registry.subscribe(&id).unwrap();
        let op = watch.next().await.unwrap();
        assert_eq!(op.stage(), ExecutionStage::Error);
        assert!(watch.next().await.is_none());
        assert!(watch.next().await.is_none());
    }

    #[tokio::test]
    async fn watcher_waits_for_transitions() {
        let registry = std::sync::Arc::new(OperationRegistry::new());
        let id = registry.create(Digest::of(b"a"));
        let mut watch = registry.subscribe(&id).unwrap();
        assert_eq!(watch.next().await.unwrap().stage(), ExecutionStage::Queued);

        let writer = registry.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.update(&id, Transition::Start).unwrap();
        });

        let op = tokio::time::timeout(Duration::from_secs(2), watch.next())
            .await
            .expect("watcher should wake on transition")
            .unwrap();
        assert_eq!(op.stage(), ExecutionStage::Executing);
    }

    #[tokio::test]
    async fn independent_watchers_see_same_terminal() {
        let registry = OperationRegistry::new();
        let id = registry.create(Digest::of(b"a"));
        let early = registry.subscribe(&id).unwrap();
        registry.update(&id, Transition::Start).unwrap();
        let late = registry.subscribe(&id).unwrap();
        registry
            .update(
                &id,
                Transition::Complete {
                    result: result(),
                    cached: false,
                },
            )
            .unwrap();

        let a = early.wait_terminal().await.unwrap();
        let b = late.wait_terminal().await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.stage(), ExecutionStage::Completed);
    }
}
