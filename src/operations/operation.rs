use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::action::ActionResult;
use crate::cache::Digest;

pub type OperationId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionStage {
    Queued,
    Executing,
    Completed,
    Error,
}

impl ExecutionStage {
    pub fn is_terminal(self) -> bool {
        matches!(self, ExecutionStage::Completed | ExecutionStage::Error)
    }
}

impl std::fmt::Display for ExecutionStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionStage::Queued => write!(f, "queued"),
            ExecutionStage::Executing => write!(f, "executing"),
            ExecutionStage::Completed => write!(f, "completed"),
            ExecutionStage::Error => write!(f, "error"),
        }
    }
}

/// Why an operation ended in [`ExecutionStage::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// An input referenced by the action is missing from the CAS.
    MissingInput,
    /// The command ran and exited non-zero.
    NonZeroExit,
    Timeout,
    /// The process or the isolation wrapper could not be set up.
    SandboxFailure,
    /// Reading from or writing to the cache failed.
    CacheFailure,
    /// The worker itself failed while driving the operation.
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::MissingInput => write!(f, "missing_input"),
            ErrorKind::NonZeroExit => write!(f, "non_zero_exit"),
            ErrorKind::Timeout => write!(f, "timeout"),
            ErrorKind::SandboxFailure => write!(f, "sandbox_failure"),
            ErrorKind::CacheFailure => write!(f, "cache_failure"),
            ErrorKind::Internal => write!(f, "internal"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationError {
    pub kind: ErrorKind,
    pub message: String,
    pub exit_code: Option<i32>,
    /// Last bytes of the captured stderr, lossily decoded.
    pub stderr_tail: String,
}

impl OperationError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            exit_code: None,
            stderr_tail: String::new(),
        }
    }

    pub fn with_exit_code(mut self, exit_code: Option<i32>) -> Self {
        self.exit_code = exit_code;
        self
    }

    pub fn with_stderr_tail(mut self, stderr_tail: impl Into<String>) -> Self {
        self.stderr_tail = stderr_tail.into();
        self
    }
}

impl std::fmt::Display for OperationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Lifecycle state. The result and the error only exist in their terminal
/// states.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationState {
    Queued,
    Executing,
    Completed(ActionResult),
    Error(OperationError),
}

impl OperationState {
    pub fn stage(&self) -> ExecutionStage {
        match self {
            OperationState::Queued => ExecutionStage::Queued,
            OperationState::Executing => ExecutionStage::Executing,
            OperationState::Completed(_) => ExecutionStage::Completed,
            OperationState::Error(_) => ExecutionStage::Error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationMetadata {
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// The result came from the action cache without running anything.
    pub cached_result: bool,
}

/// A requested state change, checked against the current state before it is
/// applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// QUEUED -> EXECUTING
    Start,
    /// EXECUTING -> COMPLETED, or QUEUED -> COMPLETED when `cached`
    Complete { result: ActionResult, cached: bool },
    /// QUEUED | EXECUTING -> ERROR
    Fail(OperationError),
}

impl Transition {
    pub fn target(&self) -> ExecutionStage {
        match self {
            Transition::Start => ExecutionStage::Executing,
            Transition::Complete { .. } => ExecutionStage::Completed,
            Transition::Fail(_) => ExecutionStage::Error,
        }
    }
}

/// Snapshot of a trackable unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OperationId,
    pub action_digest: Digest,
    pub state: OperationState,
    pub metadata: OperationMetadata,
}

impl Operation {
    pub fn new(id: OperationId, action_digest: Digest) -> Self {
        Self {
            id,
            action_digest,
            state: OperationState::Queued,
            metadata: OperationMetadata {
                queued_at: Utc::now(),
                started_at: None,
                completed_at: None,
                cached_result: false,
            },
        }
    }

    pub fn stage(&self) -> ExecutionStage {
        self.state.stage()
    }

    pub fn is_terminal(&self) -> bool {
        self.stage().is_terminal()
    }

    pub fn result(&self) -> Option<&ActionResult> {
        match &self.state {
            OperationState::Completed(result) => Some(result),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&OperationError> {
        match &self.state {
            OperationState::Error(error) => Some(error),
            _ => None,
        }
    }

    /// The snapshot that follows `transition`, or `None` if the state machine
    /// doesn't allow it from the current state.
    pub fn apply(&self, transition: &Transition) -> Option<Operation> {
        let now = Utc::now();
        let mut next = self.clone();
        match (&self.state, transition) {
            (OperationState::Queued, Transition::Start) => {
                next.state = OperationState::Executing;
                next.metadata.started_at = Some(now);
            }
            (OperationState::Executing, Transition::Complete { result, cached: false })
            | (OperationState::Queued, Transition::Complete { result, cached: true }) => {
                next.state = OperationState::Completed(result.clone());
                next.metadata.completed_at = Some(now);
                next.metadata.cached_result = self.stage() == ExecutionStage::Queued;
            }
            (OperationState::Queued | OperationState::Executing, Transition::Fail(error)) => {
                next.state = OperationState::Error(error.clone());
                next.metadata.completed_at = Some(now);
            }
            _ => return None,
        }
        Some(next)
    }
}
