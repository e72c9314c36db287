//! Conversions between domain types and their protobuf messages, and from
//! domain errors to gRPC statuses.

use chrono::{DateTime, Utc};
use tonic::{Code, Status};

use crate::action::{Action, ActionResult, ExecutionMetadata, InputFile, OutputFile};
use crate::cache::{CacheError, Digest};
use crate::operations::{ExecutionStage, Operation, OperationError, OperationState, RegistryError};
use crate::proto;
use crate::worker::SubmitError;

impl From<Digest> for proto::Digest {
    fn from(d: Digest) -> Self {
        proto::Digest {
            hash: d.hash,
            size_bytes: d.size_bytes,
        }
    }
}

impl From<&Digest> for proto::Digest {
    fn from(d: &Digest) -> Self {
        d.clone().into()
    }
}

impl From<proto::Digest> for Digest {
    fn from(d: proto::Digest) -> Self {
        Digest::new(d.hash, d.size_bytes)
    }
}

/// A digest field that must be present and well formed.
pub fn required_digest(digest: Option<proto::Digest>, field: &str) -> Result<Digest, Status> {
    let digest: Digest = digest
        .ok_or_else(|| Status::invalid_argument(format!("{} is required", field)))?
        .into();
    if !digest.is_valid() {
        return Err(Status::invalid_argument(format!(
            "{} is malformed: {}",
            field, digest
        )));
    }
    Ok(digest)
}

fn to_millis(t: &DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    if ms == 0 {
        None
    } else {
        DateTime::from_timestamp_millis(ms)
    }
}

impl From<&Action> for proto::Action {
    fn from(action: &Action) -> Self {
        proto::Action {
            arguments: action.arguments.clone(),
            environment_variables: action
                .environment
                .iter()
                .map(|(name, value)| proto::EnvironmentVariable {
                    name: name.clone(),
                    value: value.clone(),
                })
                .collect(),
            input_files: action
                .input_files
                .iter()
                .map(|f| proto::InputFile {
                    path: f.path.clone(),
                    digest: Some((&f.digest).into()),
                    is_executable: f.is_executable,
                })
                .collect(),
            output_files: action.output_files.clone(),
            timeout_ms: action.timeout.map(|t| t.as_millis() as u64).unwrap_or(0),
        }
    }
}

impl TryFrom<proto::Action> for Action {
    type Error = Status;

    fn try_from(action: proto::Action) -> Result<Self, Self::Error> {
        let input_files = action
            .input_files
            .into_iter()
            .map(|f| {
                let digest = required_digest(f.digest, &format!("digest of input {}", f.path))?;
                Ok(InputFile {
                    path: f.path,
                    digest,
                    is_executable: f.is_executable,
                })
            })
            .collect::<Result<Vec<_>, Status>>()?;

        Ok(Action {
            arguments: action.arguments,
            environment: action
                .environment_variables
                .into_iter()
                .map(|v| (v.name, v.value))
                .collect(),
            input_files,
            output_files: action.output_files,
            timeout: match action.timeout_ms {
                0 => None,
                ms => Some(std::time::Duration::from_millis(ms)),
            },
        })
    }
}

impl From<&ActionResult> for proto::ActionResult {
    fn from(result: &ActionResult) -> Self {
        let meta = &result.execution_metadata;
        proto::ActionResult {
            output_files: result
                .output_files
                .iter()
                .map(|f| proto::OutputFile {
                    path: f.path.clone(),
                    digest: Some((&f.digest).into()),
                    is_executable: f.is_executable,
                })
                .collect(),
            exit_code: result.exit_code,
            stdout_digest: Some((&result.stdout_digest).into()),
            stderr_digest: Some((&result.stderr_digest).into()),
            execution_metadata: Some(proto::ExecutionMetadata {
                worker: meta.worker.clone(),
                queued_at_ms: meta.queued_at.as_ref().map(to_millis).unwrap_or(0),
                worker_start_ms: meta.worker_start.as_ref().map(to_millis).unwrap_or(0),
                worker_completed_ms: meta.worker_completed.as_ref().map(to_millis).unwrap_or(0),
            }),
        }
    }
}

impl TryFrom<proto::ActionResult> for ActionResult {
    type Error = Status;

    fn try_from(result: proto::ActionResult) -> Result<Self, Self::Error> {
        let output_files = result
            .output_files
            .into_iter()
            .map(|f| {
                let digest = required_digest(f.digest, &format!("digest of output {}", f.path))?;
                Ok(OutputFile {
                    path: f.path,
                    digest,
                    is_executable: f.is_executable,
                })
            })
            .collect::<Result<Vec<_>, Status>>()?;

        let execution_metadata = result
            .execution_metadata
            .map(|m| ExecutionMetadata {
                worker: m.worker,
                queued_at: from_millis(m.queued_at_ms),
                worker_start: from_millis(m.worker_start_ms),
                worker_completed: from_millis(m.worker_completed_ms),
            })
            .unwrap_or_default();

        Ok(ActionResult {
            output_files,
            exit_code: result.exit_code,
            stdout_digest: result.stdout_digest.map(Into::into).unwrap_or_else(Digest::empty),
            stderr_digest: result.stderr_digest.map(Into::into).unwrap_or_else(Digest::empty),
            execution_metadata,
        })
    }
}

pub fn stage_to_proto(stage: ExecutionStage) -> proto::ExecutionStage {
    match stage {
        ExecutionStage::Queued => proto::ExecutionStage::Queued,
        ExecutionStage::Executing => proto::ExecutionStage::Executing,
        ExecutionStage::Completed => proto::ExecutionStage::Completed,
        ExecutionStage::Error => proto::ExecutionStage::Error,
    }
}

impl From<&OperationError> for proto::OperationError {
    fn from(error: &OperationError) -> Self {
        proto::OperationError {
            kind: error.kind.to_string(),
            message: error.message.clone(),
            exit_code: error.exit_code,
            stderr_tail: error.stderr_tail.clone(),
        }
    }
}

impl From<&Operation> for proto::Operation {
    fn from(op: &Operation) -> Self {
        let outcome = match &op.state {
            OperationState::Completed(result) => {
                Some(proto::operation::Outcome::Result(result.into()))
            }
            OperationState::Error(error) => Some(proto::operation::Outcome::Error(error.into())),
            OperationState::Queued | OperationState::Executing => None,
        };

        proto::Operation {
            operation_id: op.id.to_string(),
            stage: stage_to_proto(op.stage()) as i32,
            action_digest: Some((&op.action_digest).into()),
            outcome,
            cached_result: op.metadata.cached_result,
            queued_at_ms: to_millis(&op.metadata.queued_at),
            started_at_ms: op.metadata.started_at.as_ref().map(to_millis),
            completed_at_ms: op.metadata.completed_at.as_ref().map(to_millis),
        }
    }
}

impl From<RegistryError> for Status {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::NotFound(_) => Status::not_found(e.to_string()),
            RegistryError::InvalidTransition { .. } => Status::failed_precondition(e.to_string()),
        }
    }
}

/// Status code reported for a cache failure.
pub fn cache_error_code(e: &CacheError) -> Code {
    match e {
        CacheError::NotFound(_) => Code::NotFound,
        CacheError::DigestMismatch { .. } => Code::InvalidArgument,
        CacheError::Malformed { .. } => Code::DataLoss,
        CacheError::Storage(_) | CacheError::Io(_) => Code::Unavailable,
    }
}

impl From<CacheError> for Status {
    fn from(e: CacheError) -> Self {
        Status::new(cache_error_code(&e), e.to_string())
    }
}

impl From<SubmitError> for Status {
    fn from(e: SubmitError) -> Self {
        match e {
            SubmitError::InvalidAction(_) => Status::invalid_argument(e.to_string()),
            SubmitError::ActionNotFound(_) => Status::failed_precondition(e.to_string()),
            SubmitError::Cache(inner) => inner.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operations::{ErrorKind, Transition};
    use std::time::Duration;
    use uuid::Uuid;

    #[test]
    fn required_digest_rejects_missing_and_malformed() {
        let err = required_digest(None, "action_digest").unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);

        let err = required_digest(
            Some(proto::Digest {
                hash: "xyz".to_string(),
                size_bytes: 3,
            }),
            "action_digest",
        )
        .unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[test]
    fn action_survives_proto_conversion() {
        let action = Action::new(["cc", "-c", "a.c"])
            .with_env("LANG", "C")
            .with_input("a.c", Digest::of(b"int x;"))
            .with_output("a.o")
            .with_timeout(Duration::from_secs(3));
        let back = Action::try_from(proto::Action::from(&action)).unwrap();
        assert_eq!(back, action);
    }

    #[test]
    fn action_with_bad_input_digest_is_rejected() {
        let mut message = proto::Action::from(&Action::new(["true"]));
        message.input_files.push(proto::InputFile {
            path: "in".to_string(),
            digest: None,
            is_executable: false,
        });
        let err = Action::try_from(message).unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[test]
    fn error_operation_carries_exit_code() {
        let op = Operation::new(Uuid::new_v4(), Digest::of(b"a"))
            .apply(&Transition::Fail(
                OperationError::new(ErrorKind::NonZeroExit, "exit 1")
                    .with_exit_code(Some(1))
                    .with_stderr_tail("boom"),
            ))
            .unwrap();
        let message = proto::Operation::from(&op);
        assert_eq!(message.stage, proto::ExecutionStage::Error as i32);
        match message.outcome {
            Some(proto::operation::Outcome::Error(e)) => {
                assert_eq!(e.exit_code, Some(1));
                assert_eq!(e.stderr_tail, "boom");
                assert_eq!(e.kind, "non_zero_exit");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn queued_operation_has_no_outcome() {
        let op = Operation::new(Uuid::new_v4(), Digest::of(b"a"));
        let message = proto::Operation::from(&op);
        assert_eq!(message.stage, proto::ExecutionStage::Queued as i32);
        assert!(message.outcome.is_none());
        assert!(message.started_at_ms.is_none());
    }

    #[test]
    fn status_codes_for_errors() {
        let id = Uuid::new_v4();
        assert_eq!(
            Status::from(RegistryError::NotFound(id)).code(),
            tonic::Code::NotFound
        );
        assert_eq!(
            Status::from(SubmitError::ActionNotFound(Digest::empty())).code(),
            tonic::Code::FailedPrecondition
        );
        assert_eq!(
            Status::from(SubmitError::InvalidAction("x".into())).code(),
            tonic::Code::InvalidArgument
        );
        assert_eq!(
            Status::from(CacheError::Storage("down".into())).code(),
            tonic::Code::Unavailable
        );
    }
}
