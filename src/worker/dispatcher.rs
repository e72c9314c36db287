use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tempfile::TempDir;
use thiserror::Error;

use crate::action::{Action, ActionResult, ExecutionMetadata, OutputFile};
use crate::cache::{CacheError, CacheGateway, Digest};
use crate::operations::{
    ErrorKind, OperationError, OperationId, OperationRegistry, OperationWatch, RegistryError,
    Transition,
};
use crate::worker::runner::{CommandRunner, RunOutput, RunSpec, RunnerError};

/// Bytes of stderr kept in the error payload of a failed operation.
const STDERR_TAIL_BYTES: usize = 4096;

/// Where the action to execute comes from.
#[derive(Debug, Clone)]
pub enum ActionSource {
    Inline(Action),
    /// An action previously uploaded to the CAS.
    Digest(Digest),
}

#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    pub action: ActionSource,
    /// Execute even if the action cache already has a result.
    pub skip_cache_lookup: bool,
}

impl ExecuteRequest {
    pub fn inline(action: Action) -> Self {
        Self {
            action: ActionSource::Inline(action),
            skip_cache_lookup: false,
        }
    }

    pub fn by_digest(digest: Digest) -> Self {
        Self {
            action: ActionSource::Digest(digest),
            skip_cache_lookup: false,
        }
    }

    pub fn skip_cache_lookup(mut self) -> Self {
        self.skip_cache_lookup = true;
        self
    }
}

/// Input errors, reported to the caller before any operation exists.
#[derive(Error, Debug)]
pub enum SubmitError {
    #[error("Invalid action: {0}")]
    InvalidAction(String),

    #[error("Action not found in cache: {0}")]
    ActionNotFound(Digest),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub operation_id: OperationId,
    pub action_digest: Digest,
}

/// Turns execution requests into operations and drives each one to a
/// terminal state.
///
/// `submit` registers the operation and returns at once; the work happens on
/// a spawned task:
///
/// 1. A result already in the action cache completes the operation without
///    running anything, unless the request skips the lookup.
/// 2. Otherwise inputs are staged from the CAS into a fresh scratch directory
///    under the work path, the operation moves to EXECUTING and the runner is
///    invoked.
/// 3. On exit code 0, declared outputs, stdout and stderr are uploaded and the
///    action result is written to the action cache under the action digest.
/// 4. Any failure, including cache I/O, ends the operation in ERROR. Failures
///    are not retried.
///
/// # Duplicate submissions
///
/// While an action digest is being driven by one operation, later
/// submissions of the same digest (without `skip_cache_lookup`) get their own
/// operation that stays QUEUED until the first one is terminal, then goes
/// through the cache lookup. A completed leader therefore turns every joined
/// duplicate into a cache hit instead of a second execution.
#[derive(Clone)]
pub struct ExecutionDispatcher {
    registry: Arc<OperationRegistry>,
    cache: CacheGateway,
    runner: Arc<dyn CommandRunner>,
    work_path: PathBuf,
    default_timeout: Duration,
    worker_name: String,
    /// Action digest -> operation currently driving it.
    in_flight: Arc<DashMap<Digest, OperationId>>,
}

impl ExecutionDispatcher {
    pub fn new(
        registry: Arc<OperationRegistry>,
        cache: CacheGateway,
        runner: Arc<dyn CommandRunner>,
        work_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            registry,
            cache,
            runner,
            work_path: work_path.into(),
            default_timeout: Duration::from_secs(600),
            worker_name: "remote-worker".to_string(),
            in_flight: Arc::new(DashMap::new()),
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_worker_name(mut self, name: impl Into<String>) -> Self {
        self.worker_name = name.into();
        self
    }

    pub fn registry(&self) -> &Arc<OperationRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &CacheGateway {
        &self.cache
    }

    /// Attach a watcher to an operation.
    pub fn watch(&self, id: &OperationId) -> Result<OperationWatch, RegistryError> {
        self.registry.subscribe(id)
    }

    /// Register an operation for `request` and start driving it.
    ///
    /// Returns as soon as the operation is registered. Only input errors are
    /// reported here; everything that goes wrong later is recorded as the
    /// operation's ERROR state.
    pub async fn submit(&self, request: ExecuteRequest) -> Result<Submission, SubmitError> {
        let (action, action_digest) = self.resolve_action(request.action).await?;

        let operation_id = self.registry.create(action_digest.clone());
        tracing::info!(
            operation_id = %operation_id,
            action_digest = %action_digest,
            skip_cache_lookup = request.skip_cache_lookup,
            "Action submitted"
        );

        let dispatcher = self.clone();
        let digest = action_digest.clone();
        let force = request.skip_cache_lookup;
        tokio::spawn(async move {
            let worker = dispatcher.clone();
            let handle =
                tokio::spawn(async move { worker.drive(operation_id, action, digest, force).await });
            if let Err(e) = handle.await {
                tracing::error!(operation_id = %operation_id, error = %e, "Dispatch task failed");
                let error = OperationError::new(ErrorKind::Internal, format!("dispatch task failed: {}", e));
                // Already terminal if the task died after its final update.
                let _ = dispatcher.registry.update(&operation_id, Transition::Fail(error));
            }
        });

        Ok(Submission {
            operation_id,
            action_digest,
        })
    }

    async fn resolve_action(&self, source: ActionSource) -> Result<(Action, Digest), SubmitError> {
        let (action, digest) = match source {
            ActionSource::Inline(action) => {
                action.validate().map_err(SubmitError::InvalidAction)?;
                let digest = self.cache.put_action(&action).await?;
                (action, digest)
            }
            ActionSource::Digest(digest) => {
                if !digest.is_valid() {
                    return Err(SubmitError::InvalidAction(format!(
                        "malformed action digest {}",
                        digest
                    )));
                }
                let action = match self.cache.get_action(&digest).await {
                    Ok(action) => action,
                    Err(CacheError::NotFound(d)) => return Err(SubmitError::ActionNotFound(d)),
                    Err(CacheError::Malformed { source, .. }) => {
                        return Err(SubmitError::InvalidAction(source.to_string()))
                    }
                    Err(e) => return Err(e.into()),
                };
                action.validate().map_err(SubmitError::InvalidAction)?;
                (action, digest)
            }
        };
        Ok((action, digest))
    }

    /// Take ownership of `digest` for `id`, or return the operation that
    /// already owns it.
    fn claim(&self, digest: &Digest, id: OperationId) -> Result<InFlightClaim, OperationId> {
        match self.in_flight.entry(digest.clone()) {
            Entry::Occupied(owner) => Err(*owner.get()),
            Entry::Vacant(slot) => {
                slot.insert(id);
                Ok(InFlightClaim {
                    in_flight: self.in_flight.clone(),
                    digest: digest.clone(),
                    id,
                })
            }
        }
    }

    async fn drive(&self, id: OperationId, action: Action, digest: Digest, force: bool) {
        let claim = loop {
            match self.claim(&digest, id) {
                Ok(claim) => break Some(claim),
                Err(_) if force => break None,
                Err(leader) => {
                    tracing::debug!(
                        operation_id = %id,
                        leader = %leader,
                        "Waiting for in-flight execution of the same action"
                    );
                    match self.registry.subscribe(&leader) {
                        Ok(watch) => {
                            watch.wait_terminal().await;
                        }
                        Err(_) => break None,
                    }
                    tokio::task::yield_now().await;
                }
            }
        };

        let transition = match self.process(id, &action, &digest, force).await {
            Ok(transition) => transition,
            Err(error) => {
                tracing::warn!(operation_id = %id, error = %error, "Action failed");
                Transition::Fail(error)
            }
        };

        // Joined duplicates wake on the terminal transition and immediately
        // try to claim the digest, so it must be free by then.
        drop(claim);

        match self.registry.update(&id, transition) {
            Ok(op) => tracing::info!(
                operation_id = %id,
                stage = %op.stage(),
                cached = op.metadata.cached_result,
                "Operation finished"
            ),
            Err(e) => tracing::error!(operation_id = %id, error = %e, "Failed to record operation outcome"),
        }
    }

    /// Everything between QUEUED and the terminal transition.
    async fn process(
        &self,
        id: OperationId,
        action: &Action,
        digest: &Digest,
        force: bool,
    ) -> Result<Transition, OperationError> {
        if !force {
            match self.cache.lookup_action_result(digest).await {
                Ok(Some(result)) => {
                    tracing::info!(operation_id = %id, action_digest = %digest, "Action cache hit");
                    return Ok(Transition::Complete {
                        result,
                        cached: true,
                    });
                }
                Ok(None) => {}
                Err(e) => return Err(cache_failure("action cache lookup", e)),
            }
        }

        // Removed on every path out of this function.
        let scratch = self.prepare_scratch(action).await?;

        let started = self
            .registry
            .update(&id, Transition::Start)
            .map_err(|e| OperationError::new(ErrorKind::Internal, e.to_string()))?;

        let spec = RunSpec {
            arguments: action.arguments.clone(),
            environment: action.environment.clone(),
            working_directory: scratch.path().to_path_buf(),
            timeout: action.timeout.unwrap_or(self.default_timeout),
        };
        let output = self.runner.run(spec).await.map_err(runner_failure)?;

        if !output.success() {
            return Err(OperationError::new(
                ErrorKind::NonZeroExit,
                match output.exit_code {
                    Some(code) => format!("command exited with code {}", code),
                    None => "command terminated by signal".to_string(),
                },
            )
            .with_exit_code(output.exit_code)
            .with_stderr_tail(stderr_tail(&output.stderr)));
        }

        let metadata = ExecutionMetadata {
            worker: self.worker_name.clone(),
            queued_at: Some(started.metadata.queued_at),
            worker_start: started.metadata.started_at,
            worker_completed: Some(Utc::now()),
        };
        let result = self
            .upload_outputs(action, scratch.path(), output, metadata)
            .await?;
        self.cache
            .put_action_result(digest, &result)
            .await
            .map_err(|e| cache_failure("action cache write", e))?;

        Ok(Transition::Complete {
            result,
            cached: false,
        })
    }

    /// Create a scratch directory under the work path and stage every input
    /// into it, plus the parent directories of declared outputs.
    async fn prepare_scratch(&self, action: &Action) -> Result<TempDir, OperationError> {
        let scratch = tempfile::Builder::new()
            .prefix("action-")
            .tempdir_in(&self.work_path)
            .map_err(|e| setup_failure("create scratch directory", e))?;

        for input in &action.input_files {
            let data = self.cache.get_blob(&input.digest).await.map_err(|e| match e {
                CacheError::NotFound(d) => OperationError::new(
                    ErrorKind::MissingInput,
                    format!("input {} not found in cache: {}", input.path, d),
                ),
                other => cache_failure("input fetch", other),
            })?;

            let path = scratch.path().join(&input.path);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| setup_failure("create input directory", e))?;
            }
            tokio::fs::write(&path, data)
                .await
                .map_err(|e| setup_failure("write input", e))?;
            if input.is_executable {
                tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
                    .await
                    .map_err(|e| setup_failure("mark input executable", e))?;
            }
        }

        for output in &action.output_files {
            if let Some(parent) = scratch.path().join(output).parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| setup_failure("create output directory", e))?;
            }
        }

        Ok(scratch)
    }

    /// Upload declared outputs that exist, plus stdout and stderr.
    async fn upload_outputs(
        &self,
        action: &Action,
        root: &Path,
        output: RunOutput,
        execution_metadata: ExecutionMetadata,
    ) -> Result<ActionResult, OperationError> {
        let mut output_files = Vec::with_capacity(action.output_files.len());
        for relative in &action.output_files {
            let path = root.join(relative);
            let metadata = match tokio::fs::metadata(&path).await {
                Ok(m) if m.is_file() => m,
                Ok(_) | Err(_) => {
                    tracing::debug!(output = %relative, "Declared output not produced");
                    continue;
                }
            };
            let data = tokio::fs::read(&path)
                .await
                .map_err(|e| setup_failure("read output", e))?;
            let digest = self
                .cache
                .put_blob(data)
                .await
                .map_err(|e| cache_failure("output upload", e))?;
            output_files.push(OutputFile {
                path: relative.clone(),
                digest,
                is_executable: metadata.permissions().mode() & 0o111 != 0,
            });
        }

        let stdout_digest = self
            .cache
            .put_blob(output.stdout)
            .await
            .map_err(|e| cache_failure("stdout upload", e))?;
        let stderr_digest = self
            .cache
            .put_blob(output.stderr)
            .await
            .map_err(|e| cache_failure("stderr upload", e))?;

        Ok(ActionResult {
            output_files,
            exit_code: output.exit_code.unwrap_or_default(),
            stdout_digest,
            stderr_digest,
            execution_metadata,
        })
    }
}

impl std::fmt::Debug for ExecutionDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionDispatcher")
            .field("work_path", &self.work_path)
            .field("default_timeout", &self.default_timeout)
            .field("worker_name", &self.worker_name)
            .finish_non_exhaustive()
    }
}

/// Releases an action digest when the owning dispatch ends, however it ends.
struct InFlightClaim {
    in_flight: Arc<DashMap<Digest, OperationId>>,
    digest: Digest,
    id: OperationId,
}

impl Drop for InFlightClaim {
    fn drop(&mut self) {
        self.in_flight
            .remove_if(&self.digest, |_, owner| *owner == self.id);
    }
}

fn cache_failure(context: &str, error: CacheError) -> OperationError {
    OperationError::new(ErrorKind::CacheFailure, format!("{}: {}", context, error))
}

fn setup_failure(context: &str, error: std::io::Error) -> OperationError {
    OperationError::new(ErrorKind::SandboxFailure, format!("{}: {}", context, error))
}

fn runner_failure(error: RunnerError) -> OperationError {
    let kind = match error {
        RunnerError::Timeout(_) => ErrorKind::Timeout,
        _ => ErrorKind::SandboxFailure,
    };
    OperationError::new(kind, error.to_string())
}

/// Last [`STDERR_TAIL_BYTES`] of `stderr`, lossily decoded.
fn stderr_tail(stderr: &[u8]) -> String {
    let start = stderr.len().saturating_sub(STDERR_TAIL_BYTES);
    String::from_utf8_lossy(&stderr[start..]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stderr_tail_keeps_the_end() {
        let mut stderr = vec![b'a'; STDERR_TAIL_BYTES];
        stderr.extend_from_slice(b"last line");
        let tail = stderr_tail(&stderr);
        assert_eq!(tail.len(), STDERR_TAIL_BYTES);
        assert!(tail.ends_with("last line"));
    }

    #[test]
    fn stderr_tail_of_short_output() {
        assert_eq!(stderr_tail(b"oops\n"), "oops\n");
        assert_eq!(stderr_tail(b""), "");
    }

    #[test]
    fn runner_errors_map_to_kinds() {
        let timeout = runner_failure(RunnerError::Timeout(Duration::from_secs(1)));
        assert_eq!(timeout.kind, ErrorKind::Timeout);

        let spawn = runner_failure(RunnerError::EmptyCommand);
        assert_eq!(spawn.kind, ErrorKind::SandboxFailure);
    }

    #[test]
    fn request_builders() {
        let request = ExecuteRequest::inline(Action::new(["true"])).skip_cache_lookup();
        assert!(request.skip_cache_lookup);
        assert!(matches!(request.action, ActionSource::Inline(_)));

        let request = ExecuteRequest::by_digest(Digest::empty());
        assert!(!request.skip_cache_lookup);
        assert!(matches!(request.action, ActionSource::Digest(_)));
    }
}
