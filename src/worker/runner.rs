use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;

use crate::worker::sandbox::SandboxBinary;

/// PATH given to actions that don't set one.
const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// How long to keep reading stdout/stderr after the process group is gone.
/// Only a process that escaped the group can hold the pipes that long.
const PIPE_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// A single subprocess invocation.
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub arguments: Vec<String>,
    pub environment: BTreeMap<String, String>,
    pub working_directory: PathBuf,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutput {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl RunOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Empty command line")]
    EmptyCommand,

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command timed out after {0:?}")]
    Timeout(Duration),

    #[error("I/O error while waiting for command: {0}")]
    Io(#[from] std::io::Error),
}

/// Runs one command to completion.
///
/// Implementations must not leave processes behind on any exit path,
/// including timeout, and must report a timeout as an error instead of
/// blocking.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, spec: RunSpec) -> Result<RunOutput, RunnerError>;
}

/// Runs commands as local subprocesses, optionally under the isolation
/// wrapper.
///
/// Sandboxed commands are started as
/// `<wrapper> -W <working_directory> -- <arguments...>`; the wrapper
/// confines the process to the working directory. Either way the child is
/// killed when the run is abandoned.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    sandbox: Option<SandboxBinary>,
}

impl ProcessRunner {
    pub fn direct() -> Self {
        Self { sandbox: None }
    }

    pub fn sandboxed(sandbox: SandboxBinary) -> Self {
        Self {
            sandbox: Some(sandbox),
        }
    }

    pub fn is_sandboxed(&self) -> bool {
        self.sandbox.is_some()
    }

    fn build_command(&self, spec: &RunSpec) -> Result<Command, RunnerError> {
        let (program, args) = spec
            .arguments
            .split_first()
            .ok_or(RunnerError::EmptyCommand)?;

        let mut cmd = match &self.sandbox {
            Some(sandbox) => {
                let mut cmd = Command::new(sandbox.path());
                cmd.arg("-W")
                    .arg(&spec.working_directory)
                    .arg("--")
                    .arg(program)
                    .args(args);
                cmd
            }
            None => {
                let mut cmd = Command::new(program);
                cmd.args(args);
                cmd
            }
        };

        cmd.env_clear()
            .envs(&spec.environment)
            .current_dir(&spec.working_directory)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        if !spec.environment.contains_key("PATH") {
            cmd.env("PATH", DEFAULT_PATH);
        }
        Ok(cmd)
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, spec: RunSpec) -> Result<RunOutput, RunnerError> {
        tracing::debug!(
            arguments = ?spec.arguments,
            working_directory = %spec.working_directory.display(),
            sandboxed = self.is_sandboxed(),
            "Running command"
        );

        let mut cmd = self.build_command(&spec)?;
        let mut child = cmd.spawn().map_err(|source| RunnerError::Spawn {
            program: spec.arguments[0].clone(),
            source,
        })?;
        // Declared after `child` so the group is killed before the leader is
        // dropped, on every path out of this function.
        let group = child.id().map(ProcessGroup::new);

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = match tokio::time::timeout(spec.timeout, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                tracing::warn!(timeout = ?spec.timeout, arguments = ?spec.arguments, "Command timed out");
                return Err(RunnerError::Timeout(spec.timeout));
            }
        };

        // Anything the command left running in the background goes with it,
        // which also closes the pipes it inherited.
        drop(group);

        let exit_code = status.code();
        tracing::debug!(exit_code = ?exit_code, "Command finished");

        Ok(RunOutput {
            exit_code,
            stdout: collect(stdout, "stdout").await?,
            stderr: collect(stderr, "stderr").await?,
        })
    }
}

/// The process group led by a spawned command. Every member is sent
/// SIGKILL when this is dropped.
struct ProcessGroup {
    pgid: libc::pid_t,
}

impl ProcessGroup {
    fn new(leader: u32) -> Self {
        Self {
            pgid: leader as libc::pid_t,
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        // ESRCH just means the whole group already exited.
        unsafe {
            libc::killpg(self.pgid, libc::SIGKILL);
        }
    }
}

fn drain<R>(pipe: Option<R>) -> JoinHandle<std::io::Result<Vec<u8>>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            pipe.read_to_end(&mut buf).await?;
        }
        Ok(buf)
    })
}

async fn collect(
    reader: JoinHandle<std::io::Result<Vec<u8>>>,
    stream: &'static str,
) -> Result<Vec<u8>, RunnerError> {
    match tokio::time::timeout(PIPE_DRAIN_TIMEOUT, reader).await {
        Ok(Ok(result)) => Ok(result?),
        Ok(Err(e)) => Err(RunnerError::Io(std::io::Error::other(e))),
        Err(_) => {
            tracing::warn!(stream, "Output pipe still open after the command exited; dropping it");
            Ok(Vec::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(dir: &std::path::Path, args: &[&str]) -> RunSpec {
        RunSpec {
            arguments: args.iter().map(|s| s.to_string()).collect(),
            environment: BTreeMap::new(),
            working_directory: dir.to_path_buf(),
            timeout: Duration::from_secs(10),
        }
    }

    #[test]
    fn sandboxed_command_is_wrapped() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ProcessRunner::sandboxed(SandboxBinary::new_unchecked("/opt/linux-sandbox"));
        let cmd = runner.build_command(&spec(dir.path(), &["cc", "-c", "a.c"])).unwrap();
        let std_cmd = cmd.as_std();

        assert_eq!(std_cmd.get_program(), "/opt/linux-sandbox");
        let args: Vec<_> = std_cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            vec![
                "-W".to_string(),
                dir.path().display().to_string(),
                "--".to_string(),
                "cc".to_string(),
                "-c".to_string(),
                "a.c".to_string(),
            ]
        );
    }

    #[test]
    fn direct_command_runs_program() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ProcessRunner::direct();
        let cmd = runner.build_command(&spec(dir.path(), &["echo", "hi"])).unwrap();
        assert_eq!(cmd.as_std().get_program(), "echo");
        assert!(!runner.is_sandboxed());
    }

    #[test]
    fn empty_command_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = ProcessRunner::direct()
            .build_command(&spec(dir.path(), &[]))
            .unwrap_err();
        assert!(matches!(err, RunnerError::EmptyCommand));
    }
}
