//! Isolation wrapper discovery and validation.
//!
//! Sandboxed execution needs a working `linux-sandbox` style binary before
//! the worker accepts any execution traffic. [`prepare`] checks everything up
//! front so that a broken wrapper is a startup condition, never a per-action
//! failure.

use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::config::SandboxConfig;
use crate::worker::runner::{CommandRunner, ProcessRunner, RunSpec};

/// File name of the wrapper inside the work directory when no explicit path
/// is configured.
pub const DEFAULT_SANDBOX_BINARY: &str = "linux-sandbox";

const SELF_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Sandboxing requested, but it is currently only available on Linux")]
    UnsupportedPlatform,

    #[error("Sandboxing requested, but no work path was specified")]
    MissingWorkPath,

    #[error("Sandbox binary not found: {0}")]
    NotFound(PathBuf),

    #[error("Sandbox binary is not an executable file: {0}")]
    NotExecutable(PathBuf),

    #[error("Sandbox self-check failed: {0}")]
    SelfCheckFailed(String),

    #[error("I/O error while inspecting sandbox binary: {0}")]
    Io(#[from] std::io::Error),
}

/// A wrapper binary that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxBinary {
    path: PathBuf,
}

impl SandboxBinary {
    /// Wrap a path without validating it. Only for callers that have already
    /// validated the binary, and for tests.
    pub fn new_unchecked(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Locate and validate the isolation wrapper.
///
/// Fails if the platform isn't Linux, if there is no work path, if the binary
/// is missing or not executable, or if `<wrapper> -- true` doesn't succeed.
pub async fn prepare(
    config: &SandboxConfig,
    work_path: Option<&Path>,
) -> Result<SandboxBinary, SandboxError> {
    if !cfg!(target_os = "linux") {
        return Err(SandboxError::UnsupportedPlatform);
    }
    let work_path = work_path.ok_or(SandboxError::MissingWorkPath)?;

    let path = config
        .binary_path
        .clone()
        .unwrap_or_else(|| work_path.join(DEFAULT_SANDBOX_BINARY));

    let metadata = match tokio::fs::metadata(&path).await {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(SandboxError::NotFound(path))
        }
        Err(e) => return Err(e.into()),
    };
    if !metadata.is_file() || metadata.permissions().mode() & 0o111 == 0 {
        return Err(SandboxError::NotExecutable(path));
    }

    let binary = SandboxBinary::new_unchecked(path);
    self_check(&binary, work_path).await?;

    tracing::info!(path = %binary.path().display(), "Sandbox binary validated");
    Ok(binary)
}

/// Run `true` through the wrapper.
async fn self_check(binary: &SandboxBinary, work_path: &Path) -> Result<(), SandboxError> {
    let runner = ProcessRunner::sandboxed(binary.clone());
    let spec = RunSpec {
        arguments: vec!["true".to_string()],
        environment: BTreeMap::new(),
        working_directory: work_path.to_path_buf(),
        timeout: SELF_CHECK_TIMEOUT,
    };

    match runner.run(spec).await {
        Ok(output) if output.success() => Ok(()),
        Ok(output) => Err(SandboxError::SelfCheckFailed(format!(
            "exit code {:?}: {}",
            output.exit_code,
            String::from_utf8_lossy(&output.stderr).trim()
        ))),
        Err(e) => Err(SandboxError::SelfCheckFailed(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(binary_path: Option<PathBuf>) -> SandboxConfig {
        SandboxConfig {
            enabled: true,
            binary_path,
        }
    }

    async fn write_script(dir: &Path, name: &str, body: &str, mode: u32) -> PathBuf {
        let path = dir.join(name);
        tokio::fs::write(&path, body).await.unwrap();
        tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))
            .await
            .unwrap();
        path
    }

    #[tokio::test]
    async fn missing_work_path() {
        let err = prepare(&config(None), None).await.unwrap_err();
        assert!(matches!(err, SandboxError::MissingWorkPath));
    }

    #[tokio::test]
    async fn missing_binary() {
        let dir = tempfile::tempdir().unwrap();
        let err = prepare(&config(None), Some(dir.path())).await.unwrap_err();
        match err {
            SandboxError::NotFound(path) => {
                assert_eq!(path, dir.path().join(DEFAULT_SANDBOX_BINARY))
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn non_executable_binary() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_script(dir.path(), "sandbox", "#!/bin/sh\nexit 0\n", 0o644).await;
        let err = prepare(&config(Some(path)), Some(dir.path()))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::NotExecutable(_)));
    }

    #[tokio::test]
    async fn failing_self_check() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_script(
            dir.path(),
            "sandbox",
            "#!/bin/sh\necho broken >&2\nexit 3\n",
            0o755,
        )
        .await;
        let err = prepare(&config(Some(path)), Some(dir.path()))
            .await
            .unwrap_err();
        match err {
            SandboxError::SelfCheckFailed(msg) => assert!(msg.contains("broken")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn passing_self_check() {
        let dir = tempfile::tempdir().unwrap();
        // Stand-in wrapper: drop "-W <dir> --" and exec the rest.
        let path = write_script(
            dir.path(),
            "sandbox",
            "#!/bin/sh\nshift 3\nexec \"$@\"\n",
            0o755,
        )
        .await;
        let binary = prepare(&config(Some(path.clone())), Some(dir.path()))
            .await
            .unwrap();
        assert_eq!(binary.path(), path.as_path());
    }
}
