use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for sandboxed action execution.
///
/// When enabled, every action runs under the isolation wrapper, which
/// confines it to its scratch directory.
#[derive(Debug, Clone, Default)]
pub struct SandboxConfig {
    /// Run actions under the isolation wrapper
    pub enabled: bool,
    /// Path to the wrapper binary. Defaults to `<work_path>/linux-sandbox`.
    pub binary_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub listen_addr: SocketAddr,
    /// Root for per-action scratch directories. Without it the worker only
    /// serves the CAS and action cache.
    pub work_path: Option<PathBuf>,
    pub sandbox: SandboxConfig,
    /// Written with the process id once the server is listening.
    pub pid_file: Option<PathBuf>,
    /// Optional HTTP diagnostics listener.
    pub dashboard_addr: Option<SocketAddr>,
    /// Timeout for actions that don't set their own.
    pub default_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            // SAFETY: This is a hardcoded valid address that will always parse
            listen_addr: "127.0.0.1:8080"
                .parse()
                .expect("default listen address is valid"),
            work_path: None,
            sandbox: SandboxConfig::default(),
            pid_file: None,
            dashboard_addr: None,
            default_timeout: Duration::from_secs(600),
        }
    }
}

impl WorkerConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_work_path(mut self, work_path: impl Into<PathBuf>) -> Self {
        self.work_path = Some(work_path.into());
        self
    }

    pub fn with_sandbox(mut self, binary_path: Option<PathBuf>) -> Self {
        self.sandbox = SandboxConfig {
            enabled: true,
            binary_path,
        };
        self
    }

    /// Execution is requested whenever a work path is configured.
    pub fn execution_requested(&self) -> bool {
        self.work_path.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sandbox_config_default() {
        let cfg = SandboxConfig::default();
        assert!(!cfg.enabled);
        assert!(cfg.binary_path.is_none());
    }

    #[test]
    fn worker_config_default() {
        let cfg = WorkerConfig::default();
        assert_eq!(cfg.listen_addr.to_string(), "127.0.0.1:8080");
        assert!(cfg.work_path.is_none());
        assert!(!cfg.sandbox.enabled);
        assert!(cfg.pid_file.is_none());
        assert!(cfg.dashboard_addr.is_none());
        assert_eq!(cfg.default_timeout, Duration::from_secs(600));
        assert!(!cfg.execution_requested());
    }

    #[test]
    fn worker_config_new() {
        let addr: SocketAddr = "10.0.0.1:9000".parse().unwrap();
        let cfg = WorkerConfig::new(addr);
        assert_eq!(cfg.listen_addr, addr);
        assert!(cfg.work_path.is_none());
    }

    #[test]
    fn worker_config_builders() {
        let cfg = WorkerConfig::default()
            .with_work_path("/tmp/work")
            .with_sandbox(Some(PathBuf::from("/opt/linux-sandbox")));
        assert!(cfg.execution_requested());
        assert_eq!(cfg.work_path, Some(PathBuf::from("/tmp/work")));
        assert!(cfg.sandbox.enabled);
        assert_eq!(
            cfg.sandbox.binary_path,
            Some(PathBuf::from("/opt/linux-sandbox"))
        );
    }
}
