//! Build actions and their results.
//!
//! An [`Action`] is owned by the client and treated as read-only input. It is
//! identified by the digest of its canonical JSON encoding, which is also the
//! key of its entry in the action cache.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::Digest;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputFile {
    /// Path relative to the execution root.
    pub path: String,
    pub digest: Digest,
    #[serde(default)]
    pub is_executable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    /// Command line; the first element is the program.
    pub arguments: Vec<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub input_files: Vec<InputFile>,
    /// Paths, relative to the execution root, uploaded on success.
    #[serde(default)]
    pub output_files: Vec<String>,
    #[serde(default, with = "timeout_millis")]
    pub timeout: Option<Duration>,
}

impl Action {
    pub fn new<I, S>(arguments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            arguments: arguments.into_iter().map(Into::into).collect(),
            environment: BTreeMap::new(),
            input_files: Vec::new(),
            output_files: Vec::new(),
            timeout: None,
        }
    }

    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(name.into(), value.into());
        self
    }

    pub fn with_input(mut self, path: impl Into<String>, digest: Digest) -> Self {
        self.input_files.push(InputFile {
            path: path.into(),
            digest,
            is_executable: false,
        });
        self
    }

    pub fn with_output(mut self, path: impl Into<String>) -> Self {
        self.output_files.push(path.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Canonical encoding. Field order is fixed by the struct and the
    /// environment is ordered, so equal actions encode to equal bytes.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn digest(&self) -> Result<Digest, serde_json::Error> {
        Ok(Digest::of(&self.encode()?))
    }

    /// Checks that don't need the cache: a program to run and relative,
    /// non-escaping paths for every input and output.
    pub fn validate(&self) -> Result<(), String> {
        match self.arguments.first() {
            Some(program) if !program.trim().is_empty() => {}
            _ => return Err("action has no command".to_string()),
        }
        for input in &self.input_files {
            check_relative_path(&input.path)?;
            if !input.digest.is_valid() {
                return Err(format!("malformed digest for input {}", input.path));
            }
        }
        for output in &self.output_files {
            check_relative_path(output)?;
        }
        Ok(())
    }
}

fn check_relative_path(path: &str) -> Result<(), String> {
    let p = std::path::Path::new(path);
    if path.is_empty() || p.is_absolute() {
        return Err(format!("path must be relative: {:?}", path));
    }
    if p.components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return Err(format!("path escapes the execution root: {:?}", path));
    }
    Ok(())
}

mod timeout_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        value.map(|d| d.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputFile {
    pub path: String,
    pub digest: Digest,
    #[serde(default)]
    pub is_executable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExecutionMetadata {
    pub worker: String,
    pub queued_at: Option<DateTime<Utc>>,
    pub worker_start: Option<DateTime<Utc>>,
    pub worker_completed: Option<DateTime<Utc>>,
}

/// Outcome of a successful execution, stored in the action cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionResult {
    pub output_files: Vec<OutputFile>,
    pub exit_code: i32,
    pub stdout_digest: Digest,
    pub stderr_digest: Digest,
    #[serde(default)]
    pub execution_metadata: ExecutionMetadata,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_stable_for_equal_actions() {
        let a = Action::new(["sh", "-c", "echo hi"])
            .with_env("B", "2")
            .with_env("A", "1");
        let b = Action::new(["sh", "-c", "echo hi"])
            .with_env("A", "1")
            .with_env("B", "2");
        assert_eq!(a.digest().unwrap(), b.digest().unwrap());
    }

    #[test]
    fn digest_differs_for_different_commands() {
        let a = Action::new(["true"]);
        let b = Action::new(["false"]);
        assert_ne!(a.digest().unwrap(), b.digest().unwrap());
    }

    #[test]
    fn decode_accepts_encoded_action() {
        let action = Action::new(["cc", "-c", "a.c"])
            .with_input("a.c", Digest::of(b"int x;"))
            .with_output("a.o")
            .with_timeout(Duration::from_secs(5));
        let decoded = Action::decode(&action.encode().unwrap()).unwrap();
        assert_eq!(decoded, action);
    }

    #[test]
    fn validate_rejects_empty_command() {
        assert!(Action::new(Vec::<String>::new()).validate().is_err());
        assert!(Action::new([" "]).validate().is_err());
    }

    #[test]
    fn validate_rejects_escaping_paths() {
        let action = Action::new(["true"]).with_output("../etc/passwd");
        assert!(action.validate().is_err());

        let action = Action::new(["true"]).with_input("/abs", Digest::of(b"x"));
        assert!(action.validate().is_err());
    }

    #[test]
    fn validate_rejects_malformed_input_digest() {
        let action = Action::new(["true"]).with_input("in", Digest::new("zz", 1));
        assert!(action.validate().is_err());
    }

    #[test]
    fn validate_accepts_nested_relative_paths() {
        let action = Action::new(["true"])
            .with_input("src/a.c", Digest::of(b"x"))
            .with_output("out/a.o");
        assert!(action.validate().is_ok());
    }
}
