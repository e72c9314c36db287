//! Action execution.
//!
//! - [`ExecutionDispatcher`]: turns requests into operations and drives them
//!   through the cache and the runner
//! - [`CommandRunner`]: runs one subprocess with a timeout; [`ProcessRunner`]
//!   runs it directly or under the isolation wrapper
//! - [`sandbox`]: startup validation of the isolation wrapper
//!
//! # Execution Flow
//!
//! 1. [`ExecutionDispatcher::submit`] registers a QUEUED operation
//! 2. Action cache hit: the operation completes without running anything
//! 3. Miss: inputs are staged into a scratch directory, the operation moves
//!    to EXECUTING and [`CommandRunner::run`] executes the command
//! 4. Outputs go to the CAS, the result to the action cache, and the
//!    operation ends COMPLETED or ERROR

pub mod dispatcher;
pub mod runner;
pub mod sandbox;

pub use dispatcher::{ActionSource, ExecuteRequest, ExecutionDispatcher, SubmitError, Submission};
pub use runner::{CommandRunner, ProcessRunner, RunOutput, RunSpec, RunnerError};
pub use sandbox::{SandboxBinary, SandboxError};
