//! Operation lifecycle tracking.
//!
//! - [`Operation`]: snapshot of one execution request and its state
//! - [`OperationRegistry`]: the single source of truth for every operation,
//!   with atomic per-id transitions
//! - [`OperationWatch`]: a subscriber receiving snapshots until terminal
//!
//! # State machine
//!
//! ```text
//! QUEUED --start--> EXECUTING --complete--> COMPLETED
//!   |                   |
//!   |                   +------fail-------> ERROR
//!   +--cache hit------------------------->  COMPLETED
//!   +--fail------------------------------>  ERROR
//! ```
//!
//! COMPLETED and ERROR are terminal; every update after them is rejected.

pub mod operation;
pub mod registry;
pub mod watch;

pub use operation::{
    ErrorKind, ExecutionStage, Operation, OperationError, OperationId, OperationMetadata,
    OperationState, Transition,
};
pub use registry::{OperationRegistry, RegistryError};
pub use watch::OperationWatch;
