//! gRPC services.
//!
//! | Service                     | Served in          |
//! |-----------------------------|--------------------|
//! | `ContentAddressableStorage` | every mode         |
//! | `ActionCache`               | every mode         |
//! | `ByteStream`                | every mode         |
//! | `Execution`                 | execution mode     |
//! | `Watcher`                   | execution mode     |

pub mod bytestream_service;
pub mod cas_service;
pub mod convert;
pub mod execution_service;
pub mod server;

pub use server::GrpcServer;
