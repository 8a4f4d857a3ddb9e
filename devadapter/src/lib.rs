/// Device adapters for the firmware update workflow
///
/// This crate wraps the three external resources the update workflow
/// drives: the configuration utility (through a single-flight command
/// gateway), the device's serial manufacturing prompt (through an exclusive
/// debug session) and the update repository (through a batch-tracking
/// sync client). Every operation returns immediately and reports its
/// outcome through a callback.

pub mod commands;
pub mod gateway;
pub mod manifest;
pub mod parser;
pub mod process;
pub mod repository;
pub mod session;
pub mod types;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use gateway::{CommandGateway, QUEUE_LIMIT};
pub use manifest::{Component, ManifestError, PackageManifest};
pub use parser::*;
pub use process::{ProcessLauncher, ProcessSink, TokioLauncher};
pub use repository::{
    local_path, DirectoryStore, DownloadBatch, FileOutcome, Listing, ObjectStore, RepositoryClient, StoreError,
};
pub use session::{DebugSession, NativeSerialConnector, ResponseFramer, SerialConnector, SerialLink, SessionError, MFG_PROMPT};
pub use types::*;
