//! Service layer for workcopy
//!
//! The orchestrator and the services it coordinates: staging, transfers,
//! credentials and submodules. All of them drive the repository through
//! [`crate::backend::GitBackend`].

use crate::error::{Result, WorkcopyError};

pub mod cancellation;
pub mod config;
pub mod context;
pub mod credentials_service;
pub mod operation_service;
pub mod path_locks;
pub mod staging_service;
pub mod submodule_service;
pub mod transfer_service;

pub use cancellation::{CancellationRegistry, CancellationToken};
pub use config::Settings;
pub use context::RepositoryContext;
pub use credentials_service::{
    ChannelPrompter, CredentialNegotiator, CredentialPrompter, CredentialStore, MemoryStore,
    NoPrompter, PendingPrompt,
};
pub use operation_service::OperationOrchestrator;
pub use path_locks::{PathGuard, PathLocks};
pub use staging_service::DiffStagingEngine;
pub use submodule_service::SubmoduleSynchronizer;
pub use transfer_service::{PullIntegration, RemoteTransferController, TransferSession};

/// Run blocking backend work on the blocking pool
pub(crate) async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| WorkcopyError::Backend(format!("Task failed: {}", e)))?
}
