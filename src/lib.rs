//! workcopy - working-copy operation orchestrator
//!
//! Runs compound Git operations (merge, rebase, revert, cherry-pick, stash
//! application) through a single state machine per repository, resolves
//! their conflicts hunk by hunk, and drives fetch, pull, push and submodule
//! updates as cancellable sessions with interactive credential negotiation.

pub mod backend;
pub mod conflict;
pub mod error;
pub mod models;
pub mod services;

#[cfg(test)]
mod test_utils;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub use backend::{Git2Backend, GitBackend, MemoryBackend, MemoryNetwork};
pub use error::{ErrorResponse, Result, WorkcopyError};
pub use services::{OperationOrchestrator, Settings};

/// Install the default tracing subscriber. `RUST_LOG` overrides the filter.
pub fn init_tracing() {
    let installed = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "workcopy=debug,git2=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();

    if installed.is_ok() {
        tracing::info!("Starting workcopy");
    }
}
