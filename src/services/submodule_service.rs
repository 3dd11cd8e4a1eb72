//! Submodule synchronization

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use super::config::Settings;
use super::credentials_service::CredentialNegotiator;
use super::transfer_service::RemoteTransferController;
use crate::backend::GitBackend;
use crate::error::{Result, WorkcopyError};
use crate::models::{
    FetchOptions, SubmoduleRecord, SubmoduleUpdate, SubmoduleUpdateOptions, SubmoduleUpdateStatus,
};

type UpdateFuture<'a> = Pin<Box<dyn Future<Output = Vec<SubmoduleUpdate>> + Send + 'a>>;

/// Brings submodules to the commits recorded by their superproject
#[derive(Clone)]
pub struct SubmoduleSynchronizer {
    backend: Arc<dyn GitBackend>,
    negotiator: Arc<CredentialNegotiator>,
    settings: Settings,
}

impl SubmoduleSynchronizer {
    pub fn new(
        backend: Arc<dyn GitBackend>,
        negotiator: Arc<CredentialNegotiator>,
        settings: Settings,
    ) -> Self {
        Self {
            backend,
            negotiator,
            settings,
        }
    }

    pub fn list(&self) -> Result<Vec<SubmoduleRecord>> {
        self.backend.submodules()
    }

    /// Update `paths` (every submodule when empty). Each path gets its own
    /// status; a failure never stops the remaining paths.
    pub async fn update(
        &self,
        paths: &[String],
        options: SubmoduleUpdateOptions,
    ) -> Vec<SubmoduleUpdate> {
        self.update_boxed(paths.to_vec(), options).await
    }

    fn update_boxed(&self, paths: Vec<String>, options: SubmoduleUpdateOptions) -> UpdateFuture<'_> {
        Box::pin(async move {
            let records = match self.list() {
                Ok(records) => records,
                Err(e) => {
                    tracing::warn!("Failed to list submodules: {}", e);
                    return paths
                        .iter()
                        .map(|p| {
                            SubmoduleUpdate::failed(
                                p,
                                SubmoduleUpdateStatus::InvalidRepository,
                                e.to_string(),
                            )
                        })
                        .collect();
                }
            };

            let mut results = Vec::new();
            for path in &paths {
                if !records.iter().any(|r| &r.path == path) {
                    results.push(SubmoduleUpdate::failed(
                        path,
                        SubmoduleUpdateStatus::InvalidRepository,
                        format!("no submodule at {}", path),
                    ));
                }
            }

            let selected = records
                .iter()
                .filter(|r| paths.is_empty() || paths.contains(&r.path));
            for record in selected {
                let mut outcome = self.update_one(record, options).await;
                results.append(&mut outcome);
            }
            results
        })
    }

    async fn update_one(
        &self,
        record: &SubmoduleRecord,
        options: SubmoduleUpdateOptions,
    ) -> Vec<SubmoduleUpdate> {
        let path = record.path.as_str();
        let invalid = |message: String| {
            vec![SubmoduleUpdate::failed(
                path,
                SubmoduleUpdateStatus::InvalidRepository,
                message,
            )]
        };

        if !record.initialized {
            if !options.init {
                return invalid(format!("submodule {} is not initialized", path));
            }
            if let Err(e) = self.backend.init_submodule(path) {
                return invalid(e.to_string());
            }
            tracing::info!("Initialized submodule {}", path);
        }

        let sub_backend = match self.backend.open_submodule(path) {
            Ok(backend) => backend,
            Err(e) => return invalid(e.to_string()),
        };

        let controller = RemoteTransferController::new(
            sub_backend.clone(),
            self.negotiator.clone(),
            self.settings.clone(),
        );
        let fetched = match controller.fetch(Some("origin"), FetchOptions::default()) {
            Ok(session) => session.wait().await.map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = fetched {
            tracing::warn!("Fetch for submodule {} failed: {}", path, e);
            return vec![SubmoduleUpdate::failed(
                path,
                SubmoduleUpdateStatus::TransferFailed,
                e.to_string(),
            )];
        }

        let Some(recorded) = record.head_oid.as_deref() else {
            return invalid(format!("no commit recorded for {}", path));
        };
        match sub_backend.checkout_detached(recorded) {
            Ok(()) => {}
            Err(WorkcopyError::CommitNotFound(oid)) => {
                return vec![SubmoduleUpdate::failed(
                    path,
                    SubmoduleUpdateStatus::TransferFailed,
                    format!("recorded commit {} is not on the remote", oid),
                )];
            }
            Err(e) => return invalid(e.to_string()),
        }

        let mut results = vec![SubmoduleUpdate::updated(path)];
        if options.recursive {
            let nested = SubmoduleSynchronizer::new(
                sub_backend,
                self.negotiator.clone(),
                self.settings.clone(),
            );
            for mut update in nested.update_boxed(Vec::new(), options).await {
                update.path = format!("{}/{}", path, update.path);
                results.push(update);
            }
        }
        results
    }
}
