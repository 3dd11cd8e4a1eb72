//! Remote transfers: fetch, pull and push sessions
//!
//! Each call validates synchronously, then returns a [`TransferSession`]
//! while the transfer runs on the blocking pool. Events for a session arrive
//! in order on one stream and always end with exactly one terminal event.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use super::blocking;
use super::cancellation::{CancellationRegistry, CancellationToken};
use super::config::Settings;
use super::credentials_service::CredentialNegotiator;
use super::submodule_service::SubmoduleSynchronizer;
use crate::backend::{GitBackend, TransferHooks};
use crate::error::{ErrorResponse, Result, WorkcopyError, NON_FAST_FORWARD_HINT};
use crate::models::{
    Credential, CredentialAnswer, CredentialRequest, FetchOptions, OperationState, PullMode,
    PushOptions, RefUpdate, SubmoduleUpdateOptions, TransferDirection, TransferEvent,
    TransferProgress, TransferSummary, UpstreamInfo,
};

/// Integrates a fetched upstream into the working copy after a pull
pub trait PullIntegration: Send + Sync {
    /// Fail when an integration could not start now, before any network I/O
    fn ensure_idle(&self) -> Result<()>;

    /// `upstream` is the remote-tracking name, e.g. `origin/main`
    fn integrate(&self, upstream: &str, mode: PullMode) -> Result<OperationState>;
}

/// Handle to one running transfer
#[derive(Debug)]
pub struct TransferSession {
    id: String,
    remote: String,
    direction: TransferDirection,
    force: bool,
    token: CancellationToken,
    progress: watch::Receiver<TransferProgress>,
    events: mpsc::UnboundedReceiver<TransferEvent>,
}

impl TransferSession {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn direction(&self) -> TransferDirection {
        self.direction
    }

    pub fn is_force(&self) -> bool {
        self.force
    }

    /// Request cancellation; takes effect at the next checked I/O boundary
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Latest progress counters
    pub fn progress(&self) -> TransferProgress {
        *self.progress.borrow()
    }

    /// Next event; `None` once the terminal event has been taken
    pub async fn next_event(&mut self) -> Option<TransferEvent> {
        self.events.recv().await
    }

    /// Drain the stream and return the terminal result
    pub async fn wait(mut self) -> Result<TransferSummary> {
        while let Some(event) = self.events.recv().await {
            match event {
                TransferEvent::Completed(summary) => return Ok(summary),
                TransferEvent::Canceled => return Err(WorkcopyError::TransferCanceled),
                TransferEvent::Failed(response) => return Err(response.into()),
                _ => {}
            }
        }
        Err(WorkcopyError::Backend(
            "transfer ended without a result".to_string(),
        ))
    }
}

/// Sending half of a session, owned by the transfer task
struct SessionFeed {
    id: String,
    remote: String,
    direction: TransferDirection,
    token: CancellationToken,
    events: mpsc::UnboundedSender<TransferEvent>,
    progress: Arc<watch::Sender<TransferProgress>>,
}

impl SessionFeed {
    fn emit(&self, event: TransferEvent) {
        // A dropped session handle just stops listening
        let _ = self.events.send(event);
    }

    fn hooks(&self, negotiator: Arc<CredentialNegotiator>, ignore_ssl: bool) -> SessionHooks {
        SessionHooks {
            negotiator,
            token: self.token.clone(),
            events: self.events.clone(),
            progress: self.progress.clone(),
            ignore_ssl,
        }
    }

    fn finish(&self, result: Result<(Vec<RefUpdate>, Option<OperationState>)>) {
        let event = match result {
            Ok((updated_refs, integration)) => {
                tracing::info!("{:?} {} finished", self.direction, self.id);
                TransferEvent::Completed(TransferSummary {
                    session_id: self.id.clone(),
                    remote: self.remote.clone(),
                    direction: self.direction,
                    progress: *self.progress.borrow(),
                    updated_refs,
                    integration,
                    finished_at: chrono::Utc::now(),
                })
            }
            Err(WorkcopyError::TransferCanceled) => {
                tracing::info!("{:?} {} canceled", self.direction, self.id);
                TransferEvent::Canceled
            }
            Err(e) => {
                tracing::warn!("{:?} {} failed: {}", self.direction, self.id, e);
                TransferEvent::Failed(ErrorResponse::from(e))
            }
        };
        self.emit(event);
    }
}

/// Transfer callbacks bridging the backend to the session stream
struct SessionHooks {
    negotiator: Arc<CredentialNegotiator>,
    token: CancellationToken,
    events: mpsc::UnboundedSender<TransferEvent>,
    progress: Arc<watch::Sender<TransferProgress>>,
    ignore_ssl: bool,
}

impl TransferHooks for SessionHooks {
    fn credentials(&mut self, request: CredentialRequest) -> Result<Credential> {
        if self.token.is_cancelled() {
            return Err(WorkcopyError::TransferCanceled);
        }
        let _ = self.events.send(TransferEvent::CredentialRequested {
            kind: request.kind,
            host: request.host.clone(),
        });
        match self.negotiator.provide(&request)? {
            CredentialAnswer::Provide(credential) => Ok(credential),
            CredentialAnswer::Cancel => {
                self.token.cancel();
                Err(WorkcopyError::TransferCanceled)
            }
        }
    }

    fn progress(&mut self, progress: TransferProgress) -> bool {
        if self.token.is_cancelled() {
            return false;
        }
        self.progress.send_replace(progress);
        let _ = self.events.send(TransferEvent::Progress(progress));
        true
    }

    fn ref_updated(&mut self, update: RefUpdate) {
        let _ = self.events.send(TransferEvent::RefUpdated(update));
    }

    fn is_canceled(&self) -> bool {
        self.token.is_cancelled()
    }

    fn accept_invalid_certificate(&self, _host: &str) -> bool {
        self.ignore_ssl
    }
}

/// Starts and tracks transfer sessions for one repository
#[derive(Clone)]
pub struct RemoteTransferController {
    backend: Arc<dyn GitBackend>,
    negotiator: Arc<CredentialNegotiator>,
    settings: Settings,
    registry: Arc<CancellationRegistry>,
}

impl RemoteTransferController {
    pub fn new(
        backend: Arc<dyn GitBackend>,
        negotiator: Arc<CredentialNegotiator>,
        settings: Settings,
    ) -> Self {
        Self {
            backend,
            negotiator,
            settings,
            registry: Arc::new(CancellationRegistry::default()),
        }
    }

    pub fn negotiator(&self) -> &Arc<CredentialNegotiator> {
        &self.negotiator
    }

    /// Cancel a running session by id
    pub fn cancel(&self, session_id: &str) -> bool {
        self.registry.cancel(session_id)
    }

    pub fn active_sessions(&self) -> Vec<String> {
        self.registry.active()
    }

    fn open_session(
        &self,
        remote: &str,
        direction: TransferDirection,
        force: bool,
    ) -> (TransferSession, SessionFeed) {
        let id = uuid::Uuid::new_v4().to_string();
        let token = self.registry.register(&id);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (progress_tx, progress_rx) = watch::channel(TransferProgress::default());

        tracing::info!("{:?} {} started against {}", direction, id, remote);
        let session = TransferSession {
            id: id.clone(),
            remote: remote.to_string(),
            direction,
            force,
            token: token.clone(),
            progress: progress_rx,
            events: events_rx,
        };
        let feed = SessionFeed {
            id,
            remote: remote.to_string(),
            direction,
            token,
            events: events_tx,
            progress: Arc::new(progress_tx),
        };
        (session, feed)
    }

    /// Explicit remote, else the branch upstream's remote, else the default remote
    fn resolve_remote(&self, remote: Option<&str>) -> Result<String> {
        let remotes = self.backend.remotes()?;
        let exists = |name: &str| remotes.iter().any(|r| r.name == name);

        if let Some(name) = remote {
            if !exists(name) {
                return Err(WorkcopyError::RemoteNotFound(name.to_string()));
            }
            return Ok(name.to_string());
        }

        if let Some(branch) = self.backend.current_branch()? {
            if let Some(upstream) = self.backend.upstream(&branch)? {
                if exists(&upstream.remote) {
                    return Ok(upstream.remote);
                }
            }
        }

        let fallback = self.settings.default_remote.as_deref().unwrap_or("origin");
        if exists(fallback) {
            return Ok(fallback.to_string());
        }
        Err(WorkcopyError::NoUpstream(
            "no upstream configured and no default remote".to_string(),
        ))
    }

    fn fetch_work(
        &self,
        feed: &SessionFeed,
        remote: String,
        options: FetchOptions,
    ) -> impl FnOnce() -> Result<Vec<RefUpdate>> + Send + 'static {
        let backend = self.backend.clone();
        let mut hooks = feed.hooks(self.negotiator.clone(), self.settings.ignore_ssl_errors);
        move || {
            if hooks.is_canceled() {
                return Err(WorkcopyError::TransferCanceled);
            }
            backend.fetch(&remote, &options, &mut hooks)
        }
    }

    /// Fetch from `remote` (resolved when omitted)
    pub fn fetch(&self, remote: Option<&str>, options: FetchOptions) -> Result<TransferSession> {
        let remote = self.resolve_remote(remote)?;
        let options = FetchOptions {
            prune: Some(options.prune.unwrap_or(self.settings.prune_on_fetch)),
            ..options
        };

        let (session, feed) = self.open_session(&remote, TransferDirection::Fetch, false);
        let work = self.fetch_work(&feed, remote, options);
        let registry = self.registry.clone();

        tokio::spawn(async move {
            let result = blocking(work).await.map(|updates| (updates, None));
            registry.remove(&feed.id);
            feed.finish(result);
        });
        Ok(session)
    }

    /// Fetch the upstream of the current branch and integrate it
    pub fn pull(
        &self,
        remote: Option<&str>,
        branch: Option<&str>,
        mode: PullMode,
        integration: Arc<dyn PullIntegration>,
    ) -> Result<TransferSession> {
        integration.ensure_idle()?;
        let current = self.backend.current_branch()?.ok_or_else(|| {
            WorkcopyError::OperationConflict("cannot pull into a detached HEAD".to_string())
        })?;

        let upstream = match (remote, branch) {
            (_, Some(branch)) => UpstreamInfo {
                remote: self.resolve_remote(remote)?,
                branch: branch.to_string(),
            },
            (remote, None) => {
                let configured = self.backend.upstream(&current)?;
                match configured {
                    Some(upstream) if remote.map_or(true, |r| r == upstream.remote) => upstream,
                    _ => {
                        return Err(WorkcopyError::NoUpstream(format!(
                            "branch '{}' has no upstream to pull from",
                            current
                        )))
                    }
                }
            }
        };

        let (session, feed) = self.open_session(&upstream.remote, TransferDirection::Pull, false);
        let work = self.fetch_work(
            &feed,
            upstream.remote.clone(),
            FetchOptions {
                prune: Some(self.settings.prune_on_fetch),
                depth: None,
            },
        );
        let registry = self.registry.clone();
        let submodules = self.settings.update_submodules_after_pull.then(|| {
            SubmoduleSynchronizer::new(
                self.backend.clone(),
                self.negotiator.clone(),
                self.settings.clone(),
            )
        });

        tokio::spawn(async move {
            let result = async {
                let updates = blocking(work).await?;
                if feed.token.is_cancelled() {
                    return Err(WorkcopyError::TransferCanceled);
                }

                let tracking = upstream.tracking_name();
                let state = blocking(move || integration.integrate(&tracking, mode)).await?;
                tracing::info!("Pull integration of {} ended {:?}", upstream.tracking_name(), state);

                if state == OperationState::Completed {
                    if let Some(synchronizer) = submodules {
                        let options = SubmoduleUpdateOptions {
                            init: true,
                            recursive: true,
                        };
                        for update in synchronizer.update(&[], options).await {
                            tracing::debug!("Submodule {} after pull: {:?}", update.path, update.status);
                        }
                    }
                }
                Ok((updates, Some(state)))
            }
            .await;
            registry.remove(&feed.id);
            feed.finish(result);
        });
        Ok(session)
    }

    /// Push `branch` (the current branch when omitted)
    pub fn push(
        &self,
        remote: Option<&str>,
        branch: Option<&str>,
        options: PushOptions,
    ) -> Result<TransferSession> {
        let branch = match branch {
            Some(branch) => branch.to_string(),
            None => self.backend.current_branch()?.ok_or_else(|| {
                WorkcopyError::OperationConflict("cannot push a detached HEAD".to_string())
            })?,
        };
        let remote = self.resolve_remote(remote)?;
        let upstream = self.backend.upstream(&branch)?;

        let destination = match (&options.to, &upstream) {
            (Some(to), _) => to.clone(),
            (None, Some(upstream)) if upstream.remote == remote => upstream.branch.clone(),
            (None, _) if options.set_upstream => branch.clone(),
            _ => {
                return Err(WorkcopyError::NoUpstream(format!(
                    "branch '{}' has no upstream; push with set_upstream or an explicit target",
                    branch
                )))
            }
        };

        let local = self.backend.resolve(&format!("refs/heads/{}", branch))?.ok_or_else(|| {
            WorkcopyError::Backend(format!("branch '{}' not found", branch))
        })?;
        let tracking = self.backend
            .resolve(&format!("refs/remotes/{}/{}", remote, destination))?;
        if let Some(tracking) = tracking {
            if !options.force && !self.backend.is_descendant(&local, &tracking)? {
                return Err(WorkcopyError::Backend(format!(
                    "'{}' has diverged from {}/{}. {}",
                    branch, remote, destination, NON_FAST_FORWARD_HINT
                )));
            }
        }

        let force_prefix = if options.force { "+" } else { "" };
        let mut refspecs = vec![format!(
            "{}refs/heads/{}:refs/heads/{}",
            force_prefix, branch, destination
        )];
        if options.push_tags {
            refspecs.extend(
                self.backend
                    .local_tags()?
                    .into_iter()
                    .map(|tag| format!("refs/tags/{}:refs/tags/{}", tag, tag)),
            );
        }

        let (session, feed) = self.open_session(&remote, TransferDirection::Push, options.force);
        let backend = self.backend.clone();
        let mut hooks = feed.hooks(self.negotiator.clone(), self.settings.ignore_ssl_errors);
        let registry = self.registry.clone();
        let set_upstream = options.set_upstream.then(|| {
            (
                branch.clone(),
                UpstreamInfo {
                    remote: remote.clone(),
                    branch: destination.clone(),
                },
            )
        });

        tokio::spawn(async move {
            let result = blocking(move || {
                if hooks.is_canceled() {
                    return Err(WorkcopyError::TransferCanceled);
                }
                let updates = backend.push(&remote, &refspecs, &mut hooks)?;
                if let Some((branch, upstream)) = set_upstream {
                    backend.set_upstream(&branch, &upstream)?;
                }
                Ok((updates, None))
            })
            .await;
            registry.remove(&feed.id);
            feed.finish(result);
        });
        Ok(session)
    }
}
