//! Shared fixtures for the integration tests

#![allow(dead_code)]

use std::sync::Arc;

use workcopy::models::{
    Credential, CredentialAnswer, CredentialRequest, TransferEvent, UpstreamInfo,
};
use workcopy::services::{CredentialPrompter, NoPrompter, OperationOrchestrator, TransferSession};
use workcopy::{GitBackend, MemoryBackend, MemoryNetwork, Settings};

pub const ORIGIN: &str = "https://git.example.com/team/project.git";

/// A local repository on `main` tracking `origin/main` on a simulated server
pub struct Workspace {
    pub network: MemoryNetwork,
    pub backend: Arc<MemoryBackend>,
    pub orchestrator: OperationOrchestrator,
}

impl Workspace {
    pub fn new() -> Self {
        Self::with(Settings::default(), Arc::new(NoPrompter))
    }

    pub fn with(settings: Settings, prompter: Arc<dyn CredentialPrompter>) -> Self {
        let network = MemoryNetwork::new();
        let backend = Arc::new(MemoryBackend::new(&network));
        backend.commit("initial", &[("f.txt", "a\nb\nc\n")]);
        backend.add_remote("origin", ORIGIN);
        let head = backend.head_oid().expect("initial commit");
        network.set_remote_branch(ORIGIN, "main", &head);
        backend
            .set_upstream(
                "main",
                &UpstreamInfo {
                    remote: "origin".to_string(),
                    branch: "main".to_string(),
                },
            )
            .expect("set upstream");

        let orchestrator = OperationOrchestrator::open(backend.clone(), settings, prompter)
            .expect("open orchestrator");
        Self {
            network,
            backend,
            orchestrator,
        }
    }

    /// Commit on top of the server's `main` as another developer would
    pub fn remote_commit(&self, files: &[(&str, &str)], message: &str) -> String {
        let tip = self
            .network
            .remote_branch(ORIGIN, "main")
            .expect("remote main");
        let oid = self.network.create_commit(&[tip.as_str()], files, message);
        self.network.set_remote_branch(ORIGIN, "main", &oid);
        oid
    }
}

/// Prompter that answers every request with the same identity
pub fn password_prompter(username: &str, password: &str) -> Arc<dyn CredentialPrompter> {
    let (username, password) = (username.to_string(), password.to_string());
    Arc::new(move |_request: &CredentialRequest| {
        CredentialAnswer::Provide(Credential::UserPass {
            username: username.clone(),
            password: password.clone(),
        })
    })
}

/// Every event of a session, terminal event last
pub async fn collect_events(mut session: TransferSession) -> Vec<TransferEvent> {
    let mut events = Vec::new();
    while let Some(event) = session.next_event().await {
        events.push(event);
    }
    events
}

pub fn terminal_count(events: &[TransferEvent]) -> usize {
    events.iter().filter(|e| e.is_terminal()).count()
}
