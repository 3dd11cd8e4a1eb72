//! Credential negotiation
//!
//! Answers the credential requests a transfer raises: cached and stored
//! identities first, then ssh-agent and key files for SSH, then a human
//! prompt. Retries are bounded so a rejected password never loops.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};

use super::config::Settings;
use crate::error::{Result, WorkcopyError};
use crate::models::{Credential, CredentialAnswer, CredentialKind, CredentialRequest};

/// Service name for keyring storage
pub const SERVICE_NAME: &str = "workcopy-git";

const DEFAULT_SSH_KEYS: [&str; 3] = ["id_ed25519", "id_rsa", "id_ecdsa"];

/// Asks a human for a credential. Called on the blocking pool; may block.
pub trait CredentialPrompter: Send + Sync {
    fn prompt(&self, request: &CredentialRequest) -> CredentialAnswer;
}

impl<F> CredentialPrompter for F
where
    F: Fn(&CredentialRequest) -> CredentialAnswer + Send + Sync,
{
    fn prompt(&self, request: &CredentialRequest) -> CredentialAnswer {
        self(request)
    }
}

/// Prompter for unattended use: every request is canceled
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPrompter;

impl CredentialPrompter for NoPrompter {
    fn prompt(&self, _request: &CredentialRequest) -> CredentialAnswer {
        CredentialAnswer::Cancel
    }
}

/// A prompt waiting for its answer
#[derive(Debug)]
pub struct PendingPrompt {
    pub request: CredentialRequest,
    reply: oneshot::Sender<CredentialAnswer>,
}

impl PendingPrompt {
    pub fn respond(self, answer: CredentialAnswer) {
        // The transfer may already be gone
        let _ = self.reply.send(answer);
    }

    pub fn cancel(self) {
        self.respond(CredentialAnswer::Cancel);
    }
}

/// Forwards prompts to whoever holds the receiving end of the channel
#[derive(Debug, Clone)]
pub struct ChannelPrompter {
    tx: mpsc::UnboundedSender<PendingPrompt>,
}

impl ChannelPrompter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PendingPrompt>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl CredentialPrompter for ChannelPrompter {
    fn prompt(&self, request: &CredentialRequest) -> CredentialAnswer {
        let (reply, answer) = oneshot::channel();
        let pending = PendingPrompt {
            request: request.clone(),
            reply,
        };
        if self.tx.send(pending).is_err() {
            tracing::debug!("No prompt receiver for {}", request.host);
            return CredentialAnswer::Cancel;
        }
        answer.blocking_recv().unwrap_or(CredentialAnswer::Cancel)
    }
}

/// Secure storage for HTTP identities, keyed by host
pub trait CredentialStore: Send + Sync {
    fn load(&self, host: &str) -> Option<(String, String)>;

    fn save(&self, host: &str, username: &str, password: &str) -> bool;

    fn delete(&self, host: &str);
}

/// Store backed by the system keyring
#[cfg(not(target_os = "macos"))]
#[derive(Debug, Default)]
pub struct KeyringStore;

#[cfg(not(target_os = "macos"))]
impl KeyringStore {
    fn entry(account: &str) -> Option<keyring::Entry> {
        keyring::Entry::new(SERVICE_NAME, account).ok()
    }
}

#[cfg(not(target_os = "macos"))]
impl CredentialStore for KeyringStore {
    fn load(&self, host: &str) -> Option<(String, String)> {
        let username = Self::entry(&format!("{}_username", host))?
            .get_password()
            .ok()?;
        let password = Self::entry(&format!("{}_password", host))?
            .get_password()
            .ok()?;
        Some((username, password))
    }

    fn save(&self, host: &str, username: &str, password: &str) -> bool {
        let username_ok = Self::entry(&format!("{}_username", host))
            .is_some_and(|e| e.set_password(username).is_ok());
        let password_ok = Self::entry(&format!("{}_password", host))
            .is_some_and(|e| e.set_password(password).is_ok());
        username_ok && password_ok
    }

    fn delete(&self, host: &str) {
        for account in [format!("{}_username", host), format!("{}_password", host)] {
            if let Some(entry) = Self::entry(&account) {
                let _ = entry.delete_credential();
            }
        }
    }
}

/// In-process store
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, (String, String)>>,
}

impl CredentialStore for MemoryStore {
    fn load(&self, host: &str) -> Option<(String, String)> {
        let entries = self.entries.lock().ok()?;
        entries.get(host).cloned()
    }

    fn save(&self, host: &str, username: &str, password: &str) -> bool {
        match self.entries.lock() {
            Ok(mut entries) => {
                entries.insert(host.to_string(), (username.to_string(), password.to_string()));
                true
            }
            Err(_) => false,
        }
    }

    fn delete(&self, host: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(host);
        }
    }
}

/// Platform store: the keyring where it is usable, memory elsewhere
pub fn default_store() -> Arc<dyn CredentialStore> {
    #[cfg(not(target_os = "macos"))]
    {
        Arc::new(KeyringStore)
    }
    #[cfg(target_os = "macos")]
    {
        Arc::new(MemoryStore::default())
    }
}

/// Answers credential requests for transfers
pub struct CredentialNegotiator {
    settings: Settings,
    prompter: Arc<dyn CredentialPrompter>,
    store: Option<Arc<dyn CredentialStore>>,
    /// Last identity accepted per host
    cache: Mutex<HashMap<String, (String, String)>>,
}

impl CredentialNegotiator {
    pub fn new(settings: Settings, prompter: Arc<dyn CredentialPrompter>) -> Self {
        Self {
            settings,
            prompter,
            store: None,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Negotiator configured from `settings`, with the platform store
    /// attached when `store_credentials` is set
    pub fn from_settings(settings: Settings, prompter: Arc<dyn CredentialPrompter>) -> Self {
        let store_credentials = settings.store_credentials;
        let negotiator = Self::new(settings, prompter);
        if store_credentials {
            negotiator.with_store(default_store())
        } else {
            negotiator
        }
    }

    pub fn with_store(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn has_store(&self) -> bool {
        self.store.is_some()
    }

    /// Seed the per-host cache
    pub fn remember(&self, host: &str, username: &str, password: &str) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(host.to_string(), (username.to_string(), password.to_string()));
        }
    }

    pub fn forget(&self, host: &str) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.remove(host);
        }
        if let Some(store) = &self.store {
            store.delete(host);
        }
    }

    fn cached(&self, host: &str) -> Option<(String, String)> {
        let cache = self.cache.lock().ok()?;
        cache.get(host).cloned()
    }

    fn evict(&self, host: &str) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.remove(host);
        }
    }

    fn exhausted(&self, request: &CredentialRequest, prompted: u32) -> Result<()> {
        if prompted >= self.settings.max_credential_attempts {
            return Err(WorkcopyError::Backend(format!(
                "authentication failed for {} after {} attempts",
                request.host, prompted
            )));
        }
        Ok(())
    }

    /// Answer one request of a transfer session
    pub fn provide(&self, request: &CredentialRequest) -> Result<CredentialAnswer> {
        tracing::debug!(
            "Credential request: kind={:?}, host={}, attempt={}",
            request.kind,
            request.host,
            request.attempt
        );
        match request.kind {
            CredentialKind::HttpBasic => self.provide_http(request),
            CredentialKind::SshKeyFile => self.provide_ssh_key(request),
            CredentialKind::SshPassphrase => {
                self.exhausted(request, request.attempt)?;
                Ok(self.prompter.prompt(request))
            }
        }
    }

    fn provide_http(&self, request: &CredentialRequest) -> Result<CredentialAnswer> {
        let host = request.host.as_str();

        if request.attempt > 0 {
            // The previous answer was rejected
            self.evict(host);
            if self.settings.is_token_only_host(host) {
                return Err(WorkcopyError::BasicAuthUnsupported(host.to_string()));
            }
            self.exhausted(request, request.attempt)?;
        } else {
            if self.settings.cache_credentials {
                if let Some((username, password)) = self.cached(host) {
                    tracing::debug!("Using cached credentials for {}", host);
                    return Ok(CredentialAnswer::Provide(Credential::UserPass {
                        username,
                        password,
                    }));
                }
            }
            if self.settings.store_credentials {
                if let Some((username, password)) = self.store.as_ref().and_then(|s| s.load(host)) {
                    tracing::debug!("Using stored credentials for {}", host);
                    return Ok(CredentialAnswer::Provide(Credential::UserPass {
                        username,
                        password,
                    }));
                }
            }
        }

        let answer = self.prompter.prompt(request);
        if let CredentialAnswer::Provide(Credential::UserPass { username, password }) = &answer {
            if self.settings.cache_credentials {
                self.remember(host, username, password);
            }
            if self.settings.store_credentials {
                if let Some(store) = &self.store {
                    if !store.save(host, username, password) {
                        tracing::warn!("Failed to store credentials for {} (cached only)", host);
                    }
                }
            }
        }
        Ok(answer)
    }

    /// Key files tried before prompting, configured key first
    fn key_candidates(&self) -> Vec<PathBuf> {
        let mut keys: Vec<PathBuf> = self.settings.ssh_key_path.iter().cloned().collect();
        if let Some(home) = dirs::home_dir() {
            keys.extend(
                DEFAULT_SSH_KEYS
                    .iter()
                    .map(|name| home.join(".ssh").join(name)),
            );
        }
        keys.retain(|key| key.exists());
        keys.dedup();
        keys
    }

    fn provide_ssh_key(&self, request: &CredentialRequest) -> Result<CredentialAnswer> {
        let username = request.username.clone().unwrap_or_else(|| "git".to_string());
        let mut step = request.attempt;

        if self.settings.use_ssh_agent {
            if step == 0 {
                tracing::debug!("Trying SSH agent for user: {}", username);
                return Ok(CredentialAnswer::Provide(Credential::SshAgent { username }));
            }
            step -= 1;
        }

        let keys = self.key_candidates();
        if let Some(private_key) = keys.get(step as usize) {
            tracing::debug!("Trying SSH key: {:?}", private_key);
            let public_key = PathBuf::from(format!("{}.pub", private_key.display()));
            return Ok(CredentialAnswer::Provide(Credential::SshKey {
                username,
                public_key: public_key.exists().then_some(public_key),
                private_key: private_key.clone(),
                passphrase: None,
            }));
        }

        self.exhausted(request, step - keys.len() as u32)?;
        Ok(self.prompter.prompt(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn http_request(url: &str, attempt: u32) -> CredentialRequest {
        CredentialRequest::new(CredentialKind::HttpBasic, url).with_attempt(attempt)
    }

    fn user_pass(username: &str, password: &str) -> CredentialAnswer {
        CredentialAnswer::Provide(Credential::UserPass {
            username: username.to_string(),
            password: password.to_string(),
        })
    }

    #[test]
    fn test_prompt_answer_is_cached_per_host() {
        let prompts = Arc::new(AtomicUsize::new(0));
        let counter = prompts.clone();
        let negotiator = CredentialNegotiator::new(
            Settings::default(),
            Arc::new(move |_: &CredentialRequest| {
                counter.fetch_add(1, Ordering::SeqCst);
                user_pass("alice", "secret")
            }),
        );

        let url = "https://git.example.com/repo.git";
        assert_eq!(negotiator.provide(&http_request(url, 0)).unwrap(), user_pass("alice", "secret"));
        assert_eq!(negotiator.provide(&http_request(url, 0)).unwrap(), user_pass("alice", "secret"));
        assert_eq!(prompts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_token_only_host_retry_is_rejected() {
        let negotiator = CredentialNegotiator::new(
            Settings::default(),
            Arc::new(|_: &CredentialRequest| user_pass("alice", "password")),
        );
        let result = negotiator.provide(&http_request("https://github.com/a/b.git", 1));
        assert!(matches!(
            result,
            Err(WorkcopyError::BasicAuthUnsupported(host)) if host == "github.com"
        ));
    }

    #[test]
    fn test_retries_are_bounded() {
        let negotiator = CredentialNegotiator::new(
            Settings::default(),
            Arc::new(|_: &CredentialRequest| user_pass("alice", "wrong")),
        );
        let url = "https://git.example.com/repo.git";
        assert!(negotiator.provide(&http_request(url, 2)).is_ok());
        let result = negotiator.provide(&http_request(url, 3));
        assert!(matches!(result, Err(WorkcopyError::Backend(msg)) if msg.contains("authentication failed")));
    }

    #[test]
    fn test_stored_credentials_used_first() {
        let store = Arc::new(MemoryStore::default());
        store.save("git.example.com", "bob", "hunter2");
        let settings = Settings {
            store_credentials: true,
            ..Settings::default()
        };
        let negotiator =
            CredentialNegotiator::new(settings, Arc::new(NoPrompter)).with_store(store);
        let answer = negotiator
            .provide(&http_request("https://git.example.com/r.git", 0))
            .unwrap();
        assert_eq!(answer, user_pass("bob", "hunter2"));
    }

    #[test]
    fn test_ssh_agent_tried_first() {
        let negotiator = CredentialNegotiator::new(Settings::default(), Arc::new(NoPrompter));
        let request = CredentialRequest::new(CredentialKind::SshKeyFile, "git@example.com:a/b.git")
            .with_username(Some("git"));
        let answer = negotiator.provide(&request).unwrap();
        assert_eq!(
            answer,
            CredentialAnswer::Provide(Credential::SshAgent {
                username: "git".to_string()
            })
        );
    }

    #[test]
    fn test_channel_prompter_round_trip() {
        let (prompter, mut rx) = ChannelPrompter::new();
        let responder = std::thread::spawn(move || {
            let pending = rx.blocking_recv().unwrap();
            assert_eq!(pending.request.host, "git.example.com");
            pending.respond(user_pass("carol", "pw"));
        });
        let answer = prompter.prompt(&http_request("https://git.example.com/r.git", 0));
        responder.join().unwrap();
        assert_eq!(answer, user_pass("carol", "pw"));
    }

    #[test]
    fn test_dropped_receiver_cancels() {
        let (prompter, rx) = ChannelPrompter::new();
        drop(rx);
        let answer = prompter.prompt(&http_request("https://git.example.com/r.git", 0));
        assert_eq!(answer, CredentialAnswer::Cancel);
    }

    #[test]
    fn test_store_attached_only_when_enabled() {
        let enabled = Settings {
            store_credentials: true,
            ..Settings::default()
        };
        assert!(CredentialNegotiator::from_settings(enabled, Arc::new(NoPrompter)).has_store());

        let disabled = Settings {
            store_credentials: false,
            ..Settings::default()
        };
        assert!(!CredentialNegotiator::from_settings(disabled, Arc::new(NoPrompter)).has_store());
    }
}
