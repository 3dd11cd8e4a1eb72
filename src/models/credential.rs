//! Credential negotiation models

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CredentialKind {
    HttpBasic,
    SshPassphrase,
    SshKeyFile,
}

/// Raised by the backend while a transfer is suspended waiting for an answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialRequest {
    pub kind: CredentialKind,
    pub url: String,
    pub host: String,
    pub username: Option<String>,
    pub key_path: Option<PathBuf>,
    /// Number of answers of this kind already rejected in the session
    pub attempt: u32,
}

impl CredentialRequest {
    pub fn new(kind: CredentialKind, url: &str) -> Self {
        Self {
            kind,
            url: url.to_string(),
            host: extract_host(url).unwrap_or_default(),
            username: None,
            key_path: None,
            attempt: 0,
        }
    }

    pub fn with_username(mut self, username: Option<&str>) -> Self {
        self.username = username.map(|s| s.to_string());
        self
    }

    pub fn with_key_path(mut self, key_path: Option<PathBuf>) -> Self {
        self.key_path = key_path;
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }
}

#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    UserPass {
        username: String,
        password: String,
    },
    SshKey {
        username: String,
        public_key: Option<PathBuf>,
        private_key: PathBuf,
        passphrase: Option<String>,
    },
    SshAgent {
        username: String,
    },
}

impl Credential {
    pub fn username(&self) -> &str {
        match self {
            Credential::UserPass { username, .. }
            | Credential::SshKey { username, .. }
            | Credential::SshAgent { username } => username,
        }
    }
}

// Secrets never reach logs
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::UserPass { username, password } => f
                .debug_struct("UserPass")
                .field("username", username)
                .field("password_len", &password.len())
                .finish(),
            Credential::SshKey {
                username,
                private_key,
                passphrase,
                ..
            } => f
                .debug_struct("SshKey")
                .field("username", username)
                .field("private_key", private_key)
                .field("has_passphrase", &passphrase.is_some())
                .finish(),
            Credential::SshAgent { username } => f
                .debug_struct("SshAgent")
                .field("username", username)
                .finish(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialAnswer {
    Provide(Credential),
    Cancel,
}

/// Extract host from a git URL
pub fn extract_host(url: &str) -> Option<String> {
    // Handle SSH URLs like git@github.com:user/repo.git
    if url.contains('@') && url.contains(':') && !url.contains("://") {
        let (_, rest) = url.split_once('@')?;
        let host = rest.split(':').next()?;
        if !host.is_empty() {
            return Some(host.to_string());
        }
    }

    if let Ok(parsed) = url::Url::parse(url) {
        return parsed.host_str().map(|s| s.to_string());
    }

    None
}
