//! Submodule models

use serde::{Deserialize, Serialize};

/// Submodule as configured in `.gitmodules` and recorded by the superproject
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmoduleRecord {
    pub name: String,
    pub path: String,
    pub url: Option<String>,
    pub branch: Option<String>,
    pub initialized: bool,
    /// Commit recorded in the superproject
    pub head_oid: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmoduleUpdateOptions {
    pub init: bool,
    pub recursive: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SubmoduleUpdateStatus {
    Updated,
    InvalidRepository,
    TransferFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmoduleUpdate {
    pub path: String,
    pub status: SubmoduleUpdateStatus,
    pub message: Option<String>,
}

impl SubmoduleUpdate {
    pub fn updated(path: &str) -> Self {
        Self {
            path: path.to_string(),
            status: SubmoduleUpdateStatus::Updated,
            message: None,
        }
    }

    pub fn failed(path: &str, status: SubmoduleUpdateStatus, message: impl Into<String>) -> Self {
        Self {
            path: path.to_string(),
            status,
            message: Some(message.into()),
        }
    }
}
