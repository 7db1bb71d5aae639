use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub mod error;
pub mod machine_size;
pub mod metadata;
pub mod target_options;

pub use error::{DriverError, Result};
pub use metadata::{ProjectMetadata, ProjectState, WorkspaceMetadata, WorkspaceStatus};
pub use target_options::{ProviderTarget, TargetOptions, TargetProperty};

// --- Entities (owned by the host) ---

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct GitRepository {
    pub id: String,
    pub url: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub name: String,
    pub repository: GitRepository,
    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,
    pub workspace_id: String,
}

// Env values carry API keys; only the keys are printed.
impl fmt::Debug for Project {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Project")
            .field("name", &self.name)
            .field("repository", &self.repository)
            .field("env_vars", &self.env_vars.keys().collect::<Vec<_>>())
            .field("workspace_id", &self.workspace_id)
            .finish()
    }
}

impl Project {
    /// Reject names and env keys that cannot be used verbatim in unit names and
    /// env files on the VM.
    pub fn validate(&self) -> Result<()> {
        if !is_safe_name(&self.name) {
            return Err(DriverError::validation(format!(
                "project name '{}' must match [A-Za-z0-9._-]+",
                self.name
            )));
        }
        if self.workspace_id.trim().is_empty() {
            return Err(DriverError::validation("project has no workspace id"));
        }
        if let Some(key) = self.env_vars.keys().find(|k| !is_env_key(k)) {
            return Err(DriverError::validation(format!(
                "environment variable name '{key}' is not a valid identifier"
            )));
        }
        // systemd's EnvironmentFile keeps escapes like `\n` literally, so a multi-line
        // value would reach the process changed. The value itself is never echoed.
        if let Some(key) = self
            .env_vars
            .iter()
            .find(|(_, v)| v.chars().any(char::is_control))
            .map(|(k, _)| k)
        {
            return Err(DriverError::validation(format!(
                "environment variable '{key}' contains control characters"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Workspace {
    pub id: String,
    pub name: String,
    pub target: String,
    #[serde(default)]
    pub projects: Vec<Project>,
}

fn is_safe_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

fn is_env_key(key: &str) -> bool {
    let mut chars = key.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

// --- Request / response envelopes ---

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceRequest {
    pub target_options: String,
    pub workspace: Workspace,
    /// Metadata returned by an earlier call for this workspace, if the host kept it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_metadata: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ProjectRequest {
    pub target_options: String,
    pub project: Project,
    /// Latest metadata of the parent workspace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_metadata: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_metadata: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectInfo {
    pub name: String,
    pub created: bool,
    pub is_running: bool,
    pub provider_metadata: String,
    pub workspace_id: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceInfo {
    pub name: String,
    #[serde(default)]
    pub projects: Vec<ProjectInfo>,
    pub provider_metadata: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ProviderInfo {
    pub name: String,
    pub version: String,
}
