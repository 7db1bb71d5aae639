use std::path::PathBuf;

use droplet_common::{DriverError, Result};
use serde::{Deserialize, Serialize};

/// Sent once by the host before any lifecycle call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeProviderRequest {
    /// Directory on the VM under which project checkouts live.
    pub base_path: String,
    pub agent_download_url: String,
    pub agent_version: String,
    pub server_url: String,
    pub api_url: String,
    pub server_port: u16,
    pub api_port: u16,
    pub logs_dir: PathBuf,
}

/// Read-only configuration frozen by `initialize`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverContext {
    pub base_path: String,
    pub agent_download_url: String,
    pub agent_version: String,
    pub server_url: String,
    pub api_url: String,
    pub server_port: u16,
    pub api_port: u16,
    pub logs_dir: PathBuf,
}

impl DriverContext {
    pub fn from_request(req: InitializeProviderRequest) -> Result<Self> {
        let required = [
            ("basePath", &req.base_path),
            ("agentDownloadUrl", &req.agent_download_url),
            ("agentVersion", &req.agent_version),
        ];
        if let Some((name, _)) = required.iter().find(|(_, v)| v.trim().is_empty()) {
            return Err(DriverError::validation(format!("{name} must not be empty")));
        }
        if req.logs_dir.as_os_str().is_empty() {
            return Err(DriverError::validation("logsDir must not be empty"));
        }
        if !req.base_path.trim().starts_with('/') {
            return Err(DriverError::validation(format!(
                "basePath '{}' must be an absolute path",
                req.base_path
            )));
        }

        std::fs::create_dir_all(&req.logs_dir).map_err(|e| {
            DriverError::validation(format!(
                "cannot create logs dir {}: {e}",
                req.logs_dir.display()
            ))
        })?;

        Ok(Self {
            base_path: req.base_path.trim().trim_end_matches('/').to_string(),
            agent_download_url: req.agent_download_url.trim().to_string(),
            agent_version: req.agent_version.trim().to_string(),
            server_url: req.server_url,
            api_url: req.api_url,
            server_port: req.server_port,
            api_port: req.api_port,
            logs_dir: req.logs_dir,
        })
    }
}
