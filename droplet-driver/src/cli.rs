use droplet_common::{DriverError, ProjectRequest, Result, WorkspaceRequest};
use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{InitializeProviderRequest, WorkspaceProvider};

/// What the binary reads from stdin.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invocation {
    #[serde(default)]
    pub initialize: Option<InitializeProviderRequest>,
    #[serde(default)]
    pub request: Value,
}

#[derive(Parser, Debug)]
#[command(name = "droplet-driver")]
#[command(about = "DigitalOcean workspace provider: reads one request on stdin, writes the result on stdout")]
#[command(version)]
pub struct Args {
    #[command(subcommand)]
    pub operation: Operation,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
#[command(rename_all = "snake_case")]
pub enum Operation {
    /// Provider name and version
    GetInfo,
    /// Properties a target accepts
    GetTargetManifest,
    /// Preconfigured targets (none)
    GetDefaultTargets,
    /// Apply the `initialize` block and do nothing else
    Initialize,
    CreateWorkspace,
    StartWorkspace,
    StopWorkspace,
    DestroyWorkspace,
    GetWorkspaceInfo,
    CreateProject,
    StartProject,
    StopProject,
    DestroyProject,
    GetProjectInfo,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::GetInfo => "get_info",
            Operation::GetTargetManifest => "get_target_manifest",
            Operation::GetDefaultTargets => "get_default_targets",
            Operation::Initialize => "initialize",
            Operation::CreateWorkspace => "create_workspace",
            Operation::StartWorkspace => "start_workspace",
            Operation::StopWorkspace => "stop_workspace",
            Operation::DestroyWorkspace => "destroy_workspace",
            Operation::GetWorkspaceInfo => "get_workspace_info",
            Operation::CreateProject => "create_project",
            Operation::StartProject => "start_project",
            Operation::StopProject => "stop_project",
            Operation::DestroyProject => "destroy_project",
            Operation::GetProjectInfo => "get_project_info",
        }
    }
}

fn parse<T: DeserializeOwned>(value: Value, what: &str) -> Result<T> {
    serde_json::from_value(value).map_err(|e| DriverError::validation(format!("malformed {what}: {e}")))
}

fn workspace_request(value: Value) -> Result<WorkspaceRequest> {
    parse(value, "workspace request")
}

fn project_request(value: Value) -> Result<ProjectRequest> {
    parse(value, "project request")
}

fn to_value<T: Serialize>(v: T) -> Result<Value> {
    serde_json::to_value(v).map_err(|e| DriverError::Decode(e.to_string()))
}

/// Run one operation. The `initialize` block, when present, is applied first.
pub async fn dispatch(driver: &dyn WorkspaceProvider, operation: Operation, input: &str) -> Result<Value> {
    let invocation: Invocation = if input.trim().is_empty() {
        Invocation {
            initialize: None,
            request: Value::Null,
        }
    } else {
        serde_json::from_str(input).map_err(|e| DriverError::validation(format!("malformed input: {e}")))?
    };

    if operation == Operation::Initialize && invocation.initialize.is_none() {
        return Err(DriverError::validation("initialize requires an \"initialize\" block"));
    }
    if let Some(init) = invocation.initialize {
        driver.initialize(init).await?;
    }
    let request = invocation.request;

    match operation {
        Operation::GetInfo => to_value(driver.get_info().await?),
        Operation::GetTargetManifest => to_value(driver.get_target_manifest().await?),
        Operation::GetDefaultTargets => to_value(driver.get_default_targets().await?),
        Operation::Initialize => Ok(Value::Null),
        Operation::CreateWorkspace => to_value(driver.create_workspace(&workspace_request(request)?).await?),
        Operation::StartWorkspace => to_value(driver.start_workspace(&workspace_request(request)?).await?),
        Operation::StopWorkspace => to_value(driver.stop_workspace(&workspace_request(request)?).await?),
        Operation::DestroyWorkspace => to_value(driver.destroy_workspace(&workspace_request(request)?).await?),
        Operation::GetWorkspaceInfo => to_value(driver.get_workspace_info(&workspace_request(request)?).await?),
        Operation::CreateProject => to_value(driver.create_project(&project_request(request)?).await?),
        Operation::StartProject => to_value(driver.start_project(&project_request(request)?).await?),
        Operation::StopProject => to_value(driver.stop_project(&project_request(request)?).await?),
        Operation::DestroyProject => to_value(driver.destroy_project(&project_request(request)?).await?),
        Operation::GetProjectInfo => to_value(driver.get_project_info(&project_request(request)?).await?),
    }
}

/// `{"ok": ..}` or `{"error": {"kind", "message"}}`.
pub fn render(result: &Result<Value>) -> Value {
    match result {
        Ok(v) => json!({ "ok": v }),
        Err(e) => json!({ "error": { "kind": e.kind(), "message": e.to_string() } }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_render_with_stable_kind() {
        let out = render(&Err(DriverError::NotInitialized));
        assert_eq!(out["error"]["kind"], "not_initialized");
        assert_eq!(out["error"]["message"], "driver is not initialized");

        let out = render(&Ok(json!([1])));
        assert_eq!(out["ok"], json!([1]));
    }

    #[test]
    fn operations_parse_from_snake_case_names() {
        let args = Args::try_parse_from(["droplet-driver", "create_workspace"]).unwrap();
        assert_eq!(args.operation, Operation::CreateWorkspace);
        assert_eq!(args.operation.as_str(), "create_workspace");

        let args = Args::try_parse_from(["droplet-driver", "get_project_info"]).unwrap();
        assert_eq!(args.operation, Operation::GetProjectInfo);

        assert!(Args::try_parse_from(["droplet-driver", "reboot_workspace"]).is_err());
        assert!(Args::try_parse_from(["droplet-driver", "create-workspace"]).is_err());
        assert!(Args::try_parse_from(["droplet-driver"]).is_err());
    }

    #[test]
    fn invocation_fields_are_optional() {
        let inv: Invocation = serde_json::from_str("{}").unwrap();
        assert!(inv.initialize.is_none());
        assert!(inv.request.is_null());
    }
}
