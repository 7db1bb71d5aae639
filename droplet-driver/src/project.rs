use droplet_common::metadata::{self, METADATA_VERSION};
use droplet_common::{
    DriverError, Project, ProjectInfo, ProjectMetadata, ProjectState, Result, WorkspaceMetadata,
    WorkspaceStatus,
};
use droplet_providers::BackoffPolicy;
use serde_json::json;

use crate::bootstrap::{self, UnitStatus};
use crate::reconciliation::{self, status_of};
use crate::remote::{run_checked, tail_str};
use crate::workspace::workspace_tag;
use crate::Session;

/// Where project commands run: the parent workspace's droplet.
#[derive(Debug, Clone)]
pub(crate) struct Parent {
    pub remote_id: Option<String>,
    pub address: String,
}

/// Only an active workspace with an address accepts project commands.
pub(crate) async fn resolve_parent(
    s: &Session<'_>,
    project: &Project,
    workspace_meta: Option<&WorkspaceMetadata>,
) -> Result<Parent> {
    let not_ready = |status: &str| DriverError::WorkspaceNotReady {
        workspace_id: project.workspace_id.clone(),
        status: status.to_string(),
    };

    match workspace_meta {
        Some(meta) => match (&meta.status, &meta.address) {
            (WorkspaceStatus::Active, Some(address)) => Ok(Parent {
                remote_id: meta.remote_id.clone(),
                address: address.clone(),
            }),
            (status, _) => Err(not_ready(status.as_str())),
        },
        None => {
            let tag = workspace_tag(&project.workspace_id);
            let instance = reconciliation::resolve_instance(s.provider, &tag, None)
                .await?
                .ok_or_else(|| not_ready("absent"))?;
            match (status_of(&instance), instance.public_ipv4) {
                (WorkspaceStatus::Active, Some(address)) => Ok(Parent {
                    remote_id: Some(instance.id),
                    address,
                }),
                (status, _) => Err(not_ready(status.as_str())),
            }
        }
    }
}

fn project_metadata(
    prior: Option<ProjectMetadata>,
    project: &Project,
    parent: Option<&Parent>,
    state: ProjectState,
) -> ProjectMetadata {
    let mut meta = prior
        .filter(|m| m.project == project.name)
        .unwrap_or_else(|| ProjectMetadata::new(project.name.clone(), state));
    meta.version = METADATA_VERSION;
    meta.state = state;
    if let Some(parent) = parent {
        meta.workspace_remote_id = parent.remote_id.clone();
        meta.address = Some(parent.address.clone());
    }
    meta
}

fn project_info(project: &Project, meta: &ProjectMetadata, created: bool, is_running: bool) -> ProjectInfo {
    ProjectInfo {
        name: project.name.clone(),
        created,
        is_running,
        provider_metadata: metadata::encode(meta),
        workspace_id: project.workspace_id.clone(),
    }
}

/// Resolve the parent, run one script and log the action in the workspace's log.
async fn run_action(
    s: &Session<'_>,
    project: &Project,
    workspace_meta: Option<&WorkspaceMetadata>,
    action_type: &str,
    operation: &str,
    script: &str,
) -> Result<Parent> {
    let pending = s
        .events
        .log_event(&project.workspace_id, action_type, Some(json!({"project": project.name})))
        .await;

    let result = async {
        let parent = resolve_parent(s, project, workspace_meta).await?;
        tracing::info!(
            "[project] {} {} on {} ({} bytes of script)",
            operation,
            project.name,
            parent.address,
            script.len()
        );
        let out = run_checked(s.executor, &s.settings.exec_retry(), operation, &parent.address, script).await?;
        Ok::<_, DriverError>((parent, out))
    }
    .await;

    let summary = result.as_ref().ok().map(|(parent, out)| {
        json!({
            "project": project.name,
            "address": parent.address,
            "stdout_tail": tail_str(&out.stdout, 2000),
        })
    });
    s.events.log_event_complete(pending, &result, summary).await;
    result.map(|(parent, _)| parent)
}

pub(crate) async fn create(
    s: &Session<'_>,
    project: &Project,
    workspace_meta: Option<&WorkspaceMetadata>,
    prior: Option<ProjectMetadata>,
) -> Result<ProjectInfo> {
    let script = bootstrap::install_script(s.ctx, &s.settings.agent_command, project);
    let parent = run_action(s, project, workspace_meta, "PROJECT_CREATE", "create_project", &script).await?;
    let meta = project_metadata(prior, project, Some(&parent), ProjectState::Created);
    Ok(project_info(project, &meta, true, false))
}

pub(crate) async fn start(
    s: &Session<'_>,
    project: &Project,
    workspace_meta: Option<&WorkspaceMetadata>,
    prior: Option<ProjectMetadata>,
) -> Result<ProjectInfo> {
    let script = bootstrap::start_script(&project.name);
    let parent = run_action(s, project, workspace_meta, "PROJECT_START", "start_project", &script).await?;
    let meta = project_metadata(prior, project, Some(&parent), ProjectState::Running);
    Ok(project_info(project, &meta, true, true))
}

pub(crate) async fn stop(
    s: &Session<'_>,
    project: &Project,
    workspace_meta: Option<&WorkspaceMetadata>,
    prior: Option<ProjectMetadata>,
) -> Result<ProjectInfo> {
    let script = bootstrap::stop_script(&project.name);
    let parent = run_action(s, project, workspace_meta, "PROJECT_STOP", "stop_project", &script).await?;
    let meta = project_metadata(prior, project, Some(&parent), ProjectState::Stopped);
    Ok(project_info(project, &meta, true, false))
}

pub(crate) async fn destroy(
    s: &Session<'_>,
    project: &Project,
    workspace_meta: Option<&WorkspaceMetadata>,
    prior: Option<ProjectMetadata>,
) -> Result<ProjectInfo> {
    let script = bootstrap::destroy_script(s.ctx, &project.name);
    let parent = run_action(s, project, workspace_meta, "PROJECT_DESTROY", "destroy_project", &script).await?;
    let meta = project_metadata(prior, project, Some(&parent), ProjectState::Destroyed);
    Ok(project_info(project, &meta, false, false))
}

fn unit_result(status: UnitStatus) -> (bool, bool, ProjectState) {
    match status {
        UnitStatus::Absent => (false, false, ProjectState::Destroyed),
        UnitStatus::Running => (true, true, ProjectState::Running),
        UnitStatus::Stopped | UnitStatus::Failed => (true, false, ProjectState::Stopped),
    }
}

async fn query_unit(s: &Session<'_>, project: &Project, parent: &Parent, policy: &BackoffPolicy) -> Result<UnitStatus> {
    let out = run_checked(
        s.executor,
        policy,
        "get_project_info",
        &parent.address,
        &bootstrap::status_script(&project.name),
    )
    .await?;
    bootstrap::parse_status(&out.stdout).ok_or_else(|| DriverError::RemoteCommand {
        operation: "get_project_info".into(),
        exit_code: out.exit_code,
        stderr: format!("unexpected status output: {}", tail_str(&out.stdout, 200)),
    })
}

pub(crate) async fn get_info(
    s: &Session<'_>,
    project: &Project,
    workspace_meta: Option<&WorkspaceMetadata>,
    prior: Option<ProjectMetadata>,
) -> Result<ProjectInfo> {
    let parent = resolve_parent(s, project, workspace_meta).await?;
    let status = query_unit(s, project, &parent, &s.settings.exec_retry()).await?;
    let (created, running, state) = unit_result(status);
    let meta = project_metadata(prior, project, Some(&parent), state);
    Ok(project_info(project, &meta, created, running))
}

/// Project entry of a workspace info. Never fails: an unreachable project is
/// reported as not running with state `unknown`.
pub(crate) async fn query_info(s: &Session<'_>, project: &Project, workspace: &WorkspaceMetadata) -> ProjectInfo {
    let parent = match (&workspace.status, &workspace.address) {
        (WorkspaceStatus::Active, Some(address)) => Parent {
            remote_id: workspace.remote_id.clone(),
            address: address.clone(),
        },
        _ => {
            let meta = project_metadata(None, project, None, ProjectState::Unknown);
            return project_info(project, &meta, false, false);
        }
    };

    let single_attempt = BackoffPolicy {
        max_retries: 0,
        ..s.settings.exec_retry()
    };
    match query_unit(s, project, &parent, &single_attempt).await {
        Ok(status) => {
            let (created, running, state) = unit_result(status);
            let meta = project_metadata(None, project, Some(&parent), state);
            project_info(project, &meta, created, running)
        }
        Err(e) => {
            tracing::warn!("[project] status of {} on {} unavailable: {}", project.name, parent.address, e);
            let meta = project_metadata(None, project, Some(&parent), ProjectState::Unknown);
            project_info(project, &meta, false, false)
        }
    }
}
