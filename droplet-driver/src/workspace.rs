use droplet_common::{
    DriverError, ProjectInfo, Result, TargetOptions, Workspace, WorkspaceInfo, WorkspaceMetadata,
    WorkspaceStatus,
};
use droplet_common::metadata;
use droplet_providers::retry::retry_when;
use droplet_providers::{
    await_active, await_off, DeleteOutcome, InstanceSpec, InstanceState, RemoteInstance,
    RemoteVolume, VolumeSpec,
};
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::bootstrap;
use crate::project;
use crate::reconciliation::{self, effective_status, observed_metadata, status_of};
use crate::state_machine::transition;
use crate::Session;

/// Marks every resource this driver creates, next to the per-workspace tag.
pub const DRIVER_TAG: &str = "droplet-driver";

pub fn validate_workspace_id(id: &str) -> Result<()> {
    if id.is_empty()
        || !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(DriverError::validation(format!(
            "workspace id '{id}' must match [A-Za-z0-9._-]+"
        )));
    }
    Ok(())
}

/// Added to a droplet whose provisioning failed. Read back as `failed` until destroy.
pub const FAILED_TAG: &str = "droplet-driver-failed";

// Sanitising maps several ids onto one name; the digest of the raw id keeps them apart.
fn id_digest(workspace_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(workspace_id.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..8].to_string()
}

/// `ws-<id>-<digest>`, restricted to the tag alphabet (letters, digits, `-`, `_`).
pub fn workspace_tag(workspace_id: &str) -> String {
    let id: String = workspace_id
        .chars()
        .take(200)
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_') { c } else { '_' })
        .collect();
    format!("ws-{id}-{}", id_digest(workspace_id))
}

/// `ws-<id>-<digest>-data`: lowercase letters, digits and dashes, at most 64 characters.
pub fn volume_name(workspace_id: &str) -> String {
    let mut id: String = workspace_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect();
    id.truncate(47);
    format!("ws-{}-{}-data", id.trim_end_matches('-'), id_digest(workspace_id))
}

fn droplet_name(workspace_id: &str) -> String {
    let id: String = workspace_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' { c.to_ascii_lowercase() } else { '-' })
        .collect();
    format!("ws-{id}")
}

fn info(workspace: &Workspace, meta: &WorkspaceMetadata, projects: Vec<ProjectInfo>) -> WorkspaceInfo {
    WorkspaceInfo {
        name: workspace.name.clone(),
        projects,
        provider_metadata: metadata::encode(meta),
    }
}

fn target_summary(options: &TargetOptions) -> serde_json::Value {
    json!({
        "region": options.region,
        "size": options.size,
        "image": options.image,
        "disk_size": options.disk_size,
    })
}

pub(crate) async fn create(
    s: &Session<'_>,
    workspace: &Workspace,
    options: &TargetOptions,
    prior: Option<WorkspaceMetadata>,
) -> Result<WorkspaceInfo> {
    let pending = s
        .events
        .log_event(&workspace.id, "WORKSPACE_CREATE", Some(target_summary(options)))
        .await;
    let result = create_inner(s, workspace, options, prior).await;
    let summary = result.as_ref().ok().map(|m| json!({"remote_id": m.remote_id, "status": m.status}));
    s.events.log_event_complete(pending, &result, summary).await;
    result.map(|m| info(workspace, &m, Vec::new()))
}

async fn create_inner(
    s: &Session<'_>,
    workspace: &Workspace,
    options: &TargetOptions,
    prior: Option<WorkspaceMetadata>,
) -> Result<WorkspaceMetadata> {
    let tag = workspace_tag(&workspace.id);
    // A destroyed workspace may be created again.
    let prior = prior.filter(|m| m.status != WorkspaceStatus::Deleted);

    if let Some(existing) = reconciliation::resolve_instance(s.provider, &tag, prior.as_ref()).await? {
        tracing::info!(
            "[workspace] {} already backed by droplet {} ({}), not creating another",
            workspace.id,
            existing.id,
            existing.state.as_str()
        );
        return adopt(s, workspace, prior.as_ref(), existing).await;
    }

    let mut status = transition(s.events, &workspace.id, None, WorkspaceStatus::Provisioning, "create").await?;

    let volume = match ensure_volume(s, workspace, options, &tag).await {
        Ok(v) => v,
        Err(e) => {
            mark_failed(s, &workspace.id, status, None, &e).await;
            return Err(e);
        }
    };

    let spec = InstanceSpec {
        name: droplet_name(&workspace.id),
        region: options.region.clone(),
        size: options.size.clone(),
        image: options.image.clone(),
        tags: vec![tag.clone(), DRIVER_TAG.to_string()],
        user_data: Some(bootstrap::cloud_init(
            &s.settings.ssh_user,
            s.settings.ssh_public_key.as_deref(),
            Some(volume.name.as_str()),
        )),
        volume_ids: vec![volume.id.clone()],
    };

    let remote_id = match s.provider.create_instance(&spec).await {
        Ok(id) => id,
        Err(e) => {
            mark_failed(s, &workspace.id, status, None, &e).await;
            return Err(e);
        }
    };
    tracing::info!("[workspace] {} created droplet {}, waiting for it to become active", workspace.id, remote_id);

    match await_active(s.provider, &remote_id, &s.settings.poll_policy(), s.cancel).await {
        Ok(instance) => {
            status = transition(s.events, &workspace.id, Some(status), WorkspaceStatus::Active, "droplet active").await?;
            Ok(observed_metadata(
                prior.as_ref(),
                &instance,
                status,
                Some(volume.id),
            ))
        }
        Err(e) => {
            // The droplet stays; destroy reclaims it.
            tracing::error!("[workspace] {} droplet {} did not become active: {}", workspace.id, remote_id, e);
            mark_failed(s, &workspace.id, status, Some(&remote_id), &e).await;
            Err(e)
        }
    }
}

/// Record the failure, and tag the droplet so a later create reports it instead of
/// adopting it. A cancelled wait leaves the droplet untagged: it may still come up.
async fn mark_failed(
    s: &Session<'_>,
    workspace_id: &str,
    from: WorkspaceStatus,
    remote_id: Option<&str>,
    error: &DriverError,
) {
    let reason = format!("{}: {}", error.kind(), error);
    if let Err(e) = transition(s.events, workspace_id, Some(from), WorkspaceStatus::Failed, &reason).await {
        tracing::warn!("[workspace] {} could not be marked failed: {}", workspace_id, e);
    }
    let Some(remote_id) = remote_id else {
        return;
    };
    if matches!(error, DriverError::Cancelled { .. }) {
        return;
    }
    if let Err(e) = s.provider.tag_instance(remote_id, FAILED_TAG).await {
        tracing::warn!("[workspace] {} could not tag droplet {} as failed: {}", workspace_id, remote_id, e);
    }
}

/// Report an existing droplet instead of creating one.
async fn adopt(
    s: &Session<'_>,
    workspace: &Workspace,
    prior: Option<&WorkspaceMetadata>,
    existing: RemoteInstance,
) -> Result<WorkspaceMetadata> {
    let status = effective_status(prior, status_of(&existing));
    match (&existing.state, status) {
        (InstanceState::Errored | InstanceState::Archived, _) => Err(DriverError::RemoteState {
            remote_id: existing.id.clone(),
            status: existing.state.as_str().to_string(),
        }),
        (_, WorkspaceStatus::Failed) => Err(DriverError::WorkspaceNotReady {
            workspace_id: workspace.id.clone(),
            status: status.as_str().to_string(),
        }),
        (InstanceState::Active, _) if existing.public_ipv4.is_some() => {
            Ok(observed_metadata(prior, &existing, WorkspaceStatus::Active, None))
        }
        (InstanceState::Off, _) => Ok(observed_metadata(prior, &existing, WorkspaceStatus::Stopped, None)),
        _ => {
            // Still booting from an earlier call: wait for it, never create a second one.
            let instance = await_active(s.provider, &existing.id, &s.settings.poll_policy(), s.cancel).await?;
            tracing::info!("[workspace] {} droplet {} is now active", workspace.id, instance.id);
            Ok(observed_metadata(prior, &instance, WorkspaceStatus::Active, None))
        }
    }
}

async fn ensure_volume(
    s: &Session<'_>,
    workspace: &Workspace,
    options: &TargetOptions,
    tag: &str,
) -> Result<RemoteVolume> {
    let name = volume_name(&workspace.id);
    if let Some(existing) = s.provider.find_volume(&name, &options.region).await? {
        tracing::info!("[workspace] {} reusing volume {} ({})", workspace.id, existing.name, existing.id);
        return Ok(existing);
    }
    s.provider
        .create_volume(&VolumeSpec {
            name,
            region: options.region.clone(),
            size_gb: options.disk_size,
            tags: vec![tag.to_string(), DRIVER_TAG.to_string()],
        })
        .await
}

pub(crate) async fn get_info(
    s: &Session<'_>,
    workspace: &Workspace,
    prior: Option<WorkspaceMetadata>,
) -> Result<WorkspaceInfo> {
    let tag = workspace_tag(&workspace.id);
    let instance = reconciliation::resolve_instance(s.provider, &tag, prior.as_ref())
        .await?
        .ok_or_else(|| DriverError::not_found("workspace", &workspace.id))?;

    let status = effective_status(prior.as_ref(), status_of(&instance));
    let meta = observed_metadata(prior.as_ref(), &instance, status, None);

    let mut projects = Vec::with_capacity(workspace.projects.len());
    for p in &workspace.projects {
        projects.push(project::query_info(s, p, &meta).await);
    }
    Ok(info(workspace, &meta, projects))
}

pub(crate) async fn start(
    s: &Session<'_>,
    workspace: &Workspace,
    prior: Option<WorkspaceMetadata>,
) -> Result<WorkspaceInfo> {
    let pending = s.events.log_event(&workspace.id, "WORKSPACE_START", None).await;
    let result = start_inner(s, workspace, prior).await;
    s.events.log_event_complete(pending, &result, None).await;
    result.map(|m| info(workspace, &m, Vec::new()))
}

async fn start_inner(
    s: &Session<'_>,
    workspace: &Workspace,
    prior: Option<WorkspaceMetadata>,
) -> Result<WorkspaceMetadata> {
    let instance = resolve_existing(s, workspace, prior.as_ref()).await?;
    let status = effective_status(prior.as_ref(), status_of(&instance));

    match (&instance.state, status) {
        (_, WorkspaceStatus::Failed) => Err(DriverError::WorkspaceNotReady {
            workspace_id: workspace.id.clone(),
            status: status.as_str().to_string(),
        }),
        (InstanceState::Active, _) if instance.public_ipv4.is_some() => {
            tracing::info!("[workspace] {} already running", workspace.id);
            Ok(observed_metadata(prior.as_ref(), &instance, WorkspaceStatus::Active, None))
        }
        (InstanceState::Off, _) => {
            transition(s.events, &workspace.id, Some(status), WorkspaceStatus::Active, "start").await?;
            s.provider.power_on(&instance.id).await?;
            let instance = await_active(s.provider, &instance.id, &s.settings.poll_policy(), s.cancel).await?;
            Ok(observed_metadata(prior.as_ref(), &instance, WorkspaceStatus::Active, None))
        }
        (InstanceState::Errored | InstanceState::Archived, _) => Err(DriverError::RemoteState {
            remote_id: instance.id.clone(),
            status: instance.state.as_str().to_string(),
        }),
        _ => {
            let instance = await_active(s.provider, &instance.id, &s.settings.poll_policy(), s.cancel).await?;
            Ok(observed_metadata(prior.as_ref(), &instance, WorkspaceStatus::Active, None))
        }
    }
}

pub(crate) async fn stop(
    s: &Session<'_>,
    workspace: &Workspace,
    prior: Option<WorkspaceMetadata>,
) -> Result<WorkspaceInfo> {
    let pending = s.events.log_event(&workspace.id, "WORKSPACE_STOP", None).await;
    let result = stop_inner(s, workspace, prior).await;
    s.events.log_event_complete(pending, &result, None).await;
    result.map(|m| info(workspace, &m, Vec::new()))
}

async fn stop_inner(
    s: &Session<'_>,
    workspace: &Workspace,
    prior: Option<WorkspaceMetadata>,
) -> Result<WorkspaceMetadata> {
    let instance = resolve_existing(s, workspace, prior.as_ref()).await?;
    let status = effective_status(prior.as_ref(), status_of(&instance));

    match (&instance.state, status) {
        (InstanceState::Off, _) => {
            tracing::info!("[workspace] {} already stopped", workspace.id);
            Ok(observed_metadata(prior.as_ref(), &instance, WorkspaceStatus::Stopped, None))
        }
        (InstanceState::Errored | InstanceState::Archived, _) => Err(DriverError::RemoteState {
            remote_id: instance.id.clone(),
            status: instance.state.as_str().to_string(),
        }),
        _ => {
            transition(s.events, &workspace.id, Some(status), WorkspaceStatus::Stopped, "stop").await?;
            s.provider.power_off(&instance.id).await?;
            let instance = await_off(s.provider, &instance.id, &s.settings.poll_policy(), s.cancel).await?;
            Ok(observed_metadata(prior.as_ref(), &instance, WorkspaceStatus::Stopped, None))
        }
    }
}

async fn resolve_existing(
    s: &Session<'_>,
    workspace: &Workspace,
    prior: Option<&WorkspaceMetadata>,
) -> Result<RemoteInstance> {
    reconciliation::resolve_instance(s.provider, &workspace_tag(&workspace.id), prior)
        .await?
        .ok_or_else(|| DriverError::not_found("workspace", &workspace.id))
}

pub(crate) async fn destroy(
    s: &Session<'_>,
    workspace: &Workspace,
    options: &TargetOptions,
    prior: Option<WorkspaceMetadata>,
) -> Result<WorkspaceInfo> {
    let pending = s.events.log_event(&workspace.id, "WORKSPACE_DESTROY", None).await;
    let result = destroy_inner(s, workspace, options, prior).await;
    s.events.log_event_complete(pending, &result, None).await;
    result.map(|m| info(workspace, &m, Vec::new()))
}

async fn destroy_inner(
    s: &Session<'_>,
    workspace: &Workspace,
    options: &TargetOptions,
    prior: Option<WorkspaceMetadata>,
) -> Result<WorkspaceMetadata> {
    let tag = workspace_tag(&workspace.id);
    let ids = reconciliation::collect_instance_ids(s.provider, &tag, prior.as_ref()).await?;

    let from = match prior.as_ref().map(|m| m.status) {
        Some(status) => Some(status),
        None if ids.is_empty() => None,
        None => Some(WorkspaceStatus::Unknown),
    };
    let status = transition(s.events, &workspace.id, from, WorkspaceStatus::Deleting, "destroy").await?;

    for id in &ids {
        match s.provider.delete_instance(id).await? {
            DeleteOutcome::Deleted => tracing::info!("[workspace] {} deleted droplet {}", workspace.id, id),
            DeleteOutcome::AlreadyAbsent => {
                tracing::info!("[workspace] {} droplet {} was already gone", workspace.id, id)
            }
        }
    }

    let region = prior
        .as_ref()
        .and_then(|m| m.region.clone())
        .unwrap_or_else(|| options.region.clone());
    delete_volume(s, workspace, prior.as_ref(), &region).await?;

    transition(s.events, &workspace.id, Some(status), WorkspaceStatus::Deleted, "resources released").await?;

    let mut meta = prior.unwrap_or_else(|| WorkspaceMetadata::new(WorkspaceStatus::Deleted));
    meta.version = metadata::METADATA_VERSION;
    meta.status = WorkspaceStatus::Deleted;
    meta.address = None;
    meta.volume_id = None;
    meta.observed_at = Some(chrono::Utc::now());
    Ok(meta)
}

async fn delete_volume(
    s: &Session<'_>,
    workspace: &Workspace,
    prior: Option<&WorkspaceMetadata>,
    region: &str,
) -> Result<()> {
    let volume_id = match prior.and_then(|m| m.volume_id.clone()) {
        Some(id) => Some(id),
        None => s
            .provider
            .find_volume(&volume_name(&workspace.id), region)
            .await?
            .map(|v| v.id),
    };
    let Some(volume_id) = volume_id else {
        return Ok(());
    };

    // Detaching follows droplet deletion asynchronously; the API answers 409 meanwhile.
    let outcome = retry_when(
        &s.settings.volume_delete_retry(),
        "delete_volume",
        |e| e.is_transient() || matches!(e, DriverError::Api { status: 409, .. }),
        || s.provider.delete_volume(&volume_id),
    )
    .await?;
    if outcome == DeleteOutcome::Deleted {
        tracing::info!("[workspace] {} deleted volume {}", workspace.id, volume_id);
    }
    Ok(())
}
