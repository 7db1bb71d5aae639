use chrono::Utc;
use droplet_common::metadata::METADATA_VERSION;
use droplet_common::{Result, WorkspaceMetadata, WorkspaceStatus};
use droplet_providers::{CloudProvider, InstanceState, RemoteInstance};

use crate::workspace::FAILED_TAG;

/// Map what the cloud reports onto the workspace lifecycle. A droplet tagged
/// failed stays failed whatever its power state.
pub fn status_of(instance: &RemoteInstance) -> WorkspaceStatus {
    if instance.tags.iter().any(|t| t == FAILED_TAG) {
        return WorkspaceStatus::Failed;
    }
    match &instance.state {
        InstanceState::Provisioning => WorkspaceStatus::Provisioning,
        InstanceState::Active => WorkspaceStatus::Active,
        InstanceState::Off | InstanceState::Archived => WorkspaceStatus::Stopped,
        InstanceState::Errored => WorkspaceStatus::Failed,
        InstanceState::Unknown(_) => WorkspaceStatus::Unknown,
    }
}

/// `failed` sticks until the workspace is destroyed, whatever the droplet does later.
pub fn effective_status(prior: Option<&WorkspaceMetadata>, observed: WorkspaceStatus) -> WorkspaceStatus {
    match prior.map(|m| m.status) {
        Some(WorkspaceStatus::Failed) => WorkspaceStatus::Failed,
        _ => observed,
    }
}

/// Find the droplet backing a workspace: the recorded id first, then the tag.
///
/// The tag lookup covers droplets whose id never reached the host (crash between
/// the create call and the response).
pub async fn resolve_instance(
    provider: &dyn CloudProvider,
    tag: &str,
    prior: Option<&WorkspaceMetadata>,
) -> Result<Option<RemoteInstance>> {
    if let Some(remote_id) = prior.and_then(|m| m.remote_id.as_deref()) {
        match provider.get_instance(remote_id).await {
            Ok(instance) => return Ok(Some(instance)),
            Err(e) if e.is_not_found() => {
                tracing::warn!(
                    "[Reconciliation] recorded droplet {} is gone, looking up tag {}",
                    remote_id,
                    tag
                );
            }
            Err(e) => return Err(e),
        }
    }

    let mut found = provider.find_instances_by_tag(tag).await?;
    if found.len() > 1 {
        tracing::warn!(
            "[Reconciliation] {} droplets carry tag {}: {:?}",
            found.len(),
            tag,
            found.iter().map(|i| i.id.as_str()).collect::<Vec<_>>()
        );
    }
    // Prefer a running droplet, then the oldest one.
    found.sort_by_key(|i| {
        (
            !matches!(i.state, InstanceState::Active),
            i.id.parse::<u64>().unwrap_or(u64::MAX),
        )
    });
    Ok(found.into_iter().next())
}

/// Every droplet id that belongs to the workspace, orphans included.
pub async fn collect_instance_ids(
    provider: &dyn CloudProvider,
    tag: &str,
    prior: Option<&WorkspaceMetadata>,
) -> Result<Vec<String>> {
    let mut ids: Vec<String> = prior
        .and_then(|m| m.remote_id.clone())
        .into_iter()
        .collect();
    for instance in provider.find_instances_by_tag(tag).await? {
        if !ids.contains(&instance.id) {
            if !ids.is_empty() {
                tracing::warn!("[Reconciliation] orphan droplet {} found by tag {}", instance.id, tag);
            }
            ids.push(instance.id);
        }
    }
    Ok(ids)
}

/// Metadata describing a live droplet. Fields the host carried over (including
/// unknown ones) are kept.
pub fn observed_metadata(
    prior: Option<&WorkspaceMetadata>,
    instance: &RemoteInstance,
    status: WorkspaceStatus,
    volume_id: Option<String>,
) -> WorkspaceMetadata {
    let mut meta = prior
        .cloned()
        .unwrap_or_else(|| WorkspaceMetadata::new(status));
    meta.version = METADATA_VERSION;
    meta.remote_id = Some(instance.id.clone());
    meta.status = status;
    meta.address = instance.public_ipv4.clone();
    meta.region = instance.region.clone().or(meta.region);
    meta.volume_id = volume_id
        .or(meta.volume_id)
        .or_else(|| instance.volume_ids.first().cloned());
    meta.observed_at = Some(Utc::now());
    meta
}
