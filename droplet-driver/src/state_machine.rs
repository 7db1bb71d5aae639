use droplet_common::{DriverError, Result, WorkspaceStatus};

use crate::logger::EventLog;

/// Whether a workspace may move from `from` (`None` = nothing exists remotely) to `to`.
///
/// ```text
/// absent -> provisioning -> active -> deleting -> deleted
/// provisioning -> failed -> deleting
/// active <-> stopped -> deleting
/// ```
/// Destroy is allowed from every state so orphans can always be reclaimed.
/// `unknown` means the remote status could not be mapped; nothing is refused from it.
pub fn is_allowed(from: Option<WorkspaceStatus>, to: WorkspaceStatus) -> bool {
    use WorkspaceStatus::*;

    if from == Some(to) {
        return true;
    }
    match (from, to) {
        (_, Deleting) => true,
        (None | Some(Deleted), Provisioning) => true,
        (Some(Provisioning), Active | Failed) => true,
        (Some(Active), Stopped) => true,
        (Some(Stopped), Active) => true,
        (Some(Deleting), Deleted) => true,
        (Some(Unknown), _) => true,
        _ => false,
    }
}

/// Validate and record a transition. An illegal one is reported as
/// `WorkspaceNotReady` carrying the current status.
pub async fn transition(
    events: &EventLog,
    workspace_id: &str,
    from: Option<WorkspaceStatus>,
    to: WorkspaceStatus,
    reason: &str,
) -> Result<WorkspaceStatus> {
    let from_label = from.map(|s| s.as_str()).unwrap_or("absent");

    if !is_allowed(from, to) {
        tracing::warn!(
            "[state_machine] refused {} -> {} for workspace {} ({})",
            from_label,
            to,
            workspace_id,
            reason
        );
        return Err(DriverError::WorkspaceNotReady {
            workspace_id: workspace_id.to_string(),
            status: from_label.to_string(),
        });
    }

    if from == Some(to) {
        return Ok(to);
    }

    tracing::info!(
        "[state_machine] workspace {}: {} -> {} ({})",
        workspace_id,
        from_label,
        to,
        reason
    );
    events
        .log_quick(
            workspace_id,
            "STATE_TRANSITION",
            serde_json::json!({"from": from_label, "to": to.as_str(), "reason": reason}),
        )
        .await;
    Ok(to)
}
