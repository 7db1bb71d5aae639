use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::Utc;
use droplet_common::DriverError;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Per-workspace action log: one JSON object per line in `<logs_dir>/<workspace id>.log`.
///
/// Writing is best effort. A full disk must not fail a lifecycle call, so errors are
/// only reported through `tracing`.
#[derive(Debug, Clone)]
pub struct EventLog {
    dir: PathBuf,
}

/// Handle returned by [`EventLog::log_event`], consumed by `log_event_complete`.
#[derive(Debug)]
pub struct PendingEvent {
    pub log_id: Uuid,
    workspace_id: String,
    action_type: String,
    started: Instant,
}

#[derive(Serialize)]
struct LogLine<'a> {
    log_id: Uuid,
    timestamp: String,
    workspace_id: &'a str,
    action_type: &'a str,
    status: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    duration_ms: Option<u128>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_kind: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<&'a serde_json::Value>,
}

impl EventLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, workspace_id: &str) -> PathBuf {
        self.dir.join(format!("{}.log", file_stem(workspace_id)))
    }

    /// Record the start of an action (status `in_progress`).
    pub async fn log_event(
        &self,
        workspace_id: &str,
        action_type: &str,
        metadata: Option<serde_json::Value>,
    ) -> PendingEvent {
        let log_id = Uuid::new_v4();
        let line = LogLine {
            log_id,
            timestamp: Utc::now().to_rfc3339(),
            workspace_id,
            action_type,
            status: "in_progress",
            duration_ms: None,
            error_kind: None,
            error_message: None,
            metadata: metadata.as_ref(),
        };
        self.append(workspace_id, &line).await;
        tracing::debug!("[logger] {} - in_progress ({})", action_type, log_id);

        PendingEvent {
            log_id,
            workspace_id: workspace_id.to_string(),
            action_type: action_type.to_string(),
            started: Instant::now(),
        }
    }

    /// Record the outcome of an action started with `log_event`.
    pub async fn log_event_complete<T>(
        &self,
        pending: PendingEvent,
        outcome: &Result<T, DriverError>,
        metadata: Option<serde_json::Value>,
    ) {
        let (status, error_kind, error_message) = match outcome {
            Ok(_) => ("success", None, None),
            Err(e) => ("failed", Some(e.kind()), Some(e.to_string())),
        };
        let line = LogLine {
            log_id: pending.log_id,
            timestamp: Utc::now().to_rfc3339(),
            workspace_id: &pending.workspace_id,
            action_type: &pending.action_type,
            status,
            duration_ms: Some(pending.started.elapsed().as_millis()),
            error_kind,
            error_message,
            metadata: metadata.as_ref(),
        };
        self.append(&pending.workspace_id, &line).await;
        tracing::debug!("[logger] {} - {} ({})", pending.action_type, status, pending.log_id);
    }

    /// One-off event such as a state transition.
    pub async fn log_quick(&self, workspace_id: &str, action_type: &str, metadata: serde_json::Value) {
        let line = LogLine {
            log_id: Uuid::new_v4(),
            timestamp: Utc::now().to_rfc3339(),
            workspace_id,
            action_type,
            status: "success",
            duration_ms: None,
            error_kind: None,
            error_message: None,
            metadata: Some(&metadata),
        };
        self.append(workspace_id, &line).await;
    }

    async fn append(&self, workspace_id: &str, line: &LogLine<'_>) {
        let path = self.path_for(workspace_id);
        let mut bytes = match serde_json::to_vec(line) {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!("[logger] cannot serialize log line: {}", e);
                return;
            }
        };
        bytes.push(b'\n');
        if let Err(e) = append_bytes(&path, &bytes).await {
            tracing::warn!("[logger] cannot write {}: {}", path.display(), e);
        }
    }
}

async fn append_bytes(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(bytes).await?;
    file.flush().await
}

// Workspace ids come from the host; keep them inside logs_dir.
fn file_stem(workspace_id: &str) -> String {
    let stem: String = workspace_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
        .collect();
    match stem.trim_matches('.') {
        "" => "_".to_string(),
        s => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(path: &Path) -> Vec<serde_json::Value> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn start_and_completion_are_appended() {
        let tmp = tempfile::tempdir().unwrap();
        let log = EventLog::new(tmp.path());

        let pending = log
            .log_event("123", "WORKSPACE_CREATE", Some(serde_json::json!({"region": "nyc3"})))
            .await;
        let log_id = pending.log_id;
        let outcome: Result<(), DriverError> = Err(DriverError::validation("bad size"));
        log.log_event_complete(pending, &outcome, None).await;

        let entries = lines(&log.path_for("123"));
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["status"], "in_progress");
        assert_eq!(entries[0]["metadata"]["region"], "nyc3");
        assert_eq!(entries[1]["status"], "failed");
        assert_eq!(entries[1]["error_kind"], "validation_error");
        assert_eq!(entries[1]["log_id"], log_id.to_string());
        assert!(entries[1]["duration_ms"].is_u64());
    }

    #[test]
    fn workspace_ids_cannot_escape_the_directory() {
        let log = EventLog::new("/var/log/ws");
        assert_eq!(log.path_for("../../etc/passwd"), PathBuf::from("/var/log/ws/_.._etc_passwd.log"));
        assert_eq!(log.path_for(".."), PathBuf::from("/var/log/ws/_.log"));
        assert_eq!(log.path_for("ws-1"), PathBuf::from("/var/log/ws/ws-1.log"));
    }
}
