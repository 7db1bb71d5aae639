//! Opaque provider metadata handed back to the host.
//!
//! The host persists these strings and passes them back on later calls; they are the
//! driver's only durable state. Decoding is tolerant: fields this version does not know
//! about are kept in `extra` and written back out unchanged on the next encode.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{DriverError, Result};

pub const METADATA_VERSION: u32 = 1;

fn current_version() -> u32 {
    METADATA_VERSION
}

/// Observed lifecycle status of the VM backing a workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceStatus {
    Provisioning,
    Active,
    Stopped,
    Deleting,
    Deleted,
    Failed,
    #[serde(other)]
    Unknown,
}

impl WorkspaceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkspaceStatus::Provisioning => "provisioning",
            WorkspaceStatus::Active => "active",
            WorkspaceStatus::Stopped => "stopped",
            WorkspaceStatus::Deleting => "deleting",
            WorkspaceStatus::Deleted => "deleted",
            WorkspaceStatus::Failed => "failed",
            WorkspaceStatus::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for WorkspaceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceMetadata {
    #[serde(default = "current_version")]
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_id: Option<String>,
    pub status: WorkspaceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl WorkspaceMetadata {
    pub fn new(status: WorkspaceStatus) -> Self {
        Self {
            version: METADATA_VERSION,
            remote_id: None,
            volume_id: None,
            status,
            address: None,
            region: None,
            observed_at: None,
            extra: serde_json::Map::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == WorkspaceStatus::Active && self.address.is_some()
    }
}

/// State of a per-project server process on the workspace VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectState {
    Created,
    Running,
    Stopped,
    Destroyed,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectMetadata {
    #[serde(default = "current_version")]
    pub version: u32,
    pub project: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_remote_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    pub state: ProjectState,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ProjectMetadata {
    pub fn new(project: impl Into<String>, state: ProjectState) -> Self {
        Self {
            version: METADATA_VERSION,
            project: project.into(),
            workspace_remote_id: None,
            address: None,
            state,
            extra: serde_json::Map::new(),
        }
    }
}

pub fn encode<T: Serialize>(state: &T) -> String {
    // Both metadata types are plain maps of strings; serialization cannot fail.
    serde_json::to_string(state).unwrap_or_default()
}

/// Decode a metadata blob. Blank input is an error: the caller decides separately
/// whether the host supplied metadata at all.
pub fn decode<T: DeserializeOwned>(raw: &str) -> Result<T> {
    if raw.trim().is_empty() {
        return Err(DriverError::Decode("empty metadata".into()));
    }
    serde_json::from_str(raw).map_err(|e| DriverError::Decode(e.to_string()))
}

/// Decode optional prior metadata: `None` (or a missing field) means the host has
/// nothing on record, which is not the same as a corrupt blob.
pub fn decode_prior<T: DeserializeOwned>(raw: Option<&str>) -> Result<Option<T>> {
    match raw {
        None => Ok(None),
        Some(raw) => decode(raw).map(Some),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn active() -> WorkspaceMetadata {
        let mut meta = WorkspaceMetadata::new(WorkspaceStatus::Active);
        meta.remote_id = Some("3164444".into());
        meta.volume_id = Some("506f78a4-e098-11e5-ad9f-000f53306ae1".into());
        meta.address = Some("104.236.32.182".into());
        meta.region = Some("nyc3".into());
        meta.observed_at = Some(Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap());
        meta
    }

    #[test]
    fn workspace_metadata_round_trips() {
        let meta = active();
        let back: WorkspaceMetadata = decode(&encode(&meta)).unwrap();
        assert_eq!(back, meta);

        let bare = WorkspaceMetadata::new(WorkspaceStatus::Failed);
        let back: WorkspaceMetadata = decode(&encode(&bare)).unwrap();
        assert_eq!(back, bare);
    }

    #[test]
    fn project_metadata_round_trips() {
        let mut meta = ProjectMetadata::new("test", ProjectState::Running);
        meta.workspace_remote_id = Some("1".into());
        meta.address = Some("10.0.0.1".into());
        let back: ProjectMetadata = decode(&encode(&meta)).unwrap();
        assert_eq!(back, meta);
    }

    #[test]
    fn unknown_fields_survive_a_decode_encode_cycle() {
        let raw = r#"{"version":3,"remoteId":"7","status":"active","address":"1.2.3.4","tailnet":{"ip":"100.64.0.1"},"zone":"a"}"#;
        let meta: WorkspaceMetadata = decode(raw).unwrap();
        assert_eq!(meta.version, 3);
        assert_eq!(meta.extra["zone"], "a");

        let again: serde_json::Value = serde_json::from_str(&encode(&meta)).unwrap();
        assert_eq!(again["tailnet"]["ip"], "100.64.0.1");
        assert_eq!(again["remoteId"], "7");
    }

    #[test]
    fn unknown_status_decodes_as_unknown() {
        let meta: WorkspaceMetadata = decode(r#"{"status":"hibernating"}"#).unwrap();
        assert_eq!(meta.status, WorkspaceStatus::Unknown);
        assert_eq!(meta.version, METADATA_VERSION);
    }

    #[test]
    fn malformed_or_blank_metadata_is_a_decode_error() {
        for raw in ["", "   ", "{", "[]", r#"{"remoteId":"1"}"#] {
            assert!(matches!(
                decode::<WorkspaceMetadata>(raw),
                Err(DriverError::Decode(_))
            ));
        }
    }

    #[test]
    fn missing_prior_metadata_is_not_an_error() {
        assert!(decode_prior::<WorkspaceMetadata>(None).unwrap().is_none());
        assert!(decode_prior::<WorkspaceMetadata>(Some("")).is_err());
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn workspace_status() -> impl Strategy<Value = WorkspaceStatus> {
        prop_oneof![
            Just(WorkspaceStatus::Provisioning),
            Just(WorkspaceStatus::Active),
            Just(WorkspaceStatus::Stopped),
            Just(WorkspaceStatus::Deleting),
            Just(WorkspaceStatus::Deleted),
            Just(WorkspaceStatus::Failed),
            Just(WorkspaceStatus::Unknown),
        ]
    }

    fn project_state() -> impl Strategy<Value = ProjectState> {
        prop_oneof![
            Just(ProjectState::Created),
            Just(ProjectState::Running),
            Just(ProjectState::Stopped),
            Just(ProjectState::Destroyed),
            Just(ProjectState::Unknown),
        ]
    }

    // Host-added fields. The prefix keeps them clear of the known keys.
    fn extra_fields() -> impl Strategy<Value = serde_json::Map<String, serde_json::Value>> {
        let value = prop_oneof![
            "[ -~]{0,20}".prop_map(serde_json::Value::from),
            any::<i64>().prop_map(serde_json::Value::from),
        ];
        prop::collection::btree_map("x-[a-z]{1,8}", value, 0..4)
            .prop_map(|fields| fields.into_iter().collect::<serde_json::Map<_, _>>())
    }

    fn observed_at() -> impl Strategy<Value = Option<DateTime<Utc>>> {
        proptest::option::of((0i64..4_000_000_000, 0u32..1_000_000_000).prop_map(|(secs, nanos)| {
            Utc.timestamp_opt(secs, nanos).unwrap()
        }))
    }

    proptest! {
        #[test]
        fn prop_workspace_metadata_survives_encode_decode(
            version in any::<u32>(),
            status in workspace_status(),
            remote_id in proptest::option::of("[0-9]{1,10}"),
            volume_id in proptest::option::of("[a-f0-9-]{1,36}"),
            address in proptest::option::of("[0-9.]{7,15}"),
            region in proptest::option::of("[a-z]{3}[0-9]"),
            observed_at in observed_at(),
            extra in extra_fields(),
        ) {
            let meta = WorkspaceMetadata {
                version,
                remote_id,
                volume_id,
                status,
                address,
                region,
                observed_at,
                extra,
            };
            let back: WorkspaceMetadata = decode(&encode(&meta)).unwrap();
            prop_assert_eq!(back, meta);
        }

        #[test]
        fn prop_project_metadata_survives_encode_decode(
            version in any::<u32>(),
            project in "[A-Za-z0-9._-]{1,30}",
            state in project_state(),
            workspace_remote_id in proptest::option::of("[0-9]{1,10}"),
            address in proptest::option::of("[0-9.]{7,15}"),
            extra in extra_fields(),
        ) {
            let meta = ProjectMetadata {
                version,
                project,
                workspace_remote_id,
                address,
                state,
                extra,
            };
            let back: ProjectMetadata = decode(&encode(&meta)).unwrap();
            prop_assert_eq!(back, meta);
        }
    }
}
