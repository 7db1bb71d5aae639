use std::sync::Arc;

use async_trait::async_trait;
use droplet_common::{DriverError, Result, TargetOptions};

pub mod retry;
pub mod wait;

pub use inventory::{DeleteOutcome, InstanceSpec, InstanceState, RemoteInstance, RemoteVolume, VolumeSpec};
pub use retry::BackoffPolicy;
pub use wait::{await_active, await_off, PollPolicy};

/// Thin client over a cloud compute API, bound to one set of credentials.
///
/// `create_instance` is not idempotent: repeating it creates a second VM, so callers
/// must check for an existing instance (by id or tag) before invoking it.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    async fn create_instance(&self, spec: &InstanceSpec) -> Result<String>;

    /// Fails with `DriverError::NotFound` when the instance does not exist.
    async fn get_instance(&self, instance_id: &str) -> Result<RemoteInstance>;

    /// Deleting an instance that is already gone is `Ok(DeleteOutcome::AlreadyAbsent)`.
    async fn delete_instance(&self, instance_id: &str) -> Result<DeleteOutcome>;

    // For reconciliation: instances created by an earlier call whose id never reached the host.
    async fn find_instances_by_tag(&self, tag: &str) -> Result<Vec<RemoteInstance>>;

    async fn power_on(&self, instance_id: &str) -> Result<()>;
    async fn power_off(&self, instance_id: &str) -> Result<()>;

    /// Attach `tag` to an instance. Tags survive on the remote side, so a later call
    /// without metadata still sees them.
    async fn tag_instance(&self, instance_id: &str, tag: &str) -> Result<()>;

    // Block storage volumes. Lookups and deletes default to "nothing there";
    // creating one is an error on providers without volumes.
    async fn find_volume(&self, _name: &str, _region: &str) -> Result<Option<RemoteVolume>> {
        Ok(None)
    }

    async fn create_volume(&self, spec: &VolumeSpec) -> Result<RemoteVolume> {
        Err(DriverError::Api {
            operation: "create_volume".into(),
            status: 501,
            body: format!("volumes are not supported by this provider ({})", spec.name),
        })
    }

    async fn delete_volume(&self, _volume_id: &str) -> Result<DeleteOutcome> {
        Ok(DeleteOutcome::AlreadyAbsent)
    }
}

/// Builds a provider client for the credentials carried by one request.
pub trait ProviderFactory: Send + Sync {
    fn connect(&self, options: &TargetOptions) -> Result<Arc<dyn CloudProvider>>;
}

pub mod inventory {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum InstanceState {
        Provisioning,
        Active,
        Off,
        Archived,
        Errored,
        Unknown(String),
    }

    impl InstanceState {
        /// Map a provider status string (`new`, `active`, `off`, `archive`, ...).
        pub fn from_provider(status: &str) -> Self {
            match status.trim().to_ascii_lowercase().as_str() {
                "new" | "provisioning" => InstanceState::Provisioning,
                "active" => InstanceState::Active,
                "off" => InstanceState::Off,
                "archive" | "archived" => InstanceState::Archived,
                "errored" | "error" | "failed" => InstanceState::Errored,
                other => InstanceState::Unknown(other.to_string()),
            }
        }

        pub fn as_str(&self) -> &str {
            match self {
                InstanceState::Provisioning => "provisioning",
                InstanceState::Active => "active",
                InstanceState::Off => "off",
                InstanceState::Archived => "archived",
                InstanceState::Errored => "errored",
                InstanceState::Unknown(s) => s,
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct RemoteInstance {
        pub id: String,
        pub name: String,
        pub state: InstanceState,
        pub public_ipv4: Option<String>,
        pub region: Option<String>,
        pub tags: Vec<String>,
        pub volume_ids: Vec<String>,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct InstanceSpec {
        pub name: String,
        pub region: String,
        pub size: String,
        pub image: String,
        pub tags: Vec<String>,
        pub user_data: Option<String>,
        pub volume_ids: Vec<String>,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct VolumeSpec {
        pub name: String,
        pub region: String,
        pub size_gb: u32,
        pub tags: Vec<String>,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct RemoteVolume {
        pub id: String,
        pub name: String,
        pub region: String,
        pub size_gb: u32,
        pub attached_to: Vec<String>,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum DeleteOutcome {
        Deleted,
        AlreadyAbsent,
    }
}

#[cfg(any(test, feature = "mock"))]
pub mod mock;

#[cfg(feature = "digitalocean")]
pub mod digitalocean;

#[cfg(test)]
mod tests {
    use super::inventory::InstanceState;
    use super::*;

    // Implements only what every provider must.
    struct Bare;

    #[async_trait]
    impl CloudProvider for Bare {
        async fn create_instance(&self, _spec: &InstanceSpec) -> Result<String> {
            Ok("1".into())
        }
        async fn get_instance(&self, id: &str) -> Result<RemoteInstance> {
            Err(DriverError::not_found("droplet", id))
        }
        async fn delete_instance(&self, _id: &str) -> Result<DeleteOutcome> {
            Ok(DeleteOutcome::AlreadyAbsent)
        }
        async fn find_instances_by_tag(&self, _tag: &str) -> Result<Vec<RemoteInstance>> {
            Ok(vec![])
        }
        async fn power_on(&self, _id: &str) -> Result<()> {
            Ok(())
        }
        async fn power_off(&self, _id: &str) -> Result<()> {
            Ok(())
        }
        async fn tag_instance(&self, _id: &str, _tag: &str) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn volume_creation_is_refused_without_volume_support() {
        let spec = VolumeSpec {
            name: "ws-1-data".into(),
            region: "nyc3".into(),
            size_gb: 20,
            tags: vec![],
        };
        let err = Bare.create_volume(&spec).await.unwrap_err();
        assert!(matches!(err, DriverError::Api { status: 501, .. }), "{err:?}");
        assert_eq!(Bare.find_volume("ws-1-data", "nyc3").await.unwrap(), None);
    }

    #[test]
    fn provider_statuses_map_to_states() {
        assert_eq!(InstanceState::from_provider("new"), InstanceState::Provisioning);
        assert_eq!(InstanceState::from_provider("ACTIVE"), InstanceState::Active);
        assert_eq!(InstanceState::from_provider("off"), InstanceState::Off);
        assert_eq!(InstanceState::from_provider("archive"), InstanceState::Archived);
        assert_eq!(InstanceState::from_provider("errored"), InstanceState::Errored);
        assert_eq!(
            InstanceState::from_provider("rebooting"),
            InstanceState::Unknown("rebooting".into())
        );
    }
}
