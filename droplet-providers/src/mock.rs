//! In-memory provider for tests and local runs.
//!
//! Behaves like the real API where the driver cares: ids are assigned on create,
//! instances report `provisioning` for a configurable number of polls, deleted ids
//! return `NotFound`, and failures can be scripted. Every call is counted.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use droplet_common::{DriverError, Result, TargetOptions};

use crate::inventory::{
    DeleteOutcome, InstanceSpec, InstanceState, RemoteInstance, RemoteVolume, VolumeSpec,
};
use crate::{CloudProvider, ProviderFactory};

/// Scripted behaviour, applied to instances created after it is set.
#[derive(Debug, Clone, Default)]
pub struct MockBehavior {
    /// `get_instance` reports `provisioning` this many times before `active`.
    pub polls_until_active: u32,
    /// New instances report `errored`.
    pub fail_provisioning: bool,
    /// New instances never leave `provisioning`.
    pub never_active: bool,
    /// The next N `get_instance` calls fail with a transient error.
    pub transient_get_failures: u32,
    /// The next N `create_instance` calls are rejected with a 429-style error.
    pub rate_limited_creates: u32,
    /// Every `delete_instance` call fails with a transient error.
    pub fail_deletes: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub connect: u32,
    pub create_instance: u32,
    pub get_instance: u32,
    pub delete_instance: u32,
    pub find_by_tag: u32,
    pub power_on: u32,
    pub power_off: u32,
    pub tag_instance: u32,
    pub find_volume: u32,
    pub create_volume: u32,
    pub delete_volume: u32,
}

impl CallCounts {
    /// Calls that would have reached the cloud API (`connect` is local).
    pub fn remote_total(&self) -> u32 {
        self.create_instance
            + self.get_instance
            + self.delete_instance
            + self.find_by_tag
            + self.power_on
            + self.power_off
            + self.tag_instance
            + self.find_volume
            + self.create_volume
            + self.delete_volume
    }
}

#[derive(Debug, Clone)]
struct MockDroplet {
    name: String,
    region: String,
    tags: Vec<String>,
    volume_ids: Vec<String>,
    ip: String,
    polls_left: u32,
    failed: bool,
    never_active: bool,
    powered_off: bool,
}

impl MockDroplet {
    fn state(&self) -> InstanceState {
        if self.failed {
            InstanceState::Errored
        } else if self.never_active || self.polls_left > 0 {
            InstanceState::Provisioning
        } else if self.powered_off {
            InstanceState::Off
        } else {
            InstanceState::Active
        }
    }

    fn snapshot(&self, id: &str) -> RemoteInstance {
        let state = self.state();
        let public_ipv4 = match state {
            InstanceState::Active | InstanceState::Off => Some(self.ip.clone()),
            _ => None,
        };
        RemoteInstance {
            id: id.to_string(),
            name: self.name.clone(),
            state,
            public_ipv4,
            region: Some(self.region.clone()),
            tags: self.tags.clone(),
            volume_ids: self.volume_ids.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct MockState {
    next_id: u64,
    droplets: BTreeMap<String, MockDroplet>,
    volumes: BTreeMap<String, RemoteVolume>,
    behavior: MockBehavior,
    calls: CallCounts,
    tokens: Vec<String>,
}

impl MockState {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        3_000_000 + self.next_id
    }
}

/// Cloneable handle; clones share state, so a test can keep one and hand another to
/// the driver through [`ProviderFactory`].
#[derive(Debug, Clone, Default)]
pub struct MockProvider {
    state: Arc<Mutex<MockState>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_behavior(behavior: MockBehavior) -> Self {
        let provider = Self::default();
        provider.set_behavior(behavior);
        provider
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        // A panicking test thread must not hide the state from the assertions that follow.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_behavior(&self, behavior: MockBehavior) {
        self.lock().behavior = behavior;
    }

    pub fn calls(&self) -> CallCounts {
        self.lock().calls.clone()
    }

    pub fn tokens_seen(&self) -> Vec<String> {
        self.lock().tokens.clone()
    }

    pub fn droplet_count(&self) -> usize {
        self.lock().droplets.len()
    }

    pub fn volume_count(&self) -> usize {
        self.lock().volumes.len()
    }

    /// Current view of an instance without counting a call.
    pub fn instance(&self, instance_id: &str) -> Option<RemoteInstance> {
        self.lock()
            .droplets
            .get(instance_id)
            .map(|d| d.snapshot(instance_id))
    }

    /// Simulate an instance whose create succeeded but whose id was lost
    /// (driver crash between create and poll). It boots like a created one.
    pub fn insert_orphan(&self, name: &str, region: &str, tags: &[&str]) -> String {
        let mut state = self.lock();
        let id = state.allocate_id();
        let polls_left = state.behavior.polls_until_active;
        state.droplets.insert(
            id.to_string(),
            MockDroplet {
                name: name.to_string(),
                region: region.to_string(),
                tags: tags.iter().map(|t| t.to_string()).collect(),
                volume_ids: vec![],
                ip: mock_ip(id),
                polls_left,
                failed: false,
                never_active: false,
                powered_off: false,
            },
        );
        id.to_string()
    }

    /// Flip an existing instance to `errored` or back.
    pub fn set_failed(&self, instance_id: &str, failed: bool) {
        if let Some(d) = self.lock().droplets.get_mut(instance_id) {
            d.failed = failed;
        }
    }
}

fn mock_ip(seq: u64) -> String {
    let last_octet = (seq % 250) + 1;
    let third_octet = ((seq / 250) % 250) + 1;
    format!("10.10.{}.{}", third_octet, last_octet)
}

fn rate_limited(operation: &str) -> DriverError {
    DriverError::Transient {
        operation: operation.to_string(),
        message: "status=429 too many requests".into(),
        retry_after: Some(Duration::from_millis(1)),
    }
}

#[async_trait]
impl CloudProvider for MockProvider {
    async fn create_instance(&self, spec: &InstanceSpec) -> Result<String> {
        let mut state = self.lock();
        state.calls.create_instance += 1;
        if state.behavior.rate_limited_creates > 0 {
            state.behavior.rate_limited_creates -= 1;
            return Err(rate_limited("create_instance"));
        }

        let id = state.allocate_id();
        let behavior = state.behavior.clone();
        state.droplets.insert(
            id.to_string(),
            MockDroplet {
                name: spec.name.clone(),
                region: spec.region.clone(),
                tags: spec.tags.clone(),
                volume_ids: spec.volume_ids.clone(),
                ip: mock_ip(id),
                polls_left: behavior.polls_until_active,
                failed: behavior.fail_provisioning,
                never_active: behavior.never_active,
                powered_off: false,
            },
        );
        for volume_id in &spec.volume_ids {
            if let Some(v) = state.volumes.get_mut(volume_id) {
                v.attached_to.push(id.to_string());
            }
        }
        Ok(id.to_string())
    }

    async fn get_instance(&self, instance_id: &str) -> Result<RemoteInstance> {
        let mut state = self.lock();
        state.calls.get_instance += 1;
        if state.behavior.transient_get_failures > 0 {
            state.behavior.transient_get_failures -= 1;
            return Err(DriverError::transient("get_instance", "connection reset by peer"));
        }
        let droplet = state
            .droplets
            .get_mut(instance_id)
            .ok_or_else(|| DriverError::not_found("droplet", instance_id))?;
        let snapshot = droplet.snapshot(instance_id);
        if droplet.polls_left > 0 {
            droplet.polls_left -= 1;
        }
        Ok(snapshot)
    }

    async fn delete_instance(&self, instance_id: &str) -> Result<DeleteOutcome> {
        let mut state = self.lock();
        state.calls.delete_instance += 1;
        if state.behavior.fail_deletes {
            return Err(DriverError::transient("delete_instance", "status=503"));
        }
        match state.droplets.remove(instance_id) {
            Some(_) => {
                for v in state.volumes.values_mut() {
                    v.attached_to.retain(|d| d != instance_id);
                }
                Ok(DeleteOutcome::Deleted)
            }
            None => Ok(DeleteOutcome::AlreadyAbsent),
        }
    }

    async fn find_instances_by_tag(&self, tag: &str) -> Result<Vec<RemoteInstance>> {
        let mut state = self.lock();
        state.calls.find_by_tag += 1;
        Ok(state
            .droplets
            .iter()
            .filter(|(_, d)| d.tags.iter().any(|t| t == tag))
            .map(|(id, d)| d.snapshot(id))
            .collect())
    }

    async fn power_on(&self, instance_id: &str) -> Result<()> {
        let mut state = self.lock();
        state.calls.power_on += 1;
        let droplet = state
            .droplets
            .get_mut(instance_id)
            .ok_or_else(|| DriverError::not_found("droplet", instance_id))?;
        droplet.powered_off = false;
        Ok(())
    }

    async fn power_off(&self, instance_id: &str) -> Result<()> {
        let mut state = self.lock();
        state.calls.power_off += 1;
        let droplet = state
            .droplets
            .get_mut(instance_id)
            .ok_or_else(|| DriverError::not_found("droplet", instance_id))?;
        droplet.powered_off = true;
        Ok(())
    }

    async fn tag_instance(&self, instance_id: &str, tag: &str) -> Result<()> {
        let mut state = self.lock();
        state.calls.tag_instance += 1;
        let droplet = state
            .droplets
            .get_mut(instance_id)
            .ok_or_else(|| DriverError::not_found("droplet", instance_id))?;
        if !droplet.tags.iter().any(|t| t == tag) {
            droplet.tags.push(tag.to_string());
        }
        Ok(())
    }

    async fn find_volume(&self, name: &str, region: &str) -> Result<Option<RemoteVolume>> {
        let mut state = self.lock();
        state.calls.find_volume += 1;
        Ok(state
            .volumes
            .values()
            .find(|v| v.name == name && v.region == region)
            .cloned())
    }

    async fn create_volume(&self, spec: &VolumeSpec) -> Result<RemoteVolume> {
        let mut state = self.lock();
        state.calls.create_volume += 1;
        let seq = state.allocate_id();
        let volume = RemoteVolume {
            id: format!("vol-{seq}"),
            name: spec.name.clone(),
            region: spec.region.clone(),
            size_gb: spec.size_gb,
            attached_to: vec![],
        };
        state.volumes.insert(volume.id.clone(), volume.clone());
        Ok(volume)
    }

    async fn delete_volume(&self, volume_id: &str) -> Result<DeleteOutcome> {
        let mut state = self.lock();
        state.calls.delete_volume += 1;
        let attached_to = state.volumes.get(volume_id).map(|v| v.attached_to.clone());
        match attached_to {
            None => Ok(DeleteOutcome::AlreadyAbsent),
            Some(droplets) if !droplets.is_empty() => Err(DriverError::Api {
                operation: "delete_volume".into(),
                status: 409,
                body: format!("volume {volume_id} is attached to {droplets:?}"),
            }),
            Some(_) => {
                state.volumes.remove(volume_id);
                Ok(DeleteOutcome::Deleted)
            }
        }
    }
}

impl ProviderFactory for MockProvider {
    fn connect(&self, options: &TargetOptions) -> Result<Arc<dyn CloudProvider>> {
        let mut state = self.lock();
        state.calls.connect += 1;
        state.tokens.push(options.auth_token().to_string());
        drop(state);
        Ok(Arc::new(self.clone()))
    }
}
