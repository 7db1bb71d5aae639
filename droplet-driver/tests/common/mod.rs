#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use droplet_common::{
    DriverError, GitRepository, Project, ProjectRequest, Result, TargetOptions, Workspace,
    WorkspaceRequest,
};
use droplet_driver::{
    DriverSettings, DropletDriver, ExecOutput, InitializeProviderRequest, RemoteExecutor,
    WorkspaceProvider,
};
use droplet_providers::mock::MockProvider;
use tempfile::TempDir;

pub const TOKEN: &str = "dop_v1_test_token";

/// Records every script instead of running it.
#[derive(Default)]
pub struct RecordingExecutor {
    calls: Mutex<Vec<(String, String)>>,
    pub transient_failures: AtomicU32,
    pub exit_code: AtomicI32,
    pub stdout: Mutex<String>,
}

impl RecordingExecutor {
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn set_stdout(&self, stdout: &str) {
        *self.stdout.lock().unwrap() = stdout.to_string();
    }
}

#[async_trait]
impl RemoteExecutor for RecordingExecutor {
    async fn run_script(&self, address: &str, script: &str) -> Result<ExecOutput> {
        self.calls
            .lock()
            .unwrap()
            .push((address.to_string(), script.to_string()));
        if self.transient_failures.load(Ordering::SeqCst) > 0 {
            self.transient_failures.fetch_sub(1, Ordering::SeqCst);
            return Err(DriverError::transient("ssh", "connection failed: exit 255"));
        }
        Ok(ExecOutput {
            exit_code: Some(self.exit_code.load(Ordering::SeqCst)),
            stdout: self.stdout.lock().unwrap().clone(),
            stderr: String::new(),
        })
    }
}

pub fn fast_settings() -> DriverSettings {
    DriverSettings {
        ssh_public_key: Some("ssh-ed25519 AAAATEST driver@test".into()),
        provision_timeout: Duration::from_secs(2),
        poll_initial_delay: Duration::from_millis(1),
        poll_max_delay: Duration::from_millis(5),
        poll_max_transient_errors: 3,
        exec_max_retries: 3,
        exec_retry_delay: Duration::from_millis(1),
        volume_delete_retries: 3,
        ..DriverSettings::from_lookup(|_| None)
    }
}

pub fn init_request(logs_dir: PathBuf) -> InitializeProviderRequest {
    InitializeProviderRequest {
        base_path: "/home/workspace".into(),
        agent_download_url: "https://download.example.com/agent/v0.1.0/agent-linux-amd64".into(),
        agent_version: "0.1.0".into(),
        server_url: "http://localhost:3986".into(),
        api_url: "http://localhost:3986/api".into(),
        server_port: 3986,
        api_port: 3987,
        logs_dir,
    }
}

pub fn target_options() -> String {
    serde_json::json!({
        "Region": "nyc3",
        "Size": "s-1vcpu-1gb",
        "Image": "ubuntu-20-04-x64",
        "Disk Size": 20,
        "Auth Token": TOKEN,
    })
    .to_string()
}

pub fn project() -> Project {
    Project {
        name: "test".into(),
        repository: GitRepository {
            id: "123".into(),
            url: "https://github.com/daytonaio/daytona".into(),
            name: "daytona".into(),
            branch: None,
        },
        env_vars: BTreeMap::from([
            ("WS_ID".to_string(), "123".to_string()),
            ("SERVER_API_KEY".to_string(), "api-key-test".to_string()),
            ("SERVER_VERSION".to_string(), "latest".to_string()),
        ]),
        workspace_id: "123".into(),
    }
}

pub fn workspace() -> Workspace {
    Workspace {
        id: "123".into(),
        name: "test".into(),
        target: "local".into(),
        projects: vec![project()],
    }
}

pub fn workspace_request(provider_metadata: Option<&str>) -> WorkspaceRequest {
    WorkspaceRequest {
        target_options: target_options(),
        workspace: workspace(),
        provider_metadata: provider_metadata.map(str::to_string),
    }
}

pub fn project_request(workspace_metadata: Option<&str>, provider_metadata: Option<&str>) -> ProjectRequest {
    ProjectRequest {
        target_options: target_options(),
        project: project(),
        workspace_metadata: workspace_metadata.map(str::to_string),
        provider_metadata: provider_metadata.map(str::to_string),
    }
}

pub struct Harness {
    pub driver: DropletDriver,
    pub cloud: MockProvider,
    pub exec: Arc<RecordingExecutor>,
    pub logs: TempDir,
}

impl Harness {
    pub fn uninitialized() -> Self {
        Self::with_settings(fast_settings())
    }

    pub fn with_settings(settings: DriverSettings) -> Self {
        let cloud = MockProvider::new();
        let exec = Arc::new(RecordingExecutor::default());
        let driver = DropletDriver::with_parts(settings, Arc::new(cloud.clone()), exec.clone());
        Self {
            driver,
            cloud,
            exec,
            logs: tempfile::tempdir().unwrap(),
        }
    }

    pub async fn new() -> Self {
        let h = Self::uninitialized();
        h.driver
            .initialize(init_request(h.logs.path().to_path_buf()))
            .await
            .unwrap();
        h
    }

    pub fn log_contents(&self, workspace_id: &str) -> String {
        std::fs::read_to_string(self.logs.path().join(format!("{workspace_id}.log"))).unwrap_or_default()
    }
}

pub fn decode_workspace_meta(raw: &str) -> droplet_common::WorkspaceMetadata {
    droplet_common::metadata::decode(raw).unwrap()
}

pub fn parsed_options() -> TargetOptions {
    TargetOptions::parse(&target_options()).unwrap()
}
