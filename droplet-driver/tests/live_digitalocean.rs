//! Runs against the real API when `DIGITALOCEAN_ACCESS_TOKEN` is set; otherwise skipped.
//! Creates one droplet and one volume, then destroys both.
#![cfg(feature = "provider-digitalocean")]

use droplet_common::{Workspace, WorkspaceRequest, WorkspaceStatus};
use droplet_driver::{DriverSettings, DropletDriver, InitializeProviderRequest, WorkspaceProvider};

#[tokio::test]
async fn live_create_and_destroy() {
    let Ok(token) = std::env::var("DIGITALOCEAN_ACCESS_TOKEN") else {
        eprintln!("DIGITALOCEAN_ACCESS_TOKEN not set, skipping");
        return;
    };
    let region = std::env::var("DIGITALOCEAN_TEST_REGION").unwrap_or_else(|_| "nyc3".into());
    let logs = tempfile::tempdir().unwrap();

    let driver = DropletDriver::new(DriverSettings::from_env());
    driver
        .initialize(InitializeProviderRequest {
            base_path: "/home/workspace".into(),
            agent_download_url: "https://download.example.com/agent".into(),
            agent_version: "0.0.0-test".into(),
            server_url: "http://localhost:3986".into(),
            api_url: "http://localhost:3986/api".into(),
            server_port: 3986,
            api_port: 3987,
            logs_dir: logs.path().to_path_buf(),
        })
        .await
        .unwrap();

    let id = format!("live-{}", uuid::Uuid::new_v4().simple());
    let req = |metadata: Option<String>| WorkspaceRequest {
        target_options: serde_json::json!({
            "Region": region,
            "Size": "s-1vcpu-1gb",
            "Image": "ubuntu-22-04-x64",
            "Disk Size": 1,
            "Auth Token": token,
        })
        .to_string(),
        workspace: Workspace {
            id: id.clone(),
            name: id.clone(),
            target: "live".into(),
            projects: vec![],
        },
        provider_metadata: metadata,
    };

    let created = driver.create_workspace(&req(None)).await;
    // Always clean up, even when create failed half way.
    let destroyed = driver
        .destroy_workspace(&req(created.as_ref().ok().map(|i| i.provider_metadata.clone())))
        .await
        .unwrap();

    let created = created.unwrap();
    let meta: droplet_common::WorkspaceMetadata =
        droplet_common::metadata::decode(&created.provider_metadata).unwrap();
    assert_eq!(meta.status, WorkspaceStatus::Active);
    let gone: droplet_common::WorkspaceMetadata =
        droplet_common::metadata::decode(&destroyed.provider_metadata).unwrap();
    assert_eq!(gone.status, WorkspaceStatus::Deleted);
}
