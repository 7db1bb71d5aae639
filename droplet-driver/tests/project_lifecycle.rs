mod common;

use std::sync::atomic::Ordering;

use common::*;
use droplet_common::metadata::{self, encode};
use droplet_common::{DriverError, ProjectMetadata, ProjectState, WorkspaceMetadata, WorkspaceStatus};
use droplet_driver::WorkspaceProvider;

async fn active_workspace(h: &Harness) -> String {
    h.driver
        .create_workspace(&workspace_request(None))
        .await
        .unwrap()
        .provider_metadata
}

fn project_state(raw: &str) -> ProjectState {
    metadata::decode::<ProjectMetadata>(raw).unwrap().state
}

#[tokio::test]
async fn create_installs_the_project_on_the_workspace_droplet() {
    let h = Harness::new().await;
    let ws = active_workspace(&h).await;
    let address = decode_workspace_meta(&ws).address.unwrap();

    let info = h.driver.create_project(&project_request(Some(&ws), None)).await.unwrap();
    assert_eq!(info.name, "test");
    assert_eq!(info.workspace_id, "123");
    assert!(info.created);
    assert!(!info.is_running);
    assert_eq!(project_state(&info.provider_metadata), ProjectState::Created);

    let calls = h.exec.calls();
    assert_eq!(calls.len(), 1);
    let (target, script) = &calls[0];
    assert_eq!(target, &address);
    assert!(script.contains("<<'WS_ENV_EOF'"));
    assert!(script.contains("SERVER_API_KEY=\"api-key-test\""));
    assert!(script.contains("WS_PROJECT_REPOSITORY_URL=\"https://github.com/daytonaio/daytona\""));
    assert!(script.contains("workspace-project-test.service"));
    assert!(script.contains("/home/workspace/test"));
    assert!(script.contains("https://download.example.com/agent/v0.1.0/agent-linux-amd64"));
}

#[tokio::test]
async fn project_env_overrides_injected_values() {
    let h = Harness::new().await;
    let ws = active_workspace(&h).await;
    h.driver.create_project(&project_request(Some(&ws), None)).await.unwrap();

    let (_, script) = &h.exec.calls()[0];
    assert!(script.contains("SERVER_VERSION=\"latest\""));
    assert!(!script.contains("SERVER_VERSION=\"0.1.0\""));
    assert!(script.contains("SERVER_URL=\"http://localhost:3986\""));
}

#[tokio::test]
async fn stopped_workspace_runs_no_commands() {
    let h = Harness::new().await;
    let ws = active_workspace(&h).await;
    let stopped = h
        .driver
        .stop_workspace(&workspace_request(Some(&ws)))
        .await
        .unwrap()
        .provider_metadata;

    let err = h
        .driver
        .create_project(&project_request(Some(&stopped), None))
        .await
        .unwrap_err();
    assert!(
        matches!(&err, DriverError::WorkspaceNotReady { status, .. } if status == "stopped"),
        "{err:?}"
    );
    assert_eq!(h.exec.call_count(), 0);
}

#[tokio::test]
async fn missing_workspace_runs_no_commands() {
    let h = Harness::new().await;
    let err = h.driver.start_project(&project_request(None, None)).await.unwrap_err();
    assert!(
        matches!(&err, DriverError::WorkspaceNotReady { status, .. } if status == "absent"),
        "{err:?}"
    );
    assert_eq!(h.exec.call_count(), 0);
}

#[tokio::test]
async fn workspace_is_found_by_tag_without_metadata() {
    let h = Harness::new().await;
    let ws = active_workspace(&h).await;
    let address = decode_workspace_meta(&ws).address.unwrap();

    h.driver.create_project(&project_request(None, None)).await.unwrap();
    assert_eq!(h.exec.calls()[0].0, address);
}

#[tokio::test]
async fn start_stop_destroy_can_repeat() {
    let h = Harness::new().await;
    let ws = active_workspace(&h).await;
    let created = h.driver.create_project(&project_request(Some(&ws), None)).await.unwrap();

    let mut meta = created.provider_metadata;
    for _ in 0..2 {
        let started = h.driver.start_project(&project_request(Some(&ws), Some(&meta))).await.unwrap();
        assert!(started.is_running);
        assert_eq!(project_state(&started.provider_metadata), ProjectState::Running);
        meta = started.provider_metadata;
    }
    for _ in 0..2 {
        let stopped = h.driver.stop_project(&project_request(Some(&ws), Some(&meta))).await.unwrap();
        assert!(stopped.created);
        assert!(!stopped.is_running);
        meta = stopped.provider_metadata;
    }
    for _ in 0..2 {
        let destroyed = h.driver.destroy_project(&project_request(Some(&ws), Some(&meta))).await.unwrap();
        assert!(!destroyed.created);
        assert_eq!(project_state(&destroyed.provider_metadata), ProjectState::Destroyed);
        meta = destroyed.provider_metadata;
    }

    let scripts: Vec<String> = h.exec.calls().into_iter().map(|(_, s)| s).collect();
    assert_eq!(scripts.len(), 7);
    assert!(scripts[1].contains("systemctl start"));
    assert!(scripts[3].contains("systemctl stop"));
    assert!(scripts[5].contains("/etc/workspace-projects/test.env"));
}

#[tokio::test]
async fn connection_failures_are_retried() {
    let h = Harness::new().await;
    let ws = active_workspace(&h).await;
    h.exec.transient_failures.store(2, Ordering::SeqCst);

    h.driver.start_project(&project_request(Some(&ws), None)).await.unwrap();
    assert_eq!(h.exec.call_count(), 3);
}

#[tokio::test]
async fn failing_script_is_not_retried() {
    let h = Harness::new().await;
    let ws = active_workspace(&h).await;
    h.exec.exit_code.store(3, Ordering::SeqCst);

    let err = h.driver.start_project(&project_request(Some(&ws), None)).await.unwrap_err();
    assert!(
        matches!(err, DriverError::RemoteCommand { exit_code: Some(3), .. }),
        "{err:?}"
    );
    assert_eq!(h.exec.call_count(), 1);

    let log = h.log_contents("123");
    assert!(log.contains("PROJECT_START"));
    assert!(log.contains("remote_command_error"));
}

#[tokio::test]
async fn project_info_reflects_the_unit_state() {
    let h = Harness::new().await;
    let ws = active_workspace(&h).await;

    h.exec.set_stdout("::phase::status\nstate=active\n");
    let info = h.driver.get_project_info(&project_request(Some(&ws), None)).await.unwrap();
    assert!(info.created && info.is_running);

    h.exec.set_stdout("state=inactive\n");
    let info = h.driver.get_project_info(&project_request(Some(&ws), None)).await.unwrap();
    assert!(info.created && !info.is_running);
    assert_eq!(project_state(&info.provider_metadata), ProjectState::Stopped);

    h.exec.set_stdout("state=absent\n");
    let info = h.driver.get_project_info(&project_request(Some(&ws), None)).await.unwrap();
    assert!(!info.created);

    h.exec.set_stdout("garbage");
    let err = h.driver.get_project_info(&project_request(Some(&ws), None)).await.unwrap_err();
    assert!(matches!(err, DriverError::RemoteCommand { .. }), "{err:?}");
}

#[tokio::test]
async fn invalid_project_requests_are_rejected_up_front() {
    let h = Harness::new().await;

    let mut req = project_request(None, None);
    req.project.name = "my project".into();
    assert!(matches!(h.driver.create_project(&req).await, Err(DriverError::Validation(_))));

    let mut req = project_request(None, None);
    req.project.env_vars.insert("BAD-KEY".into(), "x".into());
    assert!(matches!(h.driver.create_project(&req).await, Err(DriverError::Validation(_))));

    let mut req = project_request(None, None);
    req.project.env_vars.insert("CERT".into(), "-----BEGIN-----\nabc\n-----END-----".into());
    assert!(matches!(h.driver.create_project(&req).await, Err(DriverError::Validation(_))));

    let err = h
        .driver
        .create_project(&project_request(Some("{"), None))
        .await
        .unwrap_err();
    assert!(matches!(err, DriverError::Decode(_)), "{err:?}");

    assert_eq!(h.cloud.calls().connect, 0);
    assert_eq!(h.exec.call_count(), 0);
}

#[tokio::test]
async fn workspace_metadata_without_address_is_not_ready() {
    let h = Harness::new().await;
    let mut meta = WorkspaceMetadata::new(WorkspaceStatus::Active);
    meta.remote_id = Some("3000001".into());

    let err = h
        .driver
        .create_project(&project_request(Some(&encode(&meta)), None))
        .await
        .unwrap_err();
    assert!(matches!(err, DriverError::WorkspaceNotReady { .. }), "{err:?}");
    assert_eq!(h.exec.call_count(), 0);
}

#[tokio::test]
async fn secrets_stay_out_of_the_log() {
    let h = Harness::new().await;
    let ws = active_workspace(&h).await;
    h.exec.set_stdout("installed\n");
    h.driver.create_project(&project_request(Some(&ws), None)).await.unwrap();

    let log = h.log_contents("123");
    assert!(log.contains("PROJECT_CREATE"));
    assert!(log.contains("installed"));
    assert!(!log.contains("api-key-test"));
    assert!(!log.contains(TOKEN));
}
