//! Shell scripts run on workspace VMs.
//!
//! Every script is sent on ssh's stdin. Values are single-quoted with
//! [`sh_escape_single`]; env values only ever appear inside a quoted heredoc.

use std::collections::BTreeMap;

use droplet_common::Project;

use crate::context::DriverContext;
use crate::remote::sh_escape_single;

pub const DATA_MOUNT: &str = "/mnt/workspace-data";
pub const AGENT_BIN: &str = "/usr/local/bin/workspace-agent";
pub const AGENT_VERSION_FILE: &str = "/usr/local/lib/workspace-agent/VERSION";
pub const ENV_DIR: &str = "/etc/workspace-projects";

pub fn unit_name(project_name: &str) -> String {
    format!("workspace-project-{project_name}.service")
}

fn env_file(project_name: &str) -> String {
    format!("{ENV_DIR}/{project_name}.env")
}

fn project_dir(ctx: &DriverContext, project_name: &str) -> String {
    format!("{}/{}", ctx.base_path, project_name)
}

/// cloud-init user data: authorize the driver's key and mount the data volume.
pub fn cloud_init(ssh_user: &str, ssh_public_key: Option<&str>, volume_name: Option<&str>) -> String {
    let mut script = String::from("#!/bin/bash\nset -u\n");

    if let Some(key) = ssh_public_key {
        let home = if ssh_user == "root" {
            "/root".to_string()
        } else {
            format!("/home/{ssh_user}")
        };
        script.push_str(&format!(
            r#"
SSH_USER={user}
SSH_HOME={home}
if ! id "$SSH_USER" >/dev/null 2>&1; then
  useradd -m -s /bin/bash "$SSH_USER"
  echo "$SSH_USER ALL=(ALL) NOPASSWD:ALL" > "/etc/sudoers.d/90-$SSH_USER"
  chmod 440 "/etc/sudoers.d/90-$SSH_USER"
fi
mkdir -p "$SSH_HOME/.ssh"
chmod 700 "$SSH_HOME/.ssh"
grep -qxF {key} "$SSH_HOME/.ssh/authorized_keys" 2>/dev/null || echo {key} >> "$SSH_HOME/.ssh/authorized_keys"
chmod 600 "$SSH_HOME/.ssh/authorized_keys"
chown -R "$SSH_USER:$SSH_USER" "$SSH_HOME/.ssh"
"#,
            user = sh_escape_single(ssh_user),
            home = sh_escape_single(&home),
            key = sh_escape_single(key),
        ));
    }

    if let Some(volume) = volume_name {
        script.push_str(&format!(
            r#"
DATA_DEV={dev}
DATA_MNT={mnt}
for _ in $(seq 1 30); do
  [ -e "$DATA_DEV" ] && break
  sleep 2
done
if [ -e "$DATA_DEV" ]; then
  mkdir -p "$DATA_MNT"
  mountpoint -q "$DATA_MNT" || mount -o discard,defaults,noatime "$DATA_DEV" "$DATA_MNT"
  grep -q "$DATA_DEV" /etc/fstab || echo "$DATA_DEV $DATA_MNT ext4 defaults,nofail,discard,noatime 0 2" >> /etc/fstab
fi
"#,
            dev = sh_escape_single(&format!("/dev/disk/by-id/scsi-0DO_Volume_{volume}")),
            mnt = sh_escape_single(DATA_MOUNT),
        ));
    }

    script
}

/// Variables every project process gets. Keys set by the project win on conflict.
pub fn project_env(ctx: &DriverContext, project: &Project) -> BTreeMap<String, String> {
    let mut env = BTreeMap::from([
        ("WS_ID".to_string(), project.workspace_id.clone()),
        ("WS_PROJECT_NAME".to_string(), project.name.clone()),
        ("WS_PROJECT_REPOSITORY_URL".to_string(), project.repository.url.clone()),
        ("SERVER_URL".to_string(), ctx.server_url.clone()),
        ("SERVER_API_URL".to_string(), ctx.api_url.clone()),
        ("SERVER_PORT".to_string(), ctx.server_port.to_string()),
        ("API_PORT".to_string(), ctx.api_port.to_string()),
        ("SERVER_VERSION".to_string(), ctx.agent_version.clone()),
    ]);
    for (k, v) in &project.env_vars {
        env.insert(k.clone(), v.clone());
    }
    env
}

/// systemd `EnvironmentFile` body. Values are double-quoted with C-style escapes so
/// no line of the file can be mistaken for a heredoc terminator.
pub fn env_file_contents(env: &BTreeMap<String, String>) -> String {
    env.iter()
        .map(|(k, v)| {
            let escaped = v
                .replace('\\', "\\\\")
                .replace('"', "\\\"")
                .replace('\n', "\\n")
                .replace('\r', "\\r");
            format!("{k}=\"{escaped}\"\n")
        })
        .collect()
}

pub fn install_script(ctx: &DriverContext, agent_command: &str, project: &Project) -> String {
    let env = env_file_contents(&project_env(ctx, project));
    format!(
        r#"#!/usr/bin/env bash
set -euo pipefail
export DEBIAN_FRONTEND=noninteractive

PROJECT_NAME={name}
PROJECT_DIR={dir}
ENV_FILE={env_file}
UNIT={unit}
UNIT_FILE="/etc/systemd/system/$UNIT"
AGENT_URL={agent_url}
AGENT_VERSION={agent_version}
AGENT_BIN={agent_bin}
AGENT_VERSION_FILE={agent_version_file}

echo "::phase::start"
mkdir -p "$PROJECT_DIR" {env_dir} "$(dirname "$AGENT_VERSION_FILE")"
chmod 700 {env_dir}

echo "::phase::env_file"
(
  umask 077
  cat > "$ENV_FILE.tmp" <<'WS_ENV_EOF'
{env}WS_ENV_EOF
)
chmod 600 "$ENV_FILE.tmp"
mv -f "$ENV_FILE.tmp" "$ENV_FILE"

echo "::phase::agent"
if [ ! -x "$AGENT_BIN" ] || [ "$(cat "$AGENT_VERSION_FILE" 2>/dev/null || true)" != "$AGENT_VERSION" ]; then
  command -v curl >/dev/null || (apt-get update -y && apt-get install -y curl)
  curl -fsSL --retry 3 -o "$AGENT_BIN.tmp" "$AGENT_URL"
  chmod 755 "$AGENT_BIN.tmp"
  mv -f "$AGENT_BIN.tmp" "$AGENT_BIN"
  echo "$AGENT_VERSION" > "$AGENT_VERSION_FILE"
fi

echo "::phase::unit"
cat > "$UNIT_FILE" <<WS_UNIT_EOF
[Unit]
Description=Workspace project $PROJECT_NAME
After=network-online.target
Wants=network-online.target

[Service]
EnvironmentFile=$ENV_FILE
WorkingDirectory=$PROJECT_DIR
ExecStart=$AGENT_BIN {agent_command}
Restart=on-failure
RestartSec=5

[Install]
WantedBy=multi-user.target
WS_UNIT_EOF
systemctl daemon-reload
systemctl enable "$UNIT" >/dev/null 2>&1

echo "::phase::done"
"#,
        name = sh_escape_single(&project.name),
        dir = sh_escape_single(&project_dir(ctx, &project.name)),
        env_file = sh_escape_single(&env_file(&project.name)),
        unit = sh_escape_single(&unit_name(&project.name)),
        agent_url = sh_escape_single(&ctx.agent_download_url),
        agent_version = sh_escape_single(&ctx.agent_version),
        agent_bin = sh_escape_single(AGENT_BIN),
        agent_version_file = sh_escape_single(AGENT_VERSION_FILE),
        env_dir = sh_escape_single(ENV_DIR),
        env = env,
        agent_command = agent_command,
    )
}

pub fn start_script(project_name: &str) -> String {
    format!(
        r#"#!/usr/bin/env bash
set -euo pipefail
UNIT={unit}
if ! systemctl cat "$UNIT" >/dev/null 2>&1; then
  echo "unit $UNIT is not installed" >&2
  exit 3
fi
systemctl start "$UNIT"
"#,
        unit = sh_escape_single(&unit_name(project_name)),
    )
}

pub fn stop_script(project_name: &str) -> String {
    format!(
        r#"#!/usr/bin/env bash
set -euo pipefail
UNIT={unit}
if systemctl cat "$UNIT" >/dev/null 2>&1; then
  systemctl stop "$UNIT"
fi
"#,
        unit = sh_escape_single(&unit_name(project_name)),
    )
}

pub fn destroy_script(ctx: &DriverContext, project_name: &str) -> String {
    format!(
        r#"#!/usr/bin/env bash
set -uo pipefail
UNIT={unit}
systemctl disable --now "$UNIT" >/dev/null 2>&1 || true
rm -f "/etc/systemd/system/$UNIT" {env_file}
rm -rf -- {dir}
systemctl daemon-reload
systemctl reset-failed "$UNIT" >/dev/null 2>&1 || true
exit 0
"#,
        unit = sh_escape_single(&unit_name(project_name)),
        env_file = sh_escape_single(&env_file(project_name)),
        dir = sh_escape_single(&project_dir(ctx, project_name)),
    )
}

pub fn status_script(project_name: &str) -> String {
    format!(
        r#"#!/usr/bin/env bash
UNIT={unit}
if ! systemctl cat "$UNIT" >/dev/null 2>&1; then
  echo "state=absent"
  exit 0
fi
echo "state=$(systemctl is-active "$UNIT" 2>/dev/null || true)"
"#,
        unit = sh_escape_single(&unit_name(project_name)),
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitStatus {
    Absent,
    Running,
    Stopped,
    Failed,
}

/// Parse the `state=` line printed by [`status_script`].
pub fn parse_status(stdout: &str) -> Option<UnitStatus> {
    let state = stdout
        .lines()
        .rev()
        .find_map(|l| l.trim().strip_prefix("state="))?;
    Some(match state.trim() {
        "absent" => UnitStatus::Absent,
        "active" | "activating" | "reloading" => UnitStatus::Running,
        "failed" => UnitStatus::Failed,
        _ => UnitStatus::Stopped,
    })
}
