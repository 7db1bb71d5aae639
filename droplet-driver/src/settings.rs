use std::time::Duration;

use droplet_providers::{BackoffPolicy, PollPolicy};

/// Process-level knobs, read once from the environment (and `.env` when present).
///
/// Everything that varies per request (credentials, region, size) lives in
/// `TargetOptions` instead.
#[derive(Debug, Clone)]
pub struct DriverSettings {
    pub api_base_url: String,
    pub api_connect_timeout: Duration,
    pub api_request_timeout: Duration,
    pub api_max_retries: u32,

    pub ssh_user: String,
    pub ssh_private_key_file: String,
    /// Installed into `authorized_keys` through cloud-init.
    pub ssh_public_key: Option<String>,
    pub ssh_connect_timeout: Duration,
    pub ssh_command_timeout: Duration,
    pub exec_max_retries: u32,
    pub exec_retry_delay: Duration,

    pub provision_timeout: Duration,
    pub poll_initial_delay: Duration,
    pub poll_max_delay: Duration,
    pub poll_max_transient_errors: u32,
    pub volume_delete_retries: u32,

    /// Arguments passed to the agent binary by each project unit.
    pub agent_command: String,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl DriverSettings {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let string = |key: &str, default: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| default.to_string())
        };
        let number = |key: &str, default: u64| {
            lookup(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .filter(|v| *v > 0)
                .unwrap_or(default)
        };
        let count = |key: &str, default: u32| {
            lookup(key)
                .and_then(|v| v.trim().parse::<u32>().ok())
                .unwrap_or(default)
        };

        let home = string("HOME", "/root");
        let ssh_private_key_file = string(
            "DROPLET_SSH_PRIVATE_KEY_FILE",
            &format!("{home}/.ssh/id_ed25519"),
        );
        // Prefer the key file next to the private key, fallback to an env string.
        let ssh_public_key_file = string(
            "DROPLET_SSH_PUBLIC_KEY_FILE",
            &format!("{ssh_private_key_file}.pub"),
        );
        let ssh_public_key = std::fs::read_to_string(&ssh_public_key_file)
            .ok()
            .or_else(|| lookup("DROPLET_SSH_PUBLIC_KEY"))
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        Self {
            api_base_url: string("DIGITALOCEAN_API_URL", "https://api.digitalocean.com"),
            api_connect_timeout: Duration::from_secs(number("DROPLET_API_CONNECT_TIMEOUT_S", 5)),
            api_request_timeout: Duration::from_secs(number("DROPLET_API_TIMEOUT_S", 20)),
            api_max_retries: count("DROPLET_API_MAX_RETRIES", 5),

            ssh_user: string("DROPLET_SSH_USER", "root"),
            ssh_private_key_file,
            ssh_public_key,
            ssh_connect_timeout: Duration::from_secs(number("DROPLET_SSH_CONNECT_TIMEOUT_S", 10)),
            ssh_command_timeout: Duration::from_secs(number("DROPLET_SSH_COMMAND_TIMEOUT_S", 900)),
            exec_max_retries: count("DROPLET_EXEC_MAX_RETRIES", 4),
            exec_retry_delay: Duration::from_millis(number("DROPLET_EXEC_RETRY_DELAY_MS", 2_000)),

            provision_timeout: Duration::from_secs(number("DROPLET_PROVISION_TIMEOUT_S", 300)),
            poll_initial_delay: Duration::from_millis(number("DROPLET_POLL_INITIAL_MS", 2_000)),
            poll_max_delay: Duration::from_millis(number("DROPLET_POLL_MAX_MS", 15_000)),
            poll_max_transient_errors: count("DROPLET_POLL_MAX_TRANSIENT_ERRORS", 5),
            volume_delete_retries: count("DROPLET_VOLUME_DELETE_RETRIES", 6),

            agent_command: string("DROPLET_AGENT_COMMAND", "agent"),
        }
    }

    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy {
            backoff: BackoffPolicy {
                initial_delay: self.poll_initial_delay,
                max_delay: self.poll_max_delay,
                max_retries: 0,
            },
            timeout: self.provision_timeout,
            max_transient_errors: self.poll_max_transient_errors,
        }
    }

    pub fn api_retry(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_retries: self.api_max_retries,
            ..BackoffPolicy::default()
        }
    }

    /// Backoff for SSH connectivity failures (exit 255, timeouts).
    pub fn exec_retry(&self) -> BackoffPolicy {
        BackoffPolicy {
            initial_delay: self.exec_retry_delay,
            max_delay: self.exec_retry_delay.saturating_mul(10),
            max_retries: self.exec_max_retries,
        }
    }

    // A deleted droplet releases its volume a few seconds later.
    pub fn volume_delete_retry(&self) -> BackoffPolicy {
        BackoffPolicy {
            initial_delay: self.poll_initial_delay,
            max_delay: self.poll_max_delay,
            max_retries: self.volume_delete_retries,
        }
    }

    #[cfg(feature = "provider-digitalocean")]
    pub fn api_config(&self) -> droplet_providers::digitalocean::DigitalOceanConfig {
        droplet_providers::digitalocean::DigitalOceanConfig {
            base_url: self.api_base_url.clone(),
            connect_timeout: self.api_connect_timeout,
            request_timeout: self.api_request_timeout,
            retry: self.api_retry(),
        }
    }
}
