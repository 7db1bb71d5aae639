use std::time::Duration;

use droplet_common::{DriverError, Result};
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

use crate::inventory::{InstanceState, RemoteInstance};
use crate::retry::BackoffPolicy;
use crate::CloudProvider;

/// How `await_active` polls a freshly created or powered-on instance.
#[derive(Debug, Clone)]
pub struct PollPolicy {
    /// Delay between polls; `max_retries` is not used here, `timeout` bounds the wait.
    pub backoff: BackoffPolicy,
    pub timeout: Duration,
    /// Consecutive transport failures tolerated before giving up.
    pub max_transient_errors: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy {
                initial_delay: Duration::from_secs(2),
                max_delay: Duration::from_secs(15),
                max_retries: 0,
            },
            timeout: Duration::from_secs(300),
            max_transient_errors: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Desired {
    Active,
    Off,
}

impl Desired {
    fn label(self) -> &'static str {
        match self {
            Desired::Active => "await_active",
            Desired::Off => "await_off",
        }
    }
}

/// Poll `get_instance` until the instance is active and has a public address.
///
/// - provisioning / unknown: keep polling
/// - off / archived / errored: `RemoteState`, no further polls
/// - transport errors: tolerated up to `max_transient_errors` in a row
/// - `cancel` fired: `Cancelled`; the instance is left as is
pub async fn await_active(
    provider: &dyn CloudProvider,
    instance_id: &str,
    policy: &PollPolicy,
    cancel: &CancellationToken,
) -> Result<RemoteInstance> {
    await_state(provider, instance_id, policy, cancel, Desired::Active).await
}

/// Poll until a power-off action has taken effect.
pub async fn await_off(
    provider: &dyn CloudProvider,
    instance_id: &str,
    policy: &PollPolicy,
    cancel: &CancellationToken,
) -> Result<RemoteInstance> {
    await_state(provider, instance_id, policy, cancel, Desired::Off).await
}

async fn await_state(
    provider: &dyn CloudProvider,
    instance_id: &str,
    policy: &PollPolicy,
    cancel: &CancellationToken,
    desired: Desired,
) -> Result<RemoteInstance> {
    let started = Instant::now();
    let label = desired.label();

    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            tracing::warn!("[{}] wait for {} cancelled after {:?}", label, instance_id, started.elapsed());
            Err(DriverError::Cancelled {
                operation: label.into(),
                remote_id: Some(instance_id.to_string()),
            })
        }
        res = tokio::time::timeout(policy.timeout, poll_until(provider, instance_id, policy, desired)) => {
            match res {
                Ok(out) => out,
                Err(_) => {
                    tracing::error!("[{}] {} not {:?} after {:?}", label, instance_id, desired, policy.timeout);
                    Err(DriverError::Timeout {
                        operation: label.into(),
                        remote_id: instance_id.to_string(),
                        waited: policy.timeout,
                    })
                }
            }
        }
    }
}

async fn poll_until(
    provider: &dyn CloudProvider,
    instance_id: &str,
    policy: &PollPolicy,
    desired: Desired,
) -> Result<RemoteInstance> {
    let label = desired.label();
    let mut attempt = 0u32;
    let mut transient_errors = 0u32;

    loop {
        match provider.get_instance(instance_id).await {
            Ok(instance) => {
                transient_errors = 0;
                let reached = match (desired, &instance.state) {
                    (Desired::Active, InstanceState::Active) => instance.public_ipv4.is_some(),
                    (Desired::Off, InstanceState::Off) => true,
                    _ => false,
                };
                if reached {
                    tracing::info!(
                        "[{}] {} is {} (attempt {})",
                        label,
                        instance_id,
                        instance.state.as_str(),
                        attempt + 1
                    );
                    return Ok(instance);
                }
                match (&instance.state, desired) {
                    (InstanceState::Off, Desired::Active)
                    | (InstanceState::Archived, _)
                    | (InstanceState::Errored, _) => {
                        return Err(DriverError::RemoteState {
                            remote_id: instance_id.to_string(),
                            status: instance.state.as_str().to_string(),
                        });
                    }
                    (state, _) => {
                        tracing::debug!(
                            "[{}] {} still {} (attempt {})",
                            label,
                            instance_id,
                            state.as_str(),
                            attempt + 1
                        );
                    }
                }
            }
            // A just-created instance may not be visible yet.
            Err(e) if e.is_transient() || e.is_not_found() => {
                transient_errors += 1;
                if transient_errors > policy.max_transient_errors {
                    return Err(match e {
                        DriverError::NotFound { .. } => e,
                        other => DriverError::transient(
                            label,
                            format!("{instance_id}: {transient_errors} consecutive failures, last: {other}"),
                        ),
                    });
                }
                tracing::warn!(
                    "[{}] poll {} failed ({}/{}): {}",
                    label,
                    instance_id,
                    transient_errors,
                    policy.max_transient_errors,
                    e
                );
            }
            Err(e) => return Err(e),
        }

        sleep(policy.backoff.delay_for(attempt)).await;
        attempt = attempt.saturating_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::InstanceSpec;
    use crate::mock::{MockBehavior, MockProvider};

    fn fast_policy() -> PollPolicy {
        PollPolicy {
            backoff: BackoffPolicy {
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                max_retries: 0,
            },
            timeout: Duration::from_millis(500),
            max_transient_errors: 2,
        }
    }

    fn spec() -> InstanceSpec {
        InstanceSpec {
            name: "ws-1".into(),
            region: "nyc3".into(),
            size: "s-1vcpu-1gb".into(),
            image: "ubuntu-22-04-x64".into(),
            tags: vec!["ws-1".into()],
            user_data: None,
            volume_ids: vec![],
        }
    }

    #[tokio::test]
    async fn keeps_polling_while_provisioning() {
        let provider = MockProvider::with_behavior(MockBehavior {
            polls_until_active: 3,
            ..Default::default()
        });
        let id = provider.create_instance(&spec()).await.unwrap();
        let inst = await_active(&provider, &id, &fast_policy(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(inst.state, InstanceState::Active);
        assert!(inst.public_ipv4.is_some());
        assert_eq!(provider.calls().get_instance, 4);
    }

    #[tokio::test]
    async fn errored_instance_stops_polling() {
        let provider = MockProvider::with_behavior(MockBehavior {
            polls_until_active: 1,
            fail_provisioning: true,
            ..Default::default()
        });
        let id = provider.create_instance(&spec()).await.unwrap();
        let err = await_active(&provider, &id, &fast_policy(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::RemoteState { ref status, .. } if status == "errored"));
        assert_eq!(provider.calls().get_instance, 1);
    }

    #[tokio::test]
    async fn transient_errors_are_bounded() {
        let provider = MockProvider::with_behavior(MockBehavior {
            transient_get_failures: 10,
            ..Default::default()
        });
        let id = provider.create_instance(&spec()).await.unwrap();
        let err = await_active(&provider, &id, &fast_policy(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(provider.calls().get_instance, 3);
    }

    #[tokio::test]
    async fn transient_errors_below_the_bound_are_absorbed() {
        let provider = MockProvider::with_behavior(MockBehavior {
            transient_get_failures: 2,
            ..Default::default()
        });
        let id = provider.create_instance(&spec()).await.unwrap();
        let inst = await_active(&provider, &id, &fast_policy(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(inst.id, id);
    }

    #[tokio::test]
    async fn times_out_when_never_active() {
        let provider = MockProvider::with_behavior(MockBehavior {
            never_active: true,
            ..Default::default()
        });
        let id = provider.create_instance(&spec()).await.unwrap();
        let mut policy = fast_policy();
        policy.timeout = Duration::from_millis(40);
        let err = await_active(&provider, &id, &policy, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Timeout { ref remote_id, .. } if *remote_id == id));
        assert!(provider.instance(&id).is_some(), "instance must not be rolled back");
    }

    #[tokio::test]
    async fn cancellation_aborts_the_wait() {
        let provider = MockProvider::with_behavior(MockBehavior {
            never_active: true,
            ..Default::default()
        });
        let id = provider.create_instance(&spec()).await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = await_active(&provider, &id, &fast_policy(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Cancelled { .. }));
        assert_eq!(provider.droplet_count(), 1);
    }

    #[tokio::test]
    async fn waits_for_power_off() {
        let provider = MockProvider::new();
        let id = provider.create_instance(&spec()).await.unwrap();
        await_active(&provider, &id, &fast_policy(), &CancellationToken::new())
            .await
            .unwrap();
        provider.power_off(&id).await.unwrap();
        let inst = await_off(&provider, &id, &fast_policy(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(inst.state, InstanceState::Off);
    }
}
