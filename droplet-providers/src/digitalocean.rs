use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use droplet_common::{DriverError, Result, TargetOptions};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Client, Method, StatusCode};
use serde_json::{json, Value};

use crate::inventory::{
    DeleteOutcome, InstanceSpec, InstanceState, RemoteInstance, RemoteVolume, VolumeSpec,
};
use crate::retry::{retry_transient, retry_when, BackoffPolicy};
use crate::{CloudProvider, ProviderFactory};

pub const DEFAULT_API_BASE_URL: &str = "https://api.digitalocean.com";

// Used when a 429 carries no Retry-After header.
const DEFAULT_RATE_LIMIT_WAIT: Duration = Duration::from_secs(2);

/// HTTP settings shared by every client the factory hands out.
#[derive(Debug, Clone)]
pub struct DigitalOceanConfig {
    pub base_url: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub retry: BackoffPolicy,
}

impl Default for DigitalOceanConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_BASE_URL.to_string(),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(20),
            retry: BackoffPolicy::default(),
        }
    }
}

pub struct DigitalOceanProvider {
    client: Client,
    base_url: String,
    headers: HeaderMap,
    retry: BackoffPolicy,
}

impl fmt::Debug for DigitalOceanProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DigitalOceanProvider")
            .field("base_url", &self.base_url)
            .field("token", &"<redacted>")
            .finish()
    }
}

// Identifies what a request is about, so a 404 becomes a precise NotFound.
struct Target<'a> {
    kind: &'static str,
    id: &'a str,
}

impl DigitalOceanProvider {
    pub fn new(token: &str, config: &DigitalOceanConfig) -> Result<Self> {
        // Default reqwest client has no overall timeout. A stalled API call must not hang a lifecycle call.
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| DriverError::Api {
                operation: "build http client".into(),
                status: 0,
                body: e.to_string(),
            })?;

        let mut auth = HeaderValue::from_str(&format!("Bearer {}", token.trim()))
            .map_err(|_| DriverError::validation("Auth Token contains invalid characters"))?;
        auth.set_sensitive(true);
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            headers,
            retry: config.retry.clone(),
        })
    }

    /// Idempotent request: every transient failure is retried.
    async fn request(
        &self,
        operation: &str,
        method: Method,
        path: &str,
        body: Option<&Value>,
        target: &Target<'_>,
    ) -> Result<Option<Value>> {
        retry_transient(&self.retry, operation, || {
            self.request_once(operation, method.clone(), path, body, target)
        })
        .await
    }

    /// Non-idempotent request: only retried when the API rejected it outright (429).
    /// A timeout or 5xx may have created the resource, so those are surfaced.
    async fn request_create(
        &self,
        operation: &str,
        path: &str,
        body: &Value,
        target: &Target<'_>,
    ) -> Result<Option<Value>> {
        retry_when(
            &self.retry,
            operation,
            |e| e.retry_after().is_some(),
            || self.request_once(operation, Method::POST, path, Some(body), target),
        )
        .await
    }

    async fn request_once(
        &self,
        operation: &str,
        method: Method,
        path: &str,
        body: Option<&Value>,
        target: &Target<'_>,
    ) -> Result<Option<Value>> {
        let url = format!("{}{}", self.base_url, path);
        tracing::debug!("[DigitalOcean API] {} {} ({})", method, url, operation);

        let mut req = self
            .client
            .request(method.clone(), &url)
            .headers(self.headers.clone());
        if let Some(body) = body {
            req = req.json(body);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| DriverError::transient(operation, format!("{method} {url}: {e}")))?;

        let status = resp.status();
        if status.is_success() {
            tracing::debug!("[DigitalOcean API] {} {} succeeded: status={}", method, url, status.as_u16());
            if status == StatusCode::NO_CONTENT {
                return Ok(None);
            }
            let text = resp
                .text()
                .await
                .map_err(|e| DriverError::transient(operation, e))?;
            if text.trim().is_empty() {
                return Ok(None);
            }
            return serde_json::from_str(&text).map(Some).map_err(|e| DriverError::Api {
                operation: operation.to_string(),
                status: status.as_u16(),
                body: format!("invalid JSON in response: {e}"),
            });
        }

        let retry_after = parse_retry_after(resp.headers());
        let text = resp.text().await.unwrap_or_default();
        tracing::warn!(
            "[DigitalOcean API] {} {} failed: status={}, response={}",
            method,
            url,
            status.as_u16(),
            truncate(&text, 500)
        );
        Err(classify_status(operation, target, status, text, retry_after))
    }
}

fn classify_status(
    operation: &str,
    target: &Target<'_>,
    status: StatusCode,
    body: String,
    retry_after: Option<Duration>,
) -> DriverError {
    match status {
        StatusCode::NOT_FOUND => DriverError::not_found(target.kind, target.id),
        StatusCode::TOO_MANY_REQUESTS => DriverError::Transient {
            operation: operation.to_string(),
            message: format!("rate limited: {}", truncate(&body, 200)),
            retry_after: Some(retry_after.unwrap_or(DEFAULT_RATE_LIMIT_WAIT)),
        },
        s if s.is_server_error() => DriverError::Transient {
            operation: operation.to_string(),
            message: format!("status={} body={}", s.as_u16(), truncate(&body, 200)),
            retry_after: None,
        },
        s => DriverError::Api {
            operation: operation.to_string(),
            status: s.as_u16(),
            body,
        },
    }
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    format!("{}... (truncated)", s.chars().take(max_chars).collect::<String>())
}

fn id_string(v: &Value) -> Option<String> {
    match v {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

fn string_list(v: &Value) -> Vec<String> {
    v.as_array()
        .map(|items| items.iter().filter_map(id_string).collect())
        .unwrap_or_default()
}

pub(crate) fn parse_droplet(v: &Value) -> Result<RemoteInstance> {
    let id = id_string(&v["id"]).ok_or_else(|| DriverError::Api {
        operation: "parse droplet".into(),
        status: 200,
        body: "droplet without id".into(),
    })?;

    let public_ipv4 = v["networks"]["v4"].as_array().and_then(|nets| {
        nets.iter()
            .find(|n| n["type"].as_str() == Some("public"))
            .and_then(|n| n["ip_address"].as_str())
            .map(str::to_string)
    });

    Ok(RemoteInstance {
        id,
        name: v["name"].as_str().unwrap_or_default().to_string(),
        state: InstanceState::from_provider(v["status"].as_str().unwrap_or("unknown")),
        public_ipv4,
        region: v["region"]["slug"].as_str().map(str::to_string),
        tags: string_list(&v["tags"]),
        volume_ids: string_list(&v["volume_ids"]),
    })
}

pub(crate) fn parse_volume(v: &Value) -> Result<RemoteVolume> {
    let id = id_string(&v["id"]).ok_or_else(|| DriverError::Api {
        operation: "parse volume".into(),
        status: 200,
        body: "volume without id".into(),
    })?;
    Ok(RemoteVolume {
        id,
        name: v["name"].as_str().unwrap_or_default().to_string(),
        region: v["region"]["slug"].as_str().unwrap_or_default().to_string(),
        size_gb: v["size_gigabytes"]
            .as_u64()
            .and_then(|s| u32::try_from(s).ok())
            .unwrap_or(0),
        attached_to: string_list(&v["droplet_ids"]),
    })
}

fn missing(operation: &str, what: &str) -> DriverError {
    DriverError::Api {
        operation: operation.to_string(),
        status: 200,
        body: format!("response without {what}"),
    }
}

#[async_trait]
impl CloudProvider for DigitalOceanProvider {
    async fn create_instance(&self, spec: &InstanceSpec) -> Result<String> {
        let mut body = json!({
            "name": spec.name,
            "region": spec.region,
            "size": spec.size,
            "image": spec.image,
            "tags": spec.tags,
            "monitoring": true,
        });
        if !spec.volume_ids.is_empty() {
            body["volumes"] = json!(spec.volume_ids);
        }
        if let Some(user_data) = spec.user_data.as_deref().filter(|u| !u.trim().is_empty()) {
            body["user_data"] = json!(user_data);
        }

        tracing::info!(
            "[DigitalOcean API] Creating droplet: name={}, region={}, size={}, image={}, volumes={}",
            spec.name,
            spec.region,
            spec.size,
            spec.image,
            spec.volume_ids.len()
        );

        let resp = self
            .request_create(
                "create_instance",
                "/v2/droplets",
                &body,
                &Target { kind: "droplet", id: &spec.name },
            )
            .await?
            .ok_or_else(|| missing("create_instance", "body"))?;

        let droplet_id =
            id_string(&resp["droplet"]["id"]).ok_or_else(|| missing("create_instance", "droplet id"))?;
        tracing::info!(
            "[DigitalOcean API] Droplet created: id={}, status={}",
            droplet_id,
            resp["droplet"]["status"].as_str().unwrap_or("unknown")
        );
        Ok(droplet_id)
    }

    async fn get_instance(&self, instance_id: &str) -> Result<RemoteInstance> {
        let resp = self
            .request(
                "get_instance",
                Method::GET,
                &format!("/v2/droplets/{instance_id}"),
                None,
                &Target { kind: "droplet", id: instance_id },
            )
            .await?
            .ok_or_else(|| missing("get_instance", "body"))?;
        parse_droplet(&resp["droplet"])
    }

    async fn delete_instance(&self, instance_id: &str) -> Result<DeleteOutcome> {
        tracing::info!("[DigitalOcean API] Deleting droplet {}", instance_id);
        match self
            .request(
                "delete_instance",
                Method::DELETE,
                &format!("/v2/droplets/{instance_id}"),
                None,
                &Target { kind: "droplet", id: instance_id },
            )
            .await
        {
            Ok(_) => Ok(DeleteOutcome::Deleted),
            Err(e) if e.is_not_found() => {
                tracing::info!("[DigitalOcean API] Droplet {} already deleted", instance_id);
                Ok(DeleteOutcome::AlreadyAbsent)
            }
            Err(e) => Err(e),
        }
    }

    async fn find_instances_by_tag(&self, tag: &str) -> Result<Vec<RemoteInstance>> {
        let resp = self
            .request(
                "find_instances_by_tag",
                Method::GET,
                &format!("/v2/droplets?tag_name={tag}&per_page=200"),
                None,
                &Target { kind: "tag", id: tag },
            )
            .await?
            .ok_or_else(|| missing("find_instances_by_tag", "body"))?;

        resp["droplets"]
            .as_array()
            .map(|items| items.iter().map(parse_droplet).collect())
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn power_on(&self, instance_id: &str) -> Result<()> {
        tracing::info!("[DigitalOcean API] Powering on droplet {}", instance_id);
        self.request(
            "power_on",
            Method::POST,
            &format!("/v2/droplets/{instance_id}/actions"),
            Some(&json!({ "type": "power_on" })),
            &Target { kind: "droplet", id: instance_id },
        )
        .await?;
        Ok(())
    }

    async fn power_off(&self, instance_id: &str) -> Result<()> {
        tracing::info!("[DigitalOcean API] Powering off droplet {}", instance_id);
        self.request(
            "power_off",
            Method::POST,
            &format!("/v2/droplets/{instance_id}/actions"),
            Some(&json!({ "type": "power_off" })),
            &Target { kind: "droplet", id: instance_id },
        )
        .await?;
        Ok(())
    }

    async fn tag_instance(&self, instance_id: &str, tag: &str) -> Result<()> {
        tracing::info!("[DigitalOcean API] Tagging droplet {} with {}", instance_id, tag);
        // A tag must exist before resources can be attached to it.
        match self
            .request(
                "create_tag",
                Method::POST,
                "/v2/tags",
                Some(&json!({ "name": tag })),
                &Target { kind: "tag", id: tag },
            )
            .await
        {
            Ok(_) => {}
            Err(DriverError::Api { status: 422, .. }) => {
                tracing::debug!("[DigitalOcean API] Tag {} already exists", tag);
            }
            Err(e) => return Err(e),
        }

        self.request(
            "tag_instance",
            Method::POST,
            &format!("/v2/tags/{tag}/resources"),
            Some(&json!({
                "resources": [{ "resource_id": instance_id, "resource_type": "droplet" }]
            })),
            &Target { kind: "droplet", id: instance_id },
        )
        .await?;
        Ok(())
    }

    async fn find_volume(&self, name: &str, region: &str) -> Result<Option<RemoteVolume>> {
        let resp = self
            .request(
                "find_volume",
                Method::GET,
                &format!("/v2/volumes?name={name}&region={region}"),
                None,
                &Target { kind: "volume", id: name },
            )
            .await?
            .ok_or_else(|| missing("find_volume", "body"))?;

        match resp["volumes"].as_array().and_then(|v| v.first()) {
            Some(v) => parse_volume(v).map(Some),
            None => Ok(None),
        }
    }

    async fn create_volume(&self, spec: &VolumeSpec) -> Result<RemoteVolume> {
        let body = json!({
            "name": spec.name,
            "region": spec.region,
            "size_gigabytes": spec.size_gb,
            "filesystem_type": "ext4",
            "tags": spec.tags,
        });
        tracing::info!(
            "[DigitalOcean API] Creating volume: name={}, region={}, size={}GB",
            spec.name,
            spec.region,
            spec.size_gb
        );
        let resp = self
            .request_create(
                "create_volume",
                "/v2/volumes",
                &body,
                &Target { kind: "volume", id: &spec.name },
            )
            .await?
            .ok_or_else(|| missing("create_volume", "body"))?;
        parse_volume(&resp["volume"])
    }

    async fn delete_volume(&self, volume_id: &str) -> Result<DeleteOutcome> {
        tracing::info!("[DigitalOcean API] Deleting volume {}", volume_id);
        match self
            .request(
                "delete_volume",
                Method::DELETE,
                &format!("/v2/volumes/{volume_id}"),
                None,
                &Target { kind: "volume", id: volume_id },
            )
            .await
        {
            Ok(_) => Ok(DeleteOutcome::Deleted),
            Err(e) if e.is_not_found() => Ok(DeleteOutcome::AlreadyAbsent),
            Err(e) => Err(e),
        }
    }
}

/// Hands out one [`DigitalOceanProvider`] per request token.
#[derive(Debug, Clone, Default)]
pub struct DigitalOceanFactory {
    config: DigitalOceanConfig,
}

impl DigitalOceanFactory {
    pub fn new(config: DigitalOceanConfig) -> Self {
        Self { config }
    }
}

impl ProviderFactory for DigitalOceanFactory {
    fn connect(&self, options: &TargetOptions) -> Result<Arc<dyn CloudProvider>> {
        Ok(Arc::new(DigitalOceanProvider::new(
            options.auth_token(),
            &self.config,
        )?))
    }
}
