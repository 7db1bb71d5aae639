use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{DriverError, Result};
use crate::machine_size::{self, SUGGESTED_SIZES};

pub const DEFAULT_REGION: &str = "nyc3";
pub const DEFAULT_SIZE: &str = "s-2vcpu-4gb";
pub const DEFAULT_IMAGE: &str = "ubuntu-22-04-x64";
pub const DEFAULT_DISK_SIZE_GB: u32 = 20;

const SUGGESTED_REGIONS: &[&str] = &[
    "ams3", "blr1", "fra1", "lon1", "nyc1", "nyc3", "sfo2", "sfo3", "sgp1", "syd1", "tor1",
];

const SUGGESTED_IMAGES: &[&str] = &[
    "ubuntu-20-04-x64",
    "ubuntu-22-04-x64",
    "ubuntu-24-04-x64",
    "debian-12-x64",
];

/// Validated provisioning configuration for one target.
///
/// Built only through [`TargetOptions::parse`], so a value in hand always has every
/// required field. The auth token is kept out of `Debug` output.
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct TargetOptions {
    #[serde(rename = "Region")]
    pub region: String,
    #[serde(rename = "Size")]
    pub size: String,
    #[serde(rename = "Image")]
    pub image: String,
    #[serde(rename = "Disk Size")]
    pub disk_size: u32,
    #[serde(rename = "Auth Token")]
    auth_token: String,
}

// Wire shape as sent by the host, before validation.
#[derive(Deserialize)]
struct RawTargetOptions {
    #[serde(rename = "Region", alias = "region")]
    region: Option<String>,
    #[serde(rename = "Size", alias = "size")]
    size: Option<String>,
    #[serde(rename = "Image", alias = "image")]
    image: Option<String>,
    #[serde(rename = "Disk Size", alias = "diskSize", alias = "disk_size")]
    disk_size: Option<i64>,
    #[serde(rename = "Auth Token", alias = "authToken", alias = "auth_token")]
    auth_token: Option<String>,
}

fn required(field: &str, value: Option<String>) -> Result<String> {
    let value = value.map(|v| v.trim().to_string()).unwrap_or_default();
    if value.is_empty() {
        return Err(DriverError::validation(format!("{field} is required")));
    }
    Ok(value)
}

impl TargetOptions {
    /// Parse and validate the host's serialized target options.
    ///
    /// Pure: no I/O, no environment lookups.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw: RawTargetOptions = serde_json::from_str(raw)
            .map_err(|e| DriverError::validation(format!("malformed target options: {e}")))?;

        let region = required("Region", raw.region)?;
        let size = required("Size", raw.size)?;
        let image = required("Image", raw.image)?;
        let auth_token = required("Auth Token", raw.auth_token)?;

        let disk_size = match raw.disk_size {
            Some(d) if d > 0 => u32::try_from(d)
                .map_err(|_| DriverError::validation(format!("Disk Size {d} is too large")))?,
            Some(d) => {
                return Err(DriverError::validation(format!(
                    "Disk Size must be positive (got {d})"
                )))
            }
            None => return Err(DriverError::validation("Disk Size is required")),
        };

        if !machine_size::is_known_size(&size) {
            return Err(DriverError::validation(format!(
                "unknown machine size '{size}'"
            )));
        }

        Ok(Self {
            region,
            size,
            image,
            disk_size,
            auth_token,
        })
    }

    pub fn auth_token(&self) -> &str {
        &self.auth_token
    }

    /// Serialized form accepted by [`TargetOptions::parse`].
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

impl fmt::Debug for TargetOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetOptions")
            .field("region", &self.region)
            .field("size", &self.size)
            .field("image", &self.image)
            .field("disk_size", &self.disk_size)
            .field("auth_token", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyType {
    String,
    Int,
}

/// One entry of the target manifest shown by the host when a user configures a target.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetProperty {
    pub name: String,
    #[serde(rename = "type")]
    pub property_type: PropertyType,
    pub default_value: String,
    pub input_masked: bool,
    pub description: String,
    pub suggestions: Vec<String>,
}

fn suggestions(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Ordered description of every target option.
pub fn target_manifest() -> Vec<TargetProperty> {
    vec![
        TargetProperty {
            name: "Region".into(),
            property_type: PropertyType::String,
            default_value: DEFAULT_REGION.into(),
            input_masked: false,
            description: "The region where the droplet and its volume are created.".into(),
            suggestions: suggestions(SUGGESTED_REGIONS),
        },
        TargetProperty {
            name: "Size".into(),
            property_type: PropertyType::String,
            default_value: DEFAULT_SIZE.into(),
            input_masked: false,
            description: "Droplet size slug.".into(),
            suggestions: suggestions(SUGGESTED_SIZES),
        },
        TargetProperty {
            name: "Image".into(),
            property_type: PropertyType::String,
            default_value: DEFAULT_IMAGE.into(),
            input_masked: false,
            description: "OS image slug. Must support cloud-init and systemd.".into(),
            suggestions: suggestions(SUGGESTED_IMAGES),
        },
        TargetProperty {
            name: "Disk Size".into(),
            property_type: PropertyType::Int,
            default_value: DEFAULT_DISK_SIZE_GB.to_string(),
            input_masked: false,
            description: "Size of the attached data volume in GB.".into(),
            suggestions: vec![],
        },
        TargetProperty {
            name: "Auth Token".into(),
            property_type: PropertyType::String,
            default_value: String::new(),
            input_masked: true,
            description: "API token with read/write scope. Required.".into(),
            suggestions: vec![],
        },
    ]
}

/// A target the host can offer without asking the user for options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderTarget {
    pub name: String,
    pub provider_name: String,
    pub options: String,
}

/// Always empty: a target is useless without an auth token.
pub fn default_targets() -> Vec<ProviderTarget> {
    Vec::new()
}
