//! JSON payloads exchanged with devices over MQTT.
//!
//! Device responses use camelCase keys inside `result`; health beats and the
//! command envelopes use the snake_case keys the device agent expects.

use chrono::{DateTime, Utc};
use common::domain::{ActionKind, DeviceSnap, DeviceVersion, DomainError, DomainResult, ServiceStatus};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Periodic heartbeat published on `devices/health/<device_id>`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Health {
    pub device_id: String,
    pub org_id: String,
    #[serde(default)]
    pub refresh: Option<DateTime<Utc>>,
    #[serde(default)]
    pub snap_list_hash: String,
    #[serde(default)]
    pub installed_snaps_hash: String,
}

/// Envelope of every action response published on `devices/pub/<device_id>`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResponse {
    pub action: String,
    pub id: String,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub result: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PublishDeviceVersion {
    pub device_id: String,
    pub version: String,
    pub series: String,
    pub os_id: String,
    pub os_version_id: String,
    pub on_classic: bool,
    pub kernel_version: String,
}

impl PublishDeviceVersion {
    pub fn into_device_version(self, device_id: &str) -> DeviceVersion {
        DeviceVersion {
            device_id: device_id.to_string(),
            version: self.version,
            series: self.series,
            os_id: self.os_id,
            os_version_id: self.os_version_id,
            on_classic: self.on_classic,
            kernel_version: self.kernel_version,
        }
    }
}

/// Result of the `device` and `unregister` actions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PublishDevice {
    pub device_id: String,
    pub org_id: String,
    pub brand: String,
    pub model: String,
    pub serial: String,
    pub device_key: String,
    #[serde(rename = "store")]
    pub store_id: String,
    pub version: Option<PublishDeviceVersion>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishService {
    pub name: String,
    pub daemon: String,
    pub enabled: bool,
    pub active: bool,
}

/// One installed snap, as reported by `list`, `conf` and `info`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PublishSnap {
    pub name: String,
    pub installed_size: i64,
    pub installed_date: Option<DateTime<Utc>>,
    pub status: String,
    pub channel: String,
    pub confinement: String,
    #[serde(deserialize_with = "opaque_string")]
    pub version: String,
    #[serde(deserialize_with = "opaque_string")]
    pub revision: String,
    pub devmode: bool,
    #[serde(deserialize_with = "opaque_string")]
    pub config: String,
    pub services: Vec<PublishService>,
}

impl PublishSnap {
    pub fn into_device_snap(self, device_id: &str) -> DeviceSnap {
        DeviceSnap {
            device_id: device_id.to_string(),
            name: self.name,
            installed_size: self.installed_size,
            installed_date: self.installed_date,
            status: self.status,
            channel: self.channel,
            confinement: self.confinement,
            version: self.version,
            revision: self.revision,
            devmode: self.devmode,
            config: self.config,
            services: self
                .services
                .into_iter()
                .map(|s| ServiceStatus {
                    name: s.name,
                    daemon: s.daemon,
                    enabled: s.enabled,
                    active: s.active,
                })
                .collect(),
        }
    }
}

/// Result of the `list` action
pub type PublishSnaps = Vec<PublishSnap>;

/// Command published on `devices/sub/<device_id>`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribeAction {
    pub id: String,
    pub action: ActionKind,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub snap: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub data: String,
}

impl SubscribeAction {
    /// Command with a fresh k-sortable id
    pub fn new(action: ActionKind) -> Self {
        Self {
            id: xid::new().to_string(),
            action,
            snap: String::new(),
            data: String::new(),
        }
    }

    pub fn with_snap(mut self, snap: impl Into<String>) -> Self {
        self.snap = snap.into();
        self
    }

    pub fn with_data(mut self, data: impl Into<String>) -> Self {
        self.data = data.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequiredInstallSnap {
    pub name: String,
    pub channel: String,
    pub track: String,
}

/// Reconciler command published on `devices/actions/<serial>/required-install`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequiredInstall {
    pub id: String,
    pub snaps: Vec<RequiredInstallSnap>,
}

impl RequiredInstall {
    pub fn for_snaps<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: xid::new().to_string(),
            snaps: names
                .into_iter()
                .map(|name| RequiredInstallSnap {
                    name: name.into(),
                    channel: "latest".to_string(),
                    track: "stable".to_string(),
                })
                .collect(),
        }
    }
}

/// Decode the action-specific `result` of a response
pub fn parse_result<T: DeserializeOwned>(result: Option<Value>) -> DomainResult<T> {
    let value = result.ok_or_else(|| DomainError::PayloadError("missing result".to_string()))?;
    serde_json::from_value(value).map_err(|e| DomainError::PayloadError(e.to_string()))
}

/// Task id carried by the `result` of task-style actions; anything that is not
/// a string is recorded in its JSON form
pub fn task_result(result: Option<Value>) -> String {
    match result {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(task)) => task,
        Some(other) => other.to_string(),
    }
}

fn opaque_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Null => String::new(),
        Value::String(s) => s,
        other => other.to_string(),
    })
}
