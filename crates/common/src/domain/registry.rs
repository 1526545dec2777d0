use crate::domain::result::DomainResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Device as known to the metadata registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub name: String,
    #[serde(default)]
    pub service_name: String,
    #[serde(default)]
    pub profile_name: String,
}

/// Device service owning one or more devices
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceService {
    pub name: String,
    #[serde(default)]
    pub base_address: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceProperties {
    #[serde(default)]
    pub value_type: String,
    #[serde(default)]
    pub read_write: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceResource {
    pub name: String,
    #[serde(default)]
    pub is_hidden: bool,
    #[serde(default)]
    pub properties: ResourceProperties,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceOperation {
    pub device_resource: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceCommand {
    pub name: String,
    #[serde(default)]
    pub is_hidden: bool,
    #[serde(default)]
    pub read_write: String,
    #[serde(default)]
    pub resource_operations: Vec<ResourceOperation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceProfile {
    pub name: String,
    #[serde(default)]
    pub device_resources: Vec<DeviceResource>,
    #[serde(default)]
    pub device_commands: Vec<DeviceCommand>,
}

/// One page of devices plus the registry-wide total
#[derive(Debug, Clone, PartialEq)]
pub struct DevicePage {
    pub devices: Vec<Device>,
    pub total_count: u32,
}

/// Read-only view of the metadata registry (devices, device services, device profiles).
///
/// Implementations map a missing entity to the matching not-found error and any
/// other failure to `DomainError::Registry`.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    async fn device_by_name(&self, name: &str) -> DomainResult<Device>;

    async fn all_devices(&self, offset: i32, limit: i32) -> DomainResult<DevicePage>;

    async fn device_service_by_name(&self, name: &str) -> DomainResult<DeviceService>;

    async fn device_profile_by_name(&self, name: &str) -> DomainResult<DeviceProfile>;
}
