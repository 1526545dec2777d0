use crate::domain::envelope::API_VERSION;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoreCommandParameter {
    pub resource_name: String,
    pub value_type: String,
}

/// A command callable through the core command service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoreCommand {
    pub name: String,
    pub get: bool,
    pub set: bool,
    pub path: String,
    pub url: String,
    #[serde(default)]
    pub parameters: Vec<CoreCommandParameter>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceCoreCommand {
    pub device_name: String,
    pub profile_name: String,
    pub core_commands: Vec<CoreCommand>,
}

/// Query response payload for a single device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceCoreCommandResponse {
    pub api_version: String,
    pub status_code: u16,
    pub device_core_command: DeviceCoreCommand,
}

impl DeviceCoreCommandResponse {
    pub fn ok(device_core_command: DeviceCoreCommand) -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            status_code: 200,
            device_core_command,
        }
    }
}

/// Query response payload for the paged "all devices" listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultiDeviceCoreCommandsResponse {
    pub api_version: String,
    pub status_code: u16,
    pub total_count: u32,
    pub device_core_commands: Vec<DeviceCoreCommand>,
}

impl MultiDeviceCoreCommandsResponse {
    pub fn ok(total_count: u32, device_core_commands: Vec<DeviceCoreCommand>) -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            status_code: 200,
            total_count,
            device_core_commands,
        }
    }
}
