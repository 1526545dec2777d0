use common::domain::{
    CoreCommand, CoreCommandParameter, DeviceCoreCommand, DeviceProfile, DeviceRegistry,
    DomainError, DomainResult,
};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Route under which every core command is callable
pub const API_DEVICE_ROUTE: &str = "/api/v3/device";

const READ: &str = "R";
const WRITE: &str = "W";

/// Builds the callable core commands of devices from their profiles
pub struct CommandCatalog {
    registry: Arc<dyn DeviceRegistry>,
    service_url: String,
}

impl CommandCatalog {
    pub fn new(registry: Arc<dyn DeviceRegistry>, service_url: impl Into<String>) -> Self {
        Self {
            registry,
            service_url: service_url.into(),
        }
    }

    /// Core commands of one page of devices, with the registry-wide device count
    #[instrument(skip(self))]
    pub async fn all_commands(
        &self,
        offset: i32,
        limit: i32,
    ) -> DomainResult<(Vec<DeviceCoreCommand>, u32)> {
        let page = self.registry.all_devices(offset, limit).await?;
        debug!(devices = page.devices.len(), total = page.total_count, "listing commands");

        let mut device_core_commands = Vec::with_capacity(page.devices.len());
        for device in page.devices {
            let profile = self
                .registry
                .device_profile_by_name(&device.profile_name)
                .await?;
            device_core_commands.push(DeviceCoreCommand {
                core_commands: build_core_commands(&device.name, &self.service_url, &profile)?,
                device_name: device.name,
                profile_name: device.profile_name,
            });
        }

        Ok((device_core_commands, page.total_count))
    }

    #[instrument(skip(self))]
    pub async fn commands_by_device_name(&self, name: &str) -> DomainResult<DeviceCoreCommand> {
        if name.is_empty() {
            return Err(DomainError::ContractInvalid("device name is empty".to_string()));
        }

        let device = self.registry.device_by_name(name).await?;
        let profile = self
            .registry
            .device_profile_by_name(&device.profile_name)
            .await?;

        Ok(DeviceCoreCommand {
            core_commands: build_core_commands(&device.name, &self.service_url, &profile)?,
            device_name: device.name,
            profile_name: device.profile_name,
        })
    }
}

/// Visible device commands first, in profile order, then every visible
/// device resource not already exposed under the same name.
pub fn build_core_commands(
    device_name: &str,
    service_url: &str,
    profile: &DeviceProfile,
) -> DomainResult<Vec<CoreCommand>> {
    let mut names = HashSet::new();
    let mut commands = Vec::new();

    for command in profile.device_commands.iter().filter(|c| !c.is_hidden) {
        let parameters = command
            .resource_operations
            .iter()
            .map(|op| resource_parameter(profile, &op.device_resource))
            .collect::<DomainResult<Vec<_>>>()?;

        names.insert(command.name.as_str());
        commands.push(core_command(
            device_name,
            service_url,
            &command.name,
            &command.read_write,
            parameters,
        ));
    }

    for resource in profile.device_resources.iter().filter(|r| !r.is_hidden) {
        if !names.insert(resource.name.as_str()) {
            continue;
        }
        commands.push(core_command(
            device_name,
            service_url,
            &resource.name,
            &resource.properties.read_write,
            vec![CoreCommandParameter {
                resource_name: resource.name.clone(),
                value_type: resource.properties.value_type.clone(),
            }],
        ));
    }

    Ok(commands)
}

fn resource_parameter(profile: &DeviceProfile, resource_name: &str) -> DomainResult<CoreCommandParameter> {
    profile
        .device_resources
        .iter()
        .find(|r| r.name == resource_name)
        .map(|r| CoreCommandParameter {
            resource_name: r.name.clone(),
            value_type: r.properties.value_type.clone(),
        })
        .ok_or_else(|| {
            DomainError::ContractInvalid(format!(
                "device resource {} referenced by a command is not defined in profile {}",
                resource_name, profile.name
            ))
        })
}

fn core_command(
    device_name: &str,
    service_url: &str,
    command_name: &str,
    read_write: &str,
    parameters: Vec<CoreCommandParameter>,
) -> CoreCommand {
    CoreCommand {
        name: command_name.to_string(),
        get: read_write.contains(READ),
        set: read_write.contains(WRITE),
        path: format!("{}/name/{}/{}", API_DEVICE_ROUTE, device_name, command_name),
        url: service_url.to_string(),
        parameters,
    }
}
