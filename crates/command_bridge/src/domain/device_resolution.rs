use common::domain::{DeviceRegistry, DomainResult};
use tracing::debug;

/// Device service that owns a device, as reported by the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDeviceService {
    pub service_name: String,
    pub base_address: String,
}

/// Look up the service owning `device_name`.
///
/// Only a device name is accepted: a service name carried by an inbound topic
/// is never used for addressing.
pub async fn resolve_device_service(
    registry: &dyn DeviceRegistry,
    device_name: &str,
) -> DomainResult<ResolvedDeviceService> {
    let device = registry.device_by_name(device_name).await?;
    let service = registry.device_service_by_name(&device.service_name).await?;

    debug!(
        device_name = %device_name,
        service_name = %service.name,
        "resolved device service"
    );

    Ok(ResolvedDeviceService {
        service_name: service.name,
        base_address: service.base_address,
    })
}
