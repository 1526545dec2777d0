pub mod bus;
pub mod domain;
pub mod metadata;
pub mod mqtt;
pub mod nats;
pub mod telemetry;

// Re-export mocks when testing feature is enabled
#[cfg(any(test, feature = "testing"))]
pub use bus::MockMessageBus;
#[cfg(any(test, feature = "testing"))]
pub use domain::MockDeviceRegistry;
