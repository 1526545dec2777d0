use std::time::Duration;
use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

#[derive(Error, Debug)]
pub enum DomainError {
    #[error("failed to decode message envelope: {0}")]
    EnvelopeDecode(String),

    #[error("request envelope carries no RequestID")]
    MissingRequestId,

    #[error("invalid topic scheme: {0}")]
    TopicScheme(String),

    #[error("unknown request method: {0}, only 'get' or 'set' is allowed")]
    UnsupportedMethod(String),

    #[error("invalid query parameter {name}={value}: only 'true' or 'false' is allowed")]
    InvalidQueryParameter { name: String, value: String },

    #[error("failed to get Device by name {0}: device not found")]
    DeviceNotFound(String),

    #[error("failed to get DeviceService by name {0}: device service not found")]
    DeviceServiceNotFound(String),

    #[error("failed to get DeviceProfile by name {0}: device profile not found")]
    DeviceProfileNotFound(String),

    #[error("invalid pagination parameter: {0}")]
    InvalidPagination(String),

    #[error("contract invalid: {0}")]
    ContractInvalid(String),

    #[error("timed out after {}ms waiting for response on {topic}", timeout.as_millis())]
    RequestTimeout { topic: String, timeout: Duration },

    #[error("registry error: {0}")]
    Registry(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("transport error: {0}")]
    Transport(#[from] anyhow::Error),
}
