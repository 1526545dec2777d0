mod command_catalog;
mod correlation_registry;
mod device_resolution;
mod forwarder;
mod query_dispatcher;
mod query_params;
mod request_dispatcher;
mod topic_codec;

pub use command_catalog::*;
pub use correlation_registry::*;
pub use device_resolution::*;
pub use forwarder::*;
pub use query_dispatcher::*;
pub use query_params::*;
pub use request_dispatcher::*;
pub use topic_codec::*;
