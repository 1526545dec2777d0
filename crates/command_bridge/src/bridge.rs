mod external_bridge;
mod internal_bridge;
mod response_relay;
mod subscription_loop;

pub use external_bridge::*;
pub use internal_bridge::*;
pub use response_relay::*;
pub use subscription_loop::*;
