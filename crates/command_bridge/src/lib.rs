pub mod bridge;
mod command_bridge;
pub mod domain;

pub use command_bridge::*;
