mod core_command;
mod envelope;
mod registry;
mod result;

pub use core_command::*;
pub use envelope::*;
pub use registry::*;
pub use result::*;
