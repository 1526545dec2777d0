mod memory;
mod request_reply;
mod topic;
mod traits;

pub use memory::*;
pub use request_reply::*;
pub use topic::*;
pub use traits::*;
