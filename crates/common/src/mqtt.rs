mod client;
mod connection;

pub use client::*;
pub use connection::*;
