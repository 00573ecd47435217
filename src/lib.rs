pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod forward;
pub mod rpc;
pub mod sandbox;

pub use client::SandboxClient;
pub use error::{Result, SandgateError};
