//! Infrastructure adapters and runtime bootstrap.

pub mod error;
pub mod http;
pub mod http_client;
pub mod memory;
pub mod telemetry;
