//! HTTP transport: axum routes generated from declared resources.

mod routes;
mod server;

pub use routes::{HEALTH_CHECK_PATH, routes};
pub use server::{ServerConfig, serve};
