//! Transport layer for magma.
//!
//! Currently provides the HTTP transport via axum. Transports only translate
//! between their wire format and `frontend::Call` / `Outcome`.

pub mod http;

pub use http::{ServerConfig, routes, serve};
