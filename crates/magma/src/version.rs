//! Version information for magma.

/// Magma version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, serde::Serialize)]
pub struct VersionInfo {
    pub magma: &'static str,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self { magma: VERSION }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }
}
