//! Health status reported by the frontend.

use serde::{Deserialize, Serialize};

use crate::version::VersionInfo;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Health {
    /// Accepting requests
    #[default]
    Ready,
    /// Shutdown started; new requests are refused
    ShuttingDown,
}

/// Body of `GET /health-check`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResponse {
    pub status: Health,
    /// Requests waiting for a worker reply.
    pub pending: usize,
    /// Declared resources, ordered by name.
    pub resources: Vec<String>,
    pub version: VersionInfo,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::VERSION;

    #[test]
    fn health_serializes_screaming_snake() {
        assert_eq!(serde_json::to_string(&Health::Ready).unwrap(), r#""READY""#);
        assert_eq!(
            serde_json::to_string(&Health::ShuttingDown).unwrap(),
            r#""SHUTTING_DOWN""#
        );
    }

    #[test]
    fn health_check_response_shape() {
        let response = HealthCheckResponse {
            status: Health::Ready,
            pending: 2,
            resources: vec!["network".to_string(), "widget".to_string()],
            version: VersionInfo::new(),
        };
        let json = serde_json::to_value(&response).unwrap();

        assert_eq!(
            json,
            serde_json::json!({
                "status": "READY",
                "pending": 2,
                "resources": ["network", "widget"],
                "version": { "magma": VERSION }
            })
        );
    }
}
