//! Envelope types exchanged over the broker.
//!
//! Two envelopes:
//! - **Request** (frontend -> worker): caller parameters flattened at the top level,
//!   plus the correlation token and the caller's headers
//! - **Reply** (worker -> frontend): token, success flag and payload

use serde::{Deserialize, Serialize};

/// Key carrying the correlation token in both envelopes.
pub const TOKEN_FIELD: &str = "correlationToken";

/// Key carrying the caller's transport metadata in a request envelope.
pub const HEADERS_FIELD: &str = "headers";

/// Unique join key between an outbound request and its reply.
///
/// UUID v7 is time-ordered, so tokens stay unique across the process lifetime
/// and sort by creation time in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationToken(uuid::Uuid);

impl CorrelationToken {
    pub fn new() -> Self {
        Self(uuid::Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        let uuid = uuid::Uuid::parse_str(s)?;
        Ok(Self(uuid))
    }
}

impl Default for CorrelationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CorrelationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub type Params = serde_json::Map<String, serde_json::Value>;

/// Outbound request published to `<resource>.<operation>`.
///
/// Caller parameters live at the top level of the JSON object, next to the
/// token and headers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    #[serde(flatten)]
    pub params: Params,
    #[serde(rename = "correlationToken")]
    pub token: CorrelationToken,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<Params>,
}

impl RequestEnvelope {
    /// Build an envelope, dropping caller parameters that collide with the
    /// reserved token/headers keys.
    pub fn new(mut params: Params, token: CorrelationToken, headers: Option<Params>) -> Self {
        params.remove(TOKEN_FIELD);
        params.remove(HEADERS_FIELD);
        Self {
            params,
            token,
            headers,
        }
    }
}

/// Reply published by a worker to `<resource>.replyTo`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyEnvelope {
    #[serde(rename = "correlationToken")]
    pub token: CorrelationToken,
    pub successful: bool,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl ReplyEnvelope {
    pub fn success(token: CorrelationToken, data: serde_json::Value) -> Self {
        Self {
            token,
            successful: true,
            data,
        }
    }

    pub fn failure(token: CorrelationToken, data: serde_json::Value) -> Self {
        Self {
            token,
            successful: false,
            data,
        }
    }

    /// Strip the token; what remains is what the caller sees.
    pub fn into_outcome(self) -> Outcome {
        if self.successful {
            Outcome::Success(self.data)
        } else {
            Outcome::Failure(self.data)
        }
    }
}

/// Caller-facing result of a correlated request. Never carries the token.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(serde_json::Value),
    Failure(serde_json::Value),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn data(&self) -> &serde_json::Value {
        match self {
            Self::Success(data) | Self::Failure(data) => data,
        }
    }

    pub fn into_data(self) -> serde_json::Value {
        match self {
            Self::Success(data) | Self::Failure(data) => data,
        }
    }

    /// Body returned to synchronous callers: the reply envelope minus its token.
    pub fn to_body(&self) -> serde_json::Value {
        serde_json::json!({
            "successful": self.is_success(),
            "data": self.data(),
        })
    }
}
