//! Broker message bridge between the frontend and worker roles.
//!
//! This module provides the envelope types and the body codec shared by both
//! sides of the bridge.
//!
//! # Architecture
//!
//! - **protocol**: Envelope types (RequestEnvelope, ReplyEnvelope, CorrelationToken)
//! - **codec**: JSON body codec for broker messages

pub mod codec;
pub mod protocol;
