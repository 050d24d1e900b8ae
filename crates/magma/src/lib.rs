//! magma: bridge synchronous requests to pub/sub workers with correlated replies.

mod health;
mod version;

pub mod bridge;
pub mod broker;
pub mod frontend;
pub mod registry;
pub mod reply;
pub mod resource;
pub mod topology;
pub mod transport;
pub mod worker;

pub use bridge::protocol::{CorrelationToken, Outcome, Params, ReplyEnvelope, RequestEnvelope};
pub use broker::{Broker, BrokerError, Delivery, Exchange, MemoryBroker, Queue};
pub use frontend::{
    Call, DispatchError, Frontend, FrontendConfig, FrontendError, MAX_REPLY_TIMEOUT,
};
pub use health::{Health, HealthCheckResponse};
pub use registry::{CorrelationRegistry, PendingReply, RegistryError, Resolution};
pub use resource::{Operation, OperationSpec, ResourceDecl, ResourceError, TransportMethod};
pub use topology::{TopologyCache, TopologyError};
pub use version::{VERSION, VersionInfo};
pub use worker::{
    Handlers, ReplyError, Request, ResourceHandler, Responder, Worker, WorkerError,
};
