//! HTTP route handlers.
//!
//! One route per declared operation. The request's query string, body (JSON or
//! urlencoded) and headers become a `Call`; the outcome becomes
//! `(status, {"successful": bool, "data": ...})`.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    Router,
    body::Bytes,
    extract::{Form, FromRequest, FromRequestParts, Query, Request, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Json, Response},
    routing::{MethodFilter, MethodRouter, get},
};
use futures::FutureExt;
use futures::future::BoxFuture;

use crate::bridge::protocol::{Outcome, Params};
use crate::frontend::{Call, DispatchError, Frontend};
use crate::health::{Health, HealthCheckResponse};
use crate::resource::{Operation, TransportMethod};
use crate::version::VersionInfo;

pub const HEALTH_CHECK_PATH: &str = "/health-check";

/// Build the router for every resource declared on `frontend` so far.
///
/// Resources declared after this call are not routed.
pub async fn routes(frontend: Arc<Frontend>) -> Router {
    let mut by_path: BTreeMap<String, MethodRouter<Arc<Frontend>>> = BTreeMap::new();

    for decl in frontend.resources().await {
        for op in decl.operations() {
            if op.path == HEALTH_CHECK_PATH {
                tracing::error!(resource = %decl.name(), path = %op.path, "Operation path shadows the health check, not routed");
                continue;
            }
            let handler = operation_handler(decl.name().to_string(), op.operation.clone());
            let router = by_path.remove(&op.path).unwrap_or_else(MethodRouter::new);
            by_path.insert(op.path.clone(), router.on(method_filter(op.method), handler));
            tracing::debug!(method = %op.method, path = %op.path, target = %op.target, "Routed operation");
        }
    }

    let mut router = Router::new().route(HEALTH_CHECK_PATH, get(health_check));
    for (path, method_router) in by_path {
        router = router.route(&path, method_router);
    }
    router.with_state(frontend)
}

fn method_filter(method: TransportMethod) -> MethodFilter {
    match method {
        TransportMethod::Get => MethodFilter::GET,
        TransportMethod::Post => MethodFilter::POST,
        TransportMethod::Put => MethodFilter::PUT,
        TransportMethod::Delete => MethodFilter::DELETE,
    }
}

fn operation_handler(
    resource: String,
    operation: Operation,
) -> impl Fn(State<Arc<Frontend>>, CallInput) -> BoxFuture<'static, Response>
+ Clone
+ Send
+ Sync
+ 'static {
    move |State(frontend): State<Arc<Frontend>>, input: CallInput| {
        let call = Call {
            resource: resource.clone(),
            operation: operation.clone(),
            params: input.params,
            headers: Some(input.headers),
        };
        async move { respond(frontend.dispatch(call).await) }.boxed()
    }
}

async fn health_check(State(frontend): State<Arc<Frontend>>) -> Json<HealthCheckResponse> {
    let status = if frontend.is_shutting_down() {
        Health::ShuttingDown
    } else {
        Health::Ready
    };
    let resources = frontend
        .resources()
        .await
        .iter()
        .map(|decl| decl.name().to_string())
        .collect();

    Json(HealthCheckResponse {
        status,
        pending: frontend.pending(),
        resources,
        version: VersionInfo::new(),
    })
}

fn respond(result: Result<Outcome, DispatchError>) -> Response {
    match result {
        Ok(outcome) => {
            let status = if outcome.is_success() {
                StatusCode::OK
            } else {
                StatusCode::BAD_REQUEST
            };
            (status, Json(outcome.to_body())).into_response()
        }
        Err(e) => {
            let status = dispatch_error_status(&e);
            if status.is_server_error() {
                tracing::warn!(error = %e, %status, "Dispatch failed");
            }
            error_body(status, e.to_string())
        }
    }
}

fn dispatch_error_status(e: &DispatchError) -> StatusCode {
    match e {
        DispatchError::UnknownOperation { .. } => StatusCode::NOT_FOUND,
        DispatchError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        DispatchError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        e if e.is_broker_failure() => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_body(status: StatusCode, message: String) -> Response {
    (
        status,
        Json(serde_json::json!({ "successful": false, "data": message })),
    )
        .into_response()
}

/// Parameters and headers of an inbound call.
///
/// Query parameters are merged with the body; body keys win.
struct CallInput {
    params: Params,
    headers: Params,
}

impl<S: Send + Sync> FromRequest<S> for CallInput {
    type Rejection = Response;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let (mut parts, body) = req.into_parts();
        let Query(mut params) = Query::<Params>::from_request_parts(&mut parts, state)
            .await
            .map_err(IntoResponse::into_response)?;
        let headers = header_params(&parts.headers);
        let kind = body_kind(&parts.headers);
        let req = Request::from_parts(parts, body);

        let body_params = match kind {
            BodyKind::Json => {
                let bytes = Bytes::from_request(req, state)
                    .await
                    .map_err(IntoResponse::into_response)?;
                if bytes.is_empty() {
                    Params::new()
                } else {
                    serde_json::from_slice::<Params>(&bytes).map_err(|e| {
                        error_body(
                            StatusCode::BAD_REQUEST,
                            format!("request body must be a JSON object: {e}"),
                        )
                    })?
                }
            }
            BodyKind::Form => {
                let Form(form) = Form::<Params>::from_request(req, state)
                    .await
                    .map_err(IntoResponse::into_response)?;
                form
            }
            BodyKind::None => Params::new(),
        };

        params.extend(body_params);
        Ok(Self { params, headers })
    }
}

enum BodyKind {
    Json,
    Form,
    None,
}

fn body_kind(headers: &HeaderMap) -> BodyKind {
    let Some(content_type) = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
    else {
        return BodyKind::None;
    };
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    if mime == "application/json" || mime.ends_with("+json") {
        BodyKind::Json
    } else if mime == "application/x-www-form-urlencoded" {
        BodyKind::Form
    } else {
        BodyKind::None
    }
}

/// Header names (already lower-case in `HeaderMap`) to string values; repeated
/// headers are joined with `", "`.
fn header_params(headers: &HeaderMap) -> Params {
    let mut params = Params::new();
    for name in headers.keys() {
        let joined = headers
            .get_all(name)
            .iter()
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
            .collect::<Vec<_>>()
            .join(", ");
        params.insert(name.as_str().to_string(), serde_json::Value::String(joined));
    }
    params
}
