//! magma-server: HTTP frontend over an in-process broker.
//!
//! Declares each `--resource` on the frontend and, unless `--no-echo-worker`
//! is given, serves it with an echo worker that answers `"<operation> <id>"`.
//!
//! ```sh
//! magma-server --port 3000 --resource network --resource widget=ping:get,reset:post
//! curl 'http://localhost:3000/network?id=7'   # {"successful":true,"data":"read 7"}
//! ```

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use magma::transport::{ServerConfig, serve};
use magma::{
    Frontend, FrontendConfig, MemoryBroker, Operation, Request, ResourceDecl, ResourceHandler,
    Responder, VERSION, Worker,
};

/// Command line arguments.
#[derive(Parser, Debug)]
#[command(name = "magma-server", version)]
#[command(about = "Bridge HTTP requests to pub/sub workers")]
struct Args {
    /// Bind address for the HTTP server.
    #[arg(long, default_value = "0.0.0.0", env = "MAGMA_HOST")]
    host: String,

    /// HTTP port to listen on.
    #[arg(short, long, default_value_t = 3000, env = "MAGMA_PORT")]
    port: u16,

    /// How long a caller waits for a worker reply.
    #[arg(
        long,
        default_value_t = 30_000,
        env = "MAGMA_REPLY_TIMEOUT_MS",
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    reply_timeout_ms: u64,

    /// How often requests past their deadline are swept.
    #[arg(
        long,
        default_value_t = 1_000,
        env = "MAGMA_SWEEP_INTERVAL_MS",
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    sweep_interval_ms: u64,

    /// Resource to expose: `name` or `name=route:method,...`. Repeatable.
    #[arg(
        short,
        long = "resource",
        value_name = "RESOURCE",
        default_value = "network",
        value_parser = parse_resource
    )]
    resources: Vec<ResourceDecl>,

    /// Do not start the in-process echo worker.
    #[arg(long)]
    no_echo_worker: bool,
}

impl Args {
    fn frontend_config(&self) -> FrontendConfig {
        FrontendConfig::default()
            .with_reply_timeout(Duration::from_millis(self.reply_timeout_ms))
            .with_sweep_interval(Duration::from_millis(self.sweep_interval_ms))
    }
}

fn parse_resource(s: &str) -> Result<ResourceDecl, String> {
    let decl = match s.split_once('=') {
        Some((name, specs)) => ResourceDecl::with_operations(
            name,
            specs.split(',').map(str::trim).filter(|spec| !spec.is_empty()),
        ),
        None => ResourceDecl::new(s),
    };
    decl.map_err(|e| e.to_string())
}

/// Initialize tracing. `RUST_LOG` wins; otherwise `MAGMA_LOG` picks the level.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let base_level = match std::env::var("MAGMA_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("trace") => "trace",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };

        EnvFilter::new(format!(
            "magma={level},magma_server={level}",
            level = base_level
        ))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

/// Answers every declared operation with `"<operation> <id>"`.
struct EchoHandler {
    operations: BTreeSet<Operation>,
}

impl EchoHandler {
    fn for_resource(decl: &ResourceDecl) -> Self {
        Self {
            operations: decl
                .operations()
                .iter()
                .map(|op| op.operation.clone())
                .collect(),
        }
    }
}

fn echo_text(operation: &Operation, id: Option<&serde_json::Value>) -> String {
    match id {
        Some(serde_json::Value::String(id)) => format!("{operation} {id}"),
        Some(id) => format!("{operation} {id}"),
        None => operation.to_string(),
    }
}

#[async_trait]
impl ResourceHandler for EchoHandler {
    fn operations(&self) -> BTreeSet<Operation> {
        self.operations.clone()
    }

    async fn handle(&self, operation: &Operation, request: Request, responder: Responder) {
        let text = echo_text(operation, request.param("id"));
        if let Err(e) = responder.success(text).await {
            tracing::warn!(%operation, error = %e, "Echo reply failed");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing();

    info!(version = VERSION, "Starting magma-server");

    let broker = MemoryBroker::new();
    let frontend = Frontend::connect(Arc::new(broker.clone()), args.frontend_config())
        .context("invalid frontend configuration")?;
    let worker = (!args.no_echo_worker).then(|| Worker::connect(Arc::new(broker.clone())));

    for decl in &args.resources {
        frontend
            .declare_resource(decl.clone())
            .await
            .with_context(|| format!("failed to declare resource '{}'", decl.name()))?;
        if let Some(worker) = &worker {
            worker
                .resource(decl.clone(), EchoHandler::for_resource(decl))
                .await
                .with_context(|| format!("failed to start worker for '{}'", decl.name()))?;
        }
    }

    serve(
        ServerConfig {
            host: args.host,
            port: args.port,
        },
        frontend,
    )
    .await?;

    if let Some(worker) = worker {
        worker.shutdown().await;
    }
    broker.close();

    Ok(())
}
