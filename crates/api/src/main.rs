use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use chatrelay_api::echo::EchoHandler;
use chatrelay_infra::broker::provision_vhost;
use chatrelay_infra::{WorkerConfig, WorkerContext};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    chatrelay_observability::init();

    let config = WorkerConfig::from_env().context("invalid worker configuration")?;

    if let Err(err) = provision_vhost(&reqwest::Client::new(), &config.broker).await {
        warn!(error = %err, vhost = %config.broker.vhost, "vhost provisioning failed, continuing");
    }

    let ctx = WorkerContext::new(config.clone()).context("failed to build worker")?;
    let handler = Arc::new(EchoHandler::new(ctx.tracker(), ctx.publisher()));
    let mut worker = ctx.start(handler).await.context("failed to start worker")?;

    let app = chatrelay_api::app::build_app(worker.admin(), config.admin.token.clone());
    let listener = tokio::net::TcpListener::bind(config.admin.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.admin.bind))?;
    info!(addr = %listener.local_addr()?, "admin API listening");

    let server = tokio::spawn(async move { axum::serve(listener, app).await });

    let outcome = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
            signal.context("failed to listen for ctrl-c")
        }
        supervised = worker.wait_supervisor() => {
            supervised.context("broker connection lost for good")
        }
    };

    worker.shutdown().await;
    server.abort();
    outcome
}
