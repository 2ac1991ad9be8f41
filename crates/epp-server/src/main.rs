mod args;
mod collector;
mod ext_proc;
mod health;
mod metrics;
mod scrape;
mod session;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use clap::Parser;
use envoy_types::pb::envoy::service::ext_proc::v3::external_processor_server::ExternalProcessorServer;
use tokio_util::sync::CancellationToken;

use epp_scheduler::{tokenizer_from_name, PoolRegistry, RequestClassifier, Scheduler};

use crate::args::Args;
use crate::collector::{Collector, HttpScraper};
use crate::ext_proc::{ExtProcService, SERVICE_NAME};
use crate::health::{readiness_loop, Readiness};
use crate::metrics::{healthz_handler, metrics_handler, readyz_handler, Metrics};
use crate::state::AppState;

const READINESS_INTERVAL: Duration = Duration::from_millis(500);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let otel_provider = epp_common::telemetry::init_tracing(
        "epp",
        args.verbose,
        args.log_format,
        args.otlp_endpoint.as_deref(),
        args.otlp_token.as_deref(),
    );

    args.validate()?;

    let tokenizer = tokenizer_from_name(&args.tokenizer)?;
    let classifier = Arc::new(RequestClassifier::new(args.classifier_config(), tokenizer));

    let registry = PoolRegistry::new();
    registry.declare_pool(&args.pool_name);
    let scheduler = Scheduler::new(registry.clone(), args.picker_config());

    let metrics = Arc::new(Metrics::default());
    let readiness = Arc::new(Readiness::default());

    let st = AppState {
        pool_name: args.pool_name.clone(),
        scheduler,
        classifier,
        session: args.session_config(),
        metrics: metrics.clone(),
        readiness: readiness.clone(),
    };

    tracing::info!(
        pool = %args.pool_name,
        pd_enabled = args.pd_enabled,
        pd_prompt_len_threshold = args.pd_prompt_len_threshold,
        tokenizer = %args.tokenizer,
        endpoints_file = %args.endpoints_file.display(),
        "endpoint picker starting"
    );

    let cancel = CancellationToken::new();

    let http = scrape::http_client(Duration::from_millis(args.scrape_timeout_ms));
    let collector = Collector::new(
        args.collector_config(),
        registry.clone(),
        HttpScraper::new(http),
        metrics,
    );
    let collector_task = tokio::spawn(collector.run(readiness.clone(), cancel.clone()));

    let (health_reporter, health_service) = tonic_health::server::health_reporter();
    tokio::spawn(readiness_loop(
        readiness,
        registry,
        args.pool_name.clone(),
        health_reporter,
        SERVICE_NAME,
        READINESS_INTERVAL,
        cancel.clone(),
    ));

    let health_addr = SocketAddr::from(([0, 0, 0, 0], args.grpc_health_port));
    let health_cancel = cancel.clone();
    let health_task = tokio::spawn(async move {
        tracing::info!(addr = %health_addr, "grpc health server listening");
        tonic::transport::Server::builder()
            .add_service(health_service)
            .serve_with_shutdown(health_addr, health_cancel.cancelled_owned())
            .await
    });

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .with_state(st.clone());
    let metrics_addr = SocketAddr::from(([0, 0, 0, 0], args.metrics_port));
    let listener = tokio::net::TcpListener::bind(metrics_addr).await?;
    let metrics_cancel = cancel.clone();
    let metrics_task = tokio::spawn(async move {
        tracing::info!(addr = %metrics_addr, "metrics server listening");
        axum::serve(listener, app)
            .with_graceful_shutdown(metrics_cancel.cancelled_owned())
            .await
    });

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("shutdown signal received"),
            Err(e) => tracing::error!(error = %e, "failed to listen for shutdown signal"),
        }
        shutdown.cancel();
    });

    let grpc_addr = SocketAddr::from(([0, 0, 0, 0], args.grpc_port));
    tracing::info!(addr = %grpc_addr, "ext_proc server listening");
    let served = tonic::transport::Server::builder()
        .add_service(ExternalProcessorServer::new(ExtProcService::new(st)))
        .serve_with_shutdown(grpc_addr, cancel.clone().cancelled_owned())
        .await;
    cancel.cancel();

    match collector_task.await {
        Ok(Err(e)) => tracing::error!(error = %e, "collector exited"),
        Err(e) => tracing::error!(error = %e, "collector task failed"),
        Ok(Ok(())) => {}
    }
    if let Ok(Err(e)) = health_task.await {
        tracing::error!(error = %e, "grpc health server exited");
    }
    if let Ok(Err(e)) = metrics_task.await {
        tracing::error!(error = %e, "metrics server exited");
    }

    if let Some(provider) = otel_provider {
        if let Err(e) = provider.shutdown() {
            eprintln!("failed to flush traces: {e}");
        }
    }

    served?;
    tracing::info!("endpoint picker stopped");
    Ok(())
}
