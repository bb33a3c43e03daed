// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The Limes daemon.
//!
//! `limesd collect` runs the control loop engine until interrupted, serving
//! the collector's Prometheus metrics at `/metrics` and the per-project data
//! metrics at `/data-metrics`. `limesd serve-data-metrics` serves only the
//! latter, for deployments that split the read path from the collector.

use std::convert::Infallible;
use std::fs::File;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Response, Server, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use limes_collector::discovery::StaticDiscovery;
use limes_collector::{render_data_metrics, Engine};
use limes_liquid::LiquidRegistry;
use limes_ore::now::SYSTEM_TIME;
use limes_repr::ClusterConfig;
use limes_store::{MemoryStore, Store};

#[derive(Parser, Debug)]
#[clap(name = "limesd", about = "Fleet-scale quota and usage accounting.")]
enum Command {
    /// Run the control loop engine.
    Collect {
        /// Path to the cluster configuration file.
        #[clap(long, env = "LIMES_CONFIG")]
        config: PathBuf,
        /// Address to serve metrics on.
        #[clap(long, env = "LIMES_LISTEN", default_value = "0.0.0.0:8080")]
        listen: SocketAddr,
        /// Whether this instance may push quotas to the backends. Exactly
        /// one instance per cluster should be authoritative.
        #[clap(long, env = "LIMES_AUTHORITATIVE")]
        authoritative: bool,
    },
    /// Serve only the per-project data metrics.
    ServeDataMetrics {
        /// Path to the cluster configuration file.
        #[clap(long, env = "LIMES_CONFIG")]
        config: PathBuf,
        /// Address to serve metrics on.
        #[clap(long, env = "LIMES_LISTEN", default_value = "0.0.0.0:8081")]
        listen: SocketAddr,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_env("LIMES_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match Command::parse() {
        Command::Collect {
            config,
            listen,
            authoritative,
        } => collect(config, listen, authoritative).await,
        Command::ServeDataMetrics { config, listen } => serve_data_metrics(config, listen).await,
    }
}

fn load_config(path: &PathBuf) -> anyhow::Result<ClusterConfig> {
    let file = File::open(path)
        .with_context(|| format!("failed to open config at {}", path.display()))?;
    serde_json::from_reader(file).context("malformed cluster configuration")
}

async fn collect(
    config_path: PathBuf,
    listen: SocketAddr,
    authoritative: bool,
) -> anyhow::Result<()> {
    let config = load_config(&config_path)?;
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let liquids = LiquidRegistry::from_config(&config)?;
    let discovery = Arc::new(StaticDiscovery::from_config(&config.discovery));
    let registry = prometheus::Registry::new();

    let engine = Engine::new(
        Arc::clone(&store),
        liquids,
        discovery,
        config,
        SYSTEM_TIME.clone(),
        &registry,
        authoritative,
    );
    engine.startup().await.context("engine startup failed")?;

    let shutdown = CancellationToken::new();
    let workers = engine.spawn(&shutdown);
    info!(%listen, authoritative, "collector started");

    let server = serve(listen, registry, Arc::clone(&store), shutdown.clone());
    tokio::pin!(server);
    tokio::select! {
        result = &mut server => result?,
        result = tokio::signal::ctrl_c() => result.context("failed to listen for SIGINT")?,
    }

    info!("shutting down");
    shutdown.cancel();
    for worker in workers {
        let _ = worker.await;
    }
    Ok(())
}

async fn serve_data_metrics(config_path: PathBuf, listen: SocketAddr) -> anyhow::Result<()> {
    // Parse the configuration even though only the store is consulted, so
    // that misconfiguration fails here and not in production traffic.
    let _ = load_config(&config_path)?;
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let shutdown = CancellationToken::new();
    info!(%listen, "data metrics server started");
    tokio::select! {
        result = serve(listen, prometheus::Registry::new(), store, shutdown.clone()) => result,
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for SIGINT")?;
            shutdown.cancel();
            Ok(())
        }
    }
}

async fn serve(
    listen: SocketAddr,
    registry: prometheus::Registry,
    store: Arc<dyn Store>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let make_svc = make_service_fn(move |_conn| {
        let registry = registry.clone();
        let store = Arc::clone(&store);
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let registry = registry.clone();
                let store = Arc::clone(&store);
                async move {
                    let response = match req.uri().path() {
                        "/metrics" => {
                            let mut buf = String::new();
                            prometheus::TextEncoder::new()
                                .encode_utf8(&registry.gather(), &mut buf)
                                .expect("text encoding is infallible");
                            Response::new(Body::from(buf))
                        }
                        "/data-metrics" => match render_data_metrics(&*store).await {
                            Ok(buf) => Response::new(Body::from(buf)),
                            Err(e) => Response::builder()
                                .status(StatusCode::INTERNAL_SERVER_ERROR)
                                .body(Body::from(e.to_string()))
                                .expect("static response"),
                        },
                        _ => Response::builder()
                            .status(StatusCode::NOT_FOUND)
                            .body(Body::empty())
                            .expect("static response"),
                    };
                    Ok::<_, Infallible>(response)
                }
            }))
        }
    });

    Server::try_bind(&listen)
        .with_context(|| format!("failed to bind {listen}"))?
        .serve(make_svc)
        .with_graceful_shutdown(shutdown.cancelled())
        .await
        .context("metrics server failed")
}
