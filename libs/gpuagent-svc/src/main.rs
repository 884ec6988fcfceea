// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! GPU agent daemon.
//!
//! Discovers the GPUs on this host, then serves configuration, telemetry and
//! event streams until terminated. All state is rebuilt from hardware on
//! restart; there is nothing persistent here.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use gpuagent::smi::sim::SimSmi;
use gpuagent::smi::SmiAdapter;
use gpuagent::{Agent, AgentConfig};
use gpuagent_svc::{router, AppState, DEFAULT_GRPC_SERVER_PORT, DEFAULT_RDC_SERVER_PORT};
use tracing::info;

/// Devices exposed by the simulated backend when no vendor library is
/// linked in.
const SIM_NUM_GPU: u32 = 4;

#[derive(Parser)]
#[command(name = "gpuagent")]
#[command(about = "Node-local control-plane agent for AMD GPUs")]
struct Cli {
    /// RPC server listen port
    #[arg(short = 'p', long = "grpc-server-port")]
    port: Option<String>,

    /// Upstream RDC endpoint host
    #[arg(short = 's', long = "rdc-server", default_value = "127.0.0.1")]
    rdc_server: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".parse().unwrap()),
        )
        .init();

    let port = match cli.port {
        Some(text) => match text.parse::<u32>() {
            Ok(port) if (1..=65535).contains(&port) => port as u16,
            _ => anyhow::bail!("invalid server port {text} specified"),
        },
        None => DEFAULT_GRPC_SERVER_PORT,
    };
    if cli.rdc_server.is_empty() {
        anyhow::bail!("rdc server host is not specified");
    }
    let rdc_server = format!("{}:{}", cli.rdc_server, DEFAULT_RDC_SERVER_PORT);

    info!(
        "starting gpuagent v{} (PID: {}), rdc endpoint {}",
        gpuagent_svc::VERSION,
        std::process::id(),
        rdc_server
    );

    let smi: Arc<dyn SmiAdapter> = Arc::new(SimSmi::new(SIM_NUM_GPU));
    let agent = Arc::new(
        Agent::init(AgentConfig::default(), smi).context("agent initialization failed")?,
    );

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("server listening on {} ...", addr);

    let app = router(AppState::new(agent.clone()));
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("server error")?;

    info!("server exited, agent shutting down ...");
    agent.shutdown();
    Ok(())
}
