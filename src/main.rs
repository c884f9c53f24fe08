//! taskforge-mcp entry point.

use anyhow::Context;
use clap::{Parser, ValueEnum};
use rmcp::{transport::io::stdio, ServiceExt};
use std::net::SocketAddr;
use std::sync::Arc;

use taskforge_mcp::auth::{AuthManager, Credentials};
use taskforge_mcp::client::HttpLoginService;
use taskforge_mcp::config::ServerConfig;
use taskforge_mcp::http;
use taskforge_mcp::logging;
use taskforge_mcp::server::TaskForgeMcpServer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TransportMode {
    /// Serve over stdin/stdout (local pipe).
    Stdio,
    /// Serve over streamable HTTP.
    Http,
}

#[derive(Parser, Debug)]
#[command(name = "taskforge-mcp", about = "MCP server for the TaskForge task-management API")]
struct Cli {
    #[arg(long, value_enum, default_value_t = TransportMode::Stdio)]
    transport: TransportMode,

    /// Listen address for HTTP mode.
    #[arg(long, env = "TASKFORGE_BIND", default_value = "127.0.0.1:8787")]
    bind: SocketAddr,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init_tracing("taskforge_mcp")?;

    let cli = Cli::parse();
    let config = ServerConfig::from_env().context("invalid configuration")?;

    match cli.transport {
        TransportMode::Stdio => run_stdio(config).await,
        TransportMode::Http => http::serve(config, cli.bind).await,
    }
}

/// Stdio mode: one eager service-account login through the same dispatcher
/// path the HTTP mode uses, then a single MCP service over the pipe.
async fn run_stdio(config: ServerConfig) -> anyhow::Result<()> {
    let (email, password) = config.require_service_credentials()?;
    let (email, password) = (email.to_string(), password.to_string());

    let login = Arc::new(HttpLoginService::new(config.base_url.clone()));
    let auth = AuthManager::new(&config, login);

    let authed = auth
        .authenticate(Credentials::Basic { email, password })
        .await
        .context("TaskForge login failed")?;
    tracing::info!(email = %authed.email, "authenticated with TaskForge");

    let server = TaskForgeMcpServer::new(authed);
    let service = server.serve(stdio()).await?;

    tracing::info!("TaskForge MCP server running on stdio");
    service.waiting().await?;

    tracing::info!("TaskForge MCP server stopped");
    auth.cache().clear().await;
    Ok(())
}
