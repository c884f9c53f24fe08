//! TaskForge MCP server.
//!
//! Exposes the TaskForge task-management API to MCP clients over two
//! transports: stdio (local pipe) and streamable HTTP. The HTTP mode
//! authenticates every request (shared-secret token via `?token=` or a
//! bearer header, or Basic credentials), caches authenticated TaskForge
//! clients keyed by a credential digest, collapses concurrent logins for the
//! same identity into one upstream call, and tracks MCP protocol sessions
//! independently of the credential cache.

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod handlers;
pub mod http;
pub mod logging;
pub mod params;
pub mod result;
pub mod server;
pub mod session;
pub mod sweeper;
#[cfg(test)]
mod tests;
pub mod types;

pub use auth::{AuthManager, AuthenticatedClient, Credentials};
pub use client::{HttpLoginService, LoginService, TaskForgeClient};
pub use config::ServerConfig;
pub use error::{AuthError, ClientError, SessionError};
pub use server::TaskForgeMcpServer;
pub use session::SessionManager;
