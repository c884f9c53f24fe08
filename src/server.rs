//! MCP server exposing TaskForge task operations as tools.
//!
//! One server instance wraps one authenticated client: the stdio transport
//! builds a single instance at startup, the HTTP transport builds one per
//! protocol session with that session's cached client reference.

use rmcp::{
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::{CallToolResult, ServerCapabilities, ServerInfo},
    tool, tool_handler, tool_router, ErrorData as McpError,
};
use std::sync::Arc;

use crate::auth::AuthenticatedClient;
use crate::client::TaskForgeClient;
use crate::handlers;
use crate::params::*;

#[derive(Clone)]
pub struct TaskForgeMcpServer {
    client: Arc<TaskForgeClient>,
    subject: String,
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl TaskForgeMcpServer {
    pub fn new(authed: AuthenticatedClient) -> Self {
        Self {
            client: authed.client,
            subject: authed.email,
            tool_router: Self::tool_router(),
        }
    }

    /// The identity this server instance operates as.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    #[tool(description = "List all projects visible to the authenticated user")]
    async fn list_projects(&self) -> Result<CallToolResult, McpError> {
        handlers::list_projects(&self.client).await
    }

    #[tool(description = "Query tasks with filters (project, done state, search)")]
    async fn list_tasks(
        &self,
        Parameters(params): Parameters<ListTasksParams>,
    ) -> Result<CallToolResult, McpError> {
        handlers::list_tasks(&self.client, params).await
    }

    #[tool(description = "Fetch one task by ID")]
    async fn get_task(
        &self,
        Parameters(params): Parameters<GetTaskParams>,
    ) -> Result<CallToolResult, McpError> {
        handlers::get_task(&self.client, params).await
    }

    #[tool(description = "Create a new task in a project")]
    async fn create_task(
        &self,
        Parameters(params): Parameters<CreateTaskParams>,
    ) -> Result<CallToolResult, McpError> {
        handlers::create_task(&self.client, params).await
    }

    #[tool(description = "Update task fields (title, description, done, priority, due date)")]
    async fn update_task(
        &self,
        Parameters(params): Parameters<UpdateTaskParams>,
    ) -> Result<CallToolResult, McpError> {
        handlers::update_task(&self.client, params).await
    }

    #[tool(description = "Mark a task as done")]
    async fn complete_task(
        &self,
        Parameters(params): Parameters<CompleteTaskParams>,
    ) -> Result<CallToolResult, McpError> {
        handlers::complete_task(&self.client, params).await
    }

    #[tool(description = "Delete a task permanently")]
    async fn delete_task(
        &self,
        Parameters(params): Parameters<DeleteTaskParams>,
    ) -> Result<CallToolResult, McpError> {
        handlers::delete_task(&self.client, params).await
    }
}

#[tool_handler]
impl rmcp::ServerHandler for TaskForgeMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "TaskForge task-management MCP server. Exposes project and task CRUD \
                 operations against the configured TaskForge instance. All tools operate \
                 as the authenticated user of this session."
                    .into(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}
