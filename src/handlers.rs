//! Handler implementations for taskforge-mcp tools.
//!
//! Each handler converts MCP params to API types, calls the TaskForge
//! client, and formats the result.

use rmcp::{model::CallToolResult, ErrorData as McpError};

use crate::client::TaskForgeClient;
use crate::error::invalid_params;
use crate::params::*;
use crate::result::{json_success, text_success};
use crate::types::{NewTask, ProjectListResponse, TaskListResponse, TaskPatch, TaskQuery};

pub async fn list_projects(client: &TaskForgeClient) -> Result<CallToolResult, McpError> {
    let projects = client.projects().await?;
    json_success(&ProjectListResponse {
        total: projects.len(),
        projects,
    })
}

pub async fn list_tasks(
    client: &TaskForgeClient,
    params: ListTasksParams,
) -> Result<CallToolResult, McpError> {
    let query = TaskQuery {
        project_id: params.project_id,
        done: params.done,
        search: params.search,
    };
    let tasks = client.tasks(&query).await?;
    json_success(&TaskListResponse {
        total: tasks.len(),
        tasks,
    })
}

pub async fn get_task(
    client: &TaskForgeClient,
    params: GetTaskParams,
) -> Result<CallToolResult, McpError> {
    let task = client.task(params.id).await?;
    json_success(&task)
}

pub async fn create_task(
    client: &TaskForgeClient,
    params: CreateTaskParams,
) -> Result<CallToolResult, McpError> {
    if params.title.trim().is_empty() {
        return Err(invalid_params("title cannot be empty"));
    }
    let new_task = NewTask {
        title: params.title,
        description: params.description,
        priority: params.priority,
        due_date: params.due_date,
    };
    let task = client.create_task(params.project_id, &new_task).await?;
    json_success(&task)
}

pub async fn update_task(
    client: &TaskForgeClient,
    params: UpdateTaskParams,
) -> Result<CallToolResult, McpError> {
    let patch = TaskPatch {
        title: params.title,
        description: params.description,
        done: params.done,
        priority: params.priority,
        due_date: params.due_date,
    };
    let task = client.update_task(params.id, &patch).await?;
    json_success(&task)
}

pub async fn complete_task(
    client: &TaskForgeClient,
    params: CompleteTaskParams,
) -> Result<CallToolResult, McpError> {
    let patch = TaskPatch {
        done: Some(true),
        ..Default::default()
    };
    let task = client.update_task(params.id, &patch).await?;
    json_success(&task)
}

pub async fn delete_task(
    client: &TaskForgeClient,
    params: DeleteTaskParams,
) -> Result<CallToolResult, McpError> {
    client.delete_task(params.id).await?;
    Ok(text_success(format!("task {} deleted", params.id)))
}
