//! Error types for agent-dispatch.

use std::time::Duration;

use uuid::Uuid;

use crate::tasks::model::OutputFormat;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Task {task_id} cannot transition from {from} to {to}")]
    InvalidTransition {
        task_id: Uuid,
        from: String,
        to: String,
    },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Inference endpoint errors.
///
/// These are absorbed by the gateway's retry policy and never reach a phase.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Request to model {model} failed: {reason}")]
    RequestFailed { model: String, reason: String },

    #[error("Model {model} returned HTTP {status}: {body}")]
    HttpStatus {
        model: String,
        status: u16,
        body: String,
    },

    #[error("Model {model} timed out after {timeout:?}")]
    Timeout { model: String, timeout: Duration },

    #[error("Invalid response from {model}: {reason}")]
    InvalidResponse { model: String, reason: String },

    #[error("Model {model} returned an empty response")]
    EmptyResponse { model: String },
}

/// Search and page-fetch errors.
#[derive(Debug, thiserror::Error)]
pub enum ResearchError {
    #[error("Search for '{query}' failed: {reason}")]
    SearchFailed { query: String, reason: String },

    #[error("Fetching {url} failed: {reason}")]
    FetchFailed { url: String, reason: String },

    #[error("Invalid search response: {0}")]
    InvalidResponse(String),
}

/// Artifact workspace errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("Invalid artifact name: {0}")]
    InvalidArtifactName(String),

    #[error("Artifact not found: {0}")]
    ArtifactNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Secondary-format rendering errors.
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("Rendering to {format} produced an empty document")]
    EmptyDocument { format: OutputFormat },
}

/// Phase pipeline errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Planning produced an empty plan")]
    EmptyPlan,

    #[error("Execution produced an empty artifact")]
    EmptyArtifact,

    #[error("Task {task_id} is no longer assigned to this run")]
    Superseded { task_id: Uuid },

    #[error("Store error: {0}")]
    Store(#[from] DatabaseError),

    #[error("Workspace error: {0}")]
    Workspace(#[from] WorkspaceError),
}
