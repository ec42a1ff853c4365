use std::io;
use std::path::PathBuf;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

use crate::bridge::DEFINITION_FILE;

/// Startup errors: configuration and logging setup
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("TOML parsing error: {0}")]
    TomlParseError(#[from] toml::de::Error),
}

/// Helper type for Results that use PipelineError
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors returned to the webhook caller.
///
/// The display text is exactly what ends up in the `status` field of the
/// response, so none of these variants carry digests or resolver internals.
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("Malformed body")]
    MalformedBody,

    #[error("{0}")]
    InvalidPayload(String),

    #[error("Only 'push' is supported. Got {0}")]
    UnsupportedEvent(String),

    #[error("project not found")]
    ProjectNotFound,

    #[error("No secret is configured for this repo.")]
    SecretNotConfigured,

    #[error("malformed signature")]
    SignatureMismatch,
}

impl WebhookError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            WebhookError::MalformedBody
            | WebhookError::InvalidPayload(_)
            | WebhookError::UnsupportedEvent(_)
            | WebhookError::ProjectNotFound => StatusCode::BAD_REQUEST,
            WebhookError::SignatureMismatch => StatusCode::FORBIDDEN,
            WebhookError::SecretNotConfigured => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        (
            self.status_code(),
            Json(json!({ "status": self.to_string() })),
        )
            .into_response()
    }
}

/// Project lookup failures. Never shown to the webhook caller.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("no project {key:?} in namespace {namespace:?}")]
    NotFound { key: String, namespace: String },

    #[error("project store unavailable: {0}")]
    Unavailable(String),
}

/// Failure of a single git invocation.
#[derive(Debug, thiserror::Error)]
pub enum VcsError {
    #[error("git {operation} could not be started: {source}")]
    Spawn {
        operation: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("git {operation} failed ({}){}", exit_code_text(.code), output_summary(.output))]
    Failed {
        operation: &'static str,
        code: Option<i32>,
        output: String,
    },
}

impl VcsError {
    /// Output captured from the failed process, if any was produced.
    pub fn captured_output(&self) -> Option<&str> {
        match self {
            VcsError::Failed { output, .. } if !output.is_empty() => Some(output),
            _ => None,
        }
    }
}

/// Failure inside the script sandbox.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("invalid variable name {0:?}")]
    InvalidName(String),

    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to start {interpreter}: {source}")]
    Spawn {
        interpreter: String,
        #[source]
        source: io::Error,
    },

    #[error("syntax error: {output}")]
    Compile { output: String },

    #[error("script failed ({}){}", exit_code_text(.code), output_summary(.output))]
    Execution { code: Option<i32>, output: String },

    #[error("failed to stage script: {0}")]
    Staging(#[from] io::Error),
}

impl SandboxError {
    /// Output captured from the interpreter, if any was produced.
    pub fn captured_output(&self) -> Option<&str> {
        match self {
            SandboxError::Compile { output } | SandboxError::Execution { output, .. }
                if !output.is_empty() =>
            {
                Some(output)
            }
            _ => None,
        }
    }
}

/// Failure while bootstrapping or running the pipeline scripts.
#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    #[error("failed to serialize push record: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed JS bootstrap: {0}")]
    Bootstrap(#[source] SandboxError),

    #[error("{} is not well formed: {source}\n{wrapped}", DEFINITION_FILE)]
    MalformedDefinition { source: SandboxError, wrapped: String },

    #[error("{}: {source}", .path.display())]
    Runner { path: PathBuf, source: SandboxError },
}

impl ScriptError {
    pub fn sandbox_error(&self) -> Option<&SandboxError> {
        match self {
            ScriptError::Serialize(_) => None,
            ScriptError::Bootstrap(source)
            | ScriptError::MalformedDefinition { source, .. }
            | ScriptError::Runner { source, .. } => Some(source),
        }
    }
}

/// Build failures. The display text becomes the failure status message.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("error writing ssh key cache: {0}")]
    Credentials(#[source] io::Error),

    #[error("invalid repository name {0:?}")]
    InvalidRepository(String),

    #[error("failed to create workspace {}: {source}", .path.display())]
    Workspace {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("project has an SSH key but the push carries no SSH URL")]
    MissingSshUrl,

    #[error("could neither clone nor update {url}. Clone: {clone} Update: {update}")]
    Clone {
        url: String,
        clone: VcsError,
        update: VcsError,
    },

    #[error("failed to check out {revision}: {source}")]
    Checkout {
        revision: String,
        #[source]
        source: VcsError,
    },

    #[error("failed to read {}: {source}", .path.display())]
    Definition {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Script(#[from] ScriptError),
}

/// Status publishing failures. Logged only.
#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    #[error("status request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("status API returned {status}: {body}")]
    Rejected {
        status: reqwest::StatusCode,
        body: String,
    },
}

fn exit_code_text(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "terminated by signal".to_string(),
    }
}

const MAX_SUMMARY_CHARS: usize = 200;

/// The line of process output most likely to name the failure, prefixed with
/// `": "`. Empty when there was no output.
fn output_summary(output: &str) -> String {
    let lines: Vec<&str> = output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    let line = lines
        .iter()
        .rev()
        .find(|l| l.contains("Error") || l.starts_with("fatal:") || l.starts_with("error:"))
        .or(lines.last());
    match line {
        Some(line) => format!(": {}", line.chars().take(MAX_SUMMARY_CHARS).collect::<String>()),
        None => String::new(),
    }
}
