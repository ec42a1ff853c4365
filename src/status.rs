//! Commit status reporting
//!
//! Every build publishes exactly two statuses: `pending` when it starts and
//! `success` or `failure` when it ends. Publishing is best-effort; callers
//! log errors and carry on.

use async_trait::async_trait;
use reqwest::header::ACCEPT;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;

use crate::StatusConfig;
use crate::error::StatusError;

/// Longest description the status API accepts
pub const MAX_DESCRIPTION_CHARS: usize = 140;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildState {
    Pending,
    Success,
    Failure,
    Error,
}

impl BuildState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildState::Pending => "pending",
            BuildState::Success => "success",
            BuildState::Failure => "failure",
            BuildState::Error => "error",
        }
    }
}

impl fmt::Display for BuildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One status transition for a revision
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    /// Repository full name
    pub repository: String,
    pub revision: String,
    pub state: BuildState,
    pub message: String,
    pub context: String,
    pub target_url: String,
}

#[async_trait]
pub trait StatusReporter: Send + Sync {
    async fn publish(&self, update: &StatusUpdate) -> Result<(), StatusError>;
}

#[derive(Serialize)]
struct StatusRequest<'a> {
    state: BuildState,
    target_url: &'a str,
    description: String,
    context: &'a str,
}

/// Publishes to the GitHub commit status endpoint
pub struct GitHubStatusReporter {
    client: reqwest::Client,
    api_url: String,
    token: String,
}

impl GitHubStatusReporter {
    pub fn new(api_url: impl Into<String>, token: impl Into<String>) -> Result<Self, StatusError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("pushbuild/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    fn statuses_url(&self, update: &StatusUpdate) -> String {
        format!(
            "{}/repos/{}/statuses/{}",
            self.api_url, update.repository, update.revision
        )
    }
}

#[async_trait]
impl StatusReporter for GitHubStatusReporter {
    async fn publish(&self, update: &StatusUpdate) -> Result<(), StatusError> {
        let body = StatusRequest {
            state: update.state,
            target_url: &update.target_url,
            description: truncate_description(&update.message),
            context: &update.context,
        };

        let response = self
            .client
            .post(self.statuses_url(update))
            .bearer_auth(&self.token)
            .header(ACCEPT, "application/vnd.github+json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StatusError::Rejected { status, body });
        }
        Ok(())
    }
}

/// Fallback when no API token is configured: statuses only go to the log.
#[derive(Debug, Default)]
pub struct LogStatusReporter;

#[async_trait]
impl StatusReporter for LogStatusReporter {
    async fn publish(&self, update: &StatusUpdate) -> Result<(), StatusError> {
        info!(
            "Status {} for {}@{} ({}): {}",
            update.state, update.repository, update.revision, update.context, update.message
        );
        Ok(())
    }
}

/// Picks the GitHub reporter when a token is available, the log reporter
/// otherwise.
pub fn reporter_from_config(config: &StatusConfig) -> Result<Box<dyn StatusReporter>, StatusError> {
    let token = config
        .token
        .clone()
        .or_else(|| std::env::var("GITHUB_TOKEN").ok())
        .filter(|t| !t.is_empty());
    match token {
        Some(token) => Ok(Box::new(GitHubStatusReporter::new(&config.api_url, token)?)),
        None => {
            info!("No status API token configured, commit statuses will only be logged");
            Ok(Box::new(LogStatusReporter))
        }
    }
}

fn truncate_description(message: &str) -> String {
    if message.chars().count() <= MAX_DESCRIPTION_CHARS {
        return message.to_string();
    }
    let mut truncated: String = message.chars().take(MAX_DESCRIPTION_CHARS - 3).collect();
    truncated.push_str("...");
    truncated
}
