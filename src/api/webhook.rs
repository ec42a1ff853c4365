//! Webhook handler for GitHub events

use axum::{
    Json,
    extract::{Request, State as AxumState},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::SharedState;
use crate::error::WebhookError;
use crate::project::project_key;
use crate::signature;
use crate::webhook::{EVENT_HEADER, PING_EVENT, PUSH_EVENT, PushNotification, SIGNATURE_HEADER};

/// What to do with an incoming request, decided from its event header
#[derive(Debug, PartialEq, Eq)]
pub enum EventKind<'a> {
    /// No event header; health checks and mis-wired hooks
    Missing,
    Ping,
    Push,
    Unsupported(&'a str),
}

pub fn classify(event: &str) -> EventKind<'_> {
    match event {
        "" => EventKind::Missing,
        PING_EVENT => EventKind::Ping,
        PUSH_EVENT => EventKind::Push,
        other => EventKind::Unsupported(other),
    }
}

/// Handles the GitHub webhook POST request.
pub async fn handle_webhook(
    AxumState(state): AxumState<SharedState>,
    request: Request,
) -> Response {
    let event = header_text(request.headers(), EVENT_HEADER);
    match classify(&event) {
        EventKind::Missing => {
            info!("No event header.");
            acknowledge()
        }
        EventKind::Ping => {
            info!("Received ping");
            acknowledge()
        }
        EventKind::Push => match handle_push(&state, request).await {
            Ok(response) => response,
            Err(e) => e.into_response(),
        },
        EventKind::Unsupported(other) => {
            warn!("Expected event push, got {}", other);
            WebhookError::UnsupportedEvent(other.to_string()).into_response()
        }
    }
}

/// Verifies a push and hands it to the dispatcher. Everything up to the
/// dispatch happens before the response is sent; the build itself does not.
async fn handle_push(state: &SharedState, request: Request) -> Result<Response, WebhookError> {
    let signature = request
        .headers()
        .get(SIGNATURE_HEADER)
        .map(|v| v.as_bytes().to_vec())
        .unwrap_or_default();

    let body = axum::body::to_bytes(request.into_body(), state.config.server.max_body_bytes)
        .await
        .map_err(|e| {
            warn!("Failed to read body: {}", e);
            WebhookError::MalformedBody
        })?;

    let push = PushNotification::from_slice(&body).map_err(|e| {
        info!("Could not parse push payload: {}", e);
        WebhookError::InvalidPayload(e.to_string())
    })?;

    let key = project_key(push.full_name());
    let namespace = &state.config.server.namespace;
    let project = state.resolver.resolve(&key, namespace).await.map_err(|e| {
        warn!(
            "Project {:?} ({}) not found. No secret loaded. {}",
            push.full_name(),
            key,
            e
        );
        WebhookError::ProjectNotFound
    })?;

    if project.secret.is_empty() {
        error!(
            "Project '{}' has no secret configured, refusing to build",
            push.full_name()
        );
        return Err(WebhookError::SecretNotConfigured);
    }

    if !signature::verify(project.secret.as_bytes(), &body, &signature) {
        error!(
            "Signature verification failed for project '{}'!",
            push.full_name()
        );
        debug!(
            "Expected signature {:?}, got {:?}",
            signature::sign(project.secret.as_bytes(), &body),
            String::from_utf8_lossy(&signature)
        );
        return Err(WebhookError::SignatureMismatch);
    }

    if project.name != push.full_name() {
        warn!(
            "Expected project to have name {:?}, got {:?}",
            push.full_name(),
            project.name
        );
    }

    let accepted = format!(
        "'{}' at {} (branch {})",
        push.full_name(),
        push.revision(),
        push.branch().unwrap_or("unknown")
    );
    let build_id = state.dispatcher.dispatch(push, project);
    info!("Accepted build {} for {}", build_id, accepted);

    Ok((StatusCode::OK, Json(json!({ "status": "Complete" }))).into_response())
}

fn acknowledge() -> Response {
    (StatusCode::OK, Json(json!({ "message": "OK" }))).into_response()
}

fn header_text(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
        .unwrap_or_default()
}
