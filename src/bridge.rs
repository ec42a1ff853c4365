//! Two-phase script loading
//!
//! 1. Bind `pushRecord`, `sshKey`, `configName` and `eventName` into the
//!    sandbox.
//! 2. Wrap the repository's `pipeline.js` in
//!    `var registerEvents = function(events) { ... }` so its top-level code
//!    only runs once the runner hands it an `events` registry.
//! 3. Load the runner script, which builds the registry, calls
//!    `registerEvents` and dispatches the event.

use serde_json::Value;
use std::path::Path;
use tracing::info;

use crate::error::ScriptError;
use crate::project::project_key;
use crate::sandbox::Sandbox;
use crate::webhook::{PUSH_EVENT, PushNotification};

/// Pipeline definition file at the root of the checked out repository
pub const DEFINITION_FILE: &str = "pipeline.js";

/// Stands in for `\n` in the SSH key handed to the script
pub const KEY_NEWLINE_PLACEHOLDER: &str = "$";

/// Values exposed to the user script. Built fresh for every build.
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxContext {
    pub push_record: Value,
    /// Key material flattened to a single line
    pub ssh_key: String,
    pub config_name: String,
    pub event_name: String,
}

impl SandboxContext {
    pub fn for_push(push: &PushNotification, ssh_key: Option<&str>) -> Result<Self, ScriptError> {
        Ok(Self {
            push_record: serde_json::to_value(push)?,
            ssh_key: flatten_key(ssh_key.unwrap_or_default()),
            config_name: project_key(push.full_name()),
            event_name: PUSH_EVENT.to_string(),
        })
    }
}

pub fn flatten_key(key: &str) -> String {
    key.replace('\n', KEY_NEWLINE_PLACEHOLDER)
}

/// Wraps the definition source so it only runs when handed an `events` object.
pub fn wrap_definition(source: &str) -> String {
    format!("var registerEvents = function(events) {{\n{}\n}};", source)
}

/// Bootstraps the sandbox and runs the definition through the runner script.
pub async fn execute_scripts(
    sandbox: &mut dyn Sandbox,
    context: SandboxContext,
    definition: &str,
    runner: &Path,
) -> Result<(), ScriptError> {
    let bindings = [
        ("pushRecord", context.push_record),
        ("sshKey", Value::String(context.ssh_key)),
        ("configName", Value::String(context.config_name)),
        ("eventName", Value::String(context.event_name)),
    ];
    for (name, value) in bindings {
        sandbox
            .bind_variable(name, value)
            .await
            .map_err(ScriptError::Bootstrap)?;
    }

    info!("Loading {}", DEFINITION_FILE);
    let wrapped = wrap_definition(definition);
    if let Err(source) = sandbox.evaluate(&wrapped).await {
        return Err(ScriptError::MalformedDefinition { source, wrapped });
    }

    info!("Loading {}", runner.display());
    sandbox
        .load_file(runner)
        .await
        .map_err(|source| ScriptError::Runner {
            path: runner.to_path_buf(),
            source,
        })
}
