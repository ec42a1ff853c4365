//! Build orchestration
//!
//! A build stages credentials, publishes `pending`, prepares the workspace,
//! clones or updates it to the pushed revision, reads `pipeline.js` and runs
//! it through the sandbox, then publishes `success` or `failure`. Errors never
//! reach the webhook caller; they end up in the log and in the final status.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tempfile::NamedTempFile;
use tracing::{debug, error, info, warn};

use crate::PipelineConfig;
use crate::bridge::{self, DEFINITION_FILE, SandboxContext};
use crate::error::BuildError;
use crate::project::ProjectRecord;
use crate::sandbox::SandboxFactory;
use crate::status::{BuildState, StatusReporter, StatusUpdate};
use crate::vcs::{GitCredentials, Vcs};
use crate::webhook::PushNotification;

pub const PENDING_MESSAGE: &str = "Building";
pub const SUCCESS_MESSAGE: &str = "Build passed";

#[derive(Debug, Clone)]
pub struct BuildSettings {
    pub cache_root: PathBuf,
    pub runner_script: PathBuf,
    pub target_url: String,
    pub context: String,
}

impl From<&PipelineConfig> for BuildSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            cache_root: config.build.cache_root.clone(),
            runner_script: config.build.runner_script.clone(),
            target_url: config.status.target_url.clone(),
            context: config.status.context.clone(),
        }
    }
}

/// SSH key written to a private temporary file for the length of one build.
/// Dropping it removes the file.
struct StagedCredentials {
    _key_file: Option<NamedTempFile>,
    git: GitCredentials,
}

impl StagedCredentials {
    fn stage(ssh_key: Option<&str>) -> std::io::Result<Self> {
        let Some(key) = ssh_key.filter(|k| !k.is_empty()) else {
            return Ok(Self {
                _key_file: None,
                git: GitCredentials::default(),
            });
        };

        let mut file = tempfile::Builder::new()
            .prefix("pushbuild-key-")
            .tempfile()?;
        file.write_all(key.as_bytes())?;
        if !key.ends_with('\n') {
            file.write_all(b"\n")?;
        }
        file.flush()?;

        let git = GitCredentials::with_ssh_key(file.path());
        Ok(Self {
            _key_file: Some(file),
            git,
        })
    }
}

/// Workspace for a repository: `cache_root/<owner>/<repo>`
pub fn workspace_dir(cache_root: &Path, full_name: &str) -> Result<PathBuf, BuildError> {
    let relative = Path::new(full_name);
    let safe = !full_name.is_empty()
        && relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if !safe {
        return Err(BuildError::InvalidRepository(full_name.to_string()));
    }
    Ok(cache_root.join(relative))
}

/// Clones `url` into `dest`, falling back to updating an existing working
/// copy, then checks out `revision`.
pub async fn fetch_revision(
    vcs: &dyn Vcs,
    url: &str,
    dest: &Path,
    revision: &str,
    creds: &GitCredentials,
) -> Result<(), BuildError> {
    if let Err(clone) = vcs.clone_repo(url, dest, creds).await {
        log_captured_output("clone", clone.captured_output());
        info!(
            "Clone of {} into {} failed ({}), updating in place",
            url,
            dest.display(),
            clone
        );
        if let Err(update) = vcs.update(dest, creds).await {
            log_captured_output("update", update.captured_output());
            warn!(
                "Could neither clone nor update repo {:?}. Clone: {} Update: {}",
                url, clone, update
            );
            return Err(BuildError::Clone {
                url: url.to_string(),
                clone,
                update,
            });
        }
    }

    vcs.checkout(dest, revision).await.map_err(|source| {
        log_captured_output("checkout", source.captured_output());
        error!("Failed to checkout {:?}: {}", revision, source);
        BuildError::Checkout {
            revision: revision.to_string(),
            source,
        }
    })
}

fn log_captured_output(operation: &str, output: Option<&str>) {
    if let Some(output) = output {
        warn!("{} output:\n{}", operation, output.trim_end());
    }
}

pub struct BuildOrchestrator {
    settings: BuildSettings,
    vcs: Arc<dyn Vcs>,
    sandboxes: Arc<dyn SandboxFactory>,
    reporter: Arc<dyn StatusReporter>,
    workspace_locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl BuildOrchestrator {
    pub fn new(
        settings: BuildSettings,
        vcs: Arc<dyn Vcs>,
        sandboxes: Arc<dyn SandboxFactory>,
        reporter: Arc<dyn StatusReporter>,
    ) -> Self {
        Self {
            settings,
            vcs,
            sandboxes,
            reporter,
            workspace_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Runs one build to completion and returns its final state.
    ///
    /// Returns [`BuildState::Error`] without publishing anything when the SSH
    /// key cannot be staged.
    pub async fn run(&self, push: PushNotification, project: ProjectRecord) -> BuildState {
        let credentials = match StagedCredentials::stage(project.ssh_key.as_deref()) {
            Ok(credentials) => credentials,
            Err(e) => {
                error!("{}", BuildError::Credentials(e));
                return BuildState::Error;
            }
        };

        let mut status = StatusUpdate {
            repository: push.full_name().to_string(),
            revision: push.revision().to_string(),
            state: BuildState::Pending,
            message: PENDING_MESSAGE.to_string(),
            context: self.settings.context.clone(),
            target_url: self.settings.target_url.clone(),
        };
        self.publish(&status).await;

        match self.build(&push, &project, &credentials.git).await {
            Ok(()) => {
                info!("Build of {}@{} passed", push.full_name(), push.revision());
                status.state = BuildState::Success;
                status.message = SUCCESS_MESSAGE.to_string();
            }
            Err(e) => {
                error!("Build failed: {}", e);
                if let BuildError::Script(script) = &e {
                    log_captured_output(
                        "script",
                        script.sandbox_error().and_then(|s| s.captured_output()),
                    );
                }
                status.state = BuildState::Failure;
                status.message = e.to_string();
            }
        }
        self.publish(&status).await;

        status.state
    }

    async fn publish(&self, status: &StatusUpdate) {
        if let Err(e) = self.reporter.publish(status).await {
            error!("Error setting status to {}: {}", status.state, e);
        }
    }

    fn workspace_lock(&self, workspace: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .workspace_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        locks.entry(workspace.to_path_buf()).or_default().clone()
    }

    async fn build(
        &self,
        push: &PushNotification,
        project: &ProjectRecord,
        creds: &GitCredentials,
    ) -> Result<(), BuildError> {
        let workspace = workspace_dir(&self.settings.cache_root, push.full_name())?;

        // Builds of the same repository share a working copy
        let lock = self.workspace_lock(&workspace);
        let _guard = lock.lock().await;

        tokio::fs::create_dir_all(&workspace)
            .await
            .map_err(|source| BuildError::Workspace {
                path: workspace.clone(),
                source,
            })?;

        let url = if project.has_ssh_key() {
            let ssh_url = push
                .repository
                .ssh_url
                .as_deref()
                .ok_or(BuildError::MissingSshUrl)?;
            info!("Switch to SSH URL {} because the project has a key", ssh_url);
            ssh_url
        } else {
            push.repository.clone_url.as_str()
        };

        fetch_revision(self.vcs.as_ref(), url, &workspace, push.revision(), creds).await?;

        let definition_path = workspace.join(DEFINITION_FILE);
        let definition = tokio::fs::read_to_string(&definition_path)
            .await
            .map_err(|source| BuildError::Definition {
                path: definition_path.clone(),
                source,
            })?;
        debug!("{}:\n{}", DEFINITION_FILE, definition);

        let context = SandboxContext::for_push(push, project.ssh_key.as_deref())?;
        let mut sandbox = self.sandboxes.create(&workspace);
        bridge::execute_scripts(
            sandbox.as_mut(),
            context,
            &definition,
            &self.settings.runner_script,
        )
        .await?;

        Ok(())
    }
}
