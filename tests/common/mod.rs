#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::sync::Semaphore;

use pushbuild::build::{BuildOrchestrator, BuildSettings};
use pushbuild::dispatch::BuildDispatcher;
use pushbuild::error::{ResolveError, SandboxError, StatusError, VcsError};
use pushbuild::project::{ProjectRecord, ProjectResolver, project_key};
use pushbuild::sandbox::{Sandbox, SandboxFactory};
use pushbuild::status::{StatusReporter, StatusUpdate};
use pushbuild::vcs::{GitCredentials, Vcs};
use pushbuild::webhook::PushNotification;
use pushbuild::{AppState, PipelineConfig, SharedState};

pub const CLONE_URL: &str = "https://github.com/acme/widgets.git";
pub const SSH_URL: &str = "git@github.com:acme/widgets.git";

pub fn push_payload() -> Value {
    json!({
        "ref": "refs/heads/main",
        "after": "abc123",
        "repository": {
            "name": "widgets",
            "full_name": "acme/widgets",
            "clone_url": CLONE_URL,
            "ssh_url": SSH_URL
        },
        "head_commit": { "id": "abc123", "message": "Fix the sprocket" },
        "pusher": { "name": "jo" }
    })
}

pub fn push() -> PushNotification {
    serde_json::from_value(push_payload()).unwrap()
}

pub fn project(secret: &str) -> ProjectRecord {
    ProjectRecord {
        name: "acme/widgets".into(),
        secret: secret.into(),
        ssh_key: None,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum VcsCall {
    Clone {
        url: String,
        dest: PathBuf,
        ssh_key: Option<String>,
    },
    Update {
        dest: PathBuf,
    },
    Checkout {
        dest: PathBuf,
        revision: String,
    },
}

/// Records git calls and materializes `files` in the destination on success.
///
/// With a `gate`, every clone waits for one permit before returning. `active`
/// counts builds between clone start and checkout end.
#[derive(Default)]
pub struct MockVcs {
    pub calls: Mutex<Vec<VcsCall>>,
    pub fail_clone: bool,
    pub fail_update: bool,
    pub fail_checkout: bool,
    pub files: Vec<(String, String)>,
    pub gate: Option<Arc<Semaphore>>,
    pub active: AtomicUsize,
    pub max_active: AtomicUsize,
}

impl MockVcs {
    pub fn with_pipeline(source: &str) -> Self {
        Self {
            files: vec![("pipeline.js".into(), source.into())],
            ..Default::default()
        }
    }

    /// Clones block until the returned gate is given permits
    pub fn gated(source: &str) -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let vcs = Self {
            gate: Some(Arc::clone(&gate)),
            ..Self::with_pipeline(source)
        };
        (vcs, gate)
    }

    pub fn calls(&self) -> Vec<VcsCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clones_started(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, VcsCall::Clone { .. }))
            .count()
    }

    pub async fn wait_for_clones(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.clones_started() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("clone did not start in time");
    }

    fn write_files(&self, dest: &Path) {
        for (name, contents) in &self.files {
            std::fs::write(dest.join(name), contents).unwrap();
        }
    }

    fn failure(operation: &'static str) -> VcsError {
        VcsError::Failed {
            operation,
            code: Some(128),
            output: format!("fatal: {} failed", operation),
        }
    }
}

#[async_trait]
impl Vcs for MockVcs {
    async fn clone_repo(
        &self,
        url: &str,
        dest: &Path,
        creds: &GitCredentials,
    ) -> Result<(), VcsError> {
        // Read the key while the build still holds it
        let ssh_key = creds
            .ssh_key_path
            .as_ref()
            .map(|p| std::fs::read_to_string(p).unwrap());
        self.calls.lock().unwrap().push(VcsCall::Clone {
            url: url.into(),
            dest: dest.into(),
            ssh_key,
        });
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        if self.fail_clone {
            return Err(Self::failure("clone"));
        }
        self.write_files(dest);
        Ok(())
    }

    async fn update(&self, dest: &Path, _creds: &GitCredentials) -> Result<(), VcsError> {
        self.calls
            .lock()
            .unwrap()
            .push(VcsCall::Update { dest: dest.into() });
        if self.fail_update {
            return Err(Self::failure("fetch"));
        }
        self.write_files(dest);
        Ok(())
    }

    async fn checkout(&self, dest: &Path, revision: &str) -> Result<(), VcsError> {
        self.calls.lock().unwrap().push(VcsCall::Checkout {
            dest: dest.into(),
            revision: revision.into(),
        });
        self.active.fetch_sub(1, Ordering::SeqCst);
        if self.fail_checkout {
            return Err(Self::failure("checkout"));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingReporter {
    pub updates: Mutex<Vec<StatusUpdate>>,
    pub fail: bool,
}

impl RecordingReporter {
    pub fn updates(&self) -> Vec<StatusUpdate> {
        self.updates.lock().unwrap().clone()
    }
}

#[async_trait]
impl StatusReporter for RecordingReporter {
    async fn publish(&self, update: &StatusUpdate) -> Result<(), StatusError> {
        self.updates.lock().unwrap().push(update.clone());
        if self.fail {
            return Err(StatusError::Rejected {
                status: reqwest::StatusCode::UNAUTHORIZED,
                body: "Bad credentials".into(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SandboxCall {
    Bind(String, Value),
    Evaluate(String),
    Load(PathBuf),
}

#[derive(Default)]
pub struct MockSandboxFactory {
    pub calls: Arc<Mutex<Vec<SandboxCall>>>,
    pub workdirs: Mutex<Vec<PathBuf>>,
    pub fail_evaluate: bool,
    pub fail_load: bool,
}

impl MockSandboxFactory {
    pub fn calls(&self) -> Vec<SandboxCall> {
        self.calls.lock().unwrap().clone()
    }
}

struct MockSandbox {
    calls: Arc<Mutex<Vec<SandboxCall>>>,
    fail_evaluate: bool,
    fail_load: bool,
}

#[async_trait]
impl Sandbox for MockSandbox {
    async fn bind_variable(&mut self, name: &str, value: Value) -> Result<(), SandboxError> {
        self.calls
            .lock()
            .unwrap()
            .push(SandboxCall::Bind(name.into(), value));
        Ok(())
    }

    async fn evaluate(&mut self, source: &str) -> Result<(), SandboxError> {
        self.calls
            .lock()
            .unwrap()
            .push(SandboxCall::Evaluate(source.into()));
        if self.fail_evaluate {
            return Err(SandboxError::Compile {
                output: "SyntaxError: Unexpected end of input".into(),
            });
        }
        Ok(())
    }

    async fn load_file(&mut self, path: &Path) -> Result<(), SandboxError> {
        self.calls
            .lock()
            .unwrap()
            .push(SandboxCall::Load(path.into()));
        if self.fail_load {
            return Err(SandboxError::Execution {
                code: Some(1),
                output: "Error: build step failed".into(),
            });
        }
        Ok(())
    }
}

impl SandboxFactory for MockSandboxFactory {
    fn create(&self, workdir: &Path) -> Box<dyn Sandbox> {
        self.workdirs.lock().unwrap().push(workdir.into());
        Box::new(MockSandbox {
            calls: Arc::clone(&self.calls),
            fail_evaluate: self.fail_evaluate,
            fail_load: self.fail_load,
        })
    }
}

/// Resolver over a fixed set of records keyed by repository full name
#[derive(Default)]
pub struct StaticResolver {
    pub projects: HashMap<String, ProjectRecord>,
    pub unavailable: bool,
}

impl StaticResolver {
    pub fn with(full_name: &str, record: ProjectRecord) -> Self {
        let mut projects = HashMap::new();
        projects.insert(project_key(full_name), record);
        Self {
            projects,
            unavailable: false,
        }
    }
}

#[async_trait]
impl ProjectResolver for StaticResolver {
    async fn resolve(&self, key: &str, namespace: &str) -> Result<ProjectRecord, ResolveError> {
        if self.unavailable {
            return Err(ResolveError::Unavailable("connection refused".into()));
        }
        self.projects
            .get(key)
            .cloned()
            .ok_or_else(|| ResolveError::NotFound {
                key: key.into(),
                namespace: namespace.into(),
            })
    }
}

pub struct Harness {
    pub cache: TempDir,
    pub vcs: Arc<MockVcs>,
    pub reporter: Arc<RecordingReporter>,
    pub sandboxes: Arc<MockSandboxFactory>,
}

impl Harness {
    pub fn new(vcs: MockVcs) -> Self {
        Self::with_parts(vcs, RecordingReporter::default(), MockSandboxFactory::default())
    }

    pub fn with_parts(
        vcs: MockVcs,
        reporter: RecordingReporter,
        sandboxes: MockSandboxFactory,
    ) -> Self {
        Self {
            cache: tempfile::tempdir().unwrap(),
            vcs: Arc::new(vcs),
            reporter: Arc::new(reporter),
            sandboxes: Arc::new(sandboxes),
        }
    }

    pub fn settings(&self) -> BuildSettings {
        BuildSettings {
            cache_root: self.cache.path().to_path_buf(),
            runner_script: PathBuf::from("js/runner.js"),
            target_url: "http://ci.example.com".into(),
            context: "pushbuild".into(),
        }
    }

    pub fn workspace(&self) -> PathBuf {
        self.cache.path().join("acme/widgets")
    }

    pub fn orchestrator(&self) -> BuildOrchestrator {
        BuildOrchestrator::new(
            self.settings(),
            self.vcs.clone(),
            self.sandboxes.clone(),
            self.reporter.clone(),
        )
    }

    pub fn dispatcher(&self, max_concurrent_builds: usize) -> BuildDispatcher {
        BuildDispatcher::new(Arc::new(self.orchestrator()), max_concurrent_builds)
    }

    pub fn app_state(&self, resolver: impl ProjectResolver + 'static) -> SharedState {
        Arc::new(AppState {
            config: PipelineConfig::default(),
            resolver: Arc::new(resolver),
            dispatcher: Arc::new(self.dispatcher(2)),
            start_time: Instant::now(),
            started_at: Utc::now(),
        })
    }
}
