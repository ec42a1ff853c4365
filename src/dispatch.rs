//! Build task management
//!
//! Every accepted push becomes one tracked task. A semaphore caps how many
//! builds run at once; the rest wait for a permit. Shutdown closes the
//! tracker and waits for in-flight builds.

use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, info, info_span, warn};
use uuid::Uuid;

use crate::build::BuildOrchestrator;
use crate::project::ProjectRecord;
use crate::webhook::PushNotification;

pub struct BuildDispatcher {
    orchestrator: Arc<BuildOrchestrator>,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
}

impl BuildDispatcher {
    pub fn new(orchestrator: Arc<BuildOrchestrator>, max_concurrent_builds: usize) -> Self {
        Self {
            orchestrator,
            permits: Arc::new(Semaphore::new(max_concurrent_builds.max(1))),
            tracker: TaskTracker::new(),
        }
    }

    /// Spawns a build for `push` and returns its id without waiting for it.
    pub fn dispatch(&self, push: PushNotification, project: ProjectRecord) -> Uuid {
        let build_id = Uuid::now_v7();
        let span = info_span!(
            "build",
            id = %build_id,
            repository = %push.full_name(),
            revision = %push.revision(),
        );

        let orchestrator = Arc::clone(&self.orchestrator);
        let permits = Arc::clone(&self.permits);
        self.tracker.spawn(
            async move {
                let _permit = match permits.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        warn!("Build pool is closed, dropping build");
                        return;
                    }
                };
                info!("Starting build");
                let state = orchestrator.run(push, project).await;
                info!("Build finished: {}", state);
            }
            .instrument(span),
        );

        build_id
    }

    /// Builds that are running or waiting for a permit
    pub fn active_builds(&self) -> usize {
        self.tracker.len()
    }

    /// Waits for every build dispatched so far to finish.
    pub async fn shutdown(&self) {
        self.tracker.close();
        info!("Waiting for {} build(s) to finish", self.tracker.len());
        self.tracker.wait().await;
    }
}
