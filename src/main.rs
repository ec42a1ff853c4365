use chrono::Utc;
use pushbuild::build::{BuildOrchestrator, BuildSettings};
use pushbuild::dispatch::BuildDispatcher;
use pushbuild::error::PipelineError;
use pushbuild::project::ConfigProjectResolver;
use pushbuild::sandbox::ScriptSandboxFactory;
use pushbuild::status::{StatusReporter, reporter_from_config};
use pushbuild::vcs::GitCli;
use pushbuild::{AppState, api, load_config, logging};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

const DEFAULT_CONFIG_PATH: &str = "pushbuild.toml";

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();

    if let Err(e) = run().await {
        eprintln!("{}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), PipelineError> {
    let config_path = PathBuf::from(
        std::env::var("PUSHBUILD_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string()),
    );
    let mut config = load_config(&config_path)?;
    if let Ok(bind_address) = std::env::var("BIND_ADDRESS") {
        config.server.bind_address = bind_address;
    }

    let _log_guard = logging::setup_logging(
        config.server.log_dir.as_deref(),
        config.server.log_max_files,
    )?;

    let resolver = Arc::new(ConfigProjectResolver::new(&config.project));
    if resolver.is_empty() {
        warn!("No projects configured, every push will be rejected");
    }
    for project in config.project.iter().filter(|p| !p.has_valid_secret()) {
        warn!(
            "Project '{}' has no secret, its pushes will be refused",
            project.name
        );
    }

    let reporter: Arc<dyn StatusReporter> = reporter_from_config(&config.status)
        .map_err(|e| PipelineError::ConfigError(format!("Failed to create status client: {}", e)))?
        .into();
    let orchestrator = Arc::new(BuildOrchestrator::new(
        BuildSettings::from(&config),
        Arc::new(GitCli::default()),
        Arc::new(ScriptSandboxFactory::new(config.build.interpreter.clone())),
        reporter,
    ));
    let dispatcher = Arc::new(BuildDispatcher::new(
        orchestrator,
        config.build.max_concurrent_builds,
    ));

    let bind_address = config.server.bind_address.clone();
    let state = Arc::new(AppState {
        config,
        resolver,
        dispatcher: Arc::clone(&dispatcher),
        start_time: Instant::now(),
        started_at: Utc::now(),
    });

    let app = api::router(state);

    info!("Listening on {}", bind_address);
    info!("Using config at {:?}", config_path);
    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    dispatcher.shutdown().await;
    info!("All builds finished, exiting");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested, no longer accepting webhooks");
}
