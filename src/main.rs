use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use run_orchestrator::api;
use run_orchestrator::config::{EngineConfig, SchedulerConfig, ServerConfig};
use run_orchestrator::engine::Engine;
use run_orchestrator::engine::command_unit::CommandUnit;
use run_orchestrator::jobs::{JobManager, JsonArtifactReader, SlurmScheduler};
use run_orchestrator::store::{LibSqlBackend, RunStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let engine_config = EngineConfig::from_env()?;
    let scheduler_config = SchedulerConfig::from_env()?;
    let server_config = ServerConfig::from_env()?;

    let unit_command = server_config.require_unit_command()?.to_string();

    eprintln!("Run orchestrator v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   API: http://{}", server_config.bind);
    eprintln!(
        "   Limits: {} running, {} queued",
        engine_config.max_concurrent_runs, engine_config.max_queue_size
    );

    // ── Database ─────────────────────────────────────────────────────────
    let store: Arc<dyn RunStore> = Arc::new(
        LibSqlBackend::new_local(Path::new(&server_config.db_path))
            .await
            .with_context(|| {
                format!(
                    "Failed to open database at {}",
                    server_config.db_path.display()
                )
            })?,
    );

    // ── External jobs ────────────────────────────────────────────────────
    let reader = Arc::new(JsonArtifactReader::new(scheduler_config.result_file.clone()));
    let scheduler = Arc::new(SlurmScheduler::new(scheduler_config));
    let jobs = Arc::new(JobManager::new(scheduler, Arc::clone(&store), reader));

    // ── Engine ───────────────────────────────────────────────────────────
    let unit = Arc::new(CommandUnit::new(unit_command));
    let engine = Engine::new(engine_config, store, unit, jobs)?;

    let recovery = engine.recover().await?;
    if recovery.failed > 0 || recovery.requeued > 0 {
        info!(
            failed = recovery.failed,
            requeued = recovery.requeued,
            "Recovered requests from previous run"
        );
    }

    // ── HTTP ─────────────────────────────────────────────────────────────
    let app = api::routes(engine);
    let listener = tokio::net::TcpListener::bind(server_config.bind)
        .await
        .with_context(|| format!("Failed to bind {}", server_config.bind))?;
    info!(addr = %server_config.bind, "API server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await?;

    Ok(())
}
