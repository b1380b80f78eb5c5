use anyhow::Context;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use walletsync::adapter::{EventAdapter, INTERNAL_MECHANISM_ADDRESSES};
use walletsync::api;
use walletsync::checkpoint::CheckpointManager;
use walletsync::compile::MetricsCompiler;
use walletsync::orchestration::{StatusBoard, SyncOrchestrator, TargetSyncer};
use walletsync::validation::{HttpReferencePnl, Validator};
use walletsync::config::SyncMode;
use walletsync::{init_db, Address, Config, HttpEventSource, PnlEngine, Repository};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into()),
        )
        .init();

    let config = Config::from_env().context("configuration error")?;
    let settings = config.sync_settings();

    let pool = init_db(&config.database_path)
        .await
        .context("failed to initialize database")?;
    let repo = Arc::new(Repository::new(pool));

    if let Some(path) = &config.markets_csv_path {
        let bytes = std::fs::read(path).with_context(|| format!("cannot read {}", path))?;
        repo.import_markets_csv(&bytes)
            .await
            .with_context(|| format!("market import from {} failed", path))?;
    }
    if let Some(path) = &config.marks_csv_path {
        let bytes = std::fs::read(path).with_context(|| format!("cannot read {}", path))?;
        repo.import_marks_csv(&bytes)
            .await
            .with_context(|| format!("mark import from {} failed", path))?;
    }
    let engine = PnlEngine::new(config.notional_per_share);
    let status = StatusBoard::new();

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutdown requested");
                cancel.cancel();
            }
        });
    }

    let app = api::create_router(api::AppState::new(repo.clone(), status.clone(), engine.clone()));
    let addr = SocketAddr::from(([127, 0, 0, 1], config.port));
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;
    tracing::info!("Server listening on {}", addr);

    let server = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { cancel.cancelled().await })
                .await
        })
    };

    let source = HttpEventSource::new(
        config.events_api_url.clone(),
        config.request_timeout(),
        config.retry_budget(),
    )
    .context("failed to build event source client")?;
    let adapter = EventAdapter::new(
        INTERNAL_MECHANISM_ADDRESSES.iter().map(|a| Address::new(*a)),
        config.notional_per_share,
    );
    let syncer = TargetSyncer::new(
        Arc::new(source),
        repo.clone(),
        Arc::new(adapter),
        settings.page_size,
        settings.fetch_timeout,
        settings.dry_run,
    );
    let orchestrator = SyncOrchestrator::new(
        syncer,
        CheckpointManager::new(&config.checkpoint_path),
        settings.clone(),
    )
    .with_status_board(status);

    tracing::info!(mode = ?config.sync_mode, "Starting sync");
    let mut checkpoint = orchestrator
        .load_checkpoint(config.sync_wallets.iter().cloned())
        .await
        .context("cannot resume from checkpoint")?;
    let summary = match config.sync_mode {
        SyncMode::Bulk => orchestrator.run_bulk(&mut checkpoint, &cancel).await,
        SyncMode::Incremental => {
            orchestrator
                .run_incremental(&mut checkpoint, &HashMap::new(), &cancel)
                .await
        }
    }
    .context("sync run aborted")?;

    if !summary.cancelled && !settings.dry_run {
        let mut roster: Vec<Address> =
            checkpoint.targets().iter().map(|t| t.wallet.clone()).collect();
        if roster.is_empty() {
            roster = repo.distinct_wallets().await.context("cannot list stored wallets")?;
        }
        let compiler = MetricsCompiler::new(repo.clone(), engine.clone());
        compiler
            .compile_all(&roster, settings.concurrency, false)
            .await
            .context("metrics compile failed")?;

        if let Some(url) = &config.reference_pnl_url {
            let reference = HttpReferencePnl::new(url.clone(), config.fetch_timeout())
                .context("failed to build reference client")?;
            let validator = Validator::new(
                repo.clone(),
                engine.clone(),
                Arc::new(reference),
                config.validation_tolerance,
            );
            let report = validator.validate_all(&roster).await?;
            report.write_csv_file(Path::new(&config.validation_report_path))?;
            tracing::info!(
                path = %config.validation_report_path,
                mismatches = report.mismatches(),
                "Validation report written"
            );
        }
    }

    server
        .await
        .context("server task failed")?
        .context("server error")?;
    Ok(())
}
