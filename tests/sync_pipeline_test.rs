//! Sync pipeline properties: idempotent incremental runs, duplicate
//! delivery, resume after interruption, cancellation.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_test::assert_ok;
use tokio_util::sync::CancellationToken;
use walletsync::checkpoint::{Checkpoint, CheckpointManager};
use walletsync::compile::MetricsCompiler;
use walletsync::db::init_db;
use walletsync::domain::{MarketMeta, RawEvent, SyncOutcome, SyncState};
use walletsync::orchestration::{SyncOrchestrator, SyncSettings, TargetSyncer};
use walletsync::{Address, EventAdapter, MarketId, MockEventSource, PnlEngine, Repository, TimeMs};

const W1: &str = "0x1111111111111111111111111111111111111111";
const W2: &str = "0x2222222222222222222222222222222222222222";
const W3: &str = "0x3333333333333333333333333333333333333333";
const MARKET: &str = "0xcond";

struct TestEnv {
    repo: Arc<Repository>,
    checkpoint_path: PathBuf,
    _temp: TempDir,
}

async fn setup() -> TestEnv {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir
        .path()
        .join("test.db")
        .to_string_lossy()
        .to_string();
    let pool = init_db(&db_path).await.expect("init_db failed");
    TestEnv {
        repo: Arc::new(Repository::new(pool)),
        checkpoint_path: temp_dir.path().join("checkpoint.json"),
        _temp: temp_dir,
    }
}

fn settings() -> SyncSettings {
    SyncSettings {
        concurrency: 2,
        retry_ceiling: 3,
        batch_size: 1,
        page_size: 2,
        fetch_timeout: Duration::from_secs(5),
        retry_base_delay: Duration::from_millis(1),
        dry_run: false,
    }
}

fn orchestrator(env: &TestEnv, source: MockEventSource, settings: SyncSettings) -> SyncOrchestrator {
    let syncer = TargetSyncer::new(
        Arc::new(source),
        env.repo.clone(),
        Arc::new(EventAdapter::default()),
        settings.page_size,
        settings.fetch_timeout,
        settings.dry_run,
    );
    SyncOrchestrator::new(syncer, CheckpointManager::new(&env.checkpoint_path), settings)
}

fn trade(id: &str, side: &str, price: &str, size: &str, ts: i64) -> RawEvent {
    RawEvent {
        id: Some(id.to_string()),
        kind: Some("trade".to_string()),
        condition_id: Some(MARKET.to_string()),
        outcome_index: Some(0),
        side: Some(side.to_string()),
        price: Some(price.to_string()),
        size: Some(size.to_string()),
        exchange: Some("ctf".to_string()),
        timestamp: Some(ts),
        ..Default::default()
    }
}

/// Three trades whose ids carry a prefix of `wallet`, so no two wallets share one.
fn history(wallet: &str) -> Vec<RawEvent> {
    let tag = &wallet[..6];
    vec![
        trade(&format!("{}-1", tag), "buy", "0.40", "10", 1_000),
        trade(&format!("{}-2", tag), "buy", "0.60", "5", 2_000),
        trade(&format!("{}-3", tag), "sell", "0.70", "3", 3_000),
    ]
}

fn source_for(wallets: &[&str]) -> MockEventSource {
    wallets.iter().fold(MockEventSource::new(), |source, w| {
        source.with_events(&Address::new(*w), history(w))
    })
}

async fn compiled_positions(env: &TestEnv, wallet: &Address) -> Vec<walletsync::engine::Position> {
    let compiler = MetricsCompiler::new(env.repo.clone(), PnlEngine::default());
    compiler
        .compile_all(&[wallet.clone()], 1, true)
        .await
        .unwrap();
    env.repo.query_wallet_positions(wallet).await.unwrap()
}

#[tokio::test]
async fn test_incremental_sync_is_idempotent() {
    let env = setup().await;
    let wallet = Address::new(W1);
    env.repo
        .upsert_market_meta(&MarketMeta {
            market_id: MarketId::new(MARKET),
            category: Some("politics".to_string()),
            payout_numerators: Some(vec![1, 0]),
            resolved_at: Some(TimeMs::from_secs(10_000)),
        })
        .await
        .unwrap();

    let orch = orchestrator(&env, source_for(&[W1]), settings());
    let mut checkpoint = orch.load_checkpoint([wallet.clone()]).await.unwrap();
    let cancel = CancellationToken::new();

    let first = orch
        .run_incremental(&mut checkpoint, &HashMap::new(), &cancel)
        .await
        .unwrap();
    assert_eq!(first.inserted, 3);
    let fills_after_first = env.repo.query_wallet_fills(&wallet, None, None).await.unwrap();
    let positions_after_first = compiled_positions(&env, &wallet).await;
    let scores_after_first = env.repo.query_category_scores(&wallet).await.unwrap();

    let second = orch
        .run_incremental(&mut checkpoint, &HashMap::new(), &cancel)
        .await
        .unwrap();
    assert_eq!(second.completed, 1);
    assert_eq!(second.inserted, 0);
    // The watermark is inclusive: the newest event is re-fetched and absorbed.
    assert_eq!(second.duplicates, 1);

    let fills_after_second = env.repo.query_wallet_fills(&wallet, None, None).await.unwrap();
    assert_eq!(fills_after_first, fills_after_second);
    assert_eq!(positions_after_first, compiled_positions(&env, &wallet).await);
    assert_eq!(
        scores_after_first,
        env.repo.query_category_scores(&wallet).await.unwrap()
    );
    assert_eq!(
        checkpoint.target(&wallet).unwrap().watermark,
        Some(TimeMs::from_secs(3_000))
    );
}

#[tokio::test]
async fn test_incremental_since_override_refetches_history() {
    let env = setup().await;
    let wallet = Address::new(W1);
    let orch = orchestrator(&env, source_for(&[W1]), settings());
    let mut checkpoint = orch.load_checkpoint([wallet.clone()]).await.unwrap();
    let cancel = CancellationToken::new();

    orch.run_incremental(&mut checkpoint, &HashMap::new(), &cancel)
        .await
        .unwrap();

    let overrides = HashMap::from([(wallet.clone(), TimeMs::new(0))]);
    let replay = orch
        .run_incremental(&mut checkpoint, &overrides, &cancel)
        .await
        .unwrap();
    assert_eq!(replay.inserted, 0);
    assert_eq!(replay.duplicates, 3);
    assert_eq!(env.repo.count_wallet_fills(&wallet).await.unwrap(), 3);
}

#[tokio::test]
async fn test_duplicate_delivery_does_not_change_positions() {
    let clean = setup().await;
    let noisy = setup().await;
    let wallet = Address::new(W1);

    let orch_clean = orchestrator(&clean, source_for(&[W1]), settings());
    let mut cp_clean = orch_clean.load_checkpoint([wallet.clone()]).await.unwrap();
    orch_clean
        .run_bulk(&mut cp_clean, &CancellationToken::new())
        .await
        .unwrap();

    let orch_noisy = orchestrator(&noisy, source_for(&[W1]).with_duplicate_delivery(), settings());
    let mut cp_noisy = orch_noisy.load_checkpoint([wallet.clone()]).await.unwrap();
    let summary = orch_noisy
        .run_bulk(&mut cp_noisy, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(summary.inserted, 3);
    assert_eq!(summary.duplicates, 3);

    let clean_positions = compiled_positions(&clean, &wallet).await;
    let noisy_positions = compiled_positions(&noisy, &wallet).await;
    assert_eq!(clean_positions.len(), 1);
    assert_eq!(clean_positions[0].net_shares, noisy_positions[0].net_shares);
    assert_eq!(clean_positions[0].net_cash_flow, noisy_positions[0].net_cash_flow);
}

#[tokio::test]
async fn test_resume_after_interruption_matches_uninterrupted_run() {
    let interrupted = setup().await;
    let reference = setup().await;
    let wallets: Vec<Address> = [W1, W2, W3].iter().map(|w| Address::new(*w)).collect();

    // Uninterrupted run.
    let orch = orchestrator(&reference, source_for(&[W1, W2, W3]), settings());
    let mut cp = orch.load_checkpoint(wallets.clone()).await.unwrap();
    orch.run_bulk(&mut cp, &CancellationToken::new())
        .await
        .unwrap();

    // A crash after W1 completed, with W2 in flight and W3 untouched: W1's
    // fills are in the store and the last save shows W2 as syncing.
    let orch = orchestrator(&interrupted, source_for(&[W1]), settings());
    let mut partial = orch.load_checkpoint([wallets[0].clone()]).await.unwrap();
    orch.run_bulk(&mut partial, &CancellationToken::new())
        .await
        .unwrap();
    let mut crashed = Checkpoint::from_roster(wallets.clone());
    crashed.begin(&wallets[0]);
    crashed.advance(
        &wallets[0],
        partial.target(&wallets[0]).unwrap().watermark,
        SyncOutcome::Completed { inserted: 3 },
    );
    crashed.begin(&wallets[1]);
    assert_ok!(CheckpointManager::new(&interrupted.checkpoint_path).save(&mut crashed));

    // Restart.
    let orch = orchestrator(&interrupted, source_for(&[W1, W2, W3]), settings());
    let mut resumed = orch.load_checkpoint(wallets.clone()).await.unwrap();
    assert_eq!(resumed.target(&wallets[1]).unwrap().state, SyncState::Pending);
    let summary = orch
        .run_bulk(&mut resumed, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.queued, 2);
    assert_eq!(summary.skipped_targets, 1);
    assert_eq!(summary.inserted, 6);
    assert_eq!(summary.duplicates, 0);
    assert_eq!(resumed.state_counts(), cp.state_counts());
    for wallet in &wallets {
        assert_eq!(interrupted.repo.count_wallet_fills(wallet).await.unwrap(), 3);
        assert_eq!(reference.repo.count_wallet_fills(wallet).await.unwrap(), 3);
        assert_eq!(
            interrupted.repo.query_wallet_fills(wallet, None, None).await.unwrap(),
            reference.repo.query_wallet_fills(wallet, None, None).await.unwrap()
        );
        assert_eq!(
            resumed.target(wallet).unwrap().watermark,
            cp.target(wallet).unwrap().watermark
        );
    }
}

#[tokio::test]
async fn test_transfer_between_tracked_wallets_lands_on_both() {
    let env = setup().await;
    let sender = Address::new(W1);
    let receiver = Address::new(W2);
    let transfer = RawEvent {
        id: Some("0xtx-7".to_string()),
        kind: Some("transfer".to_string()),
        condition_id: Some(MARKET.to_string()),
        outcome_index: Some(0),
        size: Some("4".to_string()),
        from: Some(W1.to_string()),
        to: Some(W2.to_string()),
        timestamp: Some(1_500),
        ..Default::default()
    };
    let source = MockEventSource::new()
        .with_event(&sender, transfer.clone())
        .with_event(&receiver, transfer);

    let orch = orchestrator(&env, source, settings());
    let mut checkpoint = orch
        .load_checkpoint([sender.clone(), receiver.clone()])
        .await
        .unwrap();
    let summary = orch
        .run_bulk(&mut checkpoint, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.inserted, 2);
    assert_eq!(summary.duplicates, 0);
    let sent = env.repo.query_wallet_fills(&sender, None, None).await.unwrap();
    let received = env.repo.query_wallet_fills(&receiver, None, None).await.unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(received.len(), 1);
    assert_eq!(sent[0].natural_key, received[0].natural_key);
    assert_eq!(sent[0].signed_shares(), -received[0].signed_shares());
}

#[tokio::test]
async fn test_cancellation_drains_in_flight_and_leaves_rest_pending() {
    let env = setup().await;
    let wallets: Vec<Address> = [W1, W2, W3].iter().map(|w| Address::new(*w)).collect();
    let source = source_for(&[W1, W2, W3]).with_delay(Duration::from_millis(200));
    let orch = orchestrator(
        &env,
        source,
        SyncSettings {
            concurrency: 1,
            page_size: 10,
            ..settings()
        },
    );

    let mut checkpoint = orch.load_checkpoint(wallets.clone()).await.unwrap();
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });
    }

    let summary = orch.run_bulk(&mut checkpoint, &cancel).await.unwrap();
    assert!(summary.cancelled);
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.pending, 2);

    let saved = CheckpointManager::new(&env.checkpoint_path)
        .load()
        .unwrap()
        .unwrap();
    assert_eq!(saved.state_counts().completed, 1);
    assert_eq!(saved.state_counts().pending, 2);
}

#[tokio::test]
async fn test_corrupt_checkpoint_is_fatal() {
    let env = setup().await;
    std::fs::write(&env.checkpoint_path, b"not a checkpoint").unwrap();
    let orch = orchestrator(&env, MockEventSource::new(), settings());
    assert!(orch.load_checkpoint([Address::new(W1)]).await.is_err());
}
