// SPDX-License-Identifier: GPL-3.0

use serde_json::{Value, json};
use starklytics_sync::{
	Backend, BackendError, Filter, RetryPolicy, SessionError, SessionSnapshot, SessionState,
	SetupStep, SyncContext, SyncOptions, SyncSession, backend::memory::MemoryBackend, models::Block,
	presets,
};
use std::{
	sync::{Arc, Mutex},
	time::Duration,
};
use tokio::{sync::watch, time::timeout};

const BLOCKS: &str = "starknet_blocks";
const TRANSACTIONS: &str = "starknet_transactions";
const CONTRACTS: &str = "starknet_contracts";
const TOKENS: &str = "starknet_tokens";
const TABLES: [&str; 4] = [BLOCKS, TRANSACTIONS, CONTRACTS, TOKENS];
const CREATE_TABLES: &str = "create_starknet_tables";

fn init() {
	let _ = env_logger::builder().is_test(true).try_init();
}

fn options() -> SyncOptions {
	SyncOptions::default().with_retry(RetryPolicy::none())
}

/// A backend with helper procedures and every table provisioned.
async fn ready_backend() -> Arc<MemoryBackend> {
	let backend = Arc::new(MemoryBackend::starknet());
	backend.rpc(CREATE_TABLES, json!({})).await.unwrap();
	backend
		.insert(BLOCKS, json!({ "id": 2, "block_number": 2, "block_hash": "0x02", "timestamp": "2024-01-01T00:00:12Z", "transaction_count": 4 }))
		.await
		.unwrap();
	backend
}

fn starknet_session(backend: &Arc<MemoryBackend>, options: SyncOptions) -> SyncSession {
	let context = SyncContext::new(backend.clone(), options);
	SyncSession::new(context, presets::starknet_resources(presets::DEFAULT_STARKNET_LIMIT))
}

fn ids(snapshot: &SessionSnapshot, resource: &str) -> Vec<Value> {
	snapshot.rows(resource).iter().map(|row| row["id"].clone()).collect()
}

async fn wait_for(
	snapshots: &mut watch::Receiver<SessionSnapshot>,
	condition: impl Fn(&SessionSnapshot) -> bool,
) -> SessionSnapshot {
	timeout(Duration::from_secs(5), async {
		loop {
			{
				let snapshot = snapshots.borrow_and_update();
				if condition(&snapshot) {
					return snapshot.clone();
				}
			}
			snapshots.changed().await.expect("session dropped");
		}
	})
	.await
	.expect("condition not reached in time")
}

#[tokio::test]
async fn ready_backend_loads_subscribes_and_schedules() {
	init();
	let backend = ready_backend().await;
	let session = starknet_session(&backend, options());

	assert_eq!(session.mount().await.unwrap(), SessionState::Ready);

	let snapshot = session.snapshot();
	assert!(!snapshot.loading);
	assert_eq!(snapshot.error, None);
	assert_eq!(snapshot.status.setup_step, SetupStep::Complete);
	assert!(snapshot.last_updated.is_some());
	// Newest block first.
	assert_eq!(ids(&snapshot, "blocks"), vec![json!(2), json!(1)]);
	let blocks: Vec<Block> = snapshot.collection("blocks").unwrap().decode().unwrap();
	assert_eq!(blocks[0].transaction_count, 4);
	assert_eq!(session.active_subscriptions().await, ["blocks", "contracts", "tokens", "transactions"]);
	assert_eq!(backend.active_channels().len(), 4);
	assert!(session.is_refreshing());
}

#[tokio::test]
async fn missing_tables_read_as_empty_collections() {
	init();
	let backend = Arc::new(MemoryBackend::starknet());
	let session = starknet_session(&backend, options());

	assert_eq!(session.mount().await.unwrap(), SessionState::SchemaMissing);

	let snapshot = session.snapshot();
	assert_eq!(snapshot.error, None);
	assert!(snapshot.status.connected && snapshot.status.functions_ready);
	assert!(!snapshot.status.schema_ready);
	for resource in ["blocks", "transactions", "contracts", "tokens"] {
		assert!(snapshot.collection(resource).unwrap().is_empty());
	}
	// Nothing is provisioned implicitly.
	assert_eq!(backend.rpc_calls(CREATE_TABLES), 0);
	assert!(backend.active_channels().is_empty());
	assert!(!session.is_refreshing());
}

#[tokio::test]
async fn missing_functions_neither_bootstrap_nor_error() {
	init();
	let backend = Arc::new(MemoryBackend::new());
	let session = starknet_session(&backend, options());

	assert_eq!(session.mount().await.unwrap(), SessionState::FunctionsMissing);
	let snapshot = session.snapshot();
	assert_eq!(snapshot.error, None);
	assert_eq!(snapshot.status.setup_step, SetupStep::Functions);
	assert!(snapshot.collections.values().all(|c| c.is_empty()));

	session.refresh().await.unwrap();
	assert_eq!(session.state(), SessionState::FunctionsMissing);
	assert_eq!(session.snapshot().error, None);
	assert_eq!(backend.rpc_calls(CREATE_TABLES), 0);

	// Bootstrapping needs the helper functions.
	let outcome = session.bootstrap(()).await.unwrap();
	assert!(!outcome.success);
	assert_eq!(backend.rpc_calls(CREATE_TABLES), 0);
	assert_eq!(session.state(), SessionState::FunctionsMissing);
	assert!(session.snapshot().error.unwrap().contains("Helper functions are missing"));
}

#[tokio::test]
async fn bootstrap_completes_the_schema_and_starts_syncing() {
	init();
	let backend = Arc::new(MemoryBackend::starknet());
	let session = starknet_session(&backend, options());
	session.mount().await.unwrap();

	let updates = Arc::new(Mutex::new(Vec::new()));
	let observer = {
		let updates = updates.clone();
		move |update: &str| updates.lock().unwrap().push(update.to_string())
	};
	let outcome = session.bootstrap(observer).await.unwrap();

	assert!(outcome.success, "{}", outcome.detail);
	assert!(outcome.status.schema_ready);
	assert_eq!(outcome.status.setup_step, SetupStep::Complete);
	assert_eq!(session.state(), SessionState::Ready);
	assert_eq!(ids(&session.snapshot(), "tokens"), vec![json!(1)]);
	assert_eq!(backend.active_channels().len(), 4);
	assert_eq!(
		*updates.lock().unwrap(),
		["Checking helper functions...", "Creating tables...", "Verifying tables...", "Created 4 tables"]
	);

	// Ready sessions have nothing to bootstrap.
	assert!(matches!(
		session.bootstrap(()).await,
		Err(SessionError::InvalidTransition { action: "bootstrap", state: SessionState::Ready })
	));
}

#[tokio::test]
async fn concurrent_bootstraps_share_one_attempt() {
	init();
	let backend = Arc::new(MemoryBackend::starknet().with_latency(Duration::from_millis(20)));
	let context = SyncContext::new(backend.clone(), options());
	let first = SyncSession::new(context.clone(), presets::starknet_resources(5));
	let second = SyncSession::new(context, presets::starknet_resources(5));
	first.mount().await.unwrap();
	second.mount().await.unwrap();

	let (a, b) = tokio::join!(first.bootstrap(()), second.bootstrap(()));

	assert!(a.unwrap().success);
	assert!(b.unwrap().success);
	assert_eq!(backend.rpc_calls(CREATE_TABLES), 1);
	assert_eq!((first.state(), second.state()), (SessionState::Ready, SessionState::Ready));
}

#[tokio::test]
async fn unreachable_backend_errors_until_retried() {
	init();
	let backend = ready_backend().await;
	backend.set_reachable(false);
	let session = starknet_session(&backend, options());

	assert_eq!(session.mount().await.unwrap(), SessionState::Error);
	let snapshot = session.snapshot();
	assert!(!snapshot.status.connected);
	assert!(snapshot.error.unwrap().contains("connection refused"));
	assert!(!session.is_refreshing());

	backend.set_reachable(true);
	assert_eq!(session.retry().await.unwrap(), SessionState::Ready);
	assert_eq!(session.snapshot().error, None);
	assert_eq!(ids(&session.snapshot(), "blocks").len(), 2);
}

#[tokio::test]
async fn partial_failures_keep_data_and_only_total_failure_sets_an_error() {
	init();
	let backend = ready_backend().await;
	let session = starknet_session(&backend, options());
	session.mount().await.unwrap();

	backend.fail_table(TRANSACTIONS, None);
	session.refresh().await.unwrap();
	let snapshot = session.snapshot();
	assert_eq!(snapshot.error, None);
	assert_eq!(ids(&snapshot, "transactions"), vec![json!(1)]);
	assert_eq!(session.retry_state().attempt_count(), 0);

	for table in TABLES {
		backend.fail_table(table, None);
	}
	session.refresh().await.unwrap();
	let snapshot = session.snapshot();
	assert!(snapshot.error.as_deref().is_some_and(|e| e.starts_with("All 4 resource fetches failed")));
	assert_eq!(snapshot.state, SessionState::Ready);
	assert!(!snapshot.loading);
	assert_eq!(ids(&snapshot, "blocks"), vec![json!(2), json!(1)]);
	assert_eq!(session.retry_state().attempt_count(), 1);

	for table in TABLES {
		backend.heal_table(table);
	}
	session.refresh().await.unwrap();
	assert_eq!(session.snapshot().error, None);
	assert_eq!(session.retry_state().attempt_count(), 0);
}

#[tokio::test]
async fn partial_failures_keep_pushed_changes() -> Result<(), BackendError> {
	init();
	let backend = ready_backend().await;
	let session = starknet_session(&backend, options());
	session.mount().await.unwrap();
	let mut snapshots = session.watch();

	backend.fail_table(BLOCKS, None);
	backend.update(BLOCKS, &[Filter::eq("id", 1)], json!({ "transaction_count": 9 })).await?;
	wait_for(&mut snapshots, |s| s.rows("blocks").last().is_some_and(|b| b["transaction_count"] == 9)).await;

	session.refresh().await.unwrap();
	let snapshot = session.snapshot();
	assert_eq!(snapshot.error, None);
	assert_eq!(ids(&snapshot, "blocks"), vec![json!(2), json!(1)]);
	assert_eq!(snapshot.rows("blocks")[1]["transaction_count"], json!(9));
	Ok(())
}

#[tokio::test]
async fn pushed_changes_update_collections_in_place() -> Result<(), BackendError> {
	init();
	let backend = ready_backend().await;
	let session = starknet_session(&backend, options());
	session.mount().await.unwrap();
	let mut snapshots = session.watch();

	backend.update(BLOCKS, &[Filter::eq("id", 1)], json!({ "transaction_count": 9 })).await?;
	let snapshot = wait_for(&mut snapshots, |s| s.rows("blocks").last().is_some_and(|b| b["transaction_count"] == 9)).await;
	assert_eq!(ids(&snapshot, "blocks"), vec![json!(2), json!(1)]);

	backend
		.insert(BLOCKS, json!({ "id": 3, "block_number": 3, "block_hash": "0x03", "timestamp": "2024-01-01T00:00:24Z" }))
		.await?;
	let snapshot = wait_for(&mut snapshots, |s| s.rows("blocks").len() == 3).await;
	assert_eq!(ids(&snapshot, "blocks"), vec![json!(3), json!(2), json!(1)]);

	backend.delete(BLOCKS, &[Filter::eq("id", 2)]);
	let snapshot = wait_for(&mut snapshots, |s| s.rows("blocks").len() == 2).await;
	assert_eq!(ids(&snapshot, "blocks"), vec![json!(3), json!(1)]);
	Ok(())
}

#[tokio::test]
async fn notifications_only_receive_their_users_rows() -> Result<(), BackendError> {
	init();
	// Only the notifications table exists: no helper procedures, no analytics tables.
	let backend = Arc::new(MemoryBackend::new().with_table("notifications", vec![]));
	let context =
		SyncContext::new(backend.clone(), options().with_schema(presets::notification_schema()));
	let session = SyncSession::new(
		context,
		presets::notification_resources("abc", presets::DEFAULT_NOTIFICATION_LIMIT),
	);
	assert_eq!(session.mount().await.unwrap(), SessionState::Ready);
	assert_eq!(session.snapshot().status.setup_step, SetupStep::Complete);
	assert_eq!(backend.active_channels(), vec!["notifications-changes-1".to_string()]);
	assert!(session.is_refreshing());
	let mut snapshots = session.watch();

	let row = |id: &str, user: &str, created_at: &str| {
		json!({ "id": id, "user_id": user, "title": "Hi", "created_at": created_at })
	};
	backend.insert("notifications", row("n1", "other", "2024-01-01T00:00:01Z")).await?;
	backend.insert("notifications", row("n2", "abc", "2024-01-01T00:00:02Z")).await?;
	backend.insert("notifications", row("n3", "abc", "2024-01-01T00:00:03Z")).await?;

	let snapshot = wait_for(&mut snapshots, |s| s.rows("notifications").len() == 2).await;
	assert_eq!(ids(&snapshot, "notifications"), vec![json!("n3"), json!("n2")]);
	Ok(())
}

#[tokio::test]
async fn resubscribing_leaves_exactly_one_channel_per_resource() {
	init();
	let backend = ready_backend().await;
	let session = starknet_session(&backend, options());
	session.mount().await.unwrap();
	let before = backend.active_channels();

	assert_eq!(session.resubscribe().await.unwrap(), 4);
	assert_eq!(session.resubscribe().await.unwrap(), 4);

	let after = backend.active_channels();
	assert_eq!(after.len(), 4);
	assert!(after.iter().all(|channel| !before.contains(channel)));
	assert!(after.contains(&"blocks-changes-9".to_string()));
	assert_eq!(session.active_subscriptions().await.len(), 4);
}

#[tokio::test]
async fn disposed_sessions_commit_nothing() -> Result<(), BackendError> {
	init();
	let backend = ready_backend().await;
	let session = starknet_session(&backend, options());
	session.mount().await.unwrap();
	let mut snapshots = session.watch();

	assert!(session.dispose().await);
	assert!(!session.dispose().await);
	let last = snapshots.borrow_and_update().clone();
	assert_eq!(last.state, SessionState::Disposed);
	assert!(backend.active_channels().is_empty());
	assert!(!session.is_refreshing());

	backend.insert(BLOCKS, json!({ "id": 5, "block_number": 5 })).await?;
	tokio::time::sleep(Duration::from_millis(50)).await;
	assert!(!snapshots.has_changed().unwrap());
	assert_eq!(session.snapshot(), last);
	assert!(matches!(session.refresh().await, Err(SessionError::Disposed)));
	Ok(())
}

#[tokio::test]
async fn disposal_discards_in_flight_results() {
	init();
	let backend = Arc::new(MemoryBackend::starknet().with_latency(Duration::from_millis(50)));
	backend.rpc(CREATE_TABLES, json!({})).await.unwrap();
	let session = Arc::new(starknet_session(&backend, options()));

	let mounting = tokio::spawn({
		let session = session.clone();
		async move { session.mount().await }
	});
	tokio::time::sleep(Duration::from_millis(10)).await;
	session.dispose().await;

	assert!(matches!(mounting.await.unwrap(), Err(SessionError::Disposed)));
	// Let the abandoned requests finish.
	tokio::time::sleep(Duration::from_millis(300)).await;
	let snapshot = session.snapshot();
	assert_eq!(snapshot.state, SessionState::Disposed);
	assert!(snapshot.collections.values().all(|c| c.is_empty()));
	assert!(backend.active_channels().is_empty());
}

#[tokio::test(start_paused = true)]
async fn silent_refresh_backs_off_while_failing() {
	init();
	let backend = ready_backend().await;
	let options = options().with_refresh(Duration::from_secs(30), Duration::from_secs(300));
	let session = starknet_session(&backend, options);
	session.mount().await.unwrap();
	let reads = backend.select_calls(TOKENS);

	for table in TABLES {
		backend.fail_table(table, None);
	}
	// Ticks at 30s (fails), then 30s + 60s.
	tokio::time::sleep(Duration::from_secs(31)).await;
	assert_eq!(backend.select_calls(TOKENS), reads + 1);
	assert_eq!(session.retry_state().attempt_count(), 1);
	// A silent refresh never shows the loading indicator.
	assert!(!session.snapshot().loading);

	tokio::time::sleep(Duration::from_secs(58)).await;
	assert_eq!(backend.select_calls(TOKENS), reads + 1);
	tokio::time::sleep(Duration::from_secs(2)).await;
	assert_eq!(backend.select_calls(TOKENS), reads + 2);
	assert_eq!(session.retry_state().attempt_count(), 2);

	// Recovery resets the cadence.
	for table in TABLES {
		backend.heal_table(table);
	}
	tokio::time::sleep(Duration::from_secs(120)).await;
	assert_eq!(backend.select_calls(TOKENS), reads + 3);
	assert_eq!(session.retry_state().attempt_count(), 0);
	tokio::time::sleep(Duration::from_secs(30)).await;
	assert_eq!(backend.select_calls(TOKENS), reads + 4);
	session.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn channels_closed_by_the_backend_reopen_on_the_next_refresh() {
	init();
	let backend = ready_backend().await;
	let session = starknet_session(&backend, options());
	session.mount().await.unwrap();
	assert_eq!(session.active_subscriptions().await.len(), 4);

	backend.close_channels();
	tokio::time::sleep(Duration::from_secs(1)).await;
	assert!(session.active_subscriptions().await.is_empty());
	assert!(backend.active_channels().is_empty());

	// The silent refresh at 30s reopens them under fresh names.
	tokio::time::sleep(Duration::from_secs(30)).await;
	assert_eq!(session.active_subscriptions().await.len(), 4);
	let channels = backend.active_channels();
	assert_eq!(channels.len(), 4);
	assert!(channels.contains(&"blocks-changes-5".to_string()));
	session.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn refresh_interval_can_be_changed() {
	init();
	let backend = ready_backend().await;
	let session = starknet_session(&backend, options());
	session.mount().await.unwrap();
	let reads = backend.select_calls(TOKENS);

	session.set_refresh_interval(Duration::from_secs(5));
	tokio::time::sleep(Duration::from_secs(11)).await;
	assert_eq!(backend.select_calls(TOKENS), reads + 2);
	session.dispose().await;
}
