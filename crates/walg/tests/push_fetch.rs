//! End-to-end push-then-fetch coverage against the in-memory object
//! store and a fake `BackupProtocol`, exercising the scenarios SPEC_FULL
//! §8 lists as hermetic (no live database or bucket required).

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use walg::config::{Config, DeltaOrigin};
use walg::storage::memory::MemoryStore;
use walg::error::WalgError;
use walg_postgres::{BackupProtocol, BackupStart, BackupStop, PgError};

/// A `BackupProtocol` double handing out monotonically increasing LSNs.
/// `bump_on_stop` lets a test force a timeline change between
/// `start_backup` and `stop_backup`, simulating a promotion mid-backup.
struct FakeProtocol {
	lsn_counter: AtomicU32,
	timeline: AtomicU32,
	bump_on_stop: AtomicBool,
}

impl FakeProtocol {
	fn new() -> Self {
		Self {
			lsn_counter: AtomicU32::new(1),
			timeline: AtomicU32::new(1),
			bump_on_stop: AtomicBool::new(false),
		}
	}

	fn arm_timeline_bump_on_stop(&self) {
		self.bump_on_stop.store(true, Ordering::SeqCst);
	}
}

#[async_trait]
impl BackupProtocol for FakeProtocol {
	async fn start_backup(&self, _label: &str) -> Result<BackupStart, PgError> {
		let lsn = self.lsn_counter.fetch_add(1, Ordering::SeqCst);
		Ok(BackupStart {
			start_lsn: format!("0/{lsn}"),
			start_wal_segment: format!("{lsn:024X}"),
			pg_version: 150004,
			timeline: self.timeline.load(Ordering::SeqCst),
		})
	}

	async fn stop_backup(&self) -> Result<BackupStop, PgError> {
		if self.bump_on_stop.load(Ordering::SeqCst) {
			self.timeline.fetch_add(1, Ordering::SeqCst);
		}
		let lsn = self.lsn_counter.fetch_add(1, Ordering::SeqCst);
		Ok(BackupStop {
			finish_lsn: format!("0/{lsn}"),
			backup_label: b"START WAL LOCATION: 0/1\n".to_vec(),
			tablespace_map: Vec::new(),
		})
	}

	async fn check_timeline_changed(&self, since: u32) -> Result<bool, PgError> {
		Ok(self.timeline.load(Ordering::SeqCst) != since)
	}
}

fn test_config(prefix: &str) -> Config {
	Config {
		store_bucket: "test-bucket".into(),
		store_prefix: prefix.into(),
		pg_connection_url: "postgres://localhost/postgres".into(),
		delta_max_steps: 0,
		delta_origin: DeltaOrigin::LatestBackup,
		upload_concurrency: 4,
		download_concurrency: 4,
		min_tar_part_size: 1, // force every file into its own part for deterministic assertions
		wal_prefetch_depth: 2,
		wal_poll_interval: std::time::Duration::from_millis(1),
		encryption_recipient: None,
		encryption_identity: None,
	}
}

async fn write_data_dir(root: &camino::Utf8Path, files: &[(&str, &[u8])]) {
	for (name, body) in files {
		let path = root.join(name);
		if let Some(parent) = path.parent() {
			tokio::fs::create_dir_all(parent.as_std_path()).await.unwrap();
		}
		tokio::fs::write(path.as_std_path(), body).await.unwrap();
	}
}

#[tokio::test]
async fn full_backup_push_then_fetch_round_trips_file_contents() {
	let store = Arc::new(MemoryStore::new());
	let protocol = Arc::new(FakeProtocol::new());
	let config = test_config("server1");

	let source = camino_tempfile::tempdir().unwrap();
	write_data_dir(source.path(), &[("base/1", b"alpha"), ("base/2", b"bravo")]).await;

	let name = walg::push::push(store.clone(), protocol.clone(), &config, source.path(), "base")
		.await
		.unwrap();
	assert!(name.is_modern());

	let target = camino_tempfile::tempdir().unwrap();
	walg::fetch::fetch(store, &config.store_prefix, &name, target.path(), None)
		.await
		.unwrap();

	let restored = tokio::fs::read(target.path().join("base/1").as_std_path()).await.unwrap();
	assert_eq!(restored, b"alpha");
	let restored = tokio::fs::read(target.path().join("base/2").as_std_path()).await.unwrap();
	assert_eq!(restored, b"bravo");
}

#[tokio::test]
async fn delta_backup_chains_to_its_full_ancestor_and_fetch_replays_both() {
	let store = Arc::new(MemoryStore::new());
	let protocol = Arc::new(FakeProtocol::new());
	let config = test_config("server2");

	let source = camino_tempfile::tempdir().unwrap();
	write_data_dir(source.path(), &[("a", b"one")]).await;
	let full_name = walg::push::push(store.clone(), protocol.clone(), &config, source.path(), "base")
		.await
		.unwrap();

	write_data_dir(source.path(), &[("b", b"two")]).await;
	let delta_name = walg::push::push(store.clone(), protocol.clone(), &config, source.path(), "base")
		.await
		.unwrap();
	assert!(delta_name.as_str().contains("_D_"));

	let catalog = walg::catalog::Catalog::new(store.clone(), config.store_prefix.clone());
	let entry = catalog.get(&delta_name).await.unwrap();
	assert_eq!(entry.sentinel.increment_from.as_deref(), Some(full_name.as_str()));

	let target = camino_tempfile::tempdir().unwrap();
	walg::fetch::fetch(store, &config.store_prefix, &delta_name, target.path(), None)
		.await
		.unwrap();

	assert_eq!(tokio::fs::read(target.path().join("a").as_std_path()).await.unwrap(), b"one");
	assert_eq!(tokio::fs::read(target.path().join("b").as_std_path()).await.unwrap(), b"two");
}

#[tokio::test]
async fn timeline_change_during_backup_is_reported_as_abandoned() {
	let store = Arc::new(MemoryStore::new());
	let protocol = Arc::new(FakeProtocol::new());
	protocol.arm_timeline_bump_on_stop();
	let config = test_config("server3");

	let source = camino_tempfile::tempdir().unwrap();
	write_data_dir(source.path(), &[("a", b"one")]).await;

	let err = walg::push::push(store.clone(), protocol, &config, source.path(), "base")
		.await
		.unwrap_err();
	assert!(matches!(err, WalgError::TimelineChanged));

	// The sentinel must never have been written for an abandoned backup.
	let catalog = walg::catalog::Catalog::new(store, config.store_prefix.clone());
	assert!(catalog.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn retention_respects_retain_last_and_dry_run() {
	let store = Arc::new(MemoryStore::new());
	let protocol = Arc::new(FakeProtocol::new());
	let config = test_config("server4");

	let source = camino_tempfile::tempdir().unwrap();
	write_data_dir(source.path(), &[("a", b"one")]).await;

	for _ in 0..3 {
		walg::push::push(store.clone(), protocol.clone(), &config, source.path(), "base")
			.await
			.unwrap();
	}

	let catalog = walg::catalog::Catalog::new(store.clone(), config.store_prefix.clone());
	let entries = catalog.list().await.unwrap();
	assert_eq!(entries.len(), 3);

	// Only the middle (non-ancestor) backup is eligible: the oldest is the
	// full ancestor the surviving delta still chains through, so retention
	// must skip it even though it falls outside `retain_last`.
	let deleted = catalog.apply_retention(&entries, Some(1), None, true).await.unwrap();
	assert_eq!(deleted.len(), 1);
	assert_eq!(deleted[0], entries[1].name);

	// Dry run must not have actually deleted anything.
	let entries_after = catalog.list().await.unwrap();
	assert_eq!(entries_after.len(), 3);
}
