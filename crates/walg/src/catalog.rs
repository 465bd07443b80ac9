//! C6: the backup catalog. Lists sentinels in the store, resolves
//! `LATEST`, and applies retention (delete-before, retain-last-N) while
//! protecting any backup still referenced as a delta chain's full
//! ancestor. Grounded on the teacher's `purge_old_backups` in
//! `crates/bestool/src/actions/tamanu/backup.rs`, generalized from a
//! single flat backup directory to the delta-chain-aware case.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use crate::error::WalgError;
use crate::name::BackupName;
use crate::sentinel::Sentinel;
use crate::storage::ObjectStore;

#[derive(Debug, Clone)]
pub struct CatalogEntry {
	pub name: BackupName,
	pub sentinel: Sentinel,
}

pub struct Catalog {
	store: Arc<dyn ObjectStore>,
	prefix: String,
}

impl Catalog {
	pub fn new(store: Arc<dyn ObjectStore>, prefix: impl Into<String>) -> Self {
		Self {
			store,
			prefix: prefix.into(),
		}
	}

	/// List every backup with a sentinel in the store, sorted by start
	/// time ascending (oldest first).
	#[instrument(skip(self))]
	pub async fn list(&self) -> Result<Vec<CatalogEntry>, WalgError> {
		let sentinel_prefix = format!("{}/basebackups_005/", self.prefix);
		let objects = self.store.list(&sentinel_prefix).await?;

		let mut entries = Vec::new();
		for object in objects {
			if !object.key.ends_with("_backup_stop_sentinel.json") {
				continue;
			}
			let Some(name) = object
				.key
				.rsplit('/')
				.next()
				.and_then(|file| file.strip_suffix("_backup_stop_sentinel.json"))
			else {
				continue;
			};

			let body = self.store.get(&object.key).await?;
			let sentinel = Sentinel::from_json(&body)?;
			entries.push(CatalogEntry {
				name: BackupName::new(name),
				sentinel,
			});
		}

		entries.sort_by(|a, b| a.sentinel.start_local_time.cmp(&b.sentinel.start_local_time));
		Ok(entries)
	}

	/// Resolve `LATEST`: the most recently started backup, full or delta.
	#[instrument(skip(self))]
	pub async fn latest(&self) -> Result<Option<CatalogEntry>, WalgError> {
		Ok(self.list().await?.into_iter().last())
	}

	pub async fn get(&self, name: &BackupName) -> Result<CatalogEntry, WalgError> {
		let key = name.sentinel_key(&self.prefix);
		let body = self
			.store
			.get(&key)
			.await
			.map_err(|err| match err {
				WalgError::NotFound(_) => WalgError::NotFound(format!("backup {name} not found")),
				other => other,
			})?;
		Ok(CatalogEntry {
			name: name.clone(),
			sentinel: Sentinel::from_json(&body)?,
		})
	}

	/// Apply retention: delete every backup older than `before` or beyond
	/// the newest `retain_last`, whichever is more permissive, unless it
	/// is a full backup that a surviving delta still chains from. When
	/// `dry_run` is set, nothing is deleted; the list of names that
	/// *would* be deleted is still returned.
	#[instrument(skip(self, entries))]
	pub async fn apply_retention(
		&self,
		entries: &[CatalogEntry],
		retain_last: Option<usize>,
		before: Option<DateTime<Utc>>,
		dry_run: bool,
	) -> Result<Vec<BackupName>, WalgError> {
		let protected = protected_full_ancestors(entries, retain_last);

		let mut candidates: Vec<&CatalogEntry> = entries.iter().collect();
		if let Some(retain_last) = retain_last {
			let cutoff = candidates.len().saturating_sub(retain_last);
			candidates.truncate(cutoff);
		}

		let mut to_delete = Vec::new();
		for entry in candidates {
			if protected.contains(entry.name.as_str()) {
				continue;
			}
			if let Some(before) = before {
				let Ok(started) = DateTime::parse_from_rfc3339(&entry.sentinel.start_local_time) else {
					warn!("unparseable start time on {}, skipping retention for it", entry.name);
					continue;
				};
				if started.with_timezone(&Utc) >= before {
					continue;
				}
			}
			if entry.sentinel.is_permanent {
				continue;
			}
			to_delete.push(entry.name.clone());
		}

		if dry_run {
			info!(count = to_delete.len(), "retention dry run");
			return Ok(to_delete);
		}

		for name in &to_delete {
			self.delete_backup(name).await?;
		}
		info!(count = to_delete.len(), "retention deleted backups");
		Ok(to_delete)
	}

	async fn delete_backup(&self, name: &BackupName) -> Result<(), WalgError> {
		self.store.delete(&name.sentinel_key(&self.prefix)).await?;
		let parts = self.store.list(&name.tar_partitions_prefix(&self.prefix)).await?;
		for part in parts {
			self.store.delete(&part.key).await?;
		}
		Ok(())
	}
}

/// Every full backup still named as `IncrementFullName` by a backup that
/// survives retention must not be deleted out from under its chain
/// (§4.9 invariant I2).
fn protected_full_ancestors(entries: &[CatalogEntry], retain_last: Option<usize>) -> HashSet<String> {
	let surviving_start = match retain_last {
		Some(retain_last) => entries.len().saturating_sub(retain_last),
		None => entries.len(),
	};
	let by_name: HashMap<&str, &CatalogEntry> =
		entries.iter().map(|entry| (entry.name.as_str(), entry)).collect();

	let mut protected = HashSet::new();
	for entry in &entries[surviving_start.min(entries.len())..] {
		let mut cursor = Some(entry);
		while let Some(current) = cursor {
			if let Some(full_name) = current.sentinel.full_backup_name() {
				protected.insert(full_name.as_str().to_string());
				cursor = by_name.get(full_name.as_str()).copied();
			} else {
				break;
			}
		}
	}
	protected
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::storage::memory::MemoryStore;
	use std::collections::BTreeMap;

	fn sentinel(start: &str, increment_full_name: Option<&str>) -> Sentinel {
		Sentinel {
			start_local_time: start.into(),
			finish_local_time: start.into(),
			start_lsn: "0/1".into(),
			finish_lsn: "0/2".into(),
			uncompressed_size: 0,
			compressed_size: 0,
			hostname: "h".into(),
			data_dir: "/data".into(),
			pg_version: 150004,
			start_wal_segment: "000000010000000000000001".into(),
			is_permanent: false,
			increment_from: increment_full_name.map(String::from),
			increment_full_name: increment_full_name.map(String::from),
			increment_count: increment_full_name.map(|_| 1),
			files: BTreeMap::new(),
		}
	}

	#[tokio::test]
	async fn list_sorts_by_start_time() {
		let store = Arc::new(MemoryStore::new());
		for (name, time) in [("b_2_2", "2026-01-02T00:00:00Z"), ("a_1_1", "2026-01-01T00:00:00Z")] {
			let sentinel = sentinel(time, None);
			store.seed(
				format!("pfx/basebackups_005/{name}_backup_stop_sentinel.json"),
				sentinel.to_json().unwrap(),
			);
		}
		let catalog = Catalog::new(store, "pfx");
		let entries = catalog.list().await.unwrap();
		assert_eq!(entries[0].name.as_str(), "a_1_1");
		assert_eq!(entries[1].name.as_str(), "b_2_2");
	}

	#[tokio::test]
	async fn retention_protects_full_ancestor_of_surviving_delta() {
		let store = Arc::new(MemoryStore::new());
		let full = sentinel("2026-01-01T00:00:00Z", None);
		let delta = sentinel("2026-01-02T00:00:00Z", Some("full_1_1"));
		store.seed(
			"pfx/basebackups_005/full_1_1_backup_stop_sentinel.json",
			full.to_json().unwrap(),
		);
		store.seed(
			"pfx/basebackups_005/delta_2_2_backup_stop_sentinel.json",
			delta.to_json().unwrap(),
		);

		let catalog = Catalog::new(store, "pfx");
		let entries = catalog.list().await.unwrap();
		let deleted = catalog.apply_retention(&entries, Some(1), None, true).await.unwrap();
		assert!(!deleted.iter().any(|n| n.as_str() == "full_1_1"));
	}
}
