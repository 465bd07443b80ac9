//! C8: the fetch controller. Walks a backup's delta chain back to its
//! full ancestor, replays each generation's tar parts into the target
//! directory oldest-first, and extracts `pg_control` last so a reader
//! never observes a partially-restored cluster as started (§4.8 step 6).
//! Sequenced the way `process_backup`'s restore counterpart would be in
//! the teacher's backup/restore pairing, generalized to chain replay.

use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use tokio::io::AsyncReadExt;
use tracing::{info, instrument};

use crate::catalog::{Catalog, CatalogEntry};
use crate::codec::decoding_reader;
use crate::error::WalgError;
use crate::name::BackupName;
use crate::storage::ObjectStore;

/// A backup's delta chain, oldest (full) first.
pub async fn resolve_chain(catalog: &Catalog, name: &BackupName) -> Result<Vec<CatalogEntry>, WalgError> {
	let mut chain = Vec::new();
	let mut current = catalog.get(name).await?;

	loop {
		let parent_name = current.sentinel.increment_from.clone();
		chain.push(current.clone());
		match parent_name {
			None => break,
			Some(parent_name) => {
				current = catalog.get(&BackupName::new(parent_name)).await.map_err(|err| match err {
					WalgError::NotFound(_) => {
						WalgError::ChainIntegrity(format!("missing ancestor of {}", chain.last().unwrap().name))
					}
					other => other,
				})?;

				if chain.iter().any(|entry| entry.name == current.name) {
					return Err(WalgError::ChainIntegrity(format!(
						"cycle detected in delta chain at {}",
						current.name
					)));
				}
			}
		}
	}

	chain.reverse();
	Ok(chain)
}

/// Restore `name` into `target_dir` by replaying its chain oldest-first,
/// extracting every tar part except the `pg_control` pseudo-part, then
/// extracting `pg_control` from the newest generation last.
#[instrument(skip(store), fields(backup = %name))]
pub async fn fetch(
	store: Arc<dyn ObjectStore>,
	prefix: &str,
	name: &BackupName,
	target_dir: &camino::Utf8Path,
	decryption_identity: Option<&str>,
) -> Result<(), WalgError> {
	let catalog = Catalog::new(store.clone(), prefix.to_string());
	let chain = resolve_chain(&catalog, name).await?;

	tokio::fs::create_dir_all(target_dir.as_std_path()).await?;

	let mut pg_control_key = None;
	for entry in &chain {
		let parts_prefix = entry.name.tar_partitions_prefix(prefix);
		let mut parts = store.list(&parts_prefix).await?;
		parts.sort_by(|a, b| a.key.cmp(&b.key));

		for part in parts {
			if part.key.ends_with(&format!("pg_control.tar{}", crate::codec::LZ4_SUFFIX)) {
				pg_control_key = Some(part.key);
				continue;
			}
			extract_part(store.clone(), &part.key, target_dir, decryption_identity).await?;
		}
	}

	if let Some(key) = pg_control_key {
		extract_part(store.clone(), &key, target_dir, decryption_identity).await?;
	}

	info!("restored {name} ({} generations)", chain.len());
	Ok(())
}

async fn extract_part(
	store: Arc<dyn ObjectStore>,
	key: &str,
	target_dir: &camino::Utf8Path,
	decryption_identity: Option<&str>,
) -> Result<(), WalgError> {
	let mut stream = store.get_stream(key).await?;
	let (mut tx, rx) = tokio::io::duplex(64 * 1024);

	let feed = tokio::spawn(async move {
		while let Some(chunk) = stream.next().await {
			let chunk: Bytes = chunk?;
			if tokio::io::AsyncWriteExt::write_all(&mut tx, &chunk).await.is_err() {
				break;
			}
		}
		Ok::<(), WalgError>(())
	});

	let reader = decoding_reader(rx, decryption_identity).await?;
	let mut archive = tokio_tar::Archive::new(reader);
	let mut entries = archive
		.entries()
		.map_err(|err| WalgError::Corrupt(format!("tar read failed for {key}: {err}")))?;

	while let Some(entry) = entries.next().await {
		let mut entry = entry.map_err(|err| WalgError::Corrupt(format!("tar entry read failed: {err}")))?;
		let path = entry
			.path()
			.map_err(|err| WalgError::Corrupt(format!("tar entry path invalid: {err}")))?
			.into_owned();
		let dest = target_dir.as_std_path().join(&path);
		if let Some(parent) = dest.parent() {
			tokio::fs::create_dir_all(parent).await?;
		}
		entry
			.unpack(&dest)
			.await
			.map_err(|err| WalgError::Corrupt(format!("tar unpack failed for {}: {err}", path.display())))?;
	}

	feed.await.map_err(|err| WalgError::StoreIo(format!("fetch task panicked: {err}")))??;
	Ok(())
}

#[allow(dead_code)]
async fn drain_to_string(mut reader: impl tokio::io::AsyncRead + Unpin) -> std::io::Result<String> {
	let mut out = String::new();
	reader.read_to_string(&mut out).await?;
	Ok(out)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::sentinel::Sentinel;
	use crate::storage::memory::MemoryStore;
	use std::collections::BTreeMap;

	fn sentinel(increment_from: Option<&str>) -> Sentinel {
		Sentinel {
			start_local_time: "2026-01-01T00:00:00Z".into(),
			finish_local_time: "2026-01-01T00:00:00Z".into(),
			start_lsn: "0/1".into(),
			finish_lsn: "0/2".into(),
			uncompressed_size: 0,
			compressed_size: 0,
			hostname: "h".into(),
			data_dir: "/data".into(),
			pg_version: 150004,
			start_wal_segment: "000000010000000000000001".into(),
			is_permanent: false,
			increment_from: increment_from.map(String::from),
			increment_full_name: increment_from.map(|_| "full_1_1".to_string()),
			increment_count: increment_from.map(|_| 1),
			files: BTreeMap::new(),
		}
	}

	#[tokio::test]
	async fn resolve_chain_orders_oldest_first() {
		let store = Arc::new(MemoryStore::new());
		store.seed(
			"pfx/basebackups_005/full_1_1_backup_stop_sentinel.json",
			sentinel(None).to_json().unwrap(),
		);
		store.seed(
			"pfx/basebackups_005/delta_2_2_backup_stop_sentinel.json",
			sentinel(Some("full_1_1")).to_json().unwrap(),
		);

		let catalog = Catalog::new(store, "pfx");
		let chain = resolve_chain(&catalog, &BackupName::new("delta_2_2")).await.unwrap();
		assert_eq!(chain.len(), 2);
		assert_eq!(chain[0].name.as_str(), "full_1_1");
		assert_eq!(chain[1].name.as_str(), "delta_2_2");
	}

	#[tokio::test]
	async fn resolve_chain_missing_ancestor_is_chain_integrity_error() {
		let store = Arc::new(MemoryStore::new());
		store.seed(
			"pfx/basebackups_005/delta_2_2_backup_stop_sentinel.json",
			sentinel(Some("full_1_1")).to_json().unwrap(),
		);
		let catalog = Catalog::new(store, "pfx");
		let err = resolve_chain(&catalog, &BackupName::new("delta_2_2")).await.unwrap_err();
		assert!(matches!(err, WalgError::ChainIntegrity(_)));
	}
}
