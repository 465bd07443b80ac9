//! C4: the tar bundler and upload queue. Groups walked files into tar
//! parts bounded by `MinSize` (§4.4), streaming each part through the
//! codec (C2) straight to the object store (C1) as it fills, the same
//! fill-then-flush pattern as the teacher's `FileChunker::with_next_chunk`
//! in `src/file_chunker.rs`.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{info, instrument};

use crate::codec::encoding_writer;
use crate::error::WalgError;
use crate::sentinel::FileMeta;
use crate::storage::ObjectStore;
use crate::walker::WalkEntry;

/// A set of files assigned to the same tar part, built up while walking
/// until the running size crosses `min_size`, mirroring the teacher's
/// chunker: a part is flushed the moment it's big enough, not sized
/// exactly.
struct PartBuilder {
	entries: Vec<WalkEntry>,
	running_size: u64,
}

impl PartBuilder {
	fn new() -> Self {
		Self {
			entries: Vec::new(),
			running_size: 0,
		}
	}

	fn push(&mut self, entry: WalkEntry) {
		self.running_size += entry.size;
		self.entries.push(entry);
	}

	fn is_full(&self, min_size: u64) -> bool {
		self.running_size >= min_size
	}
}

/// Partition `entries` into part-sized groups. Directories and symlinks
/// always ride along with the part they're encountered in; only regular
/// file sizes count toward `min_size`.
pub fn partition(entries: Vec<WalkEntry>, min_size: u64) -> Vec<Vec<WalkEntry>> {
	let mut parts = Vec::new();
	let mut current = PartBuilder::new();

	for entry in entries {
		let is_file = !entry.is_dir && !entry.is_symlink;
		current.push(entry);
		if is_file && current.is_full(min_size) {
			parts.push(std::mem::take(&mut current.entries));
			current = PartBuilder::new();
		}
	}

	if !current.entries.is_empty() {
		parts.push(current.entries);
	}

	parts
}

/// Result of bundling and uploading one tar part.
pub struct PartResult {
	pub key: String,
	pub files: BTreeMap<String, FileMeta>,
	pub uncompressed_size: u64,
}

/// Build one tar part from `entries` rooted at `data_dir`, encode it
/// through the codec, and upload it to `key`. Runs entirely in memory
/// through a `tokio::io::duplex` pipe so encoding and uploading overlap,
/// matching the teacher's `token_upload` streaming-while-building style.
#[instrument(skip(store, entries), fields(part = %key))]
pub async fn bundle_part(
	store: Arc<dyn ObjectStore>,
	data_dir: &camino::Utf8Path,
	key: String,
	entries: &[WalkEntry],
	encryption_recipient: Option<&str>,
) -> Result<PartResult, WalgError> {
	let (mut tx, rx) = tokio::io::duplex(64 * 1024);
	let mut files = BTreeMap::new();
	let mut uncompressed_size = 0u64;

	let upload_key = key.clone();
	let upload_store = store.clone();
	let upload_task = tokio::spawn(async move {
		let stream = tokio_util::io::ReaderStream::new(rx).map(|r| r.map_err(std::io::Error::from));
		upload_store.put_stream(&upload_key, Box::pin(stream)).await
	});

	{
		let mut writer = encoding_writer(&mut tx, encryption_recipient).await?;
		let mut builder = tokio_tar::Builder::new(&mut writer);

		for entry in entries {
			if entry.is_dir {
				continue;
			}
			let archive_path = entry.relative_path.clone();
			if entry.is_symlink {
				let target = entry.symlink_target.clone().unwrap_or_default();
				let mut header = tokio_tar::Header::new_gnu();
				header.set_entry_type(tokio_tar::EntryType::Symlink);
				header.set_size(0);
				builder
					.append_link(&mut header, &archive_path, &target)
					.await
					.map_err(|err| WalgError::Corrupt(format!("tar append symlink failed: {err}")))?;
				continue;
			}

			let full_path = data_dir.join(entry.relative_path.to_string_lossy().as_ref());
			let mut file = tokio::fs::File::open(full_path.as_std_path()).await?;
			builder
				.append_file(&archive_path, &mut file)
				.await
				.map_err(|err| WalgError::Corrupt(format!("tar append file failed: {err}")))?;

			uncompressed_size += entry.size;
			files.insert(
				entry.relative_path.to_string_lossy().into_owned(),
				FileMeta {
					is_incremented: false,
					mtime: chrono::Utc::now().to_rfc3339(),
				},
			);
		}

		builder
			.finish()
			.await
			.map_err(|err| WalgError::Corrupt(format!("tar finish failed: {err}")))?;
		writer.shutdown().await?;
	}
	tx.shutdown().await.ok();

	upload_task
		.await
		.map_err(|err| WalgError::StoreIo(format!("upload task panicked: {err}")))??;

	info!(bytes = uncompressed_size, "uploaded tar part {key}");
	Ok(PartResult {
		key,
		files,
		uncompressed_size,
	})
}

/// Extra bytes wal-g always appends after the last tar part: the
/// `backup_label` and (if present) `tablespace_map` pseudo-files returned
/// by `stop_backup` (§4.5 step 5).
pub async fn append_pseudo_files(
	store: Arc<dyn ObjectStore>,
	key: String,
	backup_label: Bytes,
	tablespace_map: Bytes,
) -> Result<(), WalgError> {
	let mut buf = Vec::new();
	{
		let mut builder = tokio_tar::Builder::new(&mut buf);
		append_bytes(&mut builder, "backup_label", &backup_label).await?;
		if !tablespace_map.is_empty() {
			append_bytes(&mut builder, "tablespace_map", &tablespace_map).await?;
		}
		builder
			.finish()
			.await
			.map_err(|err| WalgError::Corrupt(format!("pseudo-file tar finish failed: {err}")))?;
	}
	store.put(&key, Bytes::from(buf)).await
}

async fn append_bytes<W: tokio::io::AsyncWrite + Unpin + Send>(
	builder: &mut tokio_tar::Builder<W>,
	name: &str,
	bytes: &[u8],
) -> Result<(), WalgError> {
	let mut header = tokio_tar::Header::new_gnu();
	header.set_size(bytes.len() as u64);
	header.set_entry_type(tokio_tar::EntryType::Regular);
	header.set_cksum();
	builder
		.append_data(&mut header, name, bytes)
		.await
		.map_err(|err| WalgError::Corrupt(format!("tar append {name} failed: {err}")))
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::path::PathBuf;

	fn file_entry(name: &str, size: u64) -> WalkEntry {
		WalkEntry {
			relative_path: PathBuf::from(name),
			absolute_path: PathBuf::from(name),
			size,
			is_dir: false,
			is_symlink: false,
			symlink_target: None,
		}
	}

	#[test]
	fn partition_splits_once_min_size_is_crossed() {
		let entries = vec![file_entry("a", 40), file_entry("b", 40), file_entry("c", 40)];
		let parts = partition(entries, 50);
		assert_eq!(parts.len(), 2);
		assert_eq!(parts[0].len(), 2);
		assert_eq!(parts[1].len(), 1);
	}

	#[test]
	fn partition_keeps_everything_in_one_part_under_threshold() {
		let entries = vec![file_entry("a", 1), file_entry("b", 1)];
		let parts = partition(entries, 1_000_000);
		assert_eq!(parts.len(), 1);
	}
}
