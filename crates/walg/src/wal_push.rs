//! C10: WAL push. Uploads a completed segment synchronously so
//! Postgres's `archive_command` only returns success once the segment is
//! durable, then opportunistically uploads whichever later siblings are
//! already sitting in `pg_wal/` in the background, bounded by a
//! semaphore the same way the teacher bounds multipart-upload
//! concurrency in `src/aws/s3.rs`.

use std::sync::Arc;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tracing::{info, instrument, warn};

use crate::codec::encoding_writer;
use crate::error::WalgError;
use crate::storage::ObjectStore;

pub struct WalPusher {
	store: Arc<dyn ObjectStore>,
	prefix: String,
	upload_permits: Arc<Semaphore>,
}

impl WalPusher {
	pub fn new(store: Arc<dyn ObjectStore>, prefix: impl Into<String>, concurrency: usize) -> Self {
		Self {
			store,
			prefix: prefix.into(),
			upload_permits: Arc::new(Semaphore::new(concurrency.max(1))),
		}
	}

	fn key(&self, segment: &str) -> String {
		format!("{}/wal_005/{}{}", self.prefix, segment, crate::codec::LZ4_SUFFIX)
	}

	/// Upload `segment`'s bytes synchronously; `archive_command` must not
	/// return until this completes, so Postgres doesn't recycle the
	/// source file prematurely (§4.10 invariant I3).
	#[instrument(skip(self, bytes))]
	pub async fn push_wal(&self, segment: &str, bytes: Bytes) -> Result<(), WalgError> {
		let _permit = self
			.upload_permits
			.acquire()
			.await
			.map_err(|err| WalgError::StoreIo(format!("upload semaphore closed: {err}")))?;

		let encoded = encode_segment(bytes).await?;
		self.store.put(&self.key(segment), encoded).await?;
		info!("pushed {segment}");
		Ok(())
	}

	/// Scan `wal_dir` for segments lexicographically after `segment` and
	/// upload any not already in the store, each bounded by the same
	/// semaphore as the synchronous path so the two never together
	/// exceed the configured concurrency.
	pub fn spawn_background_siblings(self: &Arc<Self>, wal_dir: camino::Utf8PathBuf, segment: String) {
		let this = self.clone();
		tokio::spawn(async move {
			if let Err(err) = this.upload_siblings(&wal_dir, &segment).await {
				warn!("background WAL sibling upload stopped: {err}");
			}
		});
	}

	async fn upload_siblings(&self, wal_dir: &camino::Utf8Path, after: &str) -> Result<(), WalgError> {
		let mut entries = tokio::fs::read_dir(wal_dir.as_std_path()).await?;
		let mut names = Vec::new();
		while let Some(entry) = entries.next_entry().await? {
			let name = entry.file_name().to_string_lossy().into_owned();
			if name.len() == 24 && name.as_str() > after {
				names.push(name);
			}
		}
		names.sort();

		for name in names {
			if self.store.exists(&self.key(&name)).await? {
				continue;
			}
			let path = wal_dir.join(&name);
			let bytes = tokio::fs::read(path.as_std_path()).await?;
			self.push_wal(&name, Bytes::from(bytes)).await?;
		}

		Ok(())
	}
}

async fn encode_segment(bytes: Bytes) -> Result<Bytes, WalgError> {
	let mut buf = Vec::new();
	{
		let mut writer = encoding_writer(&mut buf, None).await?;
		writer.write_all(&bytes).await?;
		writer.shutdown().await?;
	}
	Ok(Bytes::from(buf))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::storage::memory::MemoryStore;

	#[tokio::test]
	async fn push_wal_stores_under_wal_005_prefix() {
		let store = Arc::new(MemoryStore::new());
		let pusher = WalPusher::new(store.clone(), "pfx", 2);
		pusher
			.push_wal("000000010000000000000001", Bytes::from_static(b"segment bytes"))
			.await
			.unwrap();
		assert!(store.contains("pfx/wal_005/000000010000000000000001.lz4"));
	}
}
