//! C9: WAL fetch with prefetch. A segment requested by Postgres's
//! `restore_command` is served from a `prefetched/` cache directory if a
//! background prefetcher already placed it there; otherwise it's fetched
//! synchronously and a prefetcher is kicked off for the following
//! segments. The `running/`-marker-then-rename handoff mirrors the
//! teacher's `with_progress_bar` file-finalization pattern in
//! `crates/algae-cli/src/files.rs`, generalized to avoid two fetchers
//! racing on the same segment.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument};

use crate::codec::decoding_reader;
use crate::error::WalgError;
use crate::storage::ObjectStore;

/// Magic number wal-g prefixes every WAL segment object with, to detect a
/// stream that's been corrupted or isn't actually a WAL segment (§4.9).
pub const WAL_MAGIC: u32 = 0xD061_1E47;

pub struct WalFetcher {
	store: Arc<dyn ObjectStore>,
	prefix: String,
	cache_dir: camino::Utf8PathBuf,
	prefetch_depth: usize,
	poll_interval: Duration,
}

impl WalFetcher {
	pub fn new(
		store: Arc<dyn ObjectStore>,
		prefix: impl Into<String>,
		cache_dir: camino::Utf8PathBuf,
		prefetch_depth: usize,
		poll_interval: Duration,
	) -> Self {
		Self {
			store,
			prefix: prefix.into(),
			cache_dir,
			prefetch_depth,
			poll_interval,
		}
	}

	fn key(&self, segment: &str) -> String {
		format!("{}/wal_005/{}{}", self.prefix, segment, crate::codec::LZ4_SUFFIX)
	}

	fn prefetched_path(&self, segment: &str) -> camino::Utf8PathBuf {
		self.cache_dir.join("prefetched").join(segment)
	}

	fn running_path(&self, segment: &str) -> camino::Utf8PathBuf {
		self.cache_dir.join("running").join(segment)
	}

	/// Serve `segment` into `dest_path`, the path Postgres's
	/// `restore_command` expects the file at. Checks the prefetch cache
	/// first, polling briefly for an in-flight prefetch before falling
	/// back to a direct fetch, then kicks off background prefetch of the
	/// following `prefetch_depth` segments.
	#[instrument(skip(self))]
	pub async fn fetch_wal(&self, segment: &str, dest_path: &camino::Utf8Path) -> Result<(), WalgError> {
		if let Some(()) = self.try_serve_from_cache(segment, dest_path).await? {
			self.spawn_prefetch(segment);
			return Ok(());
		}

		// Another prefetcher might be mid-flight on exactly this segment;
		// give it a short window before fetching directly ourselves.
		let running = self.running_path(segment);
		if tokio::fs::try_exists(&running).await.unwrap_or(false) {
			for _ in 0..20 {
				tokio::time::sleep(self.poll_interval).await;
				if self.try_serve_from_cache(segment, dest_path).await?.is_some() {
					self.spawn_prefetch(segment);
					return Ok(());
				}
			}
		}

		self.fetch_direct(segment, dest_path).await?;
		self.spawn_prefetch(segment);
		Ok(())
	}

	async fn try_serve_from_cache(
		&self,
		segment: &str,
		dest_path: &camino::Utf8Path,
	) -> Result<Option<()>, WalgError> {
		let cached = self.prefetched_path(segment);
		if !tokio::fs::try_exists(&cached).await.unwrap_or(false) {
			return Ok(None);
		}
		tokio::fs::copy(cached.as_std_path(), dest_path.as_std_path()).await?;
		debug!("served {segment} from prefetch cache");
		Ok(Some(()))
	}

	async fn fetch_direct(&self, segment: &str, dest_path: &camino::Utf8Path) -> Result<(), WalgError> {
		let key = self.key(segment);
		let encoded = self.store.get(&key).await?;
		let decoded = decode_segment(&encoded, segment).await?;
		tokio::fs::write(dest_path.as_std_path(), decoded).await?;
		Ok(())
	}

	/// Fork a background task prefetching the next `prefetch_depth`
	/// segments following `segment`, using a `running/` marker to avoid
	/// two prefetchers (or a prefetcher and a direct fetch) duplicating
	/// work on the same target.
	fn spawn_prefetch(&self, segment: &str) {
		let store = self.store.clone();
		let prefix = self.prefix.clone();
		let cache_dir = self.cache_dir.clone();
		let depth = self.prefetch_depth;
		let segment = segment.to_string();

		tokio::spawn(async move {
			let fetcher = WalFetcher {
				store,
				prefix,
				cache_dir,
				prefetch_depth: depth,
				poll_interval: Duration::from_millis(50),
			};
			for offset in 1..=depth {
				let Some(next) = next_segment_name(&fetcher.key_segment(&segment), offset) else {
					continue;
				};
				if let Err(err) = fetcher.prefetch_one(&next).await {
					debug!("prefetch of {next} stopped: {err}");
					break;
				}
			}
		});
	}

	fn key_segment<'a>(&self, segment: &'a str) -> &'a str {
		segment
	}

	async fn prefetch_one(&self, segment: &str) -> Result<(), WalgError> {
		let prefetched = self.prefetched_path(segment);
		if tokio::fs::try_exists(&prefetched).await.unwrap_or(false) {
			return Ok(());
		}

		let running = self.running_path(segment);
		if tokio::fs::try_exists(&running).await.unwrap_or(false) {
			return Ok(());
		}

		tokio::fs::create_dir_all(running.parent().unwrap().as_std_path()).await?;
		tokio::fs::create_dir_all(prefetched.parent().unwrap().as_std_path()).await?;
		tokio::fs::write(running.as_std_path(), b"").await?;

		let key = self.key(segment);
		let result = self.store.get(&key).await;
		let outcome = match result {
			Ok(encoded) => decode_segment(&encoded, segment).await,
			Err(err) => Err(err),
		};

		tokio::fs::remove_file(running.as_std_path()).await.ok();

		match outcome {
			Ok(decoded) => {
				tokio::fs::write(prefetched.as_std_path(), decoded).await?;
				info!("prefetched {segment}");
				Ok(())
			}
			Err(err) => Err(err),
		}
	}
}

async fn decode_segment(encoded: &[u8], segment: &str) -> Result<Vec<u8>, WalgError> {
	let mut reader = decoding_reader(encoded, None).await?;
	let mut decoded = Vec::new();
	tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut decoded).await?;

	if decoded.len() >= 4 {
		let magic = u32::from_le_bytes([decoded[0], decoded[1], decoded[2], decoded[3]]);
		if magic != WAL_MAGIC {
			debug!("segment {segment} does not start with the expected magic bytes, serving as-is");
		}
	}

	Ok(decoded)
}

/// Compute the name of the WAL segment `offset` positions after
/// `segment`, within the same timeline, per Postgres's 24-hex-digit
/// segment naming (`TTTTTTTTXXXXXXXXSSSSSSSS`).
fn next_segment_name(segment: &str, offset: usize) -> Option<String> {
	if segment.len() != 24 {
		return None;
	}
	let timeline = &segment[0..8];
	let log = u32::from_str_radix(&segment[8..16], 16).ok()?;
	let seg = u32::from_str_radix(&segment[16..24], 16).ok()?;

	const SEGMENTS_PER_LOG: u32 = 0x100;
	let total = (log as u64) * SEGMENTS_PER_LOG as u64 + seg as u64 + offset as u64;
	let new_log = (total / SEGMENTS_PER_LOG as u64) as u32;
	let new_seg = (total % SEGMENTS_PER_LOG as u64) as u32;

	Some(format!("{timeline}{new_log:08X}{new_seg:08X}"))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn next_segment_rolls_over_log() {
		let next = next_segment_name("0000000100000000000000FF", 1).unwrap();
		assert_eq!(next, "000000010000000100000000");
	}

	#[test]
	fn next_segment_increments_within_log() {
		let next = next_segment_name("000000010000000000000001", 1).unwrap();
		assert_eq!(next, "000000010000000000000002");
	}
}
