//! Environment-sourced configuration (§6, SPEC_FULL §4.13). Mirrors the
//! teacher's `tamanu/config` pattern of failing fast and loud on a bad
//! value rather than silently falling back to a default.

use std::env;
use std::time::Duration;

use crate::error::WalgError;

const DEFAULT_DELTA_MAX_STEPS: u32 = 0;
const DEFAULT_UPLOAD_CONCURRENCY: usize = 10;
const DEFAULT_DOWNLOAD_CONCURRENCY: usize = 10;
const DEFAULT_MIN_TAR_PART_SIZE: u64 = 1 << 30; // 1 GiB, matches wal-g's default
const DEFAULT_WAL_PREFETCH_DEPTH: usize = 8;
const DEFAULT_WAL_POLL_INTERVAL_MS: u64 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaOrigin {
	/// Every delta's parent is the latest backup of any kind.
	LatestBackup,
	/// Every delta's parent is the latest full backup (§9 REDESIGN FLAGS).
	LatestFull,
}

/// The engine's environment-sourced configuration. Constructed once at
/// startup; a bad value is fatal (`WalgError::Config`), never a silent
/// default.
#[derive(Debug, Clone)]
pub struct Config {
	pub store_bucket: String,
	pub store_prefix: String,
	pub pg_connection_url: String,

	/// `0` means unlimited (§6 `DeltaMaxSteps`).
	pub delta_max_steps: u32,
	pub delta_origin: DeltaOrigin,

	pub upload_concurrency: usize,
	pub download_concurrency: usize,
	pub min_tar_part_size: u64,

	pub wal_prefetch_depth: usize,
	pub wal_poll_interval: Duration,

	pub encryption_recipient: Option<String>,
	pub encryption_identity: Option<String>,
}

impl Config {
	/// Read configuration from the process environment. Unset optional
	/// variables fall back to the documented defaults; unset required
	/// variables and unparseable values are both `WalgError::Config`.
	pub fn from_env() -> Result<Self, WalgError> {
		let store_bucket = require_env("WALG_S3_BUCKET")?;
		let store_prefix = env::var("WALG_S3_PREFIX").unwrap_or_default();
		let pg_connection_url = require_env("WALG_PG_CONNECTION_URL")?;

		let delta_max_steps = parse_env("WALG_DELTA_MAX_STEPS", DEFAULT_DELTA_MAX_STEPS)?;
		let delta_origin = match env::var("WALG_DELTA_ORIGIN") {
			Ok(v) if v.eq_ignore_ascii_case("latest_full") => DeltaOrigin::LatestFull,
			Ok(v) if v.eq_ignore_ascii_case("latest_backup") => DeltaOrigin::LatestBackup,
			Ok(v) => {
				return Err(WalgError::Config(format!(
					"WALG_DELTA_ORIGIN must be 'latest_backup' or 'latest_full', got {v:?}"
				)))
			}
			Err(_) => DeltaOrigin::LatestBackup,
		};

		let upload_concurrency = parse_env("WALG_UPLOAD_CONCURRENCY", DEFAULT_UPLOAD_CONCURRENCY)?;
		let download_concurrency = parse_env("WALG_DOWNLOAD_CONCURRENCY", DEFAULT_DOWNLOAD_CONCURRENCY)?;
		let min_tar_part_size = parse_env("WALG_MIN_TAR_PART_SIZE", DEFAULT_MIN_TAR_PART_SIZE)?;

		let wal_prefetch_depth = parse_env("WALG_WAL_PREFETCH_DEPTH", DEFAULT_WAL_PREFETCH_DEPTH)?;
		let wal_poll_interval_ms = parse_env("WALG_WAL_POLL_INTERVAL_MS", DEFAULT_WAL_POLL_INTERVAL_MS)?;

		if upload_concurrency == 0 {
			return Err(WalgError::Config("WALG_UPLOAD_CONCURRENCY must be at least 1".into()));
		}
		if download_concurrency == 0 {
			return Err(WalgError::Config(
				"WALG_DOWNLOAD_CONCURRENCY must be at least 1".into(),
			));
		}

		Ok(Self {
			store_bucket,
			store_prefix,
			pg_connection_url,
			delta_max_steps,
			delta_origin,
			upload_concurrency,
			download_concurrency,
			min_tar_part_size,
			wal_prefetch_depth,
			wal_poll_interval: Duration::from_millis(wal_poll_interval_ms),
			encryption_recipient: env::var("WALG_ENCRYPTION_RECIPIENT").ok(),
			encryption_identity: env::var("WALG_ENCRYPTION_IDENTITY").ok(),
		})
	}
}

fn require_env(key: &str) -> Result<String, WalgError> {
	env::var(key).map_err(|_| WalgError::Config(format!("{key} is required but not set")))
}

fn parse_env<T>(key: &str, default: T) -> Result<T, WalgError>
where
	T: std::str::FromStr,
	T::Err: std::fmt::Display,
{
	match env::var(key) {
		Ok(v) => v
			.parse()
			.map_err(|e| WalgError::Config(format!("{key}={v:?} is invalid: {e}"))),
		Err(_) => Ok(default),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parse_env_falls_back_to_default() {
		env::remove_var("WALG_TEST_UNSET_KEY_XYZ");
		let v: u32 = parse_env("WALG_TEST_UNSET_KEY_XYZ", 42).unwrap();
		assert_eq!(v, 42);
	}

	#[test]
	fn parse_env_rejects_bad_value() {
		env::set_var("WALG_TEST_BAD_KEY_XYZ", "not-a-number");
		let err = parse_env::<u32>("WALG_TEST_BAD_KEY_XYZ", 42).unwrap_err();
		assert!(matches!(err, WalgError::Config(_)));
		env::remove_var("WALG_TEST_BAD_KEY_XYZ");
	}
}
