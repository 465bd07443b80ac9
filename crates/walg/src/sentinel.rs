//! C5: the backup sentinel, a JSON manifest written as the last step of a
//! push and read first on every fetch. Field layout follows §4.6; JSON
//! (de)serialization follows the teacher's `serde`+`serde_json` idiom
//! used throughout `tamanu/config`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::WalgError;
use crate::name::BackupName;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMeta {
	pub is_incremented: bool,
	#[serde(rename = "MTime")]
	pub mtime: String,
}

/// The backup-stop sentinel (§4.6). `increment_from`/`increment_full_name`
/// /`increment_count` are only present on delta backups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sentinel {
	#[serde(rename = "StartLocalTime")]
	pub start_local_time: String,
	#[serde(rename = "FinishLocalTime")]
	pub finish_local_time: String,
	#[serde(rename = "StartLSN")]
	pub start_lsn: String,
	#[serde(rename = "FinishLSN")]
	pub finish_lsn: String,
	#[serde(rename = "UncompressedSize")]
	pub uncompressed_size: u64,
	#[serde(rename = "CompressedSize")]
	pub compressed_size: u64,
	#[serde(rename = "Hostname")]
	pub hostname: String,
	#[serde(rename = "DataDir")]
	pub data_dir: String,
	#[serde(rename = "PgVersion")]
	pub pg_version: i32,
	#[serde(rename = "StartWalSegment")]
	pub start_wal_segment: String,

	#[serde(rename = "IsPermanent", default)]
	pub is_permanent: bool,

	#[serde(rename = "IncrementFrom", skip_serializing_if = "Option::is_none")]
	pub increment_from: Option<String>,
	#[serde(rename = "IncrementFullName", skip_serializing_if = "Option::is_none")]
	pub increment_full_name: Option<String>,
	#[serde(rename = "IncrementCount", skip_serializing_if = "Option::is_none")]
	pub increment_count: Option<u32>,

	#[serde(rename = "Files")]
	pub files: BTreeMap<String, FileMeta>,
}

impl Sentinel {
	pub fn is_delta(&self) -> bool {
		self.increment_from.is_some()
	}

	pub fn to_json(&self) -> Result<Vec<u8>, WalgError> {
		serde_json::to_vec_pretty(self).map_err(|err| WalgError::Corrupt(format!("sentinel encode failed: {err}")))
	}

	pub fn from_json(bytes: &[u8]) -> Result<Self, WalgError> {
		serde_json::from_slice(bytes).map_err(|err| WalgError::Corrupt(format!("sentinel decode failed: {err}")))
	}

	/// The ancestor chain of full-backup-ancestor names, oldest first,
	/// derived purely from `increment_full_name` (§4.7): every delta
	/// points directly at the full backup it chains from, not just its
	/// immediate parent.
	pub fn full_backup_name(&self) -> Option<BackupName> {
		self.increment_full_name.clone().map(BackupName::new)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn sample() -> Sentinel {
		Sentinel {
			start_local_time: "2026-01-01T00:00:00Z".into(),
			finish_local_time: "2026-01-01T00:05:00Z".into(),
			start_lsn: "0/10".into(),
			finish_lsn: "0/20".into(),
			uncompressed_size: 100,
			compressed_size: 50,
			hostname: "db1".into(),
			data_dir: "/var/lib/postgresql/data".into(),
			pg_version: 150004,
			start_wal_segment: "000000010000000000000001".into(),
			is_permanent: false,
			increment_from: None,
			increment_full_name: None,
			increment_count: None,
			files: BTreeMap::new(),
		}
	}

	#[test]
	fn full_backup_round_trips_and_is_not_delta() {
		let sentinel = sample();
		let json = sentinel.to_json().unwrap();
		let parsed = Sentinel::from_json(&json).unwrap();
		assert!(!parsed.is_delta());
		assert!(parsed.full_backup_name().is_none());
	}

	#[test]
	fn delta_sentinel_round_trips_increment_fields() {
		let mut sentinel = sample();
		sentinel.increment_from = Some("base_0_1".into());
		sentinel.increment_full_name = Some("base_0_1".into());
		sentinel.increment_count = Some(1);
		let json = sentinel.to_json().unwrap();
		let parsed = Sentinel::from_json(&json).unwrap();
		assert!(parsed.is_delta());
		assert_eq!(parsed.full_backup_name().unwrap().as_str(), "base_0_1");
	}
}
