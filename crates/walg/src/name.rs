//! Backup name grammar (§6): `<label>_<startLSN>_<startSegment>` for full
//! backups, with `_D_<parentSegment>` appended for deltas.

use std::fmt;

use regex::Regex;
use std::sync::LazyLock;

/// Matches the modern backup name layout. A name that doesn't match this
/// is a legacy layout, where `pg_control` is embedded in the main tar part
/// rather than extracted separately (§4.8 step 6).
static MODERN_NAME: LazyLock<Regex> =
	LazyLock::new(|| Regex::new(r"^([^_]+._{1}[^_]+._{1})").expect("static regex is valid"));

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BackupName(String);

impl BackupName {
	pub fn new(name: impl Into<String>) -> Self {
		Self(name.into())
	}

	/// Build a full backup name from its label, start LSN, and start WAL
	/// segment.
	pub fn full(label: &str, start_lsn: &str, start_segment: &str) -> Self {
		Self(format!("{label}_{start_lsn}_{start_segment}"))
	}

	/// Build a delta backup name: the full-backup grammar with
	/// `_D_<parent short segment name>` appended (§4.7).
	pub fn delta(label: &str, start_lsn: &str, start_segment: &str, parent_segment_short: &str) -> Self {
		Self(format!(
			"{label}_{start_lsn}_{start_segment}_D_{parent_segment_short}"
		))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	/// True if this name matches the modern (non-legacy) backup layout.
	pub fn is_modern(&self) -> bool {
		MODERN_NAME.is_match(&self.0)
	}

	pub fn sentinel_key(&self, prefix: &str) -> String {
		format!("{prefix}/basebackups_005/{}_backup_stop_sentinel.json", self.0)
	}

	pub fn tar_partitions_prefix(&self, prefix: &str) -> String {
		format!("{prefix}/basebackups_005/{}/tar_partitions/", self.0)
	}
}

impl fmt::Display for BackupName {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl From<String> for BackupName {
	fn from(value: String) -> Self {
		Self(value)
	}
}

impl From<&str> for BackupName {
	fn from(value: &str) -> Self {
		Self(value.to_string())
	}
}
