use miette::Diagnostic;
use thiserror::Error;

/// The error taxonomy for the engine (§7 of the design): library code
/// returns this; the orchestrators in [`crate::push`], [`crate::fetch`],
/// [`crate::wal_fetch`] and [`crate::wal_push`] translate it into a
/// [`miette::Result`] at the process boundary.
#[derive(Debug, Error, Diagnostic)]
pub enum WalgError {
	/// Unparseable or out-of-range configuration (§6). Fatal at startup.
	#[error("configuration error: {0}")]
	Config(String),

	/// A sentinel, backup, or WAL segment that was asked for doesn't
	/// exist. Not fatal for `GetLatest`; fatal for a named fetch.
	#[error("not found: {0}")]
	NotFound(String),

	/// A bad magic number, wrong WAL segment size, or an unrecognised tar
	/// member / codec suffix.
	#[error("corrupt object: {0}")]
	Corrupt(String),

	/// Surfaced unchanged from the object-store adapter (or the local
	/// filesystem underneath the walker/bundler/extractor).
	#[error("object store error: {0}")]
	StoreIo(String),

	#[error(transparent)]
	LocalIo(#[from] std::io::Error),

	/// A missing ancestor, a cycle, or an `IncrementCount` mismatch while
	/// walking a delta chain.
	#[error("backup chain integrity error: {0}")]
	ChainIntegrity(String),

	/// The database's timeline changed between backup start and stop; the
	/// backup is abandoned, not a hard failure.
	#[error("timeline changed during backup, abandoning")]
	TimelineChanged,

	#[error("postgres error: {0}")]
	Postgres(#[from] walg_postgres::PgError),
}

pub type Result<T> = std::result::Result<T, WalgError>;
