//! The three database calls a base-backup push needs: beginning and ending
//! a non-exclusive backup, and checking whether the timeline changed
//! between the two. Everything else about the backup protocol (replication
//! connections, WAL archiving configuration) is out of scope; callers only
//! see the data these calls return.

use async_trait::async_trait;

use crate::{error::PgError, pool::PgPool};

pub type Result<T> = std::result::Result<T, PgError>;

/// What `start_backup` hands back: enough to name the backup and to
/// classify incremental files against it later.
#[derive(Debug, Clone)]
pub struct BackupStart {
	pub start_lsn: String,
	pub start_wal_segment: String,
	pub pg_version: i32,
	pub timeline: u32,
}

/// What `stop_backup` hands back: the finish LSN and the two pseudo-files
/// the bundler appends to the tar stream.
#[derive(Debug, Clone)]
pub struct BackupStop {
	pub finish_lsn: String,
	pub backup_label: Vec<u8>,
	pub tablespace_map: Vec<u8>,
}

/// The begin/end-backup protocol, abstracted so the push controller (C7)
/// can be tested against a fake without a live database.
#[async_trait]
pub trait BackupProtocol: Send + Sync {
	async fn start_backup(&self, label: &str) -> Result<BackupStart>;
	async fn stop_backup(&self) -> Result<BackupStop>;
	async fn check_timeline_changed(&self, since: u32) -> Result<bool>;
}

/// A [`BackupProtocol`] backed by a real Postgres connection pool.
pub struct PgBackupClient {
	pool: PgPool,
}

impl PgBackupClient {
	pub fn new(pool: PgPool) -> Self {
		Self { pool }
	}
}

#[async_trait]
impl BackupProtocol for PgBackupClient {
	async fn start_backup(&self, label: &str) -> Result<BackupStart> {
		let conn = self.pool.get().await?;

		let row = conn
			.query_one("SELECT pg_backup_start($1, false) AS lsn", &[&label])
			.await
			.map_err(PgError::Query)?;
		let start_lsn: String = row.get("lsn");

		let row = conn
			.query_one("SELECT pg_walfile_name($1::pg_lsn) AS segment", &[&start_lsn])
			.await
			.map_err(PgError::Query)?;
		let start_wal_segment: String = row.get("segment");

		let row = conn
			.query_one(
				"SELECT setting::int AS version FROM pg_settings WHERE name = 'server_version_num'",
				&[],
			)
			.await
			.map_err(PgError::Query)?;
		let pg_version: i32 = row.get("version");

		let timeline = current_timeline(&conn).await?;

		Ok(BackupStart {
			start_lsn,
			start_wal_segment,
			pg_version,
			timeline,
		})
	}

	async fn stop_backup(&self) -> Result<BackupStop> {
		let conn = self.pool.get().await?;

		let row = conn
			.query_one(
				"SELECT lsn, labelfile, spcmapfile FROM pg_backup_stop(wait_for_archive => true)",
				&[],
			)
			.await
			.map_err(PgError::Query)?;

		let finish_lsn: String = row.get("lsn");
		let backup_label: String = row.get("labelfile");
		let tablespace_map: Option<String> = row.get("spcmapfile");

		Ok(BackupStop {
			finish_lsn,
			backup_label: backup_label.into_bytes(),
			tablespace_map: tablespace_map.unwrap_or_default().into_bytes(),
		})
	}

	async fn check_timeline_changed(&self, since: u32) -> Result<bool> {
		let conn = self.pool.get().await?;
		let timeline = current_timeline(&conn).await?;
		Ok(timeline != since)
	}
}

async fn current_timeline(conn: &tokio_postgres::Client) -> Result<u32> {
	let row = conn
		.query_one("SELECT timeline_id FROM pg_control_checkpoint()", &[])
		.await
		.map_err(PgError::Query)?;
	let timeline: i32 = row.get("timeline_id");
	Ok(timeline as u32)
}
