//! Thin CLI entry point over the `walg` library: a `clap`-derived
//! subcommand per operation, `tracing-subscriber` for logs, and `miette`
//! for top-level error reporting, the same three-piece shape as the
//! teacher's `bestool` entry point.

use std::sync::Arc;

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use miette::{Context, IntoDiagnostic};
use tracing_subscriber::EnvFilter;
use walg::config::Config;
use walg::storage::s3::S3Store;
use walg::storage::ObjectStore;
use walg_postgres::{create_pool, PgBackupClient};

#[derive(Debug, Parser)]
#[command(name = "walg", about = "Backup and archival tool for a write-ahead-logged relational database")]
struct Cli {
	#[command(subcommand)]
	action: Action,
}

#[derive(Debug, Subcommand)]
enum Action {
	/// Take a base backup, full or delta depending on policy and history.
	BackupPush {
		#[arg(long)]
		data_dir: Utf8PathBuf,
		#[arg(long, default_value = "base")]
		label: String,
	},
	/// Restore a base backup (default: the latest) into a target directory.
	BackupFetch {
		#[arg(long)]
		target_dir: Utf8PathBuf,
		#[arg(long, default_value = "LATEST")]
		name: String,
	},
	/// List backups in the catalog.
	BackupList,
	/// Apply retention to the backup catalog.
	Delete {
		#[arg(long)]
		retain: Option<usize>,
		#[arg(long)]
		dry_run: bool,
	},
	/// Fetch one WAL segment (invoked from `restore_command`).
	WalFetch {
		segment: String,
		dest: Utf8PathBuf,
	},
	/// Push one WAL segment (invoked from `archive_command`).
	WalPush {
		segment: String,
		path: Utf8PathBuf,
	},
}

#[tokio::main]
async fn main() -> miette::Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
		.init();

	let cli = Cli::parse();
	let config = Config::from_env().into_diagnostic().wrap_err("loading configuration")?;

	let store: Arc<dyn ObjectStore> = Arc::new(S3Store::from_env(config.store_bucket.clone()).await);

	match cli.action {
		Action::BackupPush { data_dir, label } => {
			let pool = create_pool(&config.pg_connection_url, "walg")
				.into_diagnostic()
				.wrap_err("connecting to postgres")?;
			let protocol = Arc::new(PgBackupClient::new(pool));
			let name = walg::push::push(store, protocol, &config, &data_dir, &label)
				.await
				.into_diagnostic()
				.wrap_err("backup push failed")?;
			println!("{name}");
		}
		Action::BackupFetch { target_dir, name } => {
			let catalog = walg::catalog::Catalog::new(store.clone(), config.store_prefix.clone());
			let name = if name == "LATEST" {
				catalog
					.latest()
					.await
					.into_diagnostic()
					.wrap_err("resolving LATEST")?
					.ok_or_else(|| miette::miette!("no backups found"))?
					.name
			} else {
				walg::BackupName::new(name)
			};
			walg::fetch::fetch(
				store,
				&config.store_prefix,
				&name,
				&target_dir,
				config.encryption_identity.as_deref(),
			)
			.await
			.into_diagnostic()
			.wrap_err("backup fetch failed")?;
		}
		Action::BackupList => {
			let catalog = walg::catalog::Catalog::new(store, config.store_prefix.clone());
			for entry in catalog.list().await.into_diagnostic().wrap_err("listing backups")? {
				println!(
					"{}\t{}\t{}",
					entry.name,
					entry.sentinel.start_local_time,
					if entry.sentinel.is_delta() { "delta" } else { "full" }
				);
			}
		}
		Action::Delete { retain, dry_run } => {
			let catalog = walg::catalog::Catalog::new(store, config.store_prefix.clone());
			let entries = catalog.list().await.into_diagnostic().wrap_err("listing backups")?;
			let deleted = catalog
				.apply_retention(&entries, retain, None, dry_run)
				.await
				.into_diagnostic()
				.wrap_err("applying retention")?;
			for name in deleted {
				println!("{name}");
			}
		}
		Action::WalFetch { segment, dest } => {
			let fetcher = walg::wal_fetch::WalFetcher::new(
				store,
				config.store_prefix.clone(),
				Utf8PathBuf::from("/var/lib/walg/cache"),
				config.wal_prefetch_depth,
				config.wal_poll_interval,
			);
			fetcher
				.fetch_wal(&segment, &dest)
				.await
				.into_diagnostic()
				.wrap_err("wal fetch failed")?;
		}
		Action::WalPush { segment, path } => {
			let pusher = Arc::new(walg::wal_push::WalPusher::new(
				store,
				config.store_prefix.clone(),
				config.upload_concurrency,
			));
			let bytes = tokio::fs::read(path.as_std_path())
				.await
				.into_diagnostic()
				.wrap_err("reading WAL segment from disk")?;
			pusher
				.push_wal(&segment, bytes.into())
				.await
				.into_diagnostic()
				.wrap_err("wal push failed")?;
		}
	}

	Ok(())
}
