use std::time::Duration;

use mobc::Pool;
use tokio_postgres::config::SslMode;
use tracing::debug;

use crate::error::PgError;

pub use manager::{PgConnection, PgConnectionManager};

mod manager;
mod url;

pub type Result<T> = std::result::Result<T, PgError>;

/// Does this error look like a TLS/SSL handshake failure?
fn is_tls_error(error: &PgError) -> bool {
	matches!(error, PgError::Tls(_))
		|| error.to_string().to_lowercase().contains("tls")
		|| error.to_string().to_lowercase().contains("certificate")
}

#[derive(Debug, Clone)]
pub struct PgPool {
	pub manager: PgConnectionManager,
	pub inner: Pool<PgConnectionManager>,
}

impl PgPool {
	/// Returns a connection, waiting until one is available or the pool's
	/// configured timeout elapses.
	pub async fn get(&self) -> Result<PgConnection> {
		self.inner.get().await.map_err(pool_error)
	}

	/// Returns a connection, waiting at most `duration` instead of the
	/// pool's configured timeout.
	pub async fn get_timeout(&self, duration: Duration) -> Result<PgConnection> {
		self.inner.get_timeout(duration).await.map_err(pool_error)
	}
}

fn pool_error(err: mobc::Error<PgError>) -> PgError {
	match err {
		mobc::Error::Inner(err) => err,
		mobc::Error::Timeout => PgError::UnexpectedResult("timed out waiting for a connection".into()),
		other => PgError::UnexpectedResult(other.to_string()),
	}
}

/// Create a connection pool from a `postgresql://` connection URL.
///
/// Supports Unix socket connections via a query parameter
/// (`postgresql:///dbname?host=/var/run/postgresql`), a percent-encoded
/// host, or an empty host (auto-detected). Unix socket connections disable
/// TLS. If the initial connection attempt fails with a TLS error and the
/// configured mode is `Prefer`, a single retry with TLS disabled is made.
pub async fn create_pool(url: &str, application_name: &str) -> Result<PgPool> {
	let mut config = url::parse_connection_url(url)?;
	config.application_name(application_name);

	let mut tried_ssl_fallback = false;

	loop {
		let tls = config.get_ssl_mode() != SslMode::Disable;
		let manager = PgConnectionManager::new(config.clone(), tls);

		let pool = Pool::builder()
			.max_lifetime(Some(Duration::from_secs(3600)))
			.build(manager.clone());
		let pool = PgPool {
			manager,
			inner: pool,
		};

		match check_pool(&pool).await {
			Ok(()) => {
				if tried_ssl_fallback {
					debug!("connected with SSL disabled after a TLS error");
				}
				return Ok(pool);
			}
			Err(err) if is_tls_error(&err) && config.get_ssl_mode() == SslMode::Prefer && !tried_ssl_fallback => {
				debug!(%err, "TLS failed with prefer mode, retrying with SSL disabled");
				config.ssl_mode(SslMode::Disable);
				tried_ssl_fallback = true;
			}
			Err(err) => return Err(err),
		}
	}
}

async fn check_pool(pool: &PgPool) -> Result<()> {
	let conn = pool.get().await?;
	conn.simple_query("SELECT 1").await.map_err(PgError::Query)?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn rejects_unparseable_url() {
		let result = create_pool("not a url at all", "test").await;
		assert!(result.is_err());
	}
}
