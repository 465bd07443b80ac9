use std::sync::Arc;

use async_trait::async_trait;
use rustls::ClientConfig;
use tokio_postgres::{Client, Config, NoTls};
use tokio_postgres_rustls::MakeRustlsConnect;

use crate::error::PgError;

pub use crate::error::PgError as ManagerError;

/// A [`mobc::Manager`] that opens either a TLS or plaintext connection,
/// depending on the SSL mode carried by its [`Config`].
#[derive(Debug, Clone)]
pub struct PgConnectionManager {
	config: Config,
	use_tls: bool,
}

impl PgConnectionManager {
	pub fn new(config: Config, use_tls: bool) -> Self {
		Self { config, use_tls }
	}

	fn tls_connector(&self) -> Result<MakeRustlsConnect, PgError> {
		let mut roots = rustls::RootCertStore::empty();
		for cert in rustls_native_certs::load_native_certs().map_err(|e| {
			PgError::Tls(rustls::Error::General(format!(
				"loading native root certificates: {e}"
			)))
		})? {
			// Invalid certs are skipped rather than failing the whole connection;
			// the platform store commonly carries a few that don't parse.
			let _ = roots.add(cert);
		}

		let tls_config = ClientConfig::builder()
			.with_root_certificates(roots)
			.with_no_client_auth();

		Ok(MakeRustlsConnect::new(tls_config))
	}
}

#[async_trait]
impl mobc::Manager for PgConnectionManager {
	type Connection = Client;
	type Error = PgError;

	async fn connect(&self) -> Result<Self::Connection, Self::Error> {
		if self.use_tls {
			let connector = self.tls_connector()?;
			let (client, conn) = self
				.config
				.connect(connector)
				.await
				.map_err(PgError::Connect)?;
			tokio::spawn(async move {
				if let Err(err) = conn.await {
					tracing::warn!(%err, "postgres connection task ended with an error");
				}
			});
			Ok(client)
		} else {
			let (client, conn) = self.config.connect(NoTls).await.map_err(PgError::Connect)?;
			tokio::spawn(async move {
				if let Err(err) = conn.await {
					tracing::warn!(%err, "postgres connection task ended with an error");
				}
			});
			Ok(client)
		}
	}

	async fn check(&self, conn: Self::Connection) -> Result<Self::Connection, Self::Error> {
		conn.simple_query("SELECT 1").await.map_err(PgError::Query)?;
		Ok(conn)
	}
}

/// A connection checked out of a [`Pool`](mobc::Pool).
pub type PgConnection = mobc::Connection<PgConnectionManager>;

/// Convenience alias; kept separate from [`PgConnectionManager`] so callers
/// can refer to "the TLS context" without reaching into the manager.
pub type TlsConnector = Arc<ClientConfig>;
