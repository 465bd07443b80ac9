use thiserror::Error;

/// Errors from connecting to, or talking to, a Postgres server.
#[derive(Debug, Error)]
pub enum PgError {
	#[error("parsing connection string: {0}")]
	ConnectionString(#[source] tokio_postgres::Error),

	#[error("connecting to postgres: {0}")]
	Connect(#[source] tokio_postgres::Error),

	#[error("postgres query failed: {0}")]
	Query(#[source] tokio_postgres::Error),

	#[error("tls setup failed: {0}")]
	Tls(#[source] rustls::Error),

	#[error("backup protocol call returned an unexpected shape: {0}")]
	UnexpectedResult(String),
}

impl From<tokio_postgres::Error> for PgError {
	fn from(err: tokio_postgres::Error) -> Self {
		Self::Query(err)
	}
}
