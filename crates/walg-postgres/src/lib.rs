#![deny(rust_2018_idioms)]

//! Connection pooling and the begin/end-backup protocol calls used by the
//! base-backup push controller.

pub mod error;
pub mod pool;
pub mod protocol;

pub use error::PgError;
pub use pool::{create_pool, PgConnection, PgConnectionManager, PgPool};
pub use protocol::{BackupProtocol, BackupStart, BackupStop, PgBackupClient};
