//! C1: the object-store adapter. A thin trait over whatever backend holds
//! base backups and WAL segments, grounded on the get/put/list/head calls
//! the teacher's `s3-join` crate and `aws/s3.rs` multipart helper make
//! directly against `aws-sdk-s3`.

pub mod memory;
pub mod s3;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::error::WalgError;

pub type Result<T> = std::result::Result<T, WalgError>;

#[derive(Debug, Clone)]
pub struct ObjectMeta {
	pub key: String,
	pub size: u64,
}

/// The object-store seam (C1). Every method maps backend-specific errors
/// into `WalgError::StoreIo` at the boundary so upstream code never sees
/// an SDK type.
#[async_trait]
pub trait ObjectStore: Send + Sync {
	async fn exists(&self, key: &str) -> Result<bool>;

	/// Fetch the full object. Returns `WalgError::NotFound` if the key is
	/// absent.
	async fn get(&self, key: &str) -> Result<Bytes>;

	/// Stream an object's bytes in chunks, for large files (C4/C8) that
	/// shouldn't be buffered wholesale.
	async fn get_stream(&self, key: &str) -> Result<BoxStream<'static, Result<Bytes>>>;

	/// Write the full object, replacing any existing value at that key.
	async fn put(&self, key: &str, body: Bytes) -> Result<()>;

	/// Multipart-style streamed put, for tar parts (C4) whose final size
	/// isn't known up front. `parts` is consumed in order.
	async fn put_stream(&self, key: &str, parts: BoxStream<'static, std::io::Result<Bytes>>) -> Result<()>;

	/// List all keys under `prefix`, non-recursively excluded — this
	/// returns every key regardless of depth, matching S3 `ListObjectsV2`
	/// semantics rather than a directory listing.
	async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>>;

	async fn delete(&self, key: &str) -> Result<()>;
}
