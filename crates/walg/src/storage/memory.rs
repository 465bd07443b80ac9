//! A5: an in-memory [`ObjectStore`] double used by the push/fetch/WAL
//! controller tests so they can run hermetically, without a live bucket.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{BoxStream, StreamExt};

use super::{ObjectMeta, ObjectStore, Result};
use crate::error::WalgError;

#[derive(Default)]
pub struct MemoryStore {
	objects: Mutex<BTreeMap<String, Bytes>>,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}

	/// Test helper: seed an object directly, bypassing `put`.
	pub fn seed(&self, key: impl Into<String>, body: impl Into<Bytes>) {
		self.objects.lock().unwrap().insert(key.into(), body.into());
	}

	pub fn contains(&self, key: &str) -> bool {
		self.objects.lock().unwrap().contains_key(key)
	}
}

#[async_trait]
impl ObjectStore for MemoryStore {
	async fn exists(&self, key: &str) -> Result<bool> {
		Ok(self.objects.lock().unwrap().contains_key(key))
	}

	async fn get(&self, key: &str) -> Result<Bytes> {
		self.objects
			.lock()
			.unwrap()
			.get(key)
			.cloned()
			.ok_or_else(|| WalgError::NotFound(key.to_string()))
	}

	async fn get_stream(&self, key: &str) -> Result<BoxStream<'static, Result<Bytes>>> {
		let body = self.get(key).await?;
		Ok(Box::pin(futures::stream::once(async move { Ok(body) })))
	}

	async fn put(&self, key: &str, body: Bytes) -> Result<()> {
		self.objects.lock().unwrap().insert(key.to_string(), body);
		Ok(())
	}

	async fn put_stream(&self, key: &str, mut parts: BoxStream<'static, std::io::Result<Bytes>>) -> Result<()> {
		let mut buf = BytesMut::new();
		while let Some(chunk) = parts.next().await {
			let chunk = chunk.map_err(|err| WalgError::StoreIo(err.to_string()))?;
			buf.extend_from_slice(&chunk);
		}
		self.objects.lock().unwrap().insert(key.to_string(), buf.freeze());
		Ok(())
	}

	async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
		Ok(self
			.objects
			.lock()
			.unwrap()
			.iter()
			.filter(|(key, _)| key.starts_with(prefix))
			.map(|(key, body)| ObjectMeta {
				key: key.clone(),
				size: body.len() as u64,
			})
			.collect())
	}

	async fn delete(&self, key: &str) -> Result<()> {
		self.objects.lock().unwrap().remove(key);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn put_then_get_roundtrips() {
		let store = MemoryStore::new();
		store.put("a/b", Bytes::from_static(b"hello")).await.unwrap();
		assert_eq!(store.get("a/b").await.unwrap(), Bytes::from_static(b"hello"));
	}

	#[tokio::test]
	async fn get_missing_is_not_found() {
		let store = MemoryStore::new();
		let err = store.get("missing").await.unwrap_err();
		assert!(matches!(err, WalgError::NotFound(_)));
	}

	#[tokio::test]
	async fn list_filters_by_prefix() {
		let store = MemoryStore::new();
		store.put("x/1", Bytes::new()).await.unwrap();
		store.put("y/1", Bytes::new()).await.unwrap();
		let listed = store.list("x/").await.unwrap();
		assert_eq!(listed.len(), 1);
		assert_eq!(listed[0].key, "x/1");
	}
}
