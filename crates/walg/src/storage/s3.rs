//! S3-backed [`ObjectStore`], grounded on the teacher's `src/aws/s3.rs`
//! multipart-upload helpers and `crates/s3-join/src/event_handler.rs`
//! get/put/list/head calls against `aws-sdk-s3`.

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use tracing::{debug, instrument, warn};

use super::{ObjectMeta, ObjectStore, Result};
use crate::error::WalgError;

/// Multipart uploads below this size are sent as a single `PutObject`
/// instead, mirroring the teacher's `file_chunker` threshold for not
/// bothering with multipart on small files.
const MULTIPART_THRESHOLD: usize = 8 * 1024 * 1024;

pub struct S3Store {
	client: aws_sdk_s3::Client,
	bucket: String,
}

impl S3Store {
	pub fn new(client: aws_sdk_s3::Client, bucket: impl Into<String>) -> Self {
		Self {
			client,
			bucket: bucket.into(),
		}
	}

	pub async fn from_env(bucket: impl Into<String>) -> Self {
		let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
		Self::new(aws_sdk_s3::Client::new(&config), bucket)
	}
}

#[async_trait]
impl ObjectStore for S3Store {
	#[instrument(skip(self))]
	async fn exists(&self, key: &str) -> Result<bool> {
		match self.client.head_object().bucket(&self.bucket).key(key).send().await {
			Ok(_) => Ok(true),
			Err(err) if is_not_found(&err) => Ok(false),
			Err(err) => Err(WalgError::StoreIo(err.to_string())),
		}
	}

	#[instrument(skip(self))]
	async fn get(&self, key: &str) -> Result<Bytes> {
		let output = self
			.client
			.get_object()
			.bucket(&self.bucket)
			.key(key)
			.send()
			.await
			.map_err(|err| {
				if is_not_found(&err) {
					WalgError::NotFound(key.to_string())
				} else {
					WalgError::StoreIo(err.to_string())
				}
			})?;

		let bytes = output
			.body
			.collect()
			.await
			.map_err(|err| WalgError::StoreIo(err.to_string()))?
			.into_bytes();
		Ok(bytes)
	}

	async fn get_stream(&self, key: &str) -> Result<BoxStream<'static, Result<Bytes>>> {
		let output = self
			.client
			.get_object()
			.bucket(&self.bucket)
			.key(key)
			.send()
			.await
			.map_err(|err| {
				if is_not_found(&err) {
					WalgError::NotFound(key.to_string())
				} else {
					WalgError::StoreIo(err.to_string())
				}
			})?;

		let stream = output
			.body
			.map(|chunk| chunk.map_err(|err| WalgError::StoreIo(err.to_string())));
		Ok(Box::pin(stream))
	}

	#[instrument(skip(self, body))]
	async fn put(&self, key: &str, body: Bytes) -> Result<()> {
		if body.len() >= MULTIPART_THRESHOLD {
			return self.put_stream(key, Box::pin(futures::stream::once(async move { Ok(body) }))).await;
		}

		self.client
			.put_object()
			.bucket(&self.bucket)
			.key(key)
			.body(ByteStream::from(body))
			.send()
			.await
			.map_err(|err| WalgError::StoreIo(err.to_string()))?;
		Ok(())
	}

	/// Token-based multipart upload: create, upload parts in order,
	/// complete. Mirrors `token_upload` in the teacher's `src/aws/s3.rs`.
	#[instrument(skip(self, parts))]
	async fn put_stream(&self, key: &str, mut parts: BoxStream<'static, std::io::Result<Bytes>>) -> Result<()> {
		let create = self
			.client
			.create_multipart_upload()
			.bucket(&self.bucket)
			.key(key)
			.send()
			.await
			.map_err(|err| WalgError::StoreIo(err.to_string()))?;
		let upload_id = create
			.upload_id()
			.ok_or_else(|| WalgError::StoreIo("S3 did not return an upload id".into()))?
			.to_string();

		let mut completed = Vec::new();
		let mut part_number = 1i32;

		while let Some(chunk) = parts.next().await {
			let chunk = chunk.map_err(|err| WalgError::StoreIo(err.to_string()))?;
			let part = self
				.client
				.upload_part()
				.bucket(&self.bucket)
				.key(key)
				.upload_id(&upload_id)
				.part_number(part_number)
				.body(ByteStream::from(chunk))
				.send()
				.await
				.map_err(|err| WalgError::StoreIo(err.to_string()))?;

			completed.push(
				aws_sdk_s3::types::CompletedPart::builder()
					.part_number(part_number)
					.set_e_tag(part.e_tag().map(str::to_string))
					.build(),
			);
			part_number += 1;
		}

		if completed.is_empty() {
			debug!("aborting empty multipart upload for {key}");
			let _ = self
				.client
				.abort_multipart_upload()
				.bucket(&self.bucket)
				.key(key)
				.upload_id(&upload_id)
				.send()
				.await;
			return self.put(key, Bytes::new()).await;
		}

		self.client
			.complete_multipart_upload()
			.bucket(&self.bucket)
			.key(key)
			.upload_id(&upload_id)
			.multipart_upload(
				aws_sdk_s3::types::CompletedMultipartUpload::builder()
					.set_parts(Some(completed))
					.build(),
			)
			.send()
			.await
			.map_err(|err| WalgError::StoreIo(err.to_string()))?;

		Ok(())
	}

	#[instrument(skip(self))]
	async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
		let mut out = Vec::new();
		let mut continuation_token = None;

		loop {
			let mut req = self.client.list_objects_v2().bucket(&self.bucket).prefix(prefix);
			if let Some(token) = continuation_token.take() {
				req = req.continuation_token(token);
			}
			let resp = req.send().await.map_err(|err| WalgError::StoreIo(err.to_string()))?;

			for obj in resp.contents() {
				if let Some(key) = obj.key() {
					out.push(ObjectMeta {
						key: key.to_string(),
						size: obj.size().unwrap_or(0).max(0) as u64,
					});
				}
			}

			if resp.is_truncated().unwrap_or(false) {
				continuation_token = resp.next_continuation_token().map(str::to_string);
			} else {
				break;
			}
		}

		Ok(out)
	}

	#[instrument(skip(self))]
	async fn delete(&self, key: &str) -> Result<()> {
		match self.client.delete_object().bucket(&self.bucket).key(key).send().await {
			Ok(_) => Ok(()),
			Err(err) => {
				warn!("failed to delete {key}: {err}");
				Err(WalgError::StoreIo(err.to_string()))
			}
		}
	}
}

fn is_not_found<E, R>(err: &aws_sdk_s3::error::SdkError<E, R>) -> bool
where
	E: std::error::Error + 'static,
{
	err.raw_response()
		.map(|raw| raw.status().as_u16() == 404)
		.unwrap_or(false)
}
