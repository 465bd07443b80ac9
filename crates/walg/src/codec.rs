//! C2: the stream codec. Wraps a tar byte stream with lz4 compression
//! (`async-compression`, an enrichment dependency — the teacher has no
//! compression codec of its own) and an optional `age` encryption stage,
//! grounded directly on the teacher's `crates/algae-cli/src/streams.rs`
//! `encrypt_stream`/`decrypt_stream` pair.

use std::io;
use std::pin::Pin;

use age::stream::{StreamReader, StreamWriter};
use async_compression::tokio::bufread::Lz4Decoder;
use async_compression::tokio::write::Lz4Encoder;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::error::WalgError;

/// Suffix appended to object keys that carry lz4-compressed bodies,
/// mirroring wal-g's on-disk naming so a fetch knows which decoder to use
/// (§4.2).
pub const LZ4_SUFFIX: &str = ".lz4";

/// Wraps `inner` so every byte written to the returned writer is
/// lz4-compressed, then (if `recipient` is set) encrypted, before
/// reaching `inner`. Matches the order `encrypt_stream` applies in the
/// teacher: compress first, encrypt last, so ciphertext is never fed to
/// the compressor.
pub async fn encoding_writer<W>(
	inner: W,
	recipient: Option<&str>,
) -> Result<Pin<Box<dyn AsyncWrite + Send>>, WalgError>
where
	W: AsyncWrite + Send + Unpin + 'static,
{
	match recipient {
		None => Ok(Box::pin(Lz4Encoder::new(inner))),
		Some(recipient) => {
			let recipient: age::x25519::Recipient = recipient
				.parse()
				.map_err(|err: &str| WalgError::Config(format!("invalid encryption recipient: {err}")))?;
			let encryptor = age::Encryptor::with_recipients(vec![Box::new(recipient)])
				.ok_or_else(|| WalgError::Config("age encryptor needs at least one recipient".into()))?;

			let writer = encryptor
				.wrap_async_output(inner)
				.await
				.map_err(|err| WalgError::Corrupt(format!("age encryption setup failed: {err}")))?;
			Ok(Box::pin(Lz4EncryptWriter { inner: Lz4Encoder::new(writer) }))
		}
	}
}

/// Wraps `inner` so bytes read from the returned reader are decrypted (if
/// `identity` is set) then lz4-decompressed. Mirrors `decrypt_stream`.
pub async fn decoding_reader<R>(
	inner: R,
	identity: Option<&str>,
) -> Result<Pin<Box<dyn AsyncRead + Send>>, WalgError>
where
	R: AsyncRead + Send + Unpin + 'static,
{
	match identity {
		None => Ok(Box::pin(Lz4Decoder::new(BufReader::new(inner)))),
		Some(identity) => {
			let identity: age::x25519::Identity = identity
				.parse()
				.map_err(|err: &str| WalgError::Config(format!("invalid encryption identity: {err}")))?;

			let decryptor = age::Decryptor::new_async(BufReader::new(inner))
				.await
				.map_err(|err| WalgError::Corrupt(format!("age header parse failed: {err}")))?;
			let reader = decryptor
				.decrypt_async(std::iter::once(&identity as &dyn age::Identity))
				.map_err(|err| WalgError::Corrupt(format!("age decryption failed: {err}")))?;
			Ok(Box::pin(Lz4Decoder::new(BufReader::new(reader))))
		}
	}
}

/// A write-side adapter stacking the lz4 encoder in front of an age
/// stream writer; exists because `StreamWriter` doesn't directly expose
/// `AsyncWrite` finalization semantics that `Lz4Encoder` can wrap
/// transparently.
struct Lz4EncryptWriter<W: AsyncWrite + Unpin> {
	inner: Lz4Encoder<StreamWriter<W>>,
}

impl<W: AsyncWrite + Unpin> AsyncWrite for Lz4EncryptWriter<W> {
	fn poll_write(
		self: Pin<&mut Self>,
		cx: &mut std::task::Context<'_>,
		buf: &[u8],
	) -> std::task::Poll<io::Result<usize>> {
		let this = self.get_mut();
		Pin::new(&mut this.inner).poll_write(cx, buf)
	}

	fn poll_flush(self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<io::Result<()>> {
		let this = self.get_mut();
		Pin::new(&mut this.inner).poll_flush(cx)
	}

	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<io::Result<()>> {
		let this = self.get_mut();
		Pin::new(&mut this.inner).poll_shutdown(cx)
	}
}

#[allow(dead_code)]
type AgeReader<R> = StreamReader<R>;

#[cfg(test)]
mod tests {
	use super::*;
	use tokio::io::{AsyncReadExt, AsyncWriteExt};

	#[tokio::test]
	async fn lz4_roundtrips_without_encryption() {
		let mut buf = Vec::new();
		{
			let mut writer = encoding_writer(&mut buf, None).await.unwrap();
			writer.write_all(b"hello wal-g").await.unwrap();
			writer.shutdown().await.unwrap();
		}

		let mut reader = decoding_reader(&buf[..], None).await.unwrap();
		let mut out = Vec::new();
		reader.read_to_end(&mut out).await.unwrap();
		assert_eq!(out, b"hello wal-g");
	}
}
