//! One-shot byte streams used for request and response bodies.

use std::io;
use std::pin::Pin;

use bytes::{Bytes, BytesMut};
use futures::stream::{self, Stream, TryStreamExt};
use tokio::io::{AsyncRead, AsyncReadExt};

/// A pinned, boxed stream of body chunks.
///
/// Streams are consumed by value, so whoever owns a `BodyStream` is its only reader.
pub type BodyStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Chunk size used when streaming from files and sockets.
pub(crate) const READ_CHUNK_SIZE: usize = 64 * 1024;

/// A stream that ends immediately.
pub fn empty() -> BodyStream {
    Box::pin(stream::empty::<io::Result<Bytes>>())
}

/// A stream yielding `bytes` as a single chunk (or nothing, if empty).
pub fn once(bytes: impl Into<Bytes>) -> BodyStream {
    let bytes = bytes.into();
    if bytes.is_empty() {
        return empty();
    }
    Box::pin(stream::once(async move { Ok::<_, io::Error>(bytes) }))
}

/// Drains `stream` into one contiguous buffer.
pub async fn collect(stream: BodyStream) -> io::Result<Bytes> {
    let buf = stream
        .try_fold(BytesMut::new(), |mut acc, chunk| async move {
            acc.extend_from_slice(&chunk);
            Ok(acc)
        })
        .await?;
    Ok(buf.freeze())
}

/// Streams any async reader in [`READ_CHUNK_SIZE`] chunks until EOF.
pub fn from_reader<R>(reader: R) -> BodyStream
where
    R: AsyncRead + Unpin + Send + 'static,
{
    Box::pin(stream::try_unfold(reader, |mut reader| async move {
        let mut buf = BytesMut::with_capacity(READ_CHUNK_SIZE);
        let n = reader.read_buf(&mut buf).await?;
        if n == 0 {
            Ok::<_, io::Error>(None)
        } else {
            Ok(Some((buf.freeze(), reader)))
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn collect_concatenates_chunks() {
        let chunks: Vec<io::Result<Bytes>> =
            vec![Ok(Bytes::from_static(b"ab")), Ok(Bytes::from_static(b"cd"))];
        let body: BodyStream = Box::pin(stream::iter(chunks));
        assert_eq!(collect(body).await.unwrap(), Bytes::from_static(b"abcd"));
    }

    #[tokio::test]
    async fn once_with_empty_bytes_is_empty() {
        assert!(collect(once(Vec::<u8>::new())).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reader_stream_yields_everything() {
        let data = vec![7u8; READ_CHUNK_SIZE + 10];
        let body = from_reader(io::Cursor::new(data.clone()));
        assert_eq!(collect(body).await.unwrap().as_ref(), data.as_slice());
    }
}
