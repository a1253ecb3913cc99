use bytes::Bytes;
use futures::{StreamExt, TryStreamExt, stream::BoxStream};
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;

/// Failure signal carried inside a [`ByteStream`]. A stream that ends with
/// `None` finished cleanly; one that yields `Some(Err(_))` did not, and must
/// not be treated as complete.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// The source connection broke or returned garbage.
    #[error("source stream failed: {0}")]
    Source(String),
    /// The transcoder reported a fatal condition or exited abnormally.
    #[error("transcoder failed: {0}")]
    Transcoder(String),
}

/// Ordered, finite, non-restartable byte sequence. Dropping it releases
/// whatever connection or process feeds it.
pub type ByteStream = BoxStream<'static, Result<Bytes, StreamError>>;

/// Builds a [`ByteStream`] from a fixed list of chunks, mostly useful for
/// tests and fixtures.
pub fn from_chunks<I>(chunks: I) -> ByteStream
where
    I: IntoIterator<Item = Bytes>,
    I::IntoIter: Send + 'static,
{
    futures::stream::iter(chunks.into_iter().map(Ok)).boxed()
}

/// Adapts a [`ByteStream`] into an `AsyncRead`. A stream failure surfaces as
/// an io error that [`source_error`] can recover.
pub fn into_async_read(stream: ByteStream) -> impl AsyncRead + Send + Unpin {
    StreamReader::new(
        stream.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)),
    )
}

/// The [`StreamError`] wrapped by [`into_async_read`], if `err` is one.
pub fn source_error(err: &std::io::Error) -> Option<StreamError> {
    err.get_ref()
        .and_then(|inner| inner.downcast_ref::<StreamError>())
        .cloned()
}
