//! Progress-tracking stream wrapper for upload progress.

use bytes::Bytes;
use futures_util::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

/// Callback receiving the cumulative number of bytes handed to the transport
pub type ByteCallback = Arc<dyn Fn(u64) + Send + Sync>;

/// Stream wrapper that tracks bytes transferred and calls a progress callback
pub struct ProgressStream<S> {
    inner: S,
    bytes_transferred: u64,
    callback: ByteCallback,
}

impl<S> ProgressStream<S>
where
    S: Stream<Item = Result<Bytes, std::io::Error>>,
{
    /// Create a new progress stream
    pub fn new(inner: S, callback: ByteCallback) -> Self {
        Self {
            inner,
            bytes_transferred: 0,
            callback,
        }
    }
}

impl<S> Stream for ProgressStream<S>
where
    S: Stream<Item = Result<Bytes, std::io::Error>> + Unpin,
{
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let inner = Pin::new(&mut self.inner);

        match inner.poll_next(cx) {
            Poll::Ready(Some(Ok(bytes))) => {
                self.bytes_transferred += bytes.len() as u64;
                (self.callback)(self.bytes_transferred);
                Poll::Ready(Some(Ok(bytes)))
            }
            other => other,
        }
    }
}

/// Split a buffered body into zero-copy chunks of at most `chunk_size` bytes
pub fn chunked(content: Bytes, chunk_size: usize) -> Vec<Bytes> {
    let chunk_size = chunk_size.max(1);
    let len = content.len();
    (0..len)
        .step_by(chunk_size)
        .map(|start| content.slice(start..(start + chunk_size).min(len)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{stream, StreamExt};
    use std::sync::Mutex;

    #[test]
    fn test_chunked_splits_evenly_with_tail() {
        let chunks = chunked(Bytes::from_static(b"abcdefghij"), 4);
        assert_eq!(chunks.len(), 3);
        assert_eq!(&chunks[0][..], b"abcd");
        assert_eq!(&chunks[2][..], b"ij");
    }

    #[test]
    fn test_chunked_empty_body() {
        assert!(chunked(Bytes::new(), 4).is_empty());
    }

    #[tokio::test]
    async fn test_progress_stream_reports_cumulative_bytes() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let callback: ByteCallback = Arc::new(move |n| seen_clone.lock().unwrap().push(n));

        let chunks = chunked(Bytes::from(vec![0u8; 10]), 4);
        let inner = stream::iter(chunks.into_iter().map(Ok::<_, std::io::Error>));
        let mut progress = ProgressStream::new(inner, callback);

        let mut total = 0;
        while let Some(chunk) = progress.next().await {
            total += chunk.unwrap().len();
        }

        assert_eq!(total, 10);
        assert_eq!(*seen.lock().unwrap(), vec![4, 8, 10]);
    }
}
