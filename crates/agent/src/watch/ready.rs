//! Ready — resolve when a regex matches the container's stdout.
//!
//! Game servers signal readiness with a well-known stdout line (e.g.
//! `Done (30.0s)! For help, type "help"`). The watcher tests the pattern
//! against every stdout chunk as it arrives. Matching is per-chunk, not
//! line-buffered: the readiness line is emitted atomically by the server's
//! logging path, so cross-chunk splits are not compensated for.

use std::time::Duration;

use grep_matcher::Matcher;
use grep_regex::{RegexMatcher, RegexMatcherBuilder};
use thiserror::Error;
use tokio_stream::StreamExt;

use crate::client::runtime::AttachStream;

#[derive(Error, Debug)]
pub enum WatchError {
    #[error("invalid readiness pattern: {0}")]
    InvalidPattern(String),
    #[error("deadline exceeded waiting for readiness")]
    DeadlineExceeded,
    #[error("stdout stream closed before readiness")]
    StreamClosed,
    #[error("stdout stream failed: {0}")]
    Stream(String),
}

/// Watches an already-opened stdout stream for a readiness pattern.
pub struct ReadyWatcher {
    stream: AttachStream,
    matcher: RegexMatcher,
}

impl std::fmt::Debug for ReadyWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadyWatcher").finish_non_exhaustive()
    }
}

impl ReadyWatcher {
    pub fn new(stream: AttachStream, pattern: &str) -> Result<Self, WatchError> {
        let matcher = RegexMatcherBuilder::new()
            .multi_line(false)
            .build(pattern)
            .map_err(|e| WatchError::InvalidPattern(e.to_string()))?;
        Ok(Self { stream, matcher })
    }

    /// Consume stdout chunks until the pattern matches or `deadline` fires.
    ///
    /// The deadline is fresh, not inherited from the caller's context, so a
    /// tight readiness timeout never aborts the enclosing job.
    pub async fn wait_for_match(mut self, deadline: Duration) -> Result<(), WatchError> {
        let consume = async {
            while let Some(chunk) = self.stream.next().await {
                let chunk = chunk.map_err(|e| WatchError::Stream(e.to_string()))?;
                if self.matcher.is_match(&chunk).unwrap_or(false) {
                    return Ok(());
                }
            }
            Err(WatchError::StreamClosed)
        };

        match tokio::time::timeout(deadline, consume).await {
            Ok(result) => result,
            Err(_) => Err(WatchError::DeadlineExceeded),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use crate::client::runtime::RuntimeError;

    /// Build a canned stdout stream: (delay_ms, chunk) pairs.
    fn chunk_stream(chunks: Vec<(u64, &str)>) -> AttachStream {
        let chunks: Vec<(u64, String)> = chunks
            .into_iter()
            .map(|(delay, data)| (delay, data.to_string()))
            .collect();
        let stream = async_stream::try_stream! {
            for (delay, data) in chunks {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                yield Bytes::from(data.into_bytes());
            }
        };
        Box::pin(stream)
    }

    fn failing_stream() -> AttachStream {
        let stream = async_stream::try_stream! {
            yield Bytes::from_static(b"starting up\n");
            Err(RuntimeError::StreamClosed)?;
        };
        Box::pin(stream)
    }

    #[tokio::test]
    async fn resolves_on_match() {
        let stream = chunk_stream(vec![
            (0, "Loading world...\n"),
            (5, "Done (30.0s)! For help, type \"help\"\n"),
        ]);
        let watcher = ReadyWatcher::new(stream, r"Done \([0-9.]+s\)!").unwrap();

        watcher
            .wait_for_match(Duration::from_secs(5))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn deadline_shorter_than_first_emission() {
        let stream = chunk_stream(vec![(500, "Done (1.0s)!\n")]);
        let watcher = ReadyWatcher::new(stream, r"Done").unwrap();

        let err = watcher
            .wait_for_match(Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, WatchError::DeadlineExceeded));
        assert!(err.to_string().contains("deadline exceeded"));
    }

    #[tokio::test]
    async fn stream_end_without_match() {
        let stream = chunk_stream(vec![(0, "only noise\n")]);
        let watcher = ReadyWatcher::new(stream, r"Done").unwrap();

        let err = watcher
            .wait_for_match(Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, WatchError::StreamClosed));
    }

    #[tokio::test]
    async fn stream_error_is_surfaced() {
        let watcher = ReadyWatcher::new(failing_stream(), r"Done").unwrap();

        let err = watcher
            .wait_for_match(Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, WatchError::Stream(_)));
    }

    #[tokio::test]
    async fn matching_is_per_chunk_not_across_chunks() {
        // The pattern is split across two chunks; per-chunk matching misses it.
        let stream = chunk_stream(vec![(0, "Do"), (5, "ne (1.0s)!")]);
        let watcher = ReadyWatcher::new(stream, r"Done").unwrap();

        let err = watcher
            .wait_for_match(Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, WatchError::StreamClosed));
    }

    #[tokio::test]
    async fn non_matching_chunks_are_skipped() {
        let stream = chunk_stream(vec![
            (0, "tick\n"),
            (5, "tick\n"),
            (5, "Done (2.5s)! For help, type \"help\"\n"),
        ]);
        let watcher = ReadyWatcher::new(stream, r"Done \([0-9.]+s\)!").unwrap();

        watcher
            .wait_for_match(Duration::from_secs(5))
            .await
            .unwrap();
    }

    #[test]
    fn invalid_pattern_rejected() {
        let stream = Box::pin(tokio_stream::empty()) as AttachStream;
        let err = ReadyWatcher::new(stream, "[invalid").unwrap_err();
        assert!(matches!(err, WatchError::InvalidPattern(_)));
    }
}
