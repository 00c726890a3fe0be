//! Hop-tagged diagnostics for child process stderr streams.
//!
//! Remote shells, agents, and key loaders all babble on stderr. Each
//! stream gets a background reader that forwards every line through
//! `tracing` with the owning hop as a field, so interleaved noise from a
//! hundred hops stays attributable.

use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Longest stderr line the pipe will carry before giving up on a stream.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Forward each line of `src` to the diagnostic stream, tagged with
/// `host`. The reader stops at EOF, on an oversized line (reported), or
/// when the scope trips.
pub fn tag_stderr<R>(scope: CancellationToken, host: &str, src: Option<R>)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let Some(src) = src else {
        return;
    };
    let host = host.to_string();

    tokio::spawn(async move {
        let mut lines = FramedRead::new(src, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
        loop {
            tokio::select! {
                _ = scope.cancelled() => return,
                line = lines.next() => match line {
                    Some(Ok(line)) => warn!(host = %host, "{line}"),
                    Some(Err(err)) => {
                        warn!(host = %host, "stderr stream: {err}");
                        return;
                    }
                    None => return,
                },
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn reader_stops_at_eof() {
        let (mut tx, rx) = tokio::io::duplex(256);
        tag_stderr(CancellationToken::new(), "hop-1", Some(rx));

        tx.write_all(b"line one\nline two\n").await.unwrap();
        drop(tx);

        // nothing to assert beyond "the task drains and exits";
        // give it a beat to finish reading
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn cancellation_unblocks_an_idle_stream() {
        let scope = CancellationToken::new();
        let (_tx, rx) = tokio::io::duplex(256);
        tag_stderr(scope.clone(), "hop-2", Some(rx));

        scope.cancel();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn absent_stream_is_a_no_op() {
        tag_stderr(
            CancellationToken::new(),
            "hop-3",
            None::<tokio::io::DuplexStream>,
        );
    }
}
