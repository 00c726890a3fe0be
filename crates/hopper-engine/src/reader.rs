//! Target reader: turns a byte stream into the shared target channel.

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use hopper_types::LineSet;

/// Read targets from `src`, one per line, into the returned channel.
///
/// Empty lines, lines starting with `#`, and lines in `exclude` are
/// skipped. The channel is unbuffered (capacity 1) and closes when `src`
/// reaches EOF or the scope is cancelled.
pub fn read_targets<R>(
    scope: CancellationToken,
    src: R,
    exclude: LineSet,
) -> mpsc::Receiver<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(1);

    tokio::spawn(async move {
        let mut lines = BufReader::new(src).lines();
        loop {
            let line = tokio::select! {
                _ = scope.cancelled() => return,
                line = lines.next_line() => match line {
                    Ok(Some(line)) => line,
                    Ok(None) | Err(_) => return,
                },
            };

            if line.is_empty() || line.starts_with('#') || exclude.contains(&line) {
                continue;
            }

            tokio::select! {
                _ = scope.cancelled() => return,
                sent = tx.send(line) => {
                    if sent.is_err() {
                        return;
                    }
                }
            }
        }
    });

    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn drain(mut rx: mpsc::Receiver<String>) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(t) = rx.recv().await {
            out.push(t);
        }
        out
    }

    #[tokio::test]
    async fn filters_blanks_comments_and_exclusions() {
        let mut exclude = LineSet::new();
        exclude.insert("c");

        let rx = read_targets(CancellationToken::new(), &b"a\n\n#b\nc\n"[..], exclude);
        assert_eq!(drain(rx).await, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn channel_closes_on_eof() {
        let rx = read_targets(CancellationToken::new(), &b"one\ntwo\n"[..], LineSet::new());
        assert_eq!(drain(rx).await.len(), 2);
    }

    #[tokio::test]
    async fn cancelled_scope_closes_the_channel() {
        let scope = CancellationToken::new();
        scope.cancel();

        // endless reader; only cancellation can end the task
        let (client, _server) = tokio::io::duplex(64);
        let mut rx = read_targets(scope, client, LineSet::new());
        assert!(rx.recv().await.is_none());
    }
}
