//! Auth agent supervision for fan-out runs.
//!
//! Every jump host gets a dedicated `ssh-agent`: a shared agent becomes
//! the bottleneck once parallelism climbs into the tens of thousands of
//! sessions. The agent runs in foreground single-line mode (`-D -s`); its
//! first stdout line names the socket the remote shell must use.

use std::io;
use std::path::Path;
use std::process::Stdio;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::logpipe;

/// Program hosting credentials for one hop.
pub const AGENT_PROGRAM: &str = "ssh-agent";

/// Program that loads a key into a running agent.
pub const ADD_KEY_PROGRAM: &str = "ssh-add";

/// Environment variable naming the agent socket, for the agent's children.
pub const AUTH_SOCK_VAR: &str = "SSH_AUTH_SOCK";

/// Failures bringing up or feeding an auth agent. All of them abort the
/// surrounding fan-out run.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("scope cancelled before agent was ready")]
    Cancelled,
    #[error("agent terminated before its socket appeared")]
    Terminated,
    #[error("unexpected output from agent: {0:?}")]
    Handshake(String),
    #[error("cannot stat {AUTH_SOCK_VAR} {path:?}: {source}")]
    Stat {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("ssh-add exited with {status}")]
    AddKey { status: std::process::ExitStatus },
}

/// Start an auth agent for `host` and wait for its handshake.
///
/// Returns the child handle (the caller owns termination) and the socket
/// path, which is verified to exist. Fails if the scope trips, the agent
/// dies, or its first line is not a `SSH_AUTH_SOCK=<value>` pair.
pub async fn start(scope: &CancellationToken, host: &str) -> Result<(Child, String), AgentError> {
    let mut cmd = Command::new(AGENT_PROGRAM);
    cmd.args(["-D", "-s"])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    launch(scope, host, cmd).await
}

/// Spawn `cmd` as the agent process and run the handshake protocol.
async fn launch(
    scope: &CancellationToken,
    host: &str,
    mut cmd: Command,
) -> Result<(Child, String), AgentError> {
    let mut child = cmd.spawn().map_err(|source| AgentError::Spawn {
        program: AGENT_PROGRAM,
        source,
    })?;

    logpipe::tag_stderr(scope.clone(), host, child.stderr.take());

    let (tx, rx) = oneshot::channel();
    tokio::spawn(handshake(child.stdout.take(), tx));

    let sock = tokio::select! {
        _ = scope.cancelled() => {
            let _ = child.start_kill();
            return Err(AgentError::Cancelled);
        }
        parsed = rx => match parsed {
            Ok(Ok(sock)) => sock,
            Ok(Err(err)) => {
                let _ = child.start_kill();
                return Err(err);
            }
            // reader gone without a line: the agent died on us
            Err(_) => {
                let _ = child.start_kill();
                return Err(AgentError::Terminated);
            }
        },
    };

    debug!(%host, %sock, "agent ready");
    Ok((child, sock))
}

/// Accumulate stdout until the first newline, parse that line, then keep
/// draining so the agent can never block on a full pipe.
async fn handshake<R>(src: Option<R>, tx: oneshot::Sender<Result<String, AgentError>>)
where
    R: AsyncRead + Unpin,
{
    let Some(mut src) = src else {
        return;
    };

    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    let first_line = loop {
        match src.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                if let Some(idx) = buf.iter().position(|&b| b == b'\n') {
                    break String::from_utf8_lossy(&buf[..idx]).into_owned();
                }
            }
        }
    };

    let _ = tx.send(parse_handshake(&first_line));

    loop {
        match src.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}

/// Parse `SSH_AUTH_SOCK=<value>; <tail>` and stat the socket.
fn parse_handshake(line: &str) -> Result<String, AgentError> {
    let Some((key, rest)) = line.split_once('=') else {
        return Err(AgentError::Handshake(line.to_string()));
    };
    if key != AUTH_SOCK_VAR {
        return Err(AgentError::Handshake(line.to_string()));
    }

    let sock = rest.split_once(';').map_or(rest, |(sock, _)| sock);
    match std::fs::metadata(sock) {
        Ok(_) => Ok(sock.to_string()),
        Err(source) => Err(AgentError::Stat {
            path: sock.to_string(),
            source,
        }),
    }
}

/// Load `key_file` into the agent behind `sock`.
///
/// The child sees exactly one environment variable: the agent socket. Its
/// stderr is tagged with the hop so key problems are attributable.
pub async fn add_key(
    scope: &CancellationToken,
    host: &str,
    sock: &str,
    key_file: &Path,
) -> Result<(), AgentError> {
    let mut cmd = Command::new(ADD_KEY_PROGRAM);
    cmd.arg(key_file)
        .env_clear()
        .env(AUTH_SOCK_VAR, sock)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(|source| AgentError::Spawn {
        program: ADD_KEY_PROGRAM,
        source,
    })?;

    logpipe::tag_stderr(scope.clone(), host, child.stderr.take());

    let status = tokio::select! {
        _ = scope.cancelled() => {
            let _ = child.start_kill();
            return Err(AgentError::Cancelled);
        }
        status = child.wait() => status.map_err(|source| AgentError::Spawn {
            program: ADD_KEY_PROGRAM,
            source,
        })?,
    };

    if !status.success() {
        return Err(AgentError::AddKey { status });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// A scripted agent: prints a handshake line naming `sock`, then
    /// lingers like the real thing.
    fn fake_agent(sock: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(format!(
                "echo '{AUTH_SOCK_VAR}={sock}; export {AUTH_SOCK_VAR}'; sleep 5"
            ))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }

    #[tokio::test]
    async fn handshake_yields_an_existing_socket_path() {
        let sock = tempfile::NamedTempFile::new().unwrap();
        let path = sock.path().to_str().unwrap().to_string();

        let scope = CancellationToken::new();
        let (mut child, got) = launch(&scope, "localhost", fake_agent(&path))
            .await
            .unwrap();

        assert_eq!(got, path);
        // killing is idempotent
        child.start_kill().unwrap();
        let _ = child.start_kill();
        let _ = child.wait().await;
    }

    #[tokio::test]
    async fn missing_socket_is_a_stat_error() {
        let scope = CancellationToken::new();
        let err = launch(
            &scope,
            "localhost",
            fake_agent("/nonexistent/agent.sock"),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AgentError::Stat { .. }));
    }

    #[tokio::test]
    async fn garbage_handshake_is_rejected() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg("echo 'not a handshake'; sleep 5")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let scope = CancellationToken::new();
        let err = launch(&scope, "localhost", cmd).await.unwrap_err();
        assert!(matches!(err, AgentError::Handshake(_)));
    }

    #[tokio::test]
    async fn agent_dying_before_its_line_is_terminated() {
        let mut cmd = Command::new("true");
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let scope = CancellationToken::new();
        let err = launch(&scope, "localhost", cmd).await.unwrap_err();
        assert!(matches!(err, AgentError::Terminated));
    }

    #[tokio::test]
    async fn cancelled_scope_wins_over_a_slow_agent() {
        let mut cmd = Command::new("sleep");
        cmd.arg("5")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let scope = CancellationToken::new();
        let launched = launch(&scope, "localhost", cmd);
        tokio::pin!(launched);

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(50)) => scope.cancel(),
            _ = &mut launched => panic!("agent should still be waiting"),
        }
        let err = launched.await.unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));
    }

    #[test]
    fn parse_rejects_wrong_key() {
        let err = parse_handshake("WRONG_VAR=/tmp/x; tail").unwrap_err();
        assert!(matches!(err, AgentError::Handshake(_)));
    }

    #[test]
    fn parse_takes_value_up_to_semicolon() {
        let sock = tempfile::NamedTempFile::new().unwrap();
        let path = sock.path().to_str().unwrap();
        let line = format!("{AUTH_SOCK_VAR}={path}; export {AUTH_SOCK_VAR}");

        assert_eq!(parse_handshake(&line).unwrap(), path);
    }
}
