//! Local executor: a bounded worker pool running commands under deadlines.
//!
//! `run` launches `spec.parallel` workers over one shared target channel.
//! Each worker templates the argv, starts the process in its own process
//! group, captures bounded stdout/stderr, enforces the per-target
//! deadline with a group SIGKILL, and emits one JSON result line. A
//! failing target never fails the run — only cancellation does.

use std::io::{self, Write};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use hopper_types::{ExecResult, Spec, SpecError, TARGET_TOKEN};

use crate::agent::AgentError;
use crate::sink::BoundedSink;

/// Errors that fail a whole run.
///
/// Per-target failures are recorded in the [`ExecResult`] instead.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Spec(#[from] SpecError),
    #[error(transparent)]
    Agent(#[from] AgentError),
    #[error("failed to start {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("waiting on remote shell: {0}")]
    Wait(#[source] io::Error),
    #[error("writing targets to remote shell: {0}")]
    Transport(#[source] io::Error),
    #[error("{host}: remote shell {status}")]
    Remote {
        host: String,
        status: std::process::ExitStatus,
    },
    #[error("worker task failed: {0}")]
    Join(String),
    #[error("run cancelled")]
    Cancelled,
}

/// Execute `spec` against every target drawn from `targets`.
///
/// One JSON line per target is written to `out`. Returns when the channel
/// closes and all workers have drained, or with [`RunError::Cancelled`]
/// once `scope` trips.
pub async fn run<W>(
    scope: CancellationToken,
    out: Arc<Mutex<W>>,
    spec: &Spec,
    targets: mpsc::Receiver<String>,
) -> Result<(), RunError>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    spec.validate()?;

    let targets = Arc::new(Mutex::new(targets));
    let mut workers = Vec::with_capacity(spec.parallel);

    for _ in 0..spec.parallel {
        let scope = scope.clone();
        let out = out.clone();
        let targets = targets.clone();
        let spec = spec.clone();

        workers.push(tokio::spawn(async move {
            loop {
                let target = tokio::select! {
                    _ = scope.cancelled() => return Err(RunError::Cancelled),
                    target = async { targets.lock().await.recv().await } => match target {
                        Some(target) => target,
                        None => return Ok(()),
                    },
                };

                let record = run_target(&scope, &spec, &target).await;
                emit(&out, &record).await;
            }
        }));
    }

    collect(scope, workers).await
}

/// Join a set of run tasks, preferring a real error over cancellation.
pub(crate) async fn collect(
    scope: CancellationToken,
    tasks: Vec<JoinHandle<Result<(), RunError>>>,
) -> Result<(), RunError> {
    let mut first_err = None;

    for task in tasks {
        let result = task
            .await
            .unwrap_or_else(|e| Err(RunError::Join(e.to_string())));
        if let Err(err) = result {
            if matches!(err, RunError::Cancelled) {
                continue;
            }
            if first_err.is_none() {
                scope.cancel();
                first_err = Some(err);
            }
        }
    }

    match first_err {
        Some(err) => Err(err),
        None if scope.is_cancelled() => Err(RunError::Cancelled),
        None => Ok(()),
    }
}

/// Run one target through the execution protocol, always producing a
/// record.
async fn run_target(scope: &CancellationToken, spec: &Spec, target: &str) -> ExecResult {
    let mut record = ExecResult::begin(target);

    let args: Vec<String> = spec
        .args
        .iter()
        .map(|arg| arg.replace(TARGET_TOKEN, target))
        .collect();

    debug!(command = %spec.command, ?args, %target, "starting");

    let mut cmd = Command::new(&spec.command);
    cmd.args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => {
            record.error = err.to_string();
            record.seal();
            return record;
        }
    };

    let stdout_pump = pump(child.stdout.take(), BoundedSink::new(spec.stdout_bytes));
    let stderr_pump = pump(child.stderr.take(), BoundedSink::new(spec.stderr_bytes));

    // Kill the whole process group when the deadline or the surrounding
    // scope trips first. `armed` guards against racing a normal exit.
    let armed = Arc::new(AtomicBool::new(true));
    let watcher = tokio::spawn({
        let scope = scope.clone();
        let armed = armed.clone();
        let timeout = spec.timeout;
        let pid = child.id();
        async move {
            tokio::select! {
                _ = scope.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {}
            }
            if armed.load(Ordering::SeqCst) {
                kill_group(pid);
            }
        }
    });

    match child.wait().await {
        Ok(status) => match status.code() {
            Some(code) => {
                record.exit_status = code;
                if code != 0 {
                    record.error = format!("exit status {code}");
                }
            }
            None => record.error = signal_text(status),
        },
        Err(err) => record.error = err.to_string(),
    }

    armed.store(false, Ordering::SeqCst);
    watcher.abort();

    if let Ok(sink) = stdout_pump.await {
        record.stdout = sink.into_string();
    }
    if let Ok(sink) = stderr_pump.await {
        record.stderr = sink.into_string();
    }

    record.seal();
    record
}

/// Drain a child stream into a bounded sink, returning the sink at EOF.
fn pump<R>(src: Option<R>, mut sink: BoundedSink) -> JoinHandle<BoundedSink>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(mut src) = src else { return sink };
        let mut chunk = [0u8; 8192];
        loop {
            match src.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let _ = sink.write(&chunk[..n]);
                }
            }
        }
        sink
    })
}

/// Best-effort emission of one JSON line; failures are swallowed so a
/// broken output never stalls the worker pool.
async fn emit<W>(out: &Arc<Mutex<W>>, record: &ExecResult)
where
    W: AsyncWrite + Unpin,
{
    let Ok(mut line) = serde_json::to_vec(record) else {
        return;
    };
    line.push(b'\n');
    let mut w = out.lock().await;
    let _ = w.write_all(&line).await;
}

#[cfg(unix)]
fn kill_group(pid: Option<u32>) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = pid {
        let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: Option<u32>) {}

#[cfg(unix)]
fn signal_text(status: std::process::ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;

    match status.signal() {
        Some(sig) => match nix::sys::signal::Signal::try_from(sig) {
            Ok(sig) => format!("signal: {}", sig.as_str()),
            Err(_) => format!("signal: {sig}"),
        },
        None => "process terminated without exit status".to_string(),
    }
}

#[cfg(not(unix))]
fn signal_text(_status: std::process::ExitStatus) -> String {
    "process terminated without exit status".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn echo_spec() -> Spec {
        Spec {
            command: "echo".to_string(),
            args: vec![TARGET_TOKEN.to_string()],
            timeout: Duration::from_secs(1),
            parallel: 1,
            stdout_bytes: 1024,
            stderr_bytes: 1024,
        }
    }

    fn channel_of(targets: &[&str]) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(targets.len().max(1));
        for t in targets {
            tx.try_send(t.to_string()).unwrap();
        }
        rx
    }

    #[tokio::test]
    async fn invalid_spec_fails_before_any_spawn() {
        let out = Arc::new(Mutex::new(Vec::<u8>::new()));
        let spec = Spec::default();
        let err = run(CancellationToken::new(), out, &spec, channel_of(&[]))
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::Spec(SpecError::NoCommand)));
    }

    #[tokio::test]
    async fn only_args_are_templated() {
        let out = Arc::new(Mutex::new(Vec::<u8>::new()));
        let spec = echo_spec();
        run(CancellationToken::new(), out.clone(), &spec, channel_of(&["x"]))
            .await
            .unwrap();

        let buf = out.lock().await.clone();
        let record: ExecResult = serde_json::from_slice(&buf).unwrap();
        assert_eq!(record.stdout, "x\n");
        assert_eq!(record.exit_status, 0);
        assert_eq!(record.error, "");
    }

    #[tokio::test]
    async fn spawn_failure_becomes_a_record_not_an_error() {
        let out = Arc::new(Mutex::new(Vec::<u8>::new()));
        let spec = Spec {
            command: "definitely-not-a-command-1234".to_string(),
            ..echo_spec()
        };
        run(CancellationToken::new(), out.clone(), &spec, channel_of(&["t"]))
            .await
            .unwrap();

        let buf = out.lock().await.clone();
        let record: ExecResult = serde_json::from_slice(&buf).unwrap();
        assert_eq!(record.target, "t");
        assert!(!record.error.is_empty());
    }

    #[tokio::test]
    async fn non_zero_exit_is_recorded() {
        let out = Arc::new(Mutex::new(Vec::<u8>::new()));
        let spec = Spec {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), "exit 3".to_string()],
            ..echo_spec()
        };
        run(CancellationToken::new(), out.clone(), &spec, channel_of(&["t"]))
            .await
            .unwrap();

        let buf = out.lock().await.clone();
        let record: ExecResult = serde_json::from_slice(&buf).unwrap();
        assert_eq!(record.exit_status, 3);
        assert_eq!(record.error, "exit status 3");
    }

    #[tokio::test]
    async fn cancelled_scope_returns_cancelled() {
        let scope = CancellationToken::new();
        scope.cancel();

        let out = Arc::new(Mutex::new(Vec::<u8>::new()));
        // keep the channel open so only cancellation can end the workers
        let (_tx, rx) = mpsc::channel::<String>(1);
        let err = run(scope, out, &echo_spec(), rx).await.unwrap_err();
        assert!(matches!(err, RunError::Cancelled));
    }

    #[tokio::test]
    async fn one_record_per_target_across_workers() {
        let out = Arc::new(Mutex::new(Vec::<u8>::new()));
        let spec = Spec {
            parallel: 4,
            ..echo_spec()
        };
        let targets: Vec<String> = (0..20).map(|i| format!("t{i}")).collect();
        let refs: Vec<&str> = targets.iter().map(String::as_str).collect();
        run(CancellationToken::new(), out.clone(), &spec, channel_of(&refs))
            .await
            .unwrap();

        let buf = out.lock().await.clone();
        let lines: Vec<_> = buf.split(|&b| b == b'\n').filter(|l| !l.is_empty()).collect();
        assert_eq!(lines.len(), 20);
        for line in lines {
            let record: ExecResult = serde_json::from_slice(line).unwrap();
            assert_eq!(record.exit_status, 0);
        }
    }
}
