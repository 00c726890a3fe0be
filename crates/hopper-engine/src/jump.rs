//! Fan-out coordinator: relay one target stream through N jump hosts.
//!
//! Each hop gets an auth agent, a remote shell running a nested engine,
//! a dispatcher feeding it targets over stdin, and a waiter that reaps
//! it. Result lines come back on the remote stdouts and are funnelled
//! into the shared output through per-hop [`LineSink`]s, so lines from
//! different hops never interleave.
//!
//! ```text
//!                      ┌─ agent ─ remote shell (hopper exec -p p) ─┐
//!   targets ──┬─ dispatch ─▶ stdin                stdout ─▶ LineSink ─┬─▶ out
//!             ├─ ...                                                 ┤
//!             └─ dispatch ─▶ stdin                stdout ─▶ LineSink ─┘
//! ```

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use hopper_types::{JumpSpec, Spec, HOP_TOKEN};

use crate::agent;
use crate::exec::{collect, RunError};
use crate::logpipe;
use crate::sink::LineSink;

/// Name the remote side invokes for the nested engine.
const ENGINE_BIN: &str = "hopper";

/// Execute `spec` against every target drawn from `targets`, relayed
/// through the configured jump hosts.
///
/// Aggregated result lines are written to `out`. Returns when every hop
/// has drained and exited; the first real error (agent, spawn, remote
/// shell failure, transport) tears the rest of the run down.
pub async fn run<W>(
    scope: CancellationToken,
    out: Arc<Mutex<W>>,
    spec: &JumpSpec,
    targets: mpsc::Receiver<String>,
) -> Result<(), RunError>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    spec.validate()?;

    let parallel = degraded_parallelism(spec.spec.parallel, spec.jump_hosts.len());
    let targets = Arc::new(Mutex::new(targets));
    let mut tasks: Vec<JoinHandle<Result<(), RunError>>> = Vec::new();

    for host in &spec.jump_hosts {
        match start_hop(&scope, &out, spec, parallel, host, &targets, &mut tasks).await {
            Ok(()) => {}
            Err(err) => {
                scope.cancel();
                for task in tasks {
                    let _ = task.await;
                }
                return Err(err);
            }
        }
    }

    collect(scope, tasks).await
}

/// Workers each hop runs locally: the absolute count split across hops,
/// never below one.
pub fn degraded_parallelism(parallel: usize, hosts: usize) -> usize {
    (parallel / hosts.max(1)).max(1)
}

/// Bring up agent, remote shell, dispatcher, and waiter for one hop.
#[allow(clippy::too_many_arguments)]
async fn start_hop<W>(
    scope: &CancellationToken,
    out: &Arc<Mutex<W>>,
    spec: &JumpSpec,
    parallel: usize,
    host: &str,
    targets: &Arc<Mutex<mpsc::Receiver<String>>>,
    tasks: &mut Vec<JoinHandle<Result<(), RunError>>>,
) -> Result<(), RunError>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (mut agent_child, sock) = agent::start(scope, host).await?;

    if let Some(key_file) = &spec.jump_hosts_key_file {
        if let Err(err) = agent::add_key(scope, host, &sock, key_file).await {
            let _ = agent_child.start_kill();
            return Err(err.into());
        }
    }

    let rendered = spec.jump_command.replace(HOP_TOKEN, host);
    let mut words = rendered.split(' ');
    let program = words.next().unwrap_or_default().to_string();
    let mut argv: Vec<String> = words.map(str::to_string).collect();
    argv.extend(nested_args(&spec.spec, parallel));

    debug!(%host, %program, ?argv, "starting remote shell");

    let mut cmd = Command::new(&program);
    cmd.args(&argv)
        .env_clear()
        .env(agent::AUTH_SOCK_VAR, &sock)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped());

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(source) => {
            let _ = agent_child.start_kill();
            return Err(RunError::Spawn {
                command: program,
                source,
            });
        }
    };

    logpipe::tag_stderr(scope.clone(), host, child.stderr.take());

    let stdin = child.stdin.take();
    let stdout = child.stdout.take();

    tasks.push(spawn_guarded(
        scope,
        dispatch(scope.clone(), targets.clone(), stdin),
    ));

    let pump = tokio::spawn(pump_lines(stdout, LineSink::new(out.clone())));
    tasks.push(spawn_guarded(
        scope,
        wait_remote(scope.clone(), host.to_string(), child, agent_child, pump),
    ));

    Ok(())
}

/// Spawn a hop task that trips the scope on failure, so sibling hops
/// never outlive the first real error.
fn spawn_guarded<F>(scope: &CancellationToken, fut: F) -> JoinHandle<Result<(), RunError>>
where
    F: std::future::Future<Output = Result<(), RunError>> + Send + 'static,
{
    let scope = scope.clone();
    tokio::spawn(async move {
        let result = fut.await;
        if result.is_err() {
            scope.cancel();
        }
        result
    })
}

/// The argv suffix that makes the remote shell run a nested engine with
/// the degraded parallelism. The trailing `--` keeps dashed command
/// arguments out of the nested flag parser.
fn nested_args(spec: &Spec, parallel: usize) -> Vec<String> {
    let mut args = vec![
        "--".to_string(),
        ENGINE_BIN.to_string(),
        "exec".to_string(),
        format!("--timeout={}", humantime::format_duration(spec.timeout)),
        format!("--parallel={parallel}"),
        format!("--stdout_bytes={}", spec.stdout_bytes),
        format!("--stderr_bytes={}", spec.stderr_bytes),
        "--".to_string(),
        spec.command.clone(),
    ];
    args.extend(spec.args.iter().cloned());
    args
}

/// Feed targets from the shared channel into one remote shell's stdin.
///
/// A broken pipe means the remote exited; its waiter reports that, so
/// dispatching just stops. Closing the pipe (dropping stdin) tells a
/// healthy remote there is no more work.
async fn dispatch(
    scope: CancellationToken,
    targets: Arc<Mutex<mpsc::Receiver<String>>>,
    stdin: Option<ChildStdin>,
) -> Result<(), RunError> {
    let Some(mut stdin) = stdin else {
        return Ok(());
    };

    loop {
        let target = tokio::select! {
            _ = scope.cancelled() => return Err(RunError::Cancelled),
            target = async { targets.lock().await.recv().await } => match target {
                Some(target) => target,
                None => return Ok(()),
            },
        };

        let line = format!("{target}\n");
        if let Err(err) = stdin.write_all(line.as_bytes()).await {
            if err.kind() == io::ErrorKind::BrokenPipe {
                return Ok(());
            }
            return Err(RunError::Transport(err));
        }
    }
}

/// Reap one remote shell: wait for exit (killing it on cancellation),
/// drain and flush its line sink, and terminate its agent.
async fn wait_remote<W>(
    scope: CancellationToken,
    host: String,
    mut child: Child,
    mut agent_child: Child,
    pump: JoinHandle<LineSink<W>>,
) -> Result<(), RunError>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut cancelled = false;
    let status = tokio::select! {
        status = child.wait() => status,
        _ = scope.cancelled() => {
            cancelled = true;
            let _ = child.start_kill();
            child.wait().await
        }
    };

    if let Ok(mut sink) = pump.await {
        let _ = sink.flush().await;
    }
    let _ = agent_child.start_kill();

    let status = status.map_err(RunError::Wait)?;
    if cancelled {
        return Err(RunError::Cancelled);
    }
    if !status.success() {
        return Err(RunError::Remote { host, status });
    }
    Ok(())
}

/// Copy remote stdout into its line sink until EOF, then hand the sink
/// back for the final flush.
async fn pump_lines<R, W>(src: Option<R>, mut sink: LineSink<W>) -> LineSink<W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let Some(mut src) = src else {
        return sink;
    };
    let mut chunk = [0u8; 8192];
    loop {
        match src.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if sink.write(&chunk[..n]).await.is_err() {
                    break;
                }
            }
        }
    }
    sink
}
