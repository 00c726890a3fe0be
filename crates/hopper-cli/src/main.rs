//! hopper CLI entry point.
//!
//! Usage:
//!   hopper exec [flags] -- <command> [args...]   # run commands against stdin targets
//!   hopper freq <mode> [--json] [bucket]         # histogram over exec results
//!
//! `exec` reads one target per line from stdin, substitutes it for `{.T}`
//! in the command arguments, and prints one JSON result per line. With
//! `--jump_hosts` the run is relayed through jump hosts, each running a
//! nested hopper.

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use hopper_engine::{exec, freq, jump, read_targets, FileServer, GroupBy, ServeError};
use hopper_types::{JumpSpec, LineSet, Spec};

fn main() -> ExitCode {
    // Diagnostics go to stderr; stdout carries nothing but result lines.
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:?}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<ExitCode> {
    let args: Vec<String> = env::args().collect();

    match args.get(1).map(|s| s.as_str()) {
        None | Some("--help" | "-h") => {
            print_help();
            Ok(ExitCode::SUCCESS)
        }

        Some("--version" | "-V") => {
            println!("hopper {}", env!("CARGO_PKG_VERSION"));
            Ok(ExitCode::SUCCESS)
        }

        Some("exec") => run_exec(&args[2..]),

        Some("freq") => run_freq(&args[2..]),

        Some(unknown) => {
            eprintln!("Unknown command: {unknown}");
            eprintln!("Run 'hopper --help' for usage.");
            Ok(ExitCode::FAILURE)
        }
    }
}

fn print_help() {
    println!(
        r#"hopper v{} — parallel command execution over stdin targets

Usage:
  hopper exec [flags] -- <command> [args...]
  hopper freq <stdout|stderr|exitstatus|duration> [--json] [bucket]

Commands:
  exec    Compose and execute commands in parallel, one per input line
  freq    Print frequency of events from hopper exec JSON output

Options:
  -h, --help       Show this help
  -V, --version    Show version

Examples:
  echo -ne 'hello\nworld\n' | hopper exec -- echo {{.T}}
  cat hosts.txt | hopper exec -p 50 -- ssh user@{{.T}} -- hostid
  cat hosts.txt | hopper exec -j hops.txt -k hop.key -- ssh user@{{.T}} -- hostid
  cat results.json | hopper freq exitstatus
"#,
        env!("CARGO_PKG_VERSION")
    );
}

fn print_exec_help() {
    println!(
        r#"hopper exec — execute parallel commands from standard input

Each input line is a target; `{{.T}}` in the command arguments is replaced
with it. One JSON result is printed per execution.

With --jump_hosts, hopper opens a remote shell to each jump host and runs
a nested hopper there with the same command, piping a share of its own
stdin to each hop and merging their result streams. Each hop gets its own
auth agent (a shared agent throttles highly parallel runs); the key given
with --jump_key is loaded into every agent. The --parallel value is
absolute: each hop runs parallel/hops workers, at least one.

Usage:
  hopper exec [flags] -- <command> [args...]

Flags:
  -t, --timeout <dur>       timeout of each execution (default 1m)
  -p, --parallel <n>        number of parallel executions (default 1)
      --stdout_bytes <n>    bytes to keep from each stdout (default 4096)
      --stderr_bytes <n>    bytes to keep from each stderr (default 4096)
  -e, --exclude <file>      target and jump host exclusion list, one per line
  -j, --jump_hosts <file>   jump hosts, one per line
  -k, --jump_key <file>     key to load into each hop's auth agent
      --jump_cmd <tmpl>     remote shell template, {{.J}} is the hop
                            (default "{}")
  -f, --file <origin>       serve a local file or a remote host:port blob
                            over TCP; whole content is cached in memory
  -l, --address <addr>      file server bind address (default localhost:5050)
"#,
        hopper_types::DEFAULT_JUMP_COMMAND
    );
}

fn print_freq_help() {
    println!(
        r#"hopper freq — frequency of events from hopper exec JSON output

Usage:
  hopper freq stdout     [--json] < results.json
  hopper freq stderr     [--json] < results.json
  hopper freq exitstatus [--json] < results.json
  hopper freq duration   [--json] <bucket> < results.json

Examples:
  echo hello | hopper exec -- echo {{.T}} | hopper freq exitstatus
  for x in 1 2 3; do echo $x; done | hopper exec -p 3 -- sleep {{.T}} | hopper freq duration 1s
"#
    );
}

/// Everything `hopper exec` accepts, with the defaults filled in.
#[derive(Debug, Clone)]
struct ExecArgs {
    spec: JumpSpec,
    exclude_file: Option<PathBuf>,
    jump_hosts_file: Option<PathBuf>,
    file_origin: Option<String>,
    serve_address: String,
}

impl Default for ExecArgs {
    fn default() -> Self {
        Self {
            spec: JumpSpec {
                spec: Spec {
                    command: String::new(),
                    args: Vec::new(),
                    timeout: Duration::from_secs(60),
                    parallel: 1,
                    stdout_bytes: 4 * 1024,
                    stderr_bytes: 4 * 1024,
                },
                ..JumpSpec::default()
            },
            exclude_file: None,
            jump_hosts_file: None,
            file_origin: None,
            serve_address: "localhost:5050".to_string(),
        }
    }
}

/// Parse exec flags. `Ok(None)` means help was requested.
fn parse_exec_args(args: &[String]) -> Result<Option<ExecArgs>> {
    let mut parsed = ExecArgs::default();
    let mut command: Vec<String> = Vec::new();

    let mut i = 0;
    while i < args.len() {
        let arg = &args[i];
        if arg == "--" {
            command = args[i + 1..].to_vec();
            break;
        }
        if !arg.starts_with('-') {
            command = args[i..].to_vec();
            break;
        }

        let (name, inline) = match arg.split_once('=') {
            Some((name, v)) => (name, Some(v.to_string())),
            None => (arg.as_str(), None),
        };

        match name {
            "-h" | "--help" => return Ok(None),
            "-t" | "--timeout" => {
                let v = value(args, &mut i, inline, name)?;
                parsed.spec.spec.timeout = humantime::parse_duration(&v)
                    .with_context(|| format!("invalid timeout {v:?}"))?;
            }
            "-p" | "--parallel" => {
                let v = value(args, &mut i, inline, name)?;
                parsed.spec.spec.parallel =
                    v.parse().with_context(|| format!("invalid parallel {v:?}"))?;
            }
            "--stdout_bytes" => {
                let v = value(args, &mut i, inline, name)?;
                parsed.spec.spec.stdout_bytes = v
                    .parse()
                    .with_context(|| format!("invalid stdout_bytes {v:?}"))?;
            }
            "--stderr_bytes" => {
                let v = value(args, &mut i, inline, name)?;
                parsed.spec.spec.stderr_bytes = v
                    .parse()
                    .with_context(|| format!("invalid stderr_bytes {v:?}"))?;
            }
            "--jump_cmd" => parsed.spec.jump_command = value(args, &mut i, inline, name)?,
            "-j" | "--jump_hosts" => {
                parsed.jump_hosts_file = Some(value(args, &mut i, inline, name)?.into());
            }
            "-k" | "--jump_key" => {
                parsed.spec.jump_hosts_key_file = Some(value(args, &mut i, inline, name)?.into());
            }
            "-e" | "--exclude" => {
                parsed.exclude_file = Some(value(args, &mut i, inline, name)?.into());
            }
            "-f" | "--file" => parsed.file_origin = Some(value(args, &mut i, inline, name)?),
            "-l" | "--address" => parsed.serve_address = value(args, &mut i, inline, name)?,
            unknown => bail!("unknown exec option: {unknown}"),
        }
        i += 1;
    }

    if let Some((cmd, rest)) = command.split_first() {
        parsed.spec.spec.command = cmd.clone();
        parsed.spec.spec.args = rest.to_vec();
    }
    Ok(Some(parsed))
}

/// Take a flag value: inline (`--flag=v`) or the next argument.
fn value(args: &[String], i: &mut usize, inline: Option<String>, name: &str) -> Result<String> {
    if let Some(v) = inline {
        return Ok(v);
    }
    *i += 1;
    args.get(*i)
        .cloned()
        .with_context(|| format!("{name} requires a value"))
}

fn run_exec(args: &[String]) -> Result<ExitCode> {
    let Some(parsed) = parse_exec_args(args)? else {
        print_exec_help();
        return Ok(ExitCode::SUCCESS);
    };
    if parsed.spec.spec.command.is_empty() {
        print_exec_help();
        return Ok(ExitCode::FAILURE);
    }

    let exclude = match &parsed.exclude_file {
        Some(path) => LineSet::from_file(path)
            .with_context(|| format!("reading exclusion list {}", path.display()))?,
        None => LineSet::new(),
    };

    let mut spec = parsed.spec.clone();
    let rt = tokio::runtime::Runtime::new()?;

    rt.block_on(async {
        let scope = CancellationToken::new();
        {
            let scope = scope.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    scope.cancel();
                }
            });
        }

        if let Some(origin) = &parsed.file_origin {
            let server = FileServer::new(origin, &parsed.serve_address).await?;
            let (addr, mut errs) = server.serve(scope.clone()).await?;
            debug!(%addr, "file server up");

            let scope = scope.clone();
            tokio::spawn(async move {
                while let Some(err) = errs.recv().await {
                    match err {
                        ServeError::ConnWrite(_) => warn!("file server: {err}"),
                        fatal => {
                            error!("file server: {fatal}");
                            scope.cancel();
                        }
                    }
                }
            });
        }

        let targets = read_targets(scope.clone(), tokio::io::stdin(), exclude.clone());
        let out = Arc::new(Mutex::new(tokio::io::stdout()));

        let result = match &parsed.jump_hosts_file {
            None => exec::run(scope.clone(), out.clone(), &spec.spec, targets).await,
            Some(path) => {
                let mut hosts = LineSet::from_file(path)
                    .with_context(|| format!("reading jump hosts {}", path.display()))?;
                hosts.remove_all(&exclude);
                spec.jump_hosts = hosts.into_iter().collect();
                jump::run(scope.clone(), out.clone(), &spec, targets).await
            }
        };

        out.lock().await.flush().await?;
        scope.cancel();
        result.map_err(anyhow::Error::from)
    })?;

    Ok(ExitCode::SUCCESS)
}

fn run_freq(args: &[String]) -> Result<ExitCode> {
    let mut json = false;
    let mut rest: Vec<&String> = Vec::new();
    for arg in args {
        match arg.as_str() {
            "--json" => json = true,
            "-h" | "--help" => {
                print_freq_help();
                return Ok(ExitCode::SUCCESS);
            }
            _ => rest.push(arg),
        }
    }

    let Some(mode) = rest.first() else {
        print_freq_help();
        return Ok(ExitCode::FAILURE);
    };

    let group = match mode.as_str() {
        "stdout" => GroupBy::Stdout,
        "stderr" => GroupBy::Stderr,
        "exitstatus" => GroupBy::ExitStatus,
        "duration" => {
            let bucket = rest
                .get(1)
                .context("freq duration needs a bucket, e.g. 5s")?;
            GroupBy::Duration(
                humantime::parse_duration(bucket)
                    .with_context(|| format!("invalid bucket {bucket:?}"))?,
            )
        }
        unknown => bail!("unknown freq mode: {unknown}"),
    };

    let stdin = std::io::stdin();
    let items = freq::read(stdin.lock(), group).context("reading results")?;

    let mut stdout = std::io::stdout().lock();
    if json {
        freq::encode_json(&mut stdout, &items)?;
    } else {
        freq::encode_wide(&mut stdout, &items)?;
    }
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn exec_defaults_match_the_documented_surface() {
        let parsed = parse_exec_args(&args(&["--", "echo"])).unwrap().unwrap();
        let s = &parsed.spec.spec;
        assert_eq!(s.command, "echo");
        assert_eq!(s.timeout, Duration::from_secs(60));
        assert_eq!(s.parallel, 1);
        assert_eq!(s.stdout_bytes, 4096);
        assert_eq!(s.stderr_bytes, 4096);
        assert_eq!(parsed.spec.jump_command, hopper_types::DEFAULT_JUMP_COMMAND);
        assert_eq!(parsed.serve_address, "localhost:5050");
    }

    #[test]
    fn exec_flags_build_the_spec() {
        let parsed = parse_exec_args(&args(&[
            "--timeout=2s",
            "--parallel",
            "3",
            "--",
            "echo",
            "{.T}",
        ]))
        .unwrap()
        .unwrap();
        let s = &parsed.spec.spec;
        assert_eq!(s.timeout, Duration::from_secs(2));
        assert_eq!(s.parallel, 3);
        assert_eq!(s.command, "echo");
        assert_eq!(s.args, vec!["{.T}".to_string()]);
    }

    #[test]
    fn short_flags_are_accepted() {
        let parsed = parse_exec_args(&args(&[
            "-t", "5s", "-p", "10", "-j", "hops.txt", "-k", "hop.key", "-e", "skip.txt",
            "--", "ssh", "user@{.T}",
        ]))
        .unwrap()
        .unwrap();
        assert_eq!(parsed.spec.spec.timeout, Duration::from_secs(5));
        assert_eq!(parsed.spec.spec.parallel, 10);
        assert_eq!(parsed.jump_hosts_file, Some(PathBuf::from("hops.txt")));
        assert_eq!(
            parsed.spec.jump_hosts_key_file,
            Some(PathBuf::from("hop.key"))
        );
        assert_eq!(parsed.exclude_file, Some(PathBuf::from("skip.txt")));
        assert_eq!(parsed.spec.spec.command, "ssh");
    }

    #[test]
    fn double_dash_keeps_dashed_command_args() {
        let parsed = parse_exec_args(&args(&["--", "grep", "-c", "--", "x"]))
            .unwrap()
            .unwrap();
        assert_eq!(parsed.spec.spec.command, "grep");
        assert_eq!(
            parsed.spec.spec.args,
            vec!["-c".to_string(), "--".to_string(), "x".to_string()]
        );
    }

    #[test]
    fn bare_command_without_double_dash_works() {
        let parsed = parse_exec_args(&args(&["-p", "2", "echo", "hi"]))
            .unwrap()
            .unwrap();
        assert_eq!(parsed.spec.spec.command, "echo");
        assert_eq!(parsed.spec.spec.args, vec!["hi".to_string()]);
    }

    #[test]
    fn unknown_flags_are_rejected() {
        assert!(parse_exec_args(&args(&["--bogus", "--", "echo"])).is_err());
    }

    #[test]
    fn missing_value_is_an_error() {
        assert!(parse_exec_args(&args(&["--timeout"])).is_err());
    }

    #[test]
    fn help_flag_short_circuits() {
        assert!(parse_exec_args(&args(&["--help"])).unwrap().is_none());
    }
}
