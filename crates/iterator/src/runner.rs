//! Runner: spawns the child process for a command, forwards its output to
//! the logger, waits for exit and handles resolve-time cancellation.

use std::process::Stdio;

use nix::sys::signal::kill;
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::command::{Command, CommandResult, ResultKind};
use crate::Error;

/// Execute the command, potentially signalling it if the alert that
/// triggered it resolves.
///
/// Tagged results are emitted on `out`; `done` fires once the run has fully
/// completed. Both close exactly once. The cancellation token is acted upon
/// at most once per run: if it closes while the child is alive the
/// resolved-signal is delivered immediately and the child is then left to
/// run to completion; a close that is only observed after exit still
/// attempts delivery, and the (expected) failure is reported as SigFail.
pub async fn run(
    cmd: Command,
    env: Vec<(String, String)>,
    cancel: CancellationToken,
    out: mpsc::Sender<CommandResult>,
    done: oneshot::Sender<()>,
) {
    for (k, v) in &env {
        info!("Running command with environment variable: {}={}", k, v);
    }

    let mut child = match tokio::process::Command::new(&cmd.cmd)
        .args(&cmd.args)
        .envs(env)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            let _ = out
                .send(CommandResult {
                    kind: ResultKind::FAIL,
                    err: Some(Error::Execution(format!(
                        "failed to start command {}: {}",
                        cmd, e
                    ))),
                })
                .await;
            drop(out);
            let _ = done.send(());
            return;
        }
    };

    let pid = child.id();
    forward_output(&cmd, &mut child);

    let mut signalled = false;
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            _ = cancel.cancelled(), if !signalled => {
                signalled = true;
                let _ = out.send(resolve_action(&cmd, pid)).await;
            }
        }
    };

    let result = match status {
        Ok(status) if status.success() => CommandResult {
            kind: ResultKind::OK,
            err: None,
        },
        Ok(status) => CommandResult {
            kind: ResultKind::FAIL,
            err: Some(Error::Execution(format!(
                "command {} exited with {}",
                cmd, status
            ))),
        },
        Err(e) => CommandResult {
            kind: ResultKind::FAIL,
            err: Some(Error::Execution(format!(
                "failed waiting for command {}: {}",
                cmd, e
            ))),
        },
    };
    let _ = out.send(result).await;

    // A close that raced with process exit is still observed once.
    if !signalled && cancel.is_cancelled() {
        let _ = out.send(resolve_action(&cmd, pid)).await;
    }

    drop(out);
    let _ = done.send(());
}

/// React to the cancellation token closing: deliver the resolved-signal,
/// or skip it when the command ignores resolved notifications.
fn resolve_action(cmd: &Command, pid: Option<u32>) -> CommandResult {
    if cmd.should_ignore_resolved() {
        return CommandResult {
            kind: ResultKind::SKIP_SIG,
            err: None,
        };
    }

    let sig = match cmd.parse_signal() {
        Ok(sig) => sig,
        Err(e) => {
            return CommandResult {
                kind: ResultKind::SIG_FAIL,
                err: Some(Error::Signal(format!(
                    "can't use signal {} to notify command {}: {}",
                    cmd.resolved_signal, cmd, e
                ))),
            }
        }
    };

    let Some(pid) = pid else {
        return CommandResult {
            kind: ResultKind::SIG_FAIL,
            err: Some(Error::Signal(format!(
                "no pid to deliver {} to for command {}",
                sig, cmd
            ))),
        };
    };

    match kill(Pid::from_raw(pid as i32), sig) {
        Ok(()) => CommandResult {
            kind: ResultKind::SIG_OK,
            err: None,
        },
        Err(e) => CommandResult {
            kind: ResultKind::SIG_FAIL,
            err: Some(Error::Signal(format!(
                "failed sending {} to pid {} for command {}: {}",
                sig, pid, cmd, e
            ))),
        },
    }
}

/// Pipe child stdout/stderr line-by-line into the logger. Stderr output is
/// logged at error level but does not by itself classify the run as failed.
fn forward_output(cmd: &Command, child: &mut tokio::process::Child) {
    let name = cmd.cmd.clone();
    if let Some(stdout) = child.stdout.take() {
        let name = name.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                info!("[{}] {}", name, line);
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                error!("[{}] {}", name, line);
            }
        });
    }
}
