// CLI subprocess discipline
// Scoped acquisition of the child handle with guaranteed release on every
// exit path: normal completion, stage timeout, idle timeout, cancellation,
// and parse failure. Release sends a graceful terminate, waits 2s, then
// force-kills.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_stream::try_stream;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use cadence_core::{CadenceError, Result};

use crate::{ProviderEvent, ProviderStream};

/// Interval between liveness pulses while the CLI produces no terminal event.
const PROGRESS_PULSE: Duration = Duration::from_secs(30);
/// Grace period between terminate and force-kill.
const KILL_GRACE: Duration = Duration::from_secs(2);
/// Non-zero exits inside this window with no output are treated as transient.
const FAST_FAIL_WINDOW: Duration = Duration::from_secs(2);
/// Stderr tail retained for error messages.
const STDERR_TAIL_CHARS: usize = 2048;

pub const TRANSIENT_PREFIX: &str = "transient:";

/// Whether a provider error message describes a retryable transient failure.
pub fn is_transient(message: &str) -> bool {
    message.starts_with(TRANSIENT_PREFIX) || message.contains("network timeout")
}

/// One CLI invocation, fully assembled by an adapter.
#[derive(Debug, Clone, Default)]
pub struct CliInvocation {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Written to stdin, then stdin is closed.
    pub prompt: String,
    pub stage_timeout_ms: u64,
}

/// Terminate the child gracefully, then force-kill after the grace period.
pub async fn shutdown_child(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SIGTERM lets the CLI flush and drop provider sessions cleanly.
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }
    if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_err() {
        let _ = child.start_kill();
        let _ = child.wait().await;
    }
}

/// Spawn the CLI and stream parsed events. `parse` maps one stdout line to
/// zero or more events.
pub fn stream_cli<F>(
    invocation: CliInvocation,
    cancel: CancellationToken,
    parse: F,
) -> ProviderStream
where
    F: Fn(&str) -> Vec<ProviderEvent> + Send + Sync + 'static,
{
    let stream = try_stream! {
        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &invocation.env {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|err| {
            CadenceError::Provider(format!(
                "{TRANSIENT_PREFIX} failed to spawn '{}': {err}",
                invocation.program
            ))
        })?;
        let pid = child.id();
        let started = Instant::now();
        tracing::debug!(
            "spawned {} (pid {:?}, stage timeout {}ms)",
            invocation.program,
            pid,
            invocation.stage_timeout_ms
        );

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(invocation.prompt.as_bytes())
                .await
                .map_err(|err| CadenceError::Provider(format!("stdin write failed: {err}")))?;
            // Closing stdin tells the CLI the prompt is complete.
            drop(stdin);
        }

        let stdout = child.stdout.take().ok_or_else(|| {
            CadenceError::Provider("child stdout was not captured".to_string())
        })?;
        let mut lines = BufReader::new(stdout).lines();

        // Stderr is always drained so the child cannot block on a full pipe.
        let stderr_tail: Arc<Mutex<String>> = Arc::new(Mutex::new(String::new()));
        if let Some(mut stderr) = child.stderr.take() {
            let tail = stderr_tail.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                while let Ok(n) = stderr.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                    let mut guard = tail.lock().await;
                    guard.push_str(&String::from_utf8_lossy(&buf[..n]));
                    if guard.len() > STDERR_TAIL_CHARS {
                        let cut = guard.len() - STDERR_TAIL_CHARS;
                        guard.drain(0..cut);
                    }
                }
            });
        }

        let stage_timeout = Duration::from_millis(invocation.stage_timeout_ms.max(1));
        let idle_timeout = stage_timeout * 2 / 3;
        let deadline = started + stage_timeout;
        let mut pulse = tokio::time::interval_at(started + PROGRESS_PULSE, PROGRESS_PULSE);
        let mut produced_output = false;

        // The select! lives outside the yield points: async-stream cannot
        // expand `yield` inside nested macro invocations.
        enum LoopEvent {
            Cancelled,
            StageTimeout,
            Pulse,
            Line(Option<String>),
            IdleTimeout,
            ReadError(std::io::Error),
        }

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => LoopEvent::Cancelled,
                _ = tokio::time::sleep_until(deadline) => LoopEvent::StageTimeout,
                _ = pulse.tick() => LoopEvent::Pulse,
                line = tokio::time::timeout(idle_timeout, lines.next_line()) => match line {
                    Err(_) => LoopEvent::IdleTimeout,
                    Ok(Ok(line)) => LoopEvent::Line(line),
                    Ok(Err(err)) => LoopEvent::ReadError(err),
                },
            };
            match event {
                LoopEvent::Cancelled => {
                    shutdown_child(&mut child).await;
                    return;
                }
                LoopEvent::StageTimeout => {
                    shutdown_child(&mut child).await;
                    Err(CadenceError::Provider(format!(
                        "stage timeout after {}ms",
                        invocation.stage_timeout_ms
                    )))?;
                }
                LoopEvent::Pulse => {
                    yield ProviderEvent::Progress {
                        elapsed_ms: started.elapsed().as_millis() as u64,
                        pid,
                    };
                }
                LoopEvent::Line(Some(line)) => {
                    if !line.trim().is_empty() {
                        produced_output = true;
                    }
                    for event in parse(&line) {
                        yield event;
                    }
                }
                LoopEvent::Line(None) => break,
                LoopEvent::IdleTimeout => {
                    shutdown_child(&mut child).await;
                    Err(CadenceError::Provider(format!(
                        "idle timeout: no output for {}ms",
                        idle_timeout.as_millis()
                    )))?;
                }
                LoopEvent::ReadError(err) => {
                    shutdown_child(&mut child).await;
                    Err(CadenceError::Provider(format!("stdout read failed: {err}")))?;
                }
            }
        }

        let status = match tokio::time::timeout(KILL_GRACE, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(err)) => {
                Err(CadenceError::Provider(format!("wait failed: {err}")))?;
                unreachable!()
            }
            Err(_) => {
                shutdown_child(&mut child).await;
                Err(CadenceError::Provider("child did not exit after stdout close".to_string()))?;
                unreachable!()
            }
        };

        if !status.success() {
            let tail = stderr_tail.lock().await.clone();
            let message = if !produced_output && started.elapsed() < FAST_FAIL_WINDOW {
                format!("{TRANSIENT_PREFIX} {} exited {} with no output: {}",
                    invocation.program, status, tail.trim())
            } else {
                format!("{} exited {}: {}", invocation.program, status, tail.trim())
            };
            yield ProviderEvent::Error { message };
        }
    };
    Box::pin(stream)
}
