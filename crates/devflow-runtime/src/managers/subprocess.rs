// Shared subprocess execution for the script (S) and portable (P) runtimes
//
// Spawns the interpreter, feeds the JSON context on stdin, captures capped
// stdout/stderr concurrently, and enforces deadline / cancellation / memory:
// graceful SIGTERM first, SIGKILL two seconds later if the process lingers.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use devflow_core::{DomainError, Result};

const KILL_GRACE: Duration = Duration::from_secs(2);
const MEMORY_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// How the subprocess ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited,
    DeadlineExceeded,
    MemoryExceeded,
    Cancelled,
}

/// Fully specified subprocess run
#[derive(Debug)]
pub struct SubprocessSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: PathBuf,
    pub stdin_payload: Vec<u8>,
    pub deadline: Duration,
    pub memory_cap_bytes: Option<u64>,
    pub output_cap_bytes: usize,
    pub cancellation: CancellationToken,
}

/// Captured output and the way the process went down
#[derive(Debug)]
pub struct SubprocessCapture {
    pub termination: Termination,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
}

pub async fn run(spec: SubprocessSpec) -> Result<SubprocessCapture> {
    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .current_dir(&spec.cwd)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    // Own process group so teardown reaches the whole tree, not just the shell
    #[cfg(unix)]
    command.process_group(0);
    for (key, value) in &spec.env {
        command.env(key, value);
    }

    let mut child = command.spawn().map_err(|e| {
        DomainError::failure(
            "Runtime.Spawn",
            format!("cannot spawn {}: {e}", spec.program.display()),
        )
    })?;
    let pid = child.id();

    // Feed the context; a plugin that never reads stdin must not wedge us
    if let Some(mut stdin) = child.stdin.take() {
        let payload = spec.stdin_payload.clone();
        tokio::spawn(async move {
            let _ = stdin.write_all(&payload).await;
            let _ = stdin.shutdown().await;
        });
    }

    let stdout_handle = child.stdout.take().map(|out| {
        tokio::spawn(read_capped(out, spec.output_cap_bytes))
    });
    let stderr_handle = child.stderr.take().map(|err| {
        tokio::spawn(read_capped(err, spec.output_cap_bytes))
    });

    let termination = supervise(
        &mut child,
        pid,
        spec.deadline,
        spec.memory_cap_bytes,
        &spec.cancellation,
    )
    .await;

    let status = child.wait().await.map_err(|e| {
        DomainError::failure("Runtime.Wait", format!("waiting on subprocess: {e}"))
    })?;

    let (stdout, stdout_truncated) = match stdout_handle {
        Some(handle) => handle.await.unwrap_or_default(),
        None => (String::new(), false),
    };
    let (stderr, stderr_truncated) = match stderr_handle {
        Some(handle) => handle.await.unwrap_or_default(),
        None => (String::new(), false),
    };

    Ok(SubprocessCapture {
        termination,
        exit_code: status.code(),
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
    })
}

/// Watch the child until it exits or a limit trips; on a limit, take it down
async fn supervise(
    child: &mut Child,
    pid: Option<u32>,
    deadline: Duration,
    memory_cap_bytes: Option<u64>,
    cancellation: &CancellationToken,
) -> Termination {
    let deadline_sleep = tokio::time::sleep(deadline);
    tokio::pin!(deadline_sleep);
    let mut memory_poll = tokio::time::interval(MEMORY_POLL_INTERVAL);
    memory_poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    // Decide the cause inside the select, signal the process afterwards so the
    // wait future and the teardown never borrow the child at the same time.
    let cause = loop {
        tokio::select! {
            _ = child.wait() => break Termination::Exited,
            _ = &mut deadline_sleep => break Termination::DeadlineExceeded,
            _ = cancellation.cancelled() => break Termination::Cancelled,
            _ = memory_poll.tick() => {
                if let (Some(cap), Some(pid)) = (memory_cap_bytes, pid) {
                    if let Some(rss) = resident_bytes(pid) {
                        if rss > cap {
                            tracing::warn!(pid, rss, cap, "subprocess exceeded memory cap");
                            break Termination::MemoryExceeded;
                        }
                    }
                }
            }
        }
    };

    if cause != Termination::Exited {
        terminate(child, pid).await;
    }
    cause
}

/// SIGTERM to the process group, a grace period, then SIGKILL
async fn terminate(child: &mut Child, pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        // Negative pid addresses the whole process group
        let group = Pid::from_raw(-(pid as i32));
        let _ = kill(group, Signal::SIGTERM);
        let graceful = tokio::time::timeout(KILL_GRACE, child.wait()).await;
        if graceful.is_ok() {
            return;
        }
        let _ = kill(group, Signal::SIGKILL);
        return;
    }
    let _ = child.start_kill();
}

/// Drain a pipe to EOF, keeping at most `cap` bytes
async fn read_capped<R: tokio::io::AsyncRead + Unpin>(mut reader: R, cap: usize) -> (String, bool) {
    let mut kept: Vec<u8> = Vec::new();
    let mut truncated = false;
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if kept.len() < cap {
                    let take = (cap - kept.len()).min(n);
                    kept.extend_from_slice(&buf[..take]);
                    if take < n {
                        truncated = true;
                    }
                } else {
                    truncated = true;
                }
            }
            Err(_) => break,
        }
    }
    (String::from_utf8_lossy(&kept).into_owned(), truncated)
}

/// VmRSS of a process in bytes; Linux only, None elsewhere
fn resident_bytes(pid: u32) -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        let status = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
        for line in status.lines() {
            if let Some(rest) = line.strip_prefix("VmRSS:") {
                let kb: u64 = rest
                    .trim()
                    .trim_end_matches("kB")
                    .trim()
                    .parse()
                    .ok()?;
                return Some(kb * 1024);
            }
        }
        None
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = pid;
        None
    }
}
