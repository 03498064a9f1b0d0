/// Assistant-CLI runner
///
/// Spawns the configured assistant command per task, pipes the prompt to
/// stdin and closes it, captures stdout/stderr into bounded buffers, and
/// maps the exit condition into a [`ChildOutput`].
///
/// # Termination
///
/// When the kill token fires the child gets SIGTERM, a short grace window
/// to flush and exit, then SIGKILL. The final (possibly signal) exit
/// status is still reaped so no zombie is left behind.

use super::{ChildOutput, RunRequest, RunnerError, RunnerResult, TaskRunner};
use super::{STDERR_CAP_BYTES, STDOUT_CAP_BYTES};
use async_trait::async_trait;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Runner that drives the external assistant CLI.
pub struct CliRunner {
    /// argv of the assistant command (`["claude"]`, `["sh", "-c", …]`, …)
    command: Vec<String>,

    /// Grace between SIGTERM and SIGKILL
    kill_grace: Duration,
}

impl CliRunner {
    /// Creates a runner for the given argv.
    pub fn new(command: Vec<String>, kill_grace: Duration) -> Self {
        CliRunner {
            command,
            kill_grace,
        }
    }
}

/// Reads a stream into a bounded buffer, keeping the head.
async fn read_head<R: tokio::io::AsyncRead + Unpin>(mut reader: R, cap: usize) -> String {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if buffer.len() < cap {
                    let take = n.min(cap - buffer.len());
                    buffer.extend_from_slice(&chunk[..take]);
                }
                // Keep draining past the cap so the child never blocks on
                // a full pipe.
            }
        }
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

/// Reads a stream into a bounded buffer, keeping the tail.
async fn read_tail<R: tokio::io::AsyncRead + Unpin>(mut reader: R, cap: usize) -> String {
    let mut buffer: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > cap {
                    let excess = buffer.len() - cap;
                    buffer.drain(..excess);
                }
            }
        }
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

/// SIGTERM, grace, SIGKILL.
async fn terminate(child: &mut Child, grace: Duration) {
    if let Some(pid) = child.id() {
        let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        if tokio::time::timeout(grace, child.wait()).await.is_ok() {
            return;
        }
        warn!(pid, "Child ignored SIGTERM, sending SIGKILL");
    }
    let _ = child.start_kill();
}

#[async_trait]
impl TaskRunner for CliRunner {
    fn name(&self) -> &str {
        "cli"
    }

    async fn run(&self, request: RunRequest, kill: CancellationToken) -> RunnerResult<ChildOutput> {
        let program = self
            .command
            .first()
            .ok_or_else(|| RunnerError::SpawnFailed("empty assistant command".into()))?;

        let mut command = Command::new(program);
        command
            .args(&self.command[1..])
            .current_dir(&request.work_directory)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| RunnerError::SpawnFailed(e.to_string()))?;

        debug!(
            task_id = %request.task_id,
            pid = child.id(),
            work_directory = %request.work_directory.display(),
            "Spawned assistant child"
        );

        // Pipe the prompt and close stdin. A write failure here means the
        // child exited before reading; the exit status carries the story,
        // so this is not an error path.
        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(request.prompt.as_bytes()).await {
                debug!(task_id = %request.task_id, error = %e, "Prompt write failed (child exited early?)");
            }
            drop(stdin);
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RunnerError::Io("child stdout not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| RunnerError::Io("child stderr not captured".into()))?;

        let stdout_task = tokio::spawn(read_head(stdout, STDOUT_CAP_BYTES));
        let stderr_task = tokio::spawn(read_tail(stderr, STDERR_CAP_BYTES));

        let status = tokio::select! {
            status = child.wait() => {
                status.map_err(|e| RunnerError::Io(e.to_string()))?
            }
            _ = kill.cancelled() => {
                terminate(&mut child, self.kill_grace).await;
                child.wait().await.map_err(|e| RunnerError::Io(e.to_string()))?
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        Ok(ChildOutput {
            exit_code: status.code(),
            stdout,
            stderr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn sh(script: &str) -> CliRunner {
        CliRunner::new(
            vec!["sh".into(), "-c".into(), script.into()],
            Duration::from_millis(200),
        )
    }

    fn request(prompt: &str) -> RunRequest {
        RunRequest {
            task_id: "test-task".into(),
            prompt: prompt.into(),
            work_directory: PathBuf::from("/tmp"),
        }
    }

    #[tokio::test]
    async fn test_stdout_is_task_output() {
        let runner = sh("cat");
        let output = runner
            .run(request("hello from stdin"), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(output.exit_code, Some(0));
        assert!(output.is_success());
        assert_eq!(output.stdout, "hello from stdin");
    }

    #[tokio::test]
    async fn test_nonzero_exit_with_stderr() {
        let runner = sh("echo partial; echo broken >&2; exit 3");
        let output = runner
            .run(request(""), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(output.exit_code, Some(3));
        assert!(!output.is_success());
        assert_eq!(output.stdout.trim(), "partial");
        assert_eq!(output.stderr.trim(), "broken");
    }

    #[tokio::test]
    async fn test_kill_token_terminates_child() {
        let runner = sh("sleep 30");
        let kill = CancellationToken::new();

        let kill_clone = kill.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            kill_clone.cancel();
        });

        let started = std::time::Instant::now();
        let output = runner.run(request(""), kill).await.unwrap();

        assert!(
            started.elapsed() < Duration::from_secs(5),
            "child should die well before its sleep finishes"
        );
        assert_ne!(output.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_failed() {
        let runner = CliRunner::new(
            vec!["definitely-not-a-real-binary-7f3a".into()],
            Duration::from_millis(100),
        );
        let err = runner
            .run(request(""), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::SpawnFailed(_)));
    }

    #[tokio::test]
    async fn test_working_directory_is_applied() {
        let dir = tempfile::TempDir::new().unwrap();
        let runner = CliRunner::new(
            vec!["sh".into(), "-c".into(), "pwd".into()],
            Duration::from_millis(100),
        );
        let output = runner
            .run(
                RunRequest {
                    task_id: "wd".into(),
                    prompt: String::new(),
                    work_directory: dir.path().to_path_buf(),
                },
                CancellationToken::new(),
            )
            .await
            .unwrap();

        let reported = PathBuf::from(output.stdout.trim());
        assert_eq!(
            reported.canonicalize().unwrap(),
            dir.path().canonicalize().unwrap()
        );
    }
}
