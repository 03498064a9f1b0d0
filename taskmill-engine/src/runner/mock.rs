/// Mock runner for tests and demos
///
/// Produces deterministic outcomes without spawning real processes. The
/// behavior is scripted through directives embedded in the prompt:
///
/// - `[delay:500]`: sleep 500 ms before finishing
/// - `[exit:3]`: exit with code 3 (stderr carries a fixed message)
/// - `[output:text]`: emit `text` on stdout instead of the default
/// - `[spawn-fail:2]`: fail the first 2 attempts with a spawn error
///
/// The kill token is honored during the delay: a killed run reports
/// `exit_code = None`, like a signalled process.

use super::{ChildOutput, RunRequest, RunnerError, RunnerResult, TaskRunner};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

/// Deterministic fake runner.
pub struct MockRunner {
    /// Spawn attempts seen per task, for `[spawn-fail:n]`
    attempts: Mutex<HashMap<String, u32>>,
}

impl MockRunner {
    pub fn new() -> Self {
        MockRunner {
            attempts: Mutex::new(HashMap::new()),
        }
    }

    fn directive(prompt: &str, name: &str) -> Option<String> {
        let marker = format!("[{}:", name);
        let start = prompt.find(&marker)? + marker.len();
        let end = prompt[start..].find(']')? + start;
        Some(prompt[start..end].to_string())
    }
}

impl Default for MockRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskRunner for MockRunner {
    fn name(&self) -> &str {
        "mock"
    }

    async fn run(&self, request: RunRequest, kill: CancellationToken) -> RunnerResult<ChildOutput> {
        if let Some(n) = Self::directive(&request.prompt, "spawn-fail") {
            let fail_count: u32 = n.parse().unwrap_or(0);
            let mut attempts = self.attempts.lock().expect("attempts lock");
            let seen = attempts.entry(request.task_id.clone()).or_insert(0);
            *seen += 1;
            if *seen <= fail_count {
                return Err(RunnerError::SpawnFailed(format!(
                    "scripted spawn failure {}/{}",
                    seen, fail_count
                )));
            }
        }

        let delay_ms: u64 = Self::directive(&request.prompt, "delay")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        if delay_ms > 0 {
            tokio::select! {
                _ = sleep(Duration::from_millis(delay_ms)) => {}
                _ = kill.cancelled() => {
                    return Ok(ChildOutput {
                        exit_code: None,
                        stdout: String::new(),
                        stderr: "killed".into(),
                    });
                }
            }
        }

        let exit_code: i32 = Self::directive(&request.prompt, "exit")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        let stdout = Self::directive(&request.prompt, "output")
            .unwrap_or_else(|| format!("done: {}", request.task_id));

        let stderr = if exit_code == 0 {
            String::new()
        } else {
            format!("mock failure with exit code {}", exit_code)
        };

        Ok(ChildOutput {
            exit_code: Some(exit_code),
            stdout,
            stderr,
        })
    }
}
