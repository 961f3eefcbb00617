// Worker process adapter
// Spawns the kind's executable, streams stdout through the line protocol and
// resolves to the parsed result or a typed failure.
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use vidforge_core::domain::Job;
use vidforge_core::port::{ExecutionError, ProgressSink, TimeProvider, WorkerOutput, WorkerRunner};

use crate::command_builder::WorkerCommands;
use crate::progress_protocol::{extract_result, parse_line};

/// Captured stderr kept on the job error
const MAX_STDERR_BYTES: usize = 64 * 1024;

/// Stdout tail kept for result extraction
const MAX_STDOUT_BYTES: usize = 256 * 1024;

/// Bounded view of stdout: the most recent lines plus the first line that
/// held a whole JSON object, which stays the result once older lines are dropped
#[derive(Default)]
struct StdoutCapture {
    tail: VecDeque<String>,
    bytes: usize,
    first_object: Option<String>,
    truncated: bool,
}

impl StdoutCapture {
    fn push(&mut self, line: String) {
        if self.first_object.is_none() && is_json_object(&line) {
            self.first_object = Some(line.clone());
        }
        self.bytes += line.len() + 1;
        self.tail.push_back(line);
        while self.bytes > MAX_STDOUT_BYTES && self.tail.len() > 1 {
            if let Some(dropped) = self.tail.pop_front() {
                self.bytes -= dropped.len() + 1;
                self.truncated = true;
            }
        }
    }

    fn into_result(self) -> (Value, bool) {
        if self.truncated {
            if let Some(line) = &self.first_object {
                return extract_result(line);
            }
        }
        let text = self.tail.into_iter().fold(String::new(), |mut text, line| {
            text.push_str(&line);
            text.push('\n');
            text
        });
        extract_result(&text)
    }
}

fn is_json_object(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.starts_with('{') && matches!(serde_json::from_str(trimmed), Ok(Value::Object(_)))
}

/// One stdout line without its terminator. Bytes that are not UTF-8 (locale
/// encoded file names) are replaced instead of failing the run.
fn decode_line(buf: &[u8]) -> String {
    let line = buf.strip_suffix(b"\n").unwrap_or(buf);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    String::from_utf8_lossy(line).into_owned()
}

pub struct ProcessWorkerRunner {
    commands: WorkerCommands,
    env_allowlist: Vec<String>,
    time_provider: Arc<dyn TimeProvider>,
}

impl ProcessWorkerRunner {
    /// # Example
    /// ```ignore
    /// let runner = ProcessWorkerRunner::new(
    ///     WorkerCommands::default(),
    ///     vec!["PATH".to_string(), "HOME".to_string()],
    ///     Arc::new(SystemTimeProvider),
    /// );
    /// ```
    pub fn new(
        commands: WorkerCommands,
        env_allowlist: Vec<String>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            commands,
            env_allowlist,
            time_provider,
        }
    }

    /// Inherited environment reduced to the allowlist
    fn filter_env(&self, env: impl IntoIterator<Item = (String, String)>) -> HashMap<String, String> {
        env.into_iter()
            .filter(|(k, _)| self.env_allowlist.contains(k))
            .collect()
    }

    fn build_command(&self, job: &Job) -> (String, Command) {
        let spec = self.commands.for_kind(job.kind);
        let args = self.commands.build_args(&job.payload);

        let mut command = Command::new(&spec.program);
        command
            .args(&args)
            .env_clear()
            .envs(self.filter_env(std::env::vars()))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.commands.working_dir {
            command.current_dir(dir);
        }

        debug!(job_id = %job.id, program = %spec.program, args = ?args, "Worker command built");
        (spec.program.clone(), command)
    }
}

#[async_trait]
impl WorkerRunner for ProcessWorkerRunner {
    async fn run(&self, job: &Job, sink: &dyn ProgressSink) -> Result<WorkerOutput, ExecutionError> {
        let start_time = self.time_provider.now_millis();
        let (program, mut command) = self.build_command(job);

        let mut child = command.spawn().map_err(|e| ExecutionError::SpawnFailed {
            program: program.clone(),
            reason: e.to_string(),
        })?;
        info!(job_id = %job.id, kind = %job.kind, program = %program, pid = ?child.id(), "Worker spawned");

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExecutionError::Io("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ExecutionError::Io("stderr not captured".to_string()))?;

        // Drained concurrently so a chatty stderr cannot block the child
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let mut limited = stderr.take(MAX_STDERR_BYTES as u64);
            if let Err(e) = limited.read_to_end(&mut buf).await {
                warn!(error = %e, "Failed to read worker stderr");
            }
            // discard the rest so the pipe never fills up
            let mut rest = limited.into_inner();
            let _ = tokio::io::copy(&mut rest, &mut tokio::io::sink()).await;
            String::from_utf8_lossy(&buf).into_owned()
        });

        let mut captured = StdoutCapture::default();
        let mut reader = BufReader::new(stdout);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = decode_line(&buf);
                    if let Some(update) = parse_line(&line) {
                        sink.on_progress(update).await;
                    }
                    captured.push(line);
                }
                Err(e) => {
                    let _ = child.kill().await;
                    return Err(ExecutionError::Io(format!("stdout read failed: {}", e)));
                }
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| ExecutionError::Io(format!("wait failed: {}", e)))?;
        let stderr = stderr_task.await.unwrap_or_default();
        let duration_ms = self.time_provider.now_millis() - start_time;

        if !status.success() {
            info!(
                job_id = %job.id,
                exit_code = ?status.code(),
                duration_ms = %duration_ms,
                "Worker exited with failure"
            );
            return Err(ExecutionError::NonZeroExit {
                code: status.code(),
                stderr: stderr.trim().to_string(),
            });
        }

        let (result, structured) = captured.into_result();
        info!(
            job_id = %job.id,
            duration_ms = %duration_ms,
            structured = %structured,
            "Worker finished"
        );
        Ok(WorkerOutput {
            result,
            structured,
            duration_ms,
        })
    }
}
