use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{CasInsertionControl, WorkerConfig};
use crate::digest::Digest;
use crate::error::Result;
use crate::instance::{ByteSink, Instance};
use crate::messages::{ActionResult, Command};

/// How long a force-killed process gets to reap before we move on.
const KILL_REAP_GRACE: Duration = Duration::from_millis(100);

/// How long a reader may keep draining after the process has been waited
/// on, before it is cancelled. Covers grandchildren holding the pipe open.
const STREAM_DRAIN_GRACE: Duration = Duration::from_millis(200);

const READ_BUF_SIZE: usize = 8192;

/// Runs an action's command in its execution directory: replaced
/// environment, closed stdin, captured std-streams with optional live
/// forwarding, and timeout enforcement by forced termination.
pub struct CommandExecutor {
    instance: Arc<dyn Instance>,
    stream_stdout: bool,
    stream_stderr: bool,
    stdout_control: CasInsertionControl,
    stderr_control: CasInsertionControl,
}

impl CommandExecutor {
    pub fn new(instance: Arc<dyn Instance>, config: &WorkerConfig) -> Self {
        Self {
            instance,
            stream_stdout: config.stream_stdout,
            stream_stderr: config.stream_stderr,
            stdout_control: config.stdout_cas_control,
            stderr_control: config.stderr_cas_control,
        }
    }

    /// Execute the command and return a result seeded with the exit code
    /// and packaged std-streams. Output files are collected by the caller.
    ///
    /// Spawn failure yields `exit_code = -1` with no captured streams.
    pub async fn execute(
        &self,
        exec_dir: &Path,
        command: &Command,
        timeout: Option<Duration>,
        stdout_stream_name: &str,
        stderr_stream_name: &str,
    ) -> Result<ActionResult> {
        let mut result = ActionResult {
            exit_code: -1,
            ..Default::default()
        };

        let Some(program) = command.arguments.first() else {
            tracing::error!("Command has an empty argument vector");
            return Ok(result);
        };

        let stdout_sink = self.stream_sink(stdout_stream_name, self.stream_stdout).await?;
        let stderr_sink = self.stream_sink(stderr_stream_name, self.stream_stderr).await?;

        let start = Instant::now();
        let mut child = match tokio::process::Command::new(program)
            .args(&command.arguments[1..])
            .env_clear()
            .envs(
                command
                    .environment_variables
                    .iter()
                    .map(|variable| (&variable.name, &variable.value)),
            )
            .current_dir(exec_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(err) => {
                tracing::error!(program = %program, error = %err, "Failed to spawn command");
                return Ok(result);
            }
        };

        let cancel = CancellationToken::new();
        let stdout = child.stdout.take().expect("stdout is piped");
        let stderr = child.stderr.take().expect("stderr is piped");
        let stdout_task = spawn_drainer(stdout, stdout_sink, cancel.clone());
        let stderr_task = spawn_drainer(stderr, stderr_sink, cancel.clone());

        let exit_code = match timeout {
            None => exit_code_of(child.wait().await),
            Some(timeout) => {
                let remaining = timeout.saturating_sub(start.elapsed());
                match tokio::time::timeout(remaining, child.wait()).await {
                    Ok(status) => exit_code_of(status),
                    Err(_) => {
                        tracing::warn!(timeout = ?timeout, "Command timed out, killing process");
                        let _ = child.start_kill();
                        match tokio::time::timeout(KILL_REAP_GRACE, child.wait()).await {
                            Ok(status) => exit_code_of(status),
                            Err(_) => -1,
                        }
                    }
                }
            }
        };

        // Readers are always joined before returning; a reader that has
        // not reached EOF within the grace is cancelled.
        let stdout_data = join_drainer(stdout_task, &cancel).await;
        let stderr_data = join_drainer(stderr_task, &cancel).await;

        result.exit_code = exit_code;
        let (raw, digest) = self.package_stream(stdout_data, &self.stdout_control).await?;
        result.stdout_raw = raw;
        result.stdout_digest = digest;
        let (raw, digest) = self.package_stream(stderr_data, &self.stderr_control).await?;
        result.stderr_raw = raw;
        result.stderr_digest = digest;
        Ok(result)
    }

    /// Inline and/or insert one captured stream per the control policy.
    /// Empty streams are omitted entirely.
    async fn package_stream(
        &self,
        data: Vec<u8>,
        control: &CasInsertionControl,
    ) -> Result<(Option<Vec<u8>>, Option<Digest>)> {
        if data.is_empty() {
            return Ok((None, None));
        }
        let size = data.len() as u64;
        let within_limit = control.within_limit(size);
        if !control.should_insert(size) {
            return Ok((within_limit.then_some(data), None));
        }
        if within_limit {
            let digest = self.instance.put_blob(data.clone()).await?;
            Ok((Some(data), Some(digest)))
        } else {
            let digest = self.instance.put_blob(data).await?;
            Ok((None, Some(digest)))
        }
    }

    /// Remote sink when the stream has a name and forwarding is enabled,
    /// else a null sink.
    async fn stream_sink(&self, name: &str, enabled: bool) -> Result<ByteSink> {
        if enabled && !name.is_empty() {
            self.instance.get_stream_output(name).await
        } else {
            Ok(Box::new(tokio::io::sink()))
        }
    }
}

fn exit_code_of(status: std::io::Result<std::process::ExitStatus>) -> i32 {
    status.ok().and_then(|status| status.code()).unwrap_or(-1)
}

/// Drain one std-stream: accumulate into memory and forward verbatim to
/// the sink. A sink failure stops forwarding but not capture.
fn spawn_drainer(
    stream: impl AsyncRead + Send + Unpin + 'static,
    mut sink: ByteSink,
    cancel: CancellationToken,
) -> JoinHandle<Vec<u8>> {
    tokio::spawn(async move {
        let mut stream = stream;
        let mut data = Vec::new();
        let mut buf = [0u8; READ_BUF_SIZE];
        let mut forward = true;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                read = stream.read(&mut buf) => match read {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        data.extend_from_slice(&buf[..n]);
                        if forward {
                            if let Err(err) = sink.write_all(&buf[..n]).await {
                                tracing::debug!(error = %err, "Stream sink write failed, capture continues");
                                forward = false;
                            }
                        }
                    }
                }
            }
        }
        let _ = sink.shutdown().await;
        data
    })
}

async fn join_drainer(handle: JoinHandle<Vec<u8>>, cancel: &CancellationToken) -> Vec<u8> {
    let mut handle = handle;
    match tokio::time::timeout(STREAM_DRAIN_GRACE, &mut handle).await {
        Ok(joined) => joined.unwrap_or_default(),
        Err(_) => {
            cancel.cancel();
            handle.await.unwrap_or_default()
        }
    }
}
