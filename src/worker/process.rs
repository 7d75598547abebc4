// Spawning and streaming a single worker process

use super::template::{render_args, resolve_command, InvocationContext};
use crate::config::AgentBackend;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

/// Which pipe a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    pub fn as_str(self) -> &'static str {
        match self {
            Stream::Stdout => "stdout",
            Stream::Stderr => "stderr",
        }
    }
}

/// One line of worker output
#[derive(Debug, Clone)]
pub struct OutputLine {
    pub stream: Stream,
    pub text: String,
}

/// Real-time output callback; receives the invocation label (step ids) and
/// each line as it arrives
pub type OutputSink = Arc<dyn Fn(&str, &OutputLine) + Send + Sync>;

/// A running worker.
///
/// Output is buffered in full for result parsing and forwarded to the sink.
/// The child is killed if the handle is dropped.
pub struct WorkerHandle {
    child: Child,
    rx: mpsc::UnboundedReceiver<OutputLine>,
    stdout: String,
    stderr: String,
    label: String,
    sink: Option<OutputSink>,
}

/// Start a worker for `ctx` in `cwd`
pub fn invoke(
    backend: &AgentBackend,
    ctx: &InvocationContext,
    cwd: &Path,
    sink: Option<OutputSink>,
) -> Result<WorkerHandle, String> {
    let program = resolve_command(&backend.command, cwd)?;
    let tera_ctx = ctx.to_tera_context();
    let args = render_args(&backend.args, &tera_ctx)?;

    let mut cmd = Command::new(&program);
    cmd.args(&args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    for (key, value) in ctx.env_vars() {
        cmd.env(key, value);
    }
    for (key, value) in &backend.env {
        cmd.env(key, value);
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| format!("Failed to spawn {}: {}", backend.command, e))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| "Failed to capture stdout".to_string())?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| "Failed to capture stderr".to_string())?;

    let (tx, rx) = mpsc::unbounded_channel();
    spawn_reader(stdout, Stream::Stdout, tx.clone());
    spawn_reader(stderr, Stream::Stderr, tx);

    log::info!(
        "[WorkerGateway] Started '{}' (pid {:?}) for steps {} in {:?}",
        backend.name,
        child.id(),
        ctx.step_ids,
        cwd
    );

    Ok(WorkerHandle {
        child,
        rx,
        stdout: String::new(),
        stderr: String::new(),
        label: ctx.step_ids.clone(),
        sink,
    })
}

fn spawn_reader<R>(reader: R, stream: Stream, tx: mpsc::UnboundedSender<OutputLine>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(text)) => {
                    if tx.send(OutputLine { stream, text }).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    log::debug!("[WorkerGateway] {} read error: {}", stream.as_str(), e);
                    break;
                }
            }
        }
    });
}

impl WorkerHandle {
    /// Next line of output from either stream; `None` once both are closed
    pub async fn next_line(&mut self) -> Option<OutputLine> {
        let line = self.rx.recv().await?;
        let buffer = match line.stream {
            Stream::Stdout => &mut self.stdout,
            Stream::Stderr => &mut self.stderr,
        };
        buffer.push_str(&line.text);
        buffer.push('\n');
        if let Some(sink) = &self.sink {
            sink(&self.label, &line);
        }
        Some(line)
    }

    /// Drain remaining output and wait for exit.
    ///
    /// Returns the exit code; termination by signal is reported as -1.
    pub async fn wait(&mut self) -> Result<i32, String> {
        while self.next_line().await.is_some() {}
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| format!("Failed to wait for worker: {}", e))?;
        Ok(status.code().unwrap_or(-1))
    }

    /// Kill the worker and reap it
    pub async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            log::debug!("[WorkerGateway] Kill failed (already exited?): {}", e);
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn stdout(&self) -> &str {
        &self.stdout
    }

    pub fn stderr(&self) -> &str {
        &self.stderr
    }
}
