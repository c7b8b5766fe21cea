//! One subprocess-backed decrypt session.
//!
//! Lifecycle: `Uninitialized → Ready → Processing* → TornDown`. A forced
//! teardown can happen from any state and is recorded separately.
//!
//! Both output pipes are drained by their own tasks, started before the
//! first byte is written to the child's stdin. The network reader can then
//! write as fast as the child accepts input without the child ever blocking
//! on a full stdout or stderr pipe.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tokio::task::JoinHandle;

use vaultbridge_core::MessageMetadata;

use super::{DecryptCommand, DecryptError};
use crate::event_bus::EventBus;
use crate::events::Event;
use crate::keyring::DataKey;

const DRAIN_BUFFER_BYTES: usize = 1024 * 1024;
const STDERR_TAIL_LINES: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Ready,
    Processing,
    TornDown,
}

/// Bounded waits used while tearing a session down.
#[derive(Debug, Clone, Copy)]
pub struct SessionTimeouts {
    /// Per drain task join.
    pub join: Duration,
    /// Child exit after stdin is closed.
    pub exit: Duration,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            join: Duration::from_secs(20),
            exit: Duration::from_secs(20),
        }
    }
}

pub struct DecryptionSession {
    command: Arc<DecryptCommand>,
    scratch_path: PathBuf,
    timeouts: SessionTimeouts,
    bus: EventBus,

    state: SessionState,
    forced: bool,
    finished: bool,
    drains_started: bool,
    bytes_fed: u64,

    stop: Arc<AtomicBool>,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    stdout_drain: Option<JoinHandle<Result<u64, DecryptError>>>,
    stderr_drain: Option<JoinHandle<Vec<String>>>,
    stderr_tail: Vec<String>,
}

impl DecryptionSession {
    pub fn new(
        command: Arc<DecryptCommand>,
        scratch_path: PathBuf,
        timeouts: SessionTimeouts,
        bus: EventBus,
    ) -> Self {
        Self {
            command,
            scratch_path,
            timeouts,
            bus,
            state: SessionState::Uninitialized,
            forced: false,
            finished: false,
            drains_started: false,
            bytes_fed: 0,
            stop: Arc::new(AtomicBool::new(false)),
            child: None,
            stdin: None,
            stdout_drain: None,
            stderr_drain: None,
            stderr_tail: Vec::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_forced(&self) -> bool {
        self.forced
    }

    pub fn scratch_path(&self) -> &Path {
        &self.scratch_path
    }

    pub fn drains_started(&self) -> bool {
        self.drains_started
    }

    /// True while either drain task has not been joined.
    pub fn drains_running(&self) -> bool {
        self.stdout_drain.is_some() || self.stderr_drain.is_some()
    }

    /// Spawn the decrypt executable and start both drains.
    ///
    /// On failure the session stays `Uninitialized` and nothing is left
    /// running or on disk.
    pub async fn initialize(&mut self, key: &DataKey) -> Result<(), DecryptError> {
        if self.state != SessionState::Uninitialized {
            return Err(DecryptError::InvalidState(self.state));
        }

        let scratch = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.scratch_path)
            .await
            .map_err(|source| DecryptError::Scratch {
                path: self.scratch_path.clone(),
                source,
            })?;

        let mut child = match self.command.build(key).spawn() {
            Ok(child) => child,
            Err(source) => {
                drop(scratch);
                remove_scratch(&self.scratch_path).await;
                return Err(DecryptError::Spawn {
                    program: self.command.program.clone(),
                    source,
                });
            }
        };

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            let _ = child.start_kill();
            drop(scratch);
            remove_scratch(&self.scratch_path).await;
            return Err(DecryptError::Drain("child pipes were not captured".into()));
        };

        self.stdout_drain = Some(tokio::spawn(drain_stdout(
            stdout,
            scratch,
            Arc::clone(&self.stop),
        )));
        self.stderr_drain = Some(tokio::spawn(drain_stderr(stderr, Arc::clone(&self.stop))));
        self.drains_started = true;

        self.stdin = Some(stdin);
        self.child = Some(child);
        self.state = SessionState::Ready;
        tracing::debug!(scratch = %self.scratch_path.display(), "decrypt session ready");
        Ok(())
    }

    /// Write one ciphertext chunk. An empty chunk ends the input: the
    /// session tears down and, if the child exited cleanly, publishes
    /// `DataStoreFileAvailable` with `scratch_path` set on `metadata`.
    ///
    /// Any failure force-tears the session down before it is returned.
    pub async fn feed(
        &mut self,
        chunk: &[u8],
        metadata: &MessageMetadata,
    ) -> Result<(), DecryptError> {
        let result = self.feed_inner(chunk, metadata).await;
        if let Err(e) = &result {
            tracing::warn!(
                request_id = %metadata.request_id,
                remote_key = %metadata.remote_key,
                error = %e,
                "decrypt session failed, forcing teardown"
            );
            self.force_teardown().await;
        }
        result
    }

    async fn feed_inner(
        &mut self,
        chunk: &[u8],
        metadata: &MessageMetadata,
    ) -> Result<(), DecryptError> {
        if !matches!(self.state, SessionState::Ready | SessionState::Processing) {
            return Err(DecryptError::InvalidState(self.state));
        }

        if !chunk.is_empty() {
            let stdin = self
                .stdin
                .as_mut()
                .ok_or(DecryptError::InvalidState(self.state))?;
            stdin.write_all(chunk).await?;
            self.bytes_fed += chunk.len() as u64;
            self.state = SessionState::Processing;
            return Ok(());
        }

        let (status, written) = self.finish().await?;
        if !status.is_some_and(|s| s.success()) {
            return Err(DecryptError::ProcessFailed {
                status: status.map(|s| s.to_string()).unwrap_or_else(|| "no exit status".into()),
                stderr: self.stderr_tail.join("\n"),
            });
        }
        self.finished = true;

        let mut ready = metadata.clone();
        ready.scratch_path = Some(self.scratch_path.clone());
        tracing::info!(
            request_id = %ready.request_id,
            remote_key = %ready.remote_key,
            bytes_in = self.bytes_fed,
            bytes_out = written,
            "decrypted file ready"
        );
        self.bus.publish(Event::DataStoreFileAvailable(ready));
        Ok(())
    }

    /// Orderly shutdown. Idempotent: later calls return `Ok(None)`.
    pub async fn teardown(&mut self) -> Result<Option<ExitStatus>, DecryptError> {
        if self.state == SessionState::TornDown {
            return Ok(None);
        }
        self.finish().await.map(|(status, _)| status)
    }

    async fn finish(&mut self) -> Result<(Option<ExitStatus>, u64), DecryptError> {
        // Closing stdin is the end-of-input signal for the child.
        drop(self.stdin.take());

        let drained = self.join_drains().await;
        let status = self.reap().await;
        self.state = SessionState::TornDown;

        let status = status?;
        let written = drained?;
        Ok((status, written))
    }

    /// Kill the child without waiting for orderly exit, stop both drains
    /// and drop the scratch file unless decryption already finished.
    pub async fn force_teardown(&mut self) {
        self.forced = true;
        self.stop.store(true, Ordering::Release);
        drop(self.stdin.take());

        if let Some(child) = self.child.as_mut() {
            if let Err(e) = child.start_kill() {
                tracing::debug!(error = %e, "decrypt process already gone");
            }
        }
        if let Err(e) = self.join_drains().await {
            tracing::debug!(error = %e, "drain join during forced teardown");
        }
        if let Err(e) = self.reap().await {
            tracing::debug!(error = %e, "reap during forced teardown");
        }

        if !self.finished {
            remove_scratch(&self.scratch_path).await;
        }
        self.state = SessionState::TornDown;
    }

    async fn join_drains(&mut self) -> Result<u64, DecryptError> {
        let join = self.timeouts.join;

        let stderr = match self.stderr_drain.take() {
            Some(handle) => join_bounded(handle, join, "stderr").await,
            None => Ok(Vec::new()),
        };
        let stdout = match self.stdout_drain.take() {
            Some(handle) => join_bounded(handle, join, "stdout").await,
            None => Ok(Ok(0)),
        };

        if let Ok(tail) = stderr {
            self.stderr_tail = tail;
        }
        stdout?
    }

    async fn reap(&mut self) -> Result<Option<ExitStatus>, DecryptError> {
        let Some(mut child) = self.child.take() else {
            return Ok(None);
        };
        match tokio::time::timeout(self.timeouts.exit, child.wait()).await {
            Ok(status) => Ok(Some(status?)),
            Err(_) => {
                tracing::warn!(
                    timeout_secs = self.timeouts.exit.as_secs(),
                    "decrypt process did not exit, killing"
                );
                child.kill().await?;
                Ok(Some(child.wait().await?))
            }
        }
    }
}

impl Drop for DecryptionSession {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.stdout_drain.take() {
            handle.abort();
        }
        if let Some(handle) = self.stderr_drain.take() {
            handle.abort();
        }
        // The child was spawned with kill_on_drop.
    }
}

async fn join_bounded<T>(
    mut handle: JoinHandle<T>,
    timeout: Duration,
    which: &str,
) -> Result<T, DecryptError> {
    match tokio::time::timeout(timeout, &mut handle).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(DecryptError::Drain(format!("{which} drain task failed: {e}"))),
        Err(_) => {
            handle.abort();
            Err(DecryptError::Drain(format!(
                "{which} drain did not finish within {}s",
                timeout.as_secs()
            )))
        }
    }
}

async fn drain_stdout(
    mut stdout: ChildStdout,
    mut scratch: File,
    stop: Arc<AtomicBool>,
) -> Result<u64, DecryptError> {
    let mut buf = vec![0u8; DRAIN_BUFFER_BYTES];
    let mut written = 0u64;
    while !stop.load(Ordering::Acquire) {
        let n = stdout.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        scratch.write_all(&buf[..n]).await?;
        written += n as u64;
    }
    scratch.flush().await?;
    Ok(written)
}

async fn drain_stderr(stderr: ChildStderr, stop: Arc<AtomicBool>) -> Vec<String> {
    let mut lines = BufReader::new(stderr).lines();
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    while !stop.load(Ordering::Acquire) {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim().to_string();
                if line.is_empty() {
                    continue;
                }
                tracing::debug!(stderr = %line, "decrypt process");
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(error = %e, "stderr drain stopped");
                break;
            }
        }
    }
    tail.into()
}

async fn remove_scratch(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to remove scratch file"),
    }
}
