//! In-enclave decryption of inbound object streams.
//!
//! Ciphertext arriving on a transport connection is piped through an
//! external decrypt executable, one [`DecryptionSession`] per object, and
//! the plaintext lands in a scratch file under `scratch_dir`.

mod session;

pub use session::{DecryptionSession, SessionState, SessionTimeouts};

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use tokio::sync::Mutex;

use vaultbridge_core::config::DecryptionSettings;
use vaultbridge_core::MessageMetadata;

use crate::event_bus::EventBus;
use crate::keyring::{DataKey, KeyRing};
use crate::registry::Registry;

const KEY_PLACEHOLDER: &str = "{key}";

#[derive(Debug, thiserror::Error)]
pub enum DecryptError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("scratch file {path}: {source}")]
    Scratch {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("decrypt pipe: {0}")]
    Io(#[from] std::io::Error),
    #[error("decrypt process exited with {status}: {stderr}")]
    ProcessFailed { status: String, stderr: String },
    #[error("operation not valid in state {0:?}")]
    InvalidState(SessionState),
    #[error("{0}")]
    Drain(String),
    #[error("no data key for data store {0:?}")]
    MissingKey(String),
}

/// The decrypt executable and its argument template.
///
/// Ciphertext goes to stdin, plaintext comes from stdout. Every `{key}` in
/// `args` is replaced with the data key at spawn time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl DecryptCommand {
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = String>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().collect(),
        }
    }

    pub fn from_settings(settings: &DecryptionSettings) -> Self {
        Self::new(settings.program.clone(), settings.args.clone())
    }

    pub fn build(&self, key: &DataKey) -> tokio::process::Command {
        let mut command = tokio::process::Command::new(&self.program);
        command
            .args(
                self.args
                    .iter()
                    .map(|arg| arg.replace(KEY_PLACEHOLDER, key.expose())),
            )
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

/// Owns every live decrypt session, keyed by request, data store and key.
pub struct DecryptionPipeline {
    command: Arc<DecryptCommand>,
    scratch_dir: PathBuf,
    timeouts: SessionTimeouts,
    bus: EventBus,
    keys: KeyRing,
    sessions: Registry<String, Mutex<DecryptionSession>>,
}

impl DecryptionPipeline {
    pub fn new(command: DecryptCommand, scratch_dir: PathBuf, bus: EventBus, keys: KeyRing) -> Self {
        Self {
            command: Arc::new(command),
            scratch_dir,
            timeouts: SessionTimeouts::default(),
            bus,
            keys,
            sessions: Registry::new(),
        }
    }

    pub fn from_settings(settings: &DecryptionSettings, bus: EventBus, keys: KeyRing) -> Self {
        Self::new(
            DecryptCommand::from_settings(settings),
            settings.scratch_dir.clone(),
            bus,
            keys,
        )
        .with_timeouts(SessionTimeouts {
            join: settings.join_timeout(),
            exit: settings.exit_timeout(),
        })
    }

    pub fn with_timeouts(mut self, timeouts: SessionTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn has_key(&self, data_store_id: &str) -> bool {
        self.keys.contains(data_store_id)
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Feed one chunk into the session for `metadata`, starting it on first
    /// use. An empty chunk finishes the session.
    ///
    /// A failed chunk ends the session; later chunks for the same object
    /// start from scratch and will not produce a usable file.
    pub async fn decrypt_chunk(
        &self,
        metadata: &MessageMetadata,
        chunk: &[u8],
    ) -> Result<(), DecryptError> {
        let id = session_id(metadata);
        let (session, created) = self.sessions.get_or_insert_with(id.clone(), || {
            Mutex::new(DecryptionSession::new(
                Arc::clone(&self.command),
                self.scratch_file(metadata),
                self.timeouts,
                self.bus.clone(),
            ))
        });

        let mut session = session.lock().await;
        if created || session.state() == SessionState::Uninitialized {
            if let Err(e) = self.start(&mut session, metadata).await {
                self.sessions.remove(&id);
                return Err(e);
            }
        }

        let result = session.feed(chunk, metadata).await;
        if result.is_err() || chunk.is_empty() {
            self.sessions.remove(&id);
        }
        result
    }

    async fn start(
        &self,
        session: &mut DecryptionSession,
        metadata: &MessageMetadata,
    ) -> Result<(), DecryptError> {
        let key = self
            .keys
            .get(&metadata.data_store_id)
            .ok_or_else(|| DecryptError::MissingKey(metadata.data_store_id.clone()))?;
        tokio::fs::create_dir_all(&self.scratch_dir)
            .await
            .map_err(|source| DecryptError::Scratch {
                path: self.scratch_dir.clone(),
                source,
            })?;
        session.initialize(&key).await?;
        tracing::info!(
            request_id = %metadata.request_id,
            data_store_id = %metadata.data_store_id,
            remote_key = %metadata.remote_key,
            "decrypt session started"
        );
        Ok(())
    }

    /// Drop the session for `metadata`. A session that never saw its end
    /// chunk is force-torn down.
    pub async fn close_session(&self, metadata: &MessageMetadata) {
        let Some(session) = self.sessions.remove(&session_id(metadata)) else {
            return;
        };
        let mut session = session.lock().await;
        if session.state() != SessionState::TornDown {
            tracing::warn!(
                request_id = %metadata.request_id,
                remote_key = %metadata.remote_key,
                "stream ended before end of input, discarding decrypt session"
            );
            session.force_teardown().await;
        }
    }

    /// Force down every live session.
    pub async fn shutdown(&self) {
        for (id, session) in self.sessions.snapshot() {
            self.sessions.remove(&id);
            session.lock().await.force_teardown().await;
        }
    }

    fn scratch_file(&self, metadata: &MessageMetadata) -> PathBuf {
        let stem: String = metadata
            .remote_key
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
            .collect();
        self.scratch_dir
            .join(format!("{:016x}-{stem}", rand::random::<u64>()))
    }
}

fn session_id(metadata: &MessageMetadata) -> String {
    format!(
        "{}/{}/{}",
        metadata.request_id, metadata.data_store_id, metadata.remote_key
    )
}
