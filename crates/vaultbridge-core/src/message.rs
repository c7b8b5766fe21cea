//! Message types carried by the transport and the event bus.

use std::path::PathBuf;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

// ── Kinds ─────────────────────────────────────────────────────────────────────

/// What a transport connection carries after its metadata frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Host → enclave: the encrypted body of one remote object.
    ObjectStream,
    /// Enclave → host: the next bytes of a result being uploaded.
    DataStorePart,
    /// Enclave → host: the last bytes of a result, then end of upload.
    MultipartComplete,
}

/// Content kind of a remote object, recognized by key suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Parquet,
    Csv,
    Json,
    /// Unrecognized suffix. Never streamed by the downloader.
    Raw,
}

impl ContentKind {
    /// Classify a remote key by its suffix.
    pub fn from_key(key: &str) -> Self {
        let suffix = key.rsplit('.').next().unwrap_or_default();
        Self::from_name(suffix).unwrap_or(ContentKind::Raw)
    }

    /// Parse a configured kind name (`"parquet"`, `"csv"`, `"json"`).
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "parquet" => Some(ContentKind::Parquet),
            "csv" => Some(ContentKind::Csv),
            "json" => Some(ContentKind::Json),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContentKind::Parquet => "parquet",
            ContentKind::Csv => "csv",
            ContentKind::Json => "json",
            ContentKind::Raw => "raw",
        }
    }
}

// ── Metadata ──────────────────────────────────────────────────────────────────

/// The JSON header of every transport message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageMetadata {
    pub kind: MessageKind,
    /// Logical request id correlating every message of one transfer.
    pub request_id: String,
    /// Data store the object belongs to (selects key and bucket).
    pub data_store_id: String,
    /// Object key in the remote store.
    pub remote_key: String,
    pub content_kind: ContentKind,
    /// Set on the final continuation message of a multipart upload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_flag: Option<bool>,
    /// Scratch file holding the decrypted object, set once decryption finishes.
    /// Local to one side of the bridge; never meaningful to the peer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scratch_path: Option<PathBuf>,
    /// Object length as reported by the store, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_length: Option<u64>,
}

impl MessageMetadata {
    fn new(
        kind: MessageKind,
        request_id: impl Into<String>,
        data_store_id: impl Into<String>,
        remote_key: impl Into<String>,
    ) -> Self {
        let remote_key = remote_key.into();
        Self {
            kind,
            request_id: request_id.into(),
            data_store_id: data_store_id.into(),
            content_kind: ContentKind::from_key(&remote_key),
            remote_key,
            completion_flag: None,
            scratch_path: None,
            content_length: None,
        }
    }

    /// Header for an encrypted object streamed into the enclave.
    pub fn object_stream(
        request_id: impl Into<String>,
        data_store_id: impl Into<String>,
        remote_key: impl Into<String>,
    ) -> Self {
        Self::new(MessageKind::ObjectStream, request_id, data_store_id, remote_key)
    }

    /// Header for one result part sent to the host.
    pub fn data_store_part(
        request_id: impl Into<String>,
        data_store_id: impl Into<String>,
        remote_key: impl Into<String>,
    ) -> Self {
        let mut metadata =
            Self::new(MessageKind::DataStorePart, request_id, data_store_id, remote_key);
        metadata.completion_flag = Some(false);
        metadata
    }

    /// Header for the final continuation message of a result upload.
    pub fn completion(
        request_id: impl Into<String>,
        data_store_id: impl Into<String>,
        remote_key: impl Into<String>,
    ) -> Self {
        let mut metadata = Self::new(
            MessageKind::MultipartComplete,
            request_id,
            data_store_id,
            remote_key,
        );
        metadata.completion_flag = Some(true);
        metadata
    }

    pub fn is_completion(&self) -> bool {
        self.completion_flag.unwrap_or(false)
    }
}

/// One logical unit on the wire: metadata plus an optional raw payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportMessage {
    pub metadata: MessageMetadata,
    pub payload: Option<Bytes>,
}

impl TransportMessage {
    pub fn new(metadata: MessageMetadata, payload: Bytes) -> Self {
        Self {
            metadata,
            payload: Some(payload),
        }
    }

    pub fn metadata_only(metadata: MessageMetadata) -> Self {
        Self {
            metadata,
            payload: None,
        }
    }

    /// Payload bytes, empty when absent.
    pub fn data(&self) -> &[u8] {
        self.payload.as_deref().unwrap_or_default()
    }

    /// An empty payload marks the end of a data-store part stream.
    pub fn is_end_of_stream(&self) -> bool {
        self.data().is_empty()
    }
}

// ── Requests ──────────────────────────────────────────────────────────────────

/// One object to move between the enclave and the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataStoreRequest {
    pub data_store_id: String,
    pub remote_file_key: String,
    /// Local scratch file with the bytes to send. Absent on completion messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<PathBuf>,
    /// True when this request finalizes the multipart upload.
    #[serde(default)]
    pub completed: bool,
    /// Delete `local_path` once the part has been sent or dropped.
    #[serde(skip)]
    pub discard_local: bool,
}

impl DataStoreRequest {
    pub fn part(
        data_store_id: impl Into<String>,
        remote_file_key: impl Into<String>,
        local_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            data_store_id: data_store_id.into(),
            remote_file_key: remote_file_key.into(),
            local_path: Some(local_path.into()),
            completed: false,
            discard_local: false,
        }
    }

    /// Hand ownership of the local file to the sender.
    pub fn discarding_local(mut self) -> Self {
        self.discard_local = true;
        self
    }

    pub fn completion(data_store_id: impl Into<String>, remote_file_key: impl Into<String>) -> Self {
        Self {
            data_store_id: data_store_id.into(),
            remote_file_key: remote_file_key.into(),
            local_path: None,
            completed: true,
            discard_local: false,
        }
    }
}

/// A remote object named by a logical request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectDescriptor {
    pub bucket: String,
    pub key: String,
    pub data_store_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_kind_from_suffix() {
        assert_eq!(ContentKind::from_key("a/b/c.parquet"), ContentKind::Parquet);
        assert_eq!(ContentKind::from_key("x.CSV"), ContentKind::Csv);
        assert_eq!(ContentKind::from_key("x.json"), ContentKind::Json);
        assert_eq!(ContentKind::from_key("x.parquet.tmp"), ContentKind::Raw);
        assert_eq!(ContentKind::from_key("no-suffix"), ContentKind::Raw);
    }

    #[test]
    fn part_and_completion_flags() {
        let part = MessageMetadata::data_store_part("r", "d", "k.csv");
        assert_eq!(part.kind, MessageKind::DataStorePart);
        assert!(!part.is_completion());

        let done = MessageMetadata::completion("r", "d", "k.csv");
        assert!(done.is_completion());

        let object = MessageMetadata::object_stream("r", "d", "k.parquet");
        assert_eq!(object.completion_flag, None);
        assert!(!object.is_completion());
    }

    #[test]
    fn empty_payload_is_end_of_stream() {
        let metadata = MessageMetadata::data_store_part("r", "d", "k");
        assert!(TransportMessage::metadata_only(metadata.clone()).is_end_of_stream());
        assert!(TransportMessage::new(metadata.clone(), Bytes::new()).is_end_of_stream());
        assert!(!TransportMessage::new(metadata, Bytes::from_static(b"x")).is_end_of_stream());
    }

    #[test]
    fn scratch_path_is_optional_on_the_wire() {
        let json = r#"{"kind":"data_store_part","request_id":"r","data_store_id":"d",
                       "remote_key":"k","content_kind":"raw"}"#;
        let metadata: MessageMetadata = serde_json::from_str(json).unwrap();
        assert!(metadata.scratch_path.is_none());
        assert!(metadata.completion_flag.is_none());
    }
}
