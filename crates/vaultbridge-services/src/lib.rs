//! vaultbridge-services: the data plane between host and enclave.
//!
//! Components talk to each other only through the [`EventBus`]:
//!
//! ```text
//! downloader ─▶ ObjectAvailable ─▶ router ─▶ transport ─▶ enclave server
//!                                                            │
//!                              DataStoreFileAvailable ◀─ decryption
//!                                        │
//!            compute ─▶ TransportSendRequest ─▶ router ─▶ transport ─▶ host server
//!                                                                       │
//!        remote store ◀─ result upload ◀─ DataStorePartAvailable ◀──────┘
//! ```

pub mod decryption;
pub mod downloader;
pub mod event_bus;
pub mod events;
pub mod keyring;
pub mod registry;
pub mod result_publisher;
pub mod result_upload;
pub mod router;
pub mod store;
pub mod transport;

pub use decryption::{
    DecryptCommand, DecryptError, DecryptionPipeline, DecryptionSession, SessionState,
    SessionTimeouts,
};
pub use downloader::{DownloadSummary, ObjectStoreDownloader};
pub use event_bus::{EventBus, EventHandler};
pub use events::{Event, ObjectBody, ObjectTransfer, SendRequest, Topic};
pub use keyring::{DataKey, KeyFileError, KeyRing};
pub use registry::Registry;
pub use result_publisher::ResultPublisher;
pub use result_upload::{ResultStatus, ResultUploadManager, ResultWrapper};
pub use router::RequestRouter;
pub use store::{
    CompletedPart, MultipartObjectStore, ObjectStoreBackend, ObjectStream, RemoteStore,
    StoreError, UploadTarget,
};
pub use transport::{
    BoxConnection, Connection, ConnectionHandler, DecryptingReceiver, Listener, RequestBuffer,
    RequestBuffers, ResultChunkReceiver, TransportClient, TransportServer,
};
