//! vaultbridge-core: shared types, wire format, and configuration.
//! All other vaultbridge crates depend on this one.

pub mod config;
pub mod endpoint;
pub mod message;
pub mod wire;

pub use endpoint::Endpoint;
pub use message::{
    ContentKind, DataStoreRequest, MessageKind, MessageMetadata, ObjectDescriptor,
    TransportMessage,
};
