//! Event topics and payloads exchanged over the [`EventBus`](crate::EventBus).

use std::fmt;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use vaultbridge_core::{DataStoreRequest, MessageMetadata, TransportMessage};

use crate::store::ObjectStream;

/// Closed set of topics produced and consumed by the data plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// A remote object is open and ready to be streamed into the enclave.
    ObjectAvailable,
    /// A result part (or completion) should be sent to the host.
    TransportSendRequest,
    /// A network chunk of a result arrived at the host. Empty = end of stream.
    DataStorePartAvailable,
    /// A decrypted scratch file is ready inside the enclave.
    DataStoreFileAvailable,
    /// Every tracked result upload finished.
    WorkloadCompleted,
}

#[derive(Debug, Clone)]
pub enum Event {
    ObjectAvailable(ObjectTransfer),
    TransportSendRequest(SendRequest),
    DataStorePartAvailable(TransportMessage),
    /// Metadata carries `scratch_path`.
    DataStoreFileAvailable(MessageMetadata),
    WorkloadCompleted,
}

impl Event {
    pub fn topic(&self) -> Topic {
        match self {
            Event::ObjectAvailable(_) => Topic::ObjectAvailable,
            Event::TransportSendRequest(_) => Topic::TransportSendRequest,
            Event::DataStorePartAvailable(_) => Topic::DataStorePartAvailable,
            Event::DataStoreFileAvailable(_) => Topic::DataStoreFileAvailable,
            Event::WorkloadCompleted => Topic::WorkloadCompleted,
        }
    }
}

/// An outbound continuation message for one logical request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendRequest {
    pub request_id: String,
    pub request: DataStoreRequest,
}

/// A live object body plus where it is going.
#[derive(Debug, Clone)]
pub struct ObjectTransfer {
    pub metadata: MessageMetadata,
    pub body: ObjectBody,
}

// ── Object body ───────────────────────────────────────────────────────────────

/// Take-once handle on a live object stream.
///
/// Events are cloned per subscriber, the stream is not: exactly one
/// subscriber gets it through [`ObjectBody::take`]. The receiver returned by
/// [`ObjectBody::new`] resolves once the taken stream is dropped, or once
/// every handle is dropped without anyone taking it.
#[derive(Clone)]
pub struct ObjectBody {
    inner: Arc<Mutex<Option<TakenBody>>>,
}

/// A taken object stream. Dropping it releases the downloader.
pub struct TakenBody {
    pub stream: ObjectStream,
    _release: oneshot::Sender<()>,
}

impl ObjectBody {
    pub fn new(stream: ObjectStream) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        let body = Self {
            inner: Arc::new(Mutex::new(Some(TakenBody {
                stream,
                _release: tx,
            }))),
        };
        (body, rx)
    }

    /// Take the stream. Returns None if another subscriber already took it.
    pub fn take(&self) -> Option<TakenBody> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

impl fmt::Debug for ObjectBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let available = self
            .inner
            .lock()
            .map(|guard| guard.is_some())
            .unwrap_or(false);
        f.debug_struct("ObjectBody")
            .field("available", &available)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::StreamExt;

    fn stream_of(data: &'static [u8]) -> ObjectStream {
        ObjectStream {
            length: data.len() as u64,
            body: futures::stream::iter(vec![Ok(Bytes::from_static(data))]).boxed(),
        }
    }

    #[test]
    fn body_is_taken_once() {
        let (body, _released) = ObjectBody::new(stream_of(b"abc"));
        let clone = body.clone();
        assert!(body.take().is_some());
        assert!(clone.take().is_none());
    }

    #[tokio::test]
    async fn dropping_taken_body_releases() {
        let (body, released) = ObjectBody::new(stream_of(b"abc"));
        let taken = body.take().unwrap();
        assert_eq!(taken.stream.length, 3);
        drop(taken);
        // Sender dropped → receiver resolves with an error, which is the release signal.
        assert!(released.await.is_err());
    }

    #[tokio::test]
    async fn dropping_untaken_body_releases() {
        let (body, released) = ObjectBody::new(stream_of(b"abc"));
        drop(body);
        assert!(released.await.is_err());
    }

    #[test]
    fn topics_match_variants() {
        assert_eq!(Event::WorkloadCompleted.topic(), Topic::WorkloadCompleted);
        let msg = TransportMessage::metadata_only(MessageMetadata::data_store_part("r", "d", "k"));
        assert_eq!(
            Event::DataStorePartAvailable(msg).topic(),
            Topic::DataStorePartAvailable
        );
    }
}
