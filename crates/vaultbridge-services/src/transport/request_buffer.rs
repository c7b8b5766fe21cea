//! Sub-chunk residue carried between data-store part sends.
//!
//! A request's result may be sent as several scratch files. Every socket
//! write except the very last one of the request must be exactly one chunk,
//! so whatever does not fill a chunk at the end of one file waits here for
//! the next file, or for the completion message.

use std::sync::{Arc, Mutex, MutexGuard};

use bytes::{Bytes, BytesMut};

use crate::registry::Registry;

pub struct RequestBuffer {
    pending: Mutex<BytesMut>,
    chunk_size: usize,
}

impl RequestBuffer {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            pending: Mutex::new(BytesMut::new()),
            chunk_size: chunk_size.max(1),
        }
    }

    /// Append `data` and return every full chunk now available, oldest first.
    /// Less than one chunk stays buffered.
    pub fn push(&self, data: &[u8]) -> Vec<Bytes> {
        let mut pending = self.lock();
        let mut full = Vec::new();

        let mut data = data;
        if !pending.is_empty() {
            let fill = (self.chunk_size - pending.len()).min(data.len());
            pending.extend_from_slice(&data[..fill]);
            data = &data[fill..];
            if pending.len() == self.chunk_size {
                full.push(pending.split().freeze());
            }
        }
        while data.len() >= self.chunk_size {
            let (chunk, rest) = data.split_at(self.chunk_size);
            full.push(Bytes::copy_from_slice(chunk));
            data = rest;
        }
        pending.extend_from_slice(data);
        full
    }

    /// Take whatever is buffered, leaving the buffer empty.
    pub fn take_remainder(&self) -> Bytes {
        self.lock().split().freeze()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, BytesMut> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Per-request [`RequestBuffer`]s. Cheap to clone.
#[derive(Clone)]
pub struct RequestBuffers {
    buffers: Arc<Registry<String, RequestBuffer>>,
    chunk_size: usize,
}

impl RequestBuffers {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            buffers: Arc::new(Registry::new()),
            chunk_size,
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn get_or_create(&self, request_id: &str) -> Arc<RequestBuffer> {
        self.buffers
            .get_or_insert_with(request_id.to_string(), || RequestBuffer::new(self.chunk_size))
            .0
    }

    /// Remove the request's buffer and return what it held.
    pub fn take_remainder(&self, request_id: &str) -> Bytes {
        self.buffers
            .remove(request_id)
            .map(|buffer| buffer.take_remainder())
            .unwrap_or_default()
    }

    /// Buffered bytes for `request_id`, 0 if none.
    pub fn buffered(&self, request_id: &str) -> usize {
        self.buffers.get(request_id).map(|b| b.len()).unwrap_or(0)
    }

    pub fn active_requests(&self) -> usize {
        self.buffers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emits_only_full_chunks() {
        let buffer = RequestBuffer::new(4);
        assert!(buffer.push(b"ab").is_empty());
        assert_eq!(buffer.len(), 2);

        let full = buffer.push(b"cdefghij");
        assert_eq!(full, vec![Bytes::from_static(b"abcd"), Bytes::from_static(b"efgh")]);
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.take_remainder(), Bytes::from_static(b"ij"));
        assert!(buffer.is_empty());
    }

    #[test]
    fn remainder_stays_below_chunk_size() {
        let buffer = RequestBuffer::new(7);
        let mut sent = Vec::new();
        for size in [1usize, 7, 3, 20, 6, 0, 13, 2] {
            let data: Vec<u8> = (0..size).map(|i| (sent.len() + i) as u8).collect();
            for chunk in buffer.push(&data) {
                assert_eq!(chunk.len(), 7);
                sent.extend_from_slice(&chunk);
            }
            assert!(buffer.len() < 7);
        }
        let rest = buffer.take_remainder();
        sent.extend_from_slice(&rest);
        assert_eq!(sent.len(), 1 + 7 + 3 + 20 + 6 + 13 + 2);
    }

    #[test]
    fn aligned_input_leaves_nothing_behind() {
        let buffer = RequestBuffer::new(5);
        assert_eq!(buffer.push(&[0u8; 10]).len(), 2);
        assert!(buffer.is_empty());
    }

    #[test]
    fn registry_is_keyed_by_request() {
        let buffers = RequestBuffers::new(4);
        buffers.get_or_create("a").push(b"xy");
        buffers.get_or_create("b").push(b"z");
        assert_eq!(buffers.buffered("a"), 2);
        assert_eq!(buffers.take_remainder("a"), Bytes::from_static(b"xy"));
        assert_eq!(buffers.buffered("a"), 0);
        assert_eq!(buffers.active_requests(), 1);
        assert!(buffers.take_remainder("missing").is_empty());
    }
}
