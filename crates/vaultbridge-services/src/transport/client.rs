//! Sending side of a transport connection.

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::io::StreamReader;

use vaultbridge_core::config::TransportSettings;
use vaultbridge_core::{DataStoreRequest, Endpoint, MessageMetadata};

use super::request_buffer::RequestBuffers;
use super::{connect, read_chunk, timed, write_frame, BoxConnection};
use crate::store::ObjectStream;

/// One outbound connection carrying one logical message.
pub struct TransportClient {
    conn: BoxConnection,
    settings: TransportSettings,
    bytes_sent: u64,
}

impl TransportClient {
    pub async fn connect(endpoint: &Endpoint, settings: &TransportSettings) -> Result<Self> {
        let conn = connect(endpoint, settings.connect_timeout())
            .await
            .with_context(|| format!("failed to connect to {endpoint}"))?;
        tracing::trace!(%endpoint, "transport connection open");
        Ok(Self::from_connection(conn, settings))
    }

    pub fn from_connection(conn: BoxConnection, settings: &TransportSettings) -> Self {
        Self {
            conn,
            settings: settings.clone(),
            bytes_sent: 0,
        }
    }

    /// Payload bytes written so far.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// Write the metadata frame. Local scratch paths never leave this side.
    pub async fn send_metadata(&mut self, metadata: &MessageMetadata) -> Result<()> {
        let mut metadata = metadata.clone();
        metadata.scratch_path = None;
        let io_timeout = self.settings.io_timeout();
        tokio::time::timeout(io_timeout, write_frame(&mut self.conn, &metadata))
            .await
            .context("metadata write timed out")??;
        Ok(())
    }

    /// Send `metadata` then the object's body, read and forwarded one chunk
    /// at a time.
    pub async fn send_object_stream(
        &mut self,
        metadata: &MessageMetadata,
        stream: ObjectStream,
    ) -> Result<u64> {
        self.send_metadata(metadata).await?;

        let mut reader = StreamReader::new(stream.body);
        let mut sent = 0u64;
        loop {
            let chunk = timed(
                self.settings.io_timeout(),
                "object read",
                read_chunk(&mut reader, self.settings.chunk_size),
            )
            .await
            .context("reading object body")?;
            if chunk.is_empty() {
                break;
            }
            self.write_payload(&chunk).await?;
            sent += chunk.len() as u64;
        }

        if sent != stream.length {
            tracing::warn!(
                remote_key = %metadata.remote_key,
                expected = stream.length,
                bytes = sent,
                "object length differs from store-reported length"
            );
        }
        Ok(sent)
    }

    /// Send one scratch file as a data-store part of `request_id`.
    ///
    /// Only whole chunks are written. The tail that does not fill a chunk is
    /// kept in the request's buffer for the next part or the completion.
    pub async fn send_data_store_part(
        &mut self,
        request_id: &str,
        request: &DataStoreRequest,
        buffers: &RequestBuffers,
    ) -> Result<u64> {
        let path = request
            .local_path
            .as_deref()
            .context("data-store part without a local path")?;
        let mut file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("failed to open {}", path.display()))?;

        let metadata = MessageMetadata::data_store_part(
            request_id,
            &request.data_store_id,
            &request.remote_file_key,
        );
        self.send_metadata(&metadata).await?;

        let buffer = buffers.get_or_create(request_id);
        let mut sent = 0u64;
        loop {
            let data = read_chunk(&mut file, buffers.chunk_size())
                .await
                .with_context(|| format!("failed to read {}", path.display()))?;
            if data.is_empty() {
                break;
            }
            for chunk in buffer.push(&data) {
                self.write_payload(&chunk).await?;
                sent += chunk.len() as u64;
            }
        }

        tracing::debug!(
            request_id,
            remote_key = %request.remote_file_key,
            bytes = sent,
            buffered = buffer.len(),
            "data-store part sent"
        );
        Ok(sent)
    }

    /// Send the completion message for `request_id`, flushing its buffered
    /// residue as the payload.
    pub async fn send_completion(
        &mut self,
        request_id: &str,
        request: &DataStoreRequest,
        buffers: &RequestBuffers,
    ) -> Result<u64> {
        let metadata =
            MessageMetadata::completion(request_id, &request.data_store_id, &request.remote_file_key);
        self.send_metadata(&metadata).await?;

        let residue = buffers.take_remainder(request_id);
        if !residue.is_empty() {
            self.write_payload(&residue).await?;
        }
        tracing::debug!(request_id, bytes = residue.len(), "completion sent");
        Ok(residue.len() as u64)
    }

    /// End the message and wait for the peer to finish handling it.
    pub async fn close(mut self) -> Result<()> {
        let io_timeout = self.settings.io_timeout();
        timed(io_timeout, "shutdown", self.conn.shutdown())
            .await
            .context("failed to end message")?;

        // The peer closes its side once it has handled the whole message.
        let mut sink = [0u8; 512];
        loop {
            let n = timed(io_timeout, "close", self.conn.read(&mut sink))
                .await
                .context("waiting for peer to close")?;
            if n == 0 {
                break;
            }
        }
        Ok(())
    }

    async fn write_payload(&mut self, data: &[u8]) -> Result<()> {
        timed(self.settings.io_timeout(), "write", self.conn.write_all(data))
            .await
            .context("payload write failed")?;
        self.bytes_sent += data.len() as u64;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::pin::Pin;
    use std::sync::{Arc, Mutex};
    use std::task::{Context as TaskContext, Poll};

    use bytes::Bytes;
    use futures::StreamExt;
    use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

    /// Records the size of every write the client issues.
    #[derive(Clone, Default)]
    struct RecordingConn {
        writes: Arc<Mutex<Vec<usize>>>,
        data: Arc<Mutex<Vec<u8>>>,
    }

    impl AsyncRead for RecordingConn {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut TaskContext<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    impl AsyncWrite for RecordingConn {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut TaskContext<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            self.writes.lock().unwrap().push(buf.len());
            self.data.lock().unwrap().extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn settings(chunk_size: usize) -> TransportSettings {
        TransportSettings {
            chunk_size,
            ..TransportSettings::default()
        }
    }

    fn client(conn: &RecordingConn, chunk_size: usize) -> TransportClient {
        TransportClient::from_connection(Box::new(conn.clone()), &settings(chunk_size))
    }

    /// Payload write sizes, skipping the metadata frame write.
    fn payload_writes(conn: &RecordingConn) -> Vec<usize> {
        conn.writes.lock().unwrap()[1..].to_vec()
    }

    #[tokio::test]
    async fn aligned_part_is_sent_as_two_full_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("part");
        std::fs::write(&path, vec![7u8; 2 * 64]).unwrap();

        let conn = RecordingConn::default();
        let buffers = RequestBuffers::new(64);
        let mut client = client(&conn, 64);
        let request = DataStoreRequest::part("ds", "out/r.parquet", &path);

        let sent = client.send_data_store_part("req", &request, &buffers).await.unwrap();
        assert_eq!(sent, 128);
        assert_eq!(payload_writes(&conn), vec![64, 64]);
        assert_eq!(buffers.buffered("req"), 0);
    }

    #[tokio::test]
    async fn unaligned_tail_waits_for_completion() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first");
        let second = dir.path().join("second");
        std::fs::write(&first, vec![1u8; 100]).unwrap();
        std::fs::write(&second, vec![2u8; 50]).unwrap();
        let buffers = RequestBuffers::new(64);

        let conn = RecordingConn::default();
        client(&conn, 64)
            .send_data_store_part("req", &DataStoreRequest::part("ds", "k", &first), &buffers)
            .await
            .unwrap();
        assert_eq!(payload_writes(&conn), vec![64]);
        assert_eq!(buffers.buffered("req"), 36);

        let conn = RecordingConn::default();
        client(&conn, 64)
            .send_data_store_part("req", &DataStoreRequest::part("ds", "k", &second), &buffers)
            .await
            .unwrap();
        assert_eq!(payload_writes(&conn), vec![64]);
        assert_eq!(buffers.buffered("req"), 22);

        let conn = RecordingConn::default();
        let sent = client(&conn, 64)
            .send_completion("req", &DataStoreRequest::completion("ds", "k"), &buffers)
            .await
            .unwrap();
        assert_eq!(sent, 22);
        assert_eq!(payload_writes(&conn), vec![22]);
        assert_eq!(buffers.active_requests(), 0);
    }

    #[tokio::test]
    async fn object_stream_is_rechunked() {
        let conn = RecordingConn::default();
        let pieces: Vec<io::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"0123456789")),
            Ok(Bytes::from_static(b"abc")),
        ];
        let stream = ObjectStream {
            length: 13,
            body: futures::stream::iter(pieces).boxed(),
        };
        let metadata = MessageMetadata::object_stream("req", "ds", "in/a.parquet");

        let sent = client(&conn, 4).send_object_stream(&metadata, stream).await.unwrap();
        assert_eq!(sent, 13);
        assert_eq!(payload_writes(&conn), vec![4, 4, 4, 1]);
        assert!(conn.data.lock().unwrap().ends_with(b"0123456789abc"));
    }

    #[tokio::test]
    async fn scratch_path_is_not_sent() {
        let conn = RecordingConn::default();
        let mut metadata = MessageMetadata::object_stream("req", "ds", "in/a.parquet");
        metadata.scratch_path = Some("/dev/shm/secret".into());

        client(&conn, 4).send_metadata(&metadata).await.unwrap();
        let written = conn.data.lock().unwrap().clone();
        let (decoded, _) = vaultbridge_core::wire::decode_frame(&written, 1024).unwrap();
        assert_eq!(decoded.scratch_path, None);
    }
}
