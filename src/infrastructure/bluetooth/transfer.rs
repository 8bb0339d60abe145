//! Data Transfer Channel
//!
//! Frames outgoing [`Message`]s onto a connected peer stream and decodes
//! inbound frames back into messages. One frame per line; see
//! [`protocol`](super::protocol) for the envelope.

use crate::domain::error::SessionError;
use crate::domain::models::Message;
use crate::infrastructure::bluetooth::adapter::PeerStream;
use crate::infrastructure::bluetooth::protocol::{self, FRAME_DELIMITER};
use tokio::io::{
    AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf,
};
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

pub struct DataTransferChannel;

impl DataTransferChannel {
    /// Split a connected stream into its sending and listening halves.
    pub fn open(stream: PeerStream, max_payload_bytes: usize) -> (TransferSender, MessageListener) {
        let (reader, writer) = tokio::io::split(stream);
        (
            TransferSender {
                writer: Mutex::new(Some(writer)),
            },
            MessageListener {
                reader: BufReader::new(reader),
                buffer: Vec::new(),
                max_payload_bytes,
                finished: false,
            },
        )
    }
}

/// Writing half of the channel. Once a write fails the sender is dead.
pub struct TransferSender {
    writer: Mutex<Option<WriteHalf<PeerStream>>>,
}

impl TransferSender {
    /// Write `message` as a single frame.
    pub async fn send(&self, message: &Message) -> Result<(), SessionError> {
        let frame = protocol::encode_message(message)?;
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| SessionError::Transport("stream is closed".to_string()))?;

        let result = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        }
        .await;

        match result {
            Ok(()) => {
                trace!("Sent {} byte frame", frame.len());
                Ok(())
            }
            Err(e) => {
                warn!("Write failed, closing channel: {}", e);
                *guard = None;
                Err(SessionError::from(e))
            }
        }
    }

    /// Shut down the write side so the peer sees end of stream.
    pub async fn shutdown(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                debug!("Shutdown of peer stream failed: {}", e);
            }
        }
    }
}

/// Reading half of the channel: a lazy sequence of decoded messages.
pub struct MessageListener {
    reader: BufReader<ReadHalf<PeerStream>>,
    buffer: Vec<u8>,
    max_payload_bytes: usize,
    finished: bool,
}

impl MessageListener {
    /// Next decoded message, `Ok(None)` once the peer has closed the stream.
    ///
    /// A malformed or oversized payload ends the sequence with an error;
    /// frame boundaries can't be recovered after corruption.
    pub async fn next(&mut self) -> Result<Option<Message>, SessionError> {
        if self.finished {
            return Ok(None);
        }
        let result = self.read_frame().await;
        if !matches!(result, Ok(Some(_))) {
            self.finished = true;
        }
        result
    }

    async fn read_frame(&mut self) -> Result<Option<Message>, SessionError> {
        self.buffer.clear();
        let limit = (self.max_payload_bytes as u64).saturating_add(1);
        let read = (&mut self.reader)
            .take(limit)
            .read_until(FRAME_DELIMITER, &mut self.buffer)
            .await?;

        if read == 0 {
            debug!("Peer closed the stream");
            return Ok(None);
        }

        if self.buffer.last() != Some(&FRAME_DELIMITER) {
            if self.buffer.len() as u64 >= limit {
                return Err(SessionError::MalformedPayload(format!(
                    "payload exceeds {} bytes",
                    self.max_payload_bytes
                )));
            }
            // Stream ended without a trailing delimiter; accept it only if
            // it holds one complete envelope.
            debug!("Unterminated final frame ({} bytes)", self.buffer.len());
        }

        protocol::decode_message(&self.buffer).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    fn channel_pair(max: usize) -> (TransferSender, MessageListener, tokio::io::DuplexStream) {
        let (local, remote) = duplex(4096);
        let (sender, listener) = DataTransferChannel::open(Box::new(local), max);
        (sender, listener, remote)
    }

    #[tokio::test]
    async fn test_sent_frame_decodes_on_other_side() {
        let (a, b) = duplex(4096);
        let (sender, _a_listener) = DataTransferChannel::open(Box::new(a), 1024);
        let (_b_sender, mut listener) = DataTransferChannel::open(Box::new(b), 1024);

        sender.send(&Message::local("hello", "Alice")).await.unwrap();
        sender.send(&Message::local("again", "Alice")).await.unwrap();

        let first = listener.next().await.unwrap().unwrap();
        assert_eq!(first, Message::remote("hello", "Alice"));
        let second = listener.next().await.unwrap().unwrap();
        assert_eq!(second.body(), "again");
        assert!(!second.origin_local());
    }

    #[tokio::test]
    async fn test_frames_split_across_writes() {
        let (_sender, mut listener, mut remote) = channel_pair(1024);
        remote.write_all(br#"{"message":"hi","sen"#).await.unwrap();
        remote
            .write_all(b"derName\":\"Bob\",\"isFromLocalUser\":true}\n")
            .await
            .unwrap();

        let message = listener.next().await.unwrap().unwrap();
        assert_eq!(message, Message::remote("hi", "Bob"));
    }

    #[tokio::test]
    async fn test_clean_close_ends_sequence() {
        let (_sender, mut listener, remote) = channel_pair(1024);
        drop(remote);
        assert_eq!(listener.next().await.unwrap(), None);
        assert_eq!(listener.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unterminated_final_envelope_is_accepted() {
        let (_sender, mut listener, mut remote) = channel_pair(1024);
        remote
            .write_all(br#"{"message":"last","senderName":"Bob","isFromLocalUser":false}"#)
            .await
            .unwrap();
        drop(remote);

        assert_eq!(listener.next().await.unwrap().unwrap().body(), "last");
        assert_eq!(listener.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_fatal() {
        let (_sender, mut listener, mut remote) = channel_pair(1024);
        remote.write_all(b"not json\n").await.unwrap();
        remote
            .write_all(b"{\"message\":\"after\",\"senderName\":\"Bob\",\"isFromLocalUser\":false}\n")
            .await
            .unwrap();

        assert!(matches!(
            listener.next().await,
            Err(SessionError::MalformedPayload(_))
        ));
        // Nothing after corruption is delivered.
        assert_eq!(listener.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_oversized_payload_is_rejected() {
        let (_sender, mut listener, mut remote) = channel_pair(16);
        remote.write_all(&[b'x'; 64]).await.unwrap();

        let err = listener.next().await.unwrap_err();
        assert!(matches!(err, SessionError::MalformedPayload(r) if r.contains("16")));
    }

    #[tokio::test]
    async fn test_send_after_peer_gone_fails_and_kills_sender() {
        let (sender, _listener, remote) = channel_pair(1024);
        drop(remote);

        let err = sender.send(&Message::local("lost", "Alice")).await.unwrap_err();
        assert!(matches!(err, SessionError::Transport(_)));
        let err = sender.send(&Message::local("again", "Alice")).await.unwrap_err();
        assert!(matches!(err, SessionError::Transport(r) if r.contains("closed")));
    }

    #[tokio::test]
    async fn test_shutdown_signals_end_of_stream() {
        let (sender, _listener, mut remote) = channel_pair(1024);
        sender.shutdown().await;

        let mut buf = Vec::new();
        assert_eq!(remote.read_to_end(&mut buf).await.unwrap(), 0);
        assert!(sender.send(&Message::local("late", "Alice")).await.is_err());
    }

    #[tokio::test]
    async fn test_unbounded_payload_cap_reads_frames() {
        let (_sender, mut listener, mut remote) = channel_pair(usize::MAX);
        remote
            .write_all(b"{\"message\":\"big\",\"senderName\":\"Bob\",\"isFromLocalUser\":false}\n")
            .await
            .unwrap();

        assert_eq!(listener.next().await.unwrap().unwrap().body(), "big");
    }
}
