//! Message framing for TCP streams.
//!
//! A [`FramingStrategy`] carves a byte stream into discrete messages and
//! serializes outgoing messages back into the same wire format. Three
//! strategies ship with the crate:
//!
//! ```text
//! Line            | payload bytes ... | \n |
//! Delimiter(d)    | payload bytes ... | d  |
//! LengthPrefixed  | length (u32 BE)   | payload (length bytes) |
//! ```
//!
//! Every strategy enforces a maximum frame size so a peer cannot make the
//! server buffer without bound. The length prefix does **not** include the
//! 4 prefix bytes themselves, and a length of 0 is a valid empty message.

use std::fmt;
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder, FramedRead};

/// Default maximum frame size in bytes (1 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1_048_576;

const LENGTH_PREFIX_LEN: usize = 4;

/// Errors that can occur while reading or writing frames.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The frame (declared or accumulated) exceeds the configured maximum.
    #[error("frame size {size} exceeds maximum {max}")]
    FrameTooLarge {
        /// The offending size.
        size: usize,
        /// The configured maximum.
        max: usize,
    },

    /// The stream ended in the middle of a length-prefixed payload.
    #[error("stream ended after {received} of {expected} payload bytes")]
    Truncated {
        /// Declared payload length.
        expected: usize,
        /// Payload bytes actually received.
        received: usize,
    },

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-connection decode progress, owned by the codec.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeState {
    /// Leading bytes of the buffer already searched for a terminator.
    pub next_index: usize,
}

/// A rule for splitting a byte stream into messages.
///
/// Implementations are stateless and shared by every connection; all
/// per-connection state lives in the buffer and [`DecodeState`] handed
/// to `decode`.
pub trait FramingStrategy: Send + Sync + fmt::Debug {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Try to take one complete message off the front of `src`.
    ///
    /// Returns `Ok(None)` when more bytes are needed.
    fn decode(
        &self,
        src: &mut BytesMut,
        state: &mut DecodeState,
    ) -> Result<Option<Bytes>, FrameError>;

    /// Called once the peer has closed its write side. Drains remaining
    /// complete messages, then decides what to do with leftover bytes.
    fn decode_eof(
        &self,
        src: &mut BytesMut,
        state: &mut DecodeState,
    ) -> Result<Option<Bytes>, FrameError>;

    /// Append the wire form of `message` to `dst`.
    fn encode(&self, message: &[u8], dst: &mut BytesMut) -> Result<(), FrameError>;
}

// Resumes the search at `state.next_index` so a frame trickled in one
// byte at a time is scanned once overall.
fn take_until(
    src: &mut BytesMut,
    delimiter: u8,
    max: usize,
    state: &mut DecodeState,
) -> Result<Option<BytesMut>, FrameError> {
    let read_to = src.len().min(max.saturating_add(1));
    let start = state.next_index.min(read_to);
    match src[start..read_to].iter().position(|b| *b == delimiter) {
        Some(offset) => {
            state.next_index = 0;
            let pos = start + offset;
            let mut frame = src.split_to(pos + 1);
            frame.truncate(pos);
            Ok(Some(frame))
        }
        None if src.len() > max => {
            state.next_index = 0;
            Err(FrameError::FrameTooLarge {
                size: src.len(),
                max,
            })
        }
        None => {
            state.next_index = read_to;
            Ok(None)
        }
    }
}

fn check_outgoing(len: usize, max: usize) -> Result<(), FrameError> {
    if len > max {
        return Err(FrameError::FrameTooLarge { size: len, max });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Line
// ---------------------------------------------------------------------------

/// Newline-delimited messages. A trailing `\r` is stripped so `\r\n`
/// peers work, and an unterminated final line is still delivered at EOF.
#[derive(Debug, Clone)]
pub struct LineFraming {
    max_frame_size: usize,
}

impl LineFraming {
    /// Create a line strategy with the given maximum line length.
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    fn strip_cr(mut line: BytesMut) -> Bytes {
        if line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }
        line.freeze()
    }
}

impl Default for LineFraming {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl FramingStrategy for LineFraming {
    fn name(&self) -> &'static str {
        "line"
    }

    fn decode(
        &self,
        src: &mut BytesMut,
        state: &mut DecodeState,
    ) -> Result<Option<Bytes>, FrameError> {
        Ok(take_until(src, b'\n', self.max_frame_size, state)?.map(Self::strip_cr))
    }

    fn decode_eof(
        &self,
        src: &mut BytesMut,
        state: &mut DecodeState,
    ) -> Result<Option<Bytes>, FrameError> {
        if let Some(line) = self.decode(src, state)? {
            return Ok(Some(line));
        }
        state.next_index = 0;
        if src.is_empty() {
            return Ok(None);
        }
        let rest = src.split();
        Ok(Some(Self::strip_cr(rest)))
    }

    fn encode(&self, message: &[u8], dst: &mut BytesMut) -> Result<(), FrameError> {
        check_outgoing(message.len(), self.max_frame_size)?;
        dst.reserve(message.len() + 1);
        dst.extend_from_slice(message);
        dst.put_u8(b'\n');
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Delimiter
// ---------------------------------------------------------------------------

/// Messages terminated by an arbitrary single byte.
///
/// Payloads must not contain the delimiter. Bytes left without a
/// terminating delimiter when the stream ends are discarded.
#[derive(Debug, Clone)]
pub struct DelimiterFraming {
    delimiter: u8,
    max_frame_size: usize,
}

impl DelimiterFraming {
    /// Create a delimiter strategy.
    pub fn new(delimiter: u8, max_frame_size: usize) -> Self {
        Self {
            delimiter,
            max_frame_size,
        }
    }

    /// The configured delimiter byte.
    pub fn delimiter(&self) -> u8 {
        self.delimiter
    }
}

impl FramingStrategy for DelimiterFraming {
    fn name(&self) -> &'static str {
        "delimiter"
    }

    fn decode(
        &self,
        src: &mut BytesMut,
        state: &mut DecodeState,
    ) -> Result<Option<Bytes>, FrameError> {
        Ok(take_until(src, self.delimiter, self.max_frame_size, state)?.map(BytesMut::freeze))
    }

    fn decode_eof(
        &self,
        src: &mut BytesMut,
        state: &mut DecodeState,
    ) -> Result<Option<Bytes>, FrameError> {
        if let Some(frame) = self.decode(src, state)? {
            return Ok(Some(frame));
        }
        state.next_index = 0;
        if !src.is_empty() {
            tracing::debug!(
                bytes = src.len(),
                "discarding unterminated trailing bytes at end of stream"
            );
            src.clear();
        }
        Ok(None)
    }

    fn encode(&self, message: &[u8], dst: &mut BytesMut) -> Result<(), FrameError> {
        check_outgoing(message.len(), self.max_frame_size)?;
        dst.reserve(message.len() + 1);
        dst.extend_from_slice(message);
        dst.put_u8(self.delimiter);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Length-prefixed
// ---------------------------------------------------------------------------

/// Messages prefixed with their length as a big-endian `u32`.
#[derive(Debug, Clone)]
pub struct LengthPrefixedFraming {
    max_frame_size: usize,
}

impl LengthPrefixedFraming {
    /// Create a length-prefixed strategy with the given maximum payload size.
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    fn peek_len(src: &BytesMut) -> Option<usize> {
        if src.len() < LENGTH_PREFIX_LEN {
            return None;
        }
        let prefix = [src[0], src[1], src[2], src[3]];
        Some(u32::from_be_bytes(prefix) as usize)
    }
}

impl Default for LengthPrefixedFraming {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl FramingStrategy for LengthPrefixedFraming {
    fn name(&self) -> &'static str {
        "length_prefixed"
    }

    fn decode(
        &self,
        src: &mut BytesMut,
        _state: &mut DecodeState,
    ) -> Result<Option<Bytes>, FrameError> {
        let Some(len) = Self::peek_len(src) else {
            return Ok(None);
        };

        // Reject before reserving anything for the payload.
        if len > self.max_frame_size {
            return Err(FrameError::FrameTooLarge {
                size: len,
                max: self.max_frame_size,
            });
        }

        let total = LENGTH_PREFIX_LEN + len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_LEN);
        Ok(Some(src.split_to(len).freeze()))
    }

    fn decode_eof(
        &self,
        src: &mut BytesMut,
        state: &mut DecodeState,
    ) -> Result<Option<Bytes>, FrameError> {
        if let Some(frame) = self.decode(src, state)? {
            return Ok(Some(frame));
        }
        match Self::peek_len(src) {
            // EOF while waiting for a length prefix is a clean end.
            None => {
                src.clear();
                Ok(None)
            }
            Some(expected) => Err(FrameError::Truncated {
                expected,
                received: src.len() - LENGTH_PREFIX_LEN,
            }),
        }
    }

    fn encode(&self, message: &[u8], dst: &mut BytesMut) -> Result<(), FrameError> {
        check_outgoing(message.len(), self.max_frame_size)?;
        let len = u32::try_from(message.len()).map_err(|_| FrameError::FrameTooLarge {
            size: message.len(),
            max: u32::MAX as usize,
        })?;
        dst.reserve(LENGTH_PREFIX_LEN + message.len());
        dst.put_u32(len);
        dst.extend_from_slice(message);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Which framing strategy to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingKind {
    /// Split on `\n`.
    Line,
    /// Split on the given byte.
    Delimiter(u8),
    /// 4-byte big-endian length prefix.
    LengthPrefixed,
}

/// Configuration for the framing layer.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Strategy selection. Default: [`FramingKind::Line`].
    pub kind: FramingKind,
    /// Maximum allowed frame size in bytes. Default: 1 MiB.
    pub max_frame_size: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            kind: FramingKind::Line,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl FrameConfig {
    /// Build the configured strategy.
    pub fn build(&self) -> Arc<dyn FramingStrategy> {
        match self.kind {
            FramingKind::Line => Arc::new(LineFraming::new(self.max_frame_size)),
            FramingKind::Delimiter(d) => Arc::new(DelimiterFraming::new(d, self.max_frame_size)),
            FramingKind::LengthPrefixed => {
                Arc::new(LengthPrefixedFraming::new(self.max_frame_size))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Stream adapters
// ---------------------------------------------------------------------------

/// [`tokio_util`] codec driving a shared [`FramingStrategy`].
#[derive(Debug, Clone)]
pub struct MessageCodec {
    strategy: Arc<dyn FramingStrategy>,
    state: DecodeState,
}

impl MessageCodec {
    /// Wrap a strategy.
    pub fn new(strategy: Arc<dyn FramingStrategy>) -> Self {
        Self {
            strategy,
            state: DecodeState::default(),
        }
    }
}

impl Decoder for MessageCodec {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        self.strategy.decode(src, &mut self.state)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        self.strategy.decode_eof(src, &mut self.state)
    }
}

impl Encoder<&[u8]> for MessageCodec {
    type Error = FrameError;

    fn encode(&mut self, item: &[u8], dst: &mut BytesMut) -> Result<(), FrameError> {
        self.strategy.encode(item, dst)
    }
}

/// Turn a byte stream into a lazy, forward-only stream of messages.
///
/// The stream ends on a clean end-of-stream, yields an error on I/O or
/// framing failure, and stops reading as soon as it is dropped.
pub fn read_messages<R: AsyncRead>(
    reader: R,
    strategy: Arc<dyn FramingStrategy>,
) -> FramedRead<R, MessageCodec> {
    FramedRead::new(reader, MessageCodec::new(strategy))
}

/// Write a single message and flush.
pub async fn write_message<W: AsyncWrite + Unpin + ?Sized>(
    writer: &mut W,
    strategy: &dyn FramingStrategy,
    message: &[u8],
) -> Result<(), FrameError> {
    let mut buf = BytesMut::new();
    strategy.encode(message, &mut buf)?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio::io::duplex;

    async fn decode_all(
        strategy: Arc<dyn FramingStrategy>,
        wire: Vec<u8>,
    ) -> Vec<Result<Bytes, FrameError>> {
        let (mut client, server) = duplex(8192);
        let writer = tokio::spawn(async move {
            client.write_all(&wire).await.unwrap();
            // Dropping the client half signals EOF.
        });
        let frames = read_messages(server, strategy).collect::<Vec<_>>().await;
        writer.await.unwrap();
        frames
    }

    fn encode_all(strategy: &dyn FramingStrategy, messages: &[&[u8]]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        for m in messages {
            strategy.encode(m, &mut buf).unwrap();
        }
        buf.to_vec()
    }

    fn ok_frames(frames: Vec<Result<Bytes, FrameError>>) -> Vec<Vec<u8>> {
        frames.into_iter().map(|f| f.unwrap().to_vec()).collect()
    }

    #[tokio::test]
    async fn test_line_sequence_roundtrip() {
        let strategy: Arc<dyn FramingStrategy> = Arc::new(LineFraming::default());
        let messages: Vec<&[u8]> = vec![b"PING", b"", b"BROADCAST hello world"];
        let wire = encode_all(strategy.as_ref(), &messages);

        let frames = ok_frames(decode_all(strategy, wire).await);
        assert_eq!(frames, vec![b"PING".to_vec(), vec![], b"BROADCAST hello world".to_vec()]);
    }

    #[tokio::test]
    async fn test_line_strips_carriage_return() {
        let strategy: Arc<dyn FramingStrategy> = Arc::new(LineFraming::default());
        let frames = ok_frames(decode_all(strategy, b"one\r\ntwo\n".to_vec()).await);
        assert_eq!(frames, vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[tokio::test]
    async fn test_line_unterminated_tail_delivered_at_eof() {
        let strategy: Arc<dyn FramingStrategy> = Arc::new(LineFraming::default());
        let frames = ok_frames(decode_all(strategy, b"first\nlast".to_vec()).await);
        assert_eq!(frames, vec![b"first".to_vec(), b"last".to_vec()]);
    }

    #[tokio::test]
    async fn test_delimiter_sequence_roundtrip() {
        let strategy: Arc<dyn FramingStrategy> = Arc::new(DelimiterFraming::new(b'|', 1024));
        let messages: Vec<&[u8]> = vec![b"alpha", b"", b"gamma\n"];
        let wire = encode_all(strategy.as_ref(), &messages);
        assert_eq!(wire, b"alpha||gamma\n|");

        let frames = ok_frames(decode_all(strategy, wire).await);
        assert_eq!(frames, vec![b"alpha".to_vec(), vec![], b"gamma\n".to_vec()]);
    }

    #[tokio::test]
    async fn test_delimiter_discards_unterminated_tail() {
        let strategy: Arc<dyn FramingStrategy> = Arc::new(DelimiterFraming::new(0, 1024));
        let frames = ok_frames(decode_all(strategy, b"done\0partial".to_vec()).await);
        assert_eq!(frames, vec![b"done".to_vec()]);
    }

    #[tokio::test]
    async fn test_length_prefixed_sequence_roundtrip() {
        let strategy: Arc<dyn FramingStrategy> = Arc::new(LengthPrefixedFraming::default());
        // Payloads may contain any byte, including newlines and zero.
        let messages: Vec<&[u8]> = vec![b"first", b"", b"line\nbreak\0and zero", &[0, 0, 0, 4]];
        let wire = encode_all(strategy.as_ref(), &messages);

        let frames = ok_frames(decode_all(strategy, wire).await);
        let expected: Vec<Vec<u8>> = messages.iter().map(|m| m.to_vec()).collect();
        assert_eq!(frames, expected);
    }

    #[tokio::test]
    async fn test_length_prefix_is_big_endian() {
        let strategy = LengthPrefixedFraming::default();
        let mut buf = BytesMut::new();
        strategy.encode(b"hello", &mut buf).unwrap();
        assert_eq!(&buf[..4], &[0, 0, 0, 5]);
        assert_eq!(&buf[4..], b"hello");
    }

    #[tokio::test]
    async fn test_truncated_payload_is_an_error() {
        let strategy: Arc<dyn FramingStrategy> = Arc::new(LengthPrefixedFraming::default());
        let mut wire = 10u32.to_be_bytes().to_vec();
        wire.extend_from_slice(b"abc");

        let frames = decode_all(strategy, wire).await;
        assert_eq!(frames.len(), 1, "no short message may be emitted");
        assert!(matches!(
            frames[0],
            Err(FrameError::Truncated { expected: 10, received: 3 })
        ));
    }

    #[tokio::test]
    async fn test_eof_inside_length_prefix_is_clean() {
        let strategy: Arc<dyn FramingStrategy> = Arc::new(LengthPrefixedFraming::default());
        let mut wire = encode_all(strategy.as_ref(), &[b"whole"]);
        wire.extend_from_slice(&[0, 0]);

        let frames = ok_frames(decode_all(strategy, wire).await);
        assert_eq!(frames, vec![b"whole".to_vec()]);
    }

    #[tokio::test]
    async fn test_oversized_length_rejected_before_payload() {
        let strategy: Arc<dyn FramingStrategy> = Arc::new(LengthPrefixedFraming::new(16));
        let wire = 1024u32.to_be_bytes().to_vec();

        let frames = decode_all(strategy, wire).await;
        assert!(matches!(
            frames[0],
            Err(FrameError::FrameTooLarge { size: 1024, max: 16 })
        ));
    }

    #[tokio::test]
    async fn test_unbounded_line_rejected() {
        let strategy: Arc<dyn FramingStrategy> = Arc::new(LineFraming::new(8));
        let frames = decode_all(strategy, b"this line never ends".to_vec()).await;
        assert!(matches!(frames[0], Err(FrameError::FrameTooLarge { .. })));
    }

    #[tokio::test]
    async fn test_oversized_message_rejected_on_write() {
        let (mut client, _server) = duplex(8192);
        let strategy = LengthPrefixedFraming::new(16);
        let result = write_message(&mut client, &strategy, &[0u8; 1024]).await;
        assert!(matches!(result, Err(FrameError::FrameTooLarge { .. })));
    }

    #[tokio::test]
    async fn test_partial_reads_reassemble() {
        // A tiny duplex buffer forces every frame across many reads.
        let (mut client, server) = duplex(3);
        let strategy: Arc<dyn FramingStrategy> = Arc::new(LengthPrefixedFraming::default());
        let write_strategy = Arc::clone(&strategy);

        let writer = tokio::spawn(async move {
            write_message(&mut client, write_strategy.as_ref(), b"scattered across reads")
                .await
                .unwrap();
            write_message(&mut client, write_strategy.as_ref(), b"again").await.unwrap();
        });

        let frames = ok_frames(read_messages(server, strategy).collect::<Vec<_>>().await);
        writer.await.unwrap();
        assert_eq!(frames, vec![b"scattered across reads".to_vec(), b"again".to_vec()]);
    }

    #[tokio::test]
    async fn test_line_partial_reads_reassemble() {
        let (mut client, server) = duplex(2);
        let strategy: Arc<dyn FramingStrategy> = Arc::new(LineFraming::default());
        let write_strategy = Arc::clone(&strategy);

        let writer = tokio::spawn(async move {
            for msg in [&b"one two"[..], b"three"] {
                write_message(&mut client, write_strategy.as_ref(), msg).await.unwrap();
            }
        });

        let frames = ok_frames(read_messages(server, strategy).collect::<Vec<_>>().await);
        writer.await.unwrap();
        assert_eq!(frames, vec![b"one two".to_vec(), b"three".to_vec()]);
    }

    #[test]
    fn test_trickled_line_resumes_scan() {
        let mut codec = MessageCodec::new(Arc::new(LineFraming::default()));
        let mut buf = BytesMut::new();
        for (i, byte) in b"slow line".iter().enumerate() {
            buf.put_u8(*byte);
            assert!(codec.decode(&mut buf).unwrap().is_none());
            assert_eq!(codec.state.next_index, i + 1, "already scanned bytes are skipped");
        }
        buf.extend_from_slice(b"\nnext");
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"slow line");
        assert_eq!(codec.state.next_index, 0);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(&codec.decode_eof(&mut buf).unwrap().unwrap()[..], b"next");
    }

    #[test]
    fn test_trickled_delimiter_frame_hits_limit() {
        let mut codec = MessageCodec::new(Arc::new(DelimiterFraming::new(b'|', 4)));
        let mut buf = BytesMut::new();
        for byte in b"abcd" {
            buf.put_u8(*byte);
            assert!(codec.decode(&mut buf).unwrap().is_none());
        }
        buf.put_u8(b'e');
        assert!(matches!(
            codec.decode(&mut buf),
            Err(FrameError::FrameTooLarge { size: 5, max: 4 })
        ));
    }

    #[test]
    fn test_frame_at_exact_limit_is_accepted() {
        let mut codec = MessageCodec::new(Arc::new(DelimiterFraming::new(b'|', 4)));
        let mut buf = BytesMut::from(&b"abcd|"[..]);
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"abcd");
    }

    #[test]
    fn test_frame_config_builds_requested_strategy() {
        let config = FrameConfig {
            kind: FramingKind::Delimiter(b';'),
            ..Default::default()
        };
        assert_eq!(config.build().name(), "delimiter");
        assert_eq!(FrameConfig::default().build().name(), "line");
    }
}
