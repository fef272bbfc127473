//! Length-prefixed framing for raw byte streams
//!
//! Byte streams carry no message boundaries. Each envelope is therefore preceded by its
//! length in bytes, written as ASCII decimal digits and terminated by a `#` delimiter:
//!
//! ```text
//! 29#{"pattern":"log","data":"hi"}
//! ```
//!
//! The length alone bounds the body, so delimiters inside the JSON body need no escaping.
//! Bytes which arrive after a complete frame belong to the next frame and are retained.

use super::EnvelopeError;
use crate::error::RpcError;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Separator between the length prefix and the body
pub const FRAME_DELIMITER: u8 = b'#';

/// Longest accepted length prefix, enough for any `u64`
const MAX_PREFIX_DIGITS: usize = 20;

/// Largest accepted frame body, peers announcing more are rejected before anything is buffered
pub const MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

const READ_CHUNK_SIZE: usize = 4096;

/// Prepends the length prefix to a body
pub fn encode_frame(body: &[u8]) -> Vec<u8> {
    let prefix = body.len().to_string();
    let mut frame = Vec::with_capacity(prefix.len() + 1 + body.len());

    frame.extend_from_slice(prefix.as_bytes());
    frame.push(FRAME_DELIMITER);
    frame.extend_from_slice(body);

    frame
}

/// Incremental decoder splitting a stream of bytes into frame bodies
#[derive(Default, Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    /// Creates a decoder with an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends received bytes to the internal buffer
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Number of buffered bytes not yet consumed by a frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Extracts the next complete frame body, if enough bytes have been buffered
    pub fn decode(&mut self) -> Result<Option<Vec<u8>>, EnvelopeError> {
        let delimiter = match self.buffer.iter().position(|b| *b == FRAME_DELIMITER) {
            Some(position) => position,
            None => {
                validate_prefix(&self.buffer)?;
                return Ok(None);
            }
        };

        let length = parse_length(&self.buffer[..delimiter])?;
        let body_start = delimiter + 1;

        if self.buffer.len() - body_start < length {
            return Ok(None);
        }

        let remainder = self.buffer.split_off(body_start + length);
        let mut frame = std::mem::replace(&mut self.buffer, remainder);
        frame.drain(..body_start);

        Ok(Some(frame))
    }
}

fn validate_prefix(prefix: &[u8]) -> Result<(), EnvelopeError> {
    if prefix.len() > MAX_PREFIX_DIGITS {
        return Err(EnvelopeError::InvalidFrame(format!(
            "length prefix exceeds {} digits",
            MAX_PREFIX_DIGITS
        )));
    }

    if let Some(byte) = prefix.iter().find(|b| !b.is_ascii_digit()) {
        return Err(EnvelopeError::InvalidFrame(format!(
            "unexpected byte {:#04x} in length prefix",
            byte
        )));
    }

    Ok(())
}

fn parse_length(prefix: &[u8]) -> Result<usize, EnvelopeError> {
    validate_prefix(prefix)?;

    if prefix.is_empty() {
        return Err(EnvelopeError::InvalidFrame("empty length prefix".into()));
    }

    // Only ASCII digits remain at this point
    let length: u64 = String::from_utf8_lossy(prefix)
        .parse()
        .map_err(|e| EnvelopeError::InvalidFrame(format!("invalid length prefix: {}", e)))?;

    match usize::try_from(length) {
        Ok(length) if length <= MAX_FRAME_LENGTH => Ok(length),
        _ => Err(EnvelopeError::InvalidFrame(format!(
            "frame of {} bytes exceeds limit of {} bytes",
            length, MAX_FRAME_LENGTH
        ))),
    }
}

/// Reads from the stream until the decoder yields a complete frame
///
/// The stream ending before a frame is complete is reported as [`RpcError::ConnectionLost`].
pub async fn read_frame<R>(reader: &mut R, decoder: &mut FrameDecoder) -> Result<Vec<u8>, RpcError>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    loop {
        if let Some(frame) = decoder.decode()? {
            return Ok(frame);
        }

        let read = reader.read(&mut chunk).await.map_err(RpcError::io)?;

        if read == 0 {
            return Err(RpcError::ConnectionLost);
        }

        decoder.extend(&chunk[..read]);
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn prefix_with_byte_length() {
        assert_eq!(encode_frame(b"{\"a\":1}"), b"7#{\"a\":1}".to_vec());
        assert_eq!(encode_frame("\"ä\"".as_bytes()), "4#\"ä\"".as_bytes().to_vec());
    }

    #[test]
    fn wait_for_complete_frames() {
        let mut decoder = FrameDecoder::new();

        decoder.extend(b"1");
        assert_eq!(decoder.decode().unwrap(), None);

        decoder.extend(b"1#{\"a\":");
        assert_eq!(decoder.decode().unwrap(), None);

        decoder.extend(b"\"b\"}");
        assert_eq!(decoder.decode().unwrap(), Some(b"{\"a\":\"b\"}".to_vec()));
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn bound_bodies_by_length_only() {
        let body = br##"{"response":"a#b","id":"#1"}"##;
        let mut decoder = FrameDecoder::new();

        decoder.extend(&encode_frame(body));

        assert_eq!(decoder.decode().unwrap(), Some(body.to_vec()));
    }

    #[test]
    fn retain_trailing_bytes() {
        let mut decoder = FrameDecoder::new();

        decoder.extend(b"3#abc4#de");
        assert_eq!(decoder.decode().unwrap(), Some(b"abc".to_vec()));
        assert_eq!(decoder.decode().unwrap(), None);

        decoder.extend(b"fg");
        assert_eq!(decoder.decode().unwrap(), Some(b"defg".to_vec()));
    }

    #[test]
    fn accept_empty_bodies() {
        let mut decoder = FrameDecoder::new();

        decoder.extend(b"0#");
        assert_eq!(decoder.decode().unwrap(), Some(Vec::new()));
    }

    #[test]
    fn reject_invalid_prefixes() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(b"12a#");
        assert!(matches!(decoder.decode(), Err(EnvelopeError::InvalidFrame(_))));

        let mut decoder = FrameDecoder::new();
        decoder.extend(b"#{}");
        assert!(matches!(decoder.decode(), Err(EnvelopeError::InvalidFrame(_))));

        let mut decoder = FrameDecoder::new();
        decoder.extend(b"{\"id\"");
        assert!(matches!(decoder.decode(), Err(EnvelopeError::InvalidFrame(_))));
    }

    #[test]
    fn reject_oversized_prefixes() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&[b'9'; MAX_PREFIX_DIGITS + 1]);

        assert!(matches!(decoder.decode(), Err(EnvelopeError::InvalidFrame(_))));
    }

    #[test]
    fn reject_oversized_frames() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(b"99999999999#{");

        assert!(matches!(decoder.decode(), Err(EnvelopeError::InvalidFrame(_))));

        let mut decoder = FrameDecoder::new();
        decoder.extend(format!("{}#", MAX_FRAME_LENGTH).as_bytes());

        assert_eq!(decoder.decode().unwrap(), None);
    }

    #[tokio::test]
    async fn read_frames_across_chunks() {
        let mut stream: &[u8] = b"5#hello2#hi";
        let mut decoder = FrameDecoder::new();

        assert_eq!(read_frame(&mut stream, &mut decoder).await.unwrap(), b"hello");
        assert_eq!(read_frame(&mut stream, &mut decoder).await.unwrap(), b"hi");
    }

    #[tokio::test]
    async fn report_premature_end_of_stream() {
        let mut stream: &[u8] = b"10#short";
        let mut decoder = FrameDecoder::new();

        assert!(matches!(
            read_frame(&mut stream, &mut decoder).await,
            Err(RpcError::ConnectionLost)
        ));
    }

    #[tokio::test]
    async fn report_empty_streams_as_lost() {
        let mut stream: &[u8] = b"";
        let mut decoder = FrameDecoder::new();

        assert!(matches!(
            read_frame(&mut stream, &mut decoder).await,
            Err(RpcError::ConnectionLost)
        ));
    }
}
