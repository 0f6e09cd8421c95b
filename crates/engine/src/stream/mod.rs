//! Stream adapters — attach framing and detach-key handling.
//!
//! When a caller upgrades to a raw stream, multiplexed mode wraps every
//! chunk in an 8-byte header `[stream_id, 0, 0, 0, len_u32_be]`; TTY mode
//! passes bytes through unframed. Errors ride the stderr stream ID. Detach
//! is a caller-supplied key sequence scanned out of the stdin path.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::errors::EngineError;

pub const STREAM_STDOUT: u8 = 1;
pub const STREAM_STDERR: u8 = 2;
/// Error frames share the stderr stream ID.
pub const STREAM_ERROR: u8 = 2;

/// Frame a payload for multiplexed attach mode.
pub fn mux_frame(stream_id: u8, payload: &[u8]) -> Bytes {
    let mut frame = BytesMut::with_capacity(8 + payload.len());
    frame.put_u8(stream_id);
    frame.put_bytes(0, 3);
    frame.put_u32(payload.len() as u32);
    frame.put_slice(payload);
    frame.freeze()
}

/// Writes container output to a caller stream, framed or raw.
pub struct AttachWriter<W> {
    sink: W,
    /// TTY mode: unframed passthrough.
    raw: bool,
}

impl<W: AsyncWrite + Unpin> AttachWriter<W> {
    pub fn new(sink: W, raw: bool) -> Self {
        AttachWriter { sink, raw }
    }

    pub async fn write(&mut self, stream_id: u8, payload: &[u8]) -> Result<(), EngineError> {
        if self.raw {
            self.sink.write_all(payload).await?;
        } else {
            self.sink.write_all(&mux_frame(stream_id, payload)).await?;
        }
        self.sink.flush().await?;
        Ok(())
    }

    pub async fn write_error(&mut self, message: &str) -> Result<(), EngineError> {
        self.write(STREAM_ERROR, message.as_bytes()).await
    }

    pub fn into_inner(self) -> W {
        self.sink
    }
}

/// Parse a detach-keys description like `ctrl-p,ctrl-q` or `ctrl-@,a` into
/// the byte sequence to watch for. Empty input means detach is disabled.
pub fn parse_detach_keys(keys: &str) -> Result<Vec<u8>, EngineError> {
    if keys.is_empty() {
        return Ok(Vec::new());
    }
    let mut sequence = Vec::new();
    for part in keys.split(',') {
        if let Some(ctrl) = part.strip_prefix("ctrl-") {
            let mut chars = ctrl.chars();
            let (Some(c), None) = (chars.next(), chars.next()) else {
                return Err(EngineError::InvalidArg(format!(
                    "invalid detach key \"{}\"",
                    part
                )));
            };
            let byte = match c {
                'a'..='z' => c as u8 - b'a' + 1,
                '@' => 0,
                '[' => 27,
                '\\' => 28,
                ']' => 29,
                '^' => 30,
                '_' => 31,
                _ => {
                    return Err(EngineError::InvalidArg(format!(
                        "invalid ctrl key \"{}\"",
                        part
                    )))
                }
            };
            sequence.push(byte);
        } else {
            let bytes = part.as_bytes();
            if bytes.len() != 1 {
                return Err(EngineError::InvalidArg(format!(
                    "invalid detach key \"{}\"",
                    part
                )));
            }
            sequence.push(bytes[0]);
        }
    }
    Ok(sequence)
}

/// Incremental matcher for the detach sequence on the stdin path.
pub struct DetachScanner {
    sequence: Vec<u8>,
    matched: usize,
}

impl DetachScanner {
    pub fn new(sequence: Vec<u8>) -> Self {
        DetachScanner {
            sequence,
            matched: 0,
        }
    }

    /// Feed a chunk of stdin. Returns the bytes to forward to the
    /// container, or [`EngineError::Detach`] once the full sequence has
    /// been typed. Partially-matched prefixes are withheld until resolved.
    pub fn scan(&mut self, chunk: &[u8]) -> Result<Vec<u8>, EngineError> {
        if self.sequence.is_empty() {
            return Ok(chunk.to_vec());
        }
        let mut forward = Vec::with_capacity(chunk.len());
        for &byte in chunk {
            if byte == self.sequence[self.matched] {
                self.matched += 1;
                if self.matched == self.sequence.len() {
                    return Err(EngineError::Detach);
                }
            } else {
                // Flush the withheld prefix, then retry this byte at the
                // start of the sequence.
                forward.extend_from_slice(&self.sequence[..self.matched]);
                self.matched = 0;
                if byte == self.sequence[0] {
                    self.matched = 1;
                } else {
                    forward.push(byte);
                }
            }
        }
        Ok(forward)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mux_frame_layout() {
        let frame = mux_frame(STREAM_STDOUT, b"hello");
        assert_eq!(frame.len(), 13);
        assert_eq!(frame[0], 1);
        assert_eq!(&frame[1..4], &[0, 0, 0]);
        assert_eq!(&frame[4..8], &5u32.to_be_bytes());
        assert_eq!(&frame[8..], b"hello");
    }

    #[tokio::test]
    async fn test_attach_writer_modes() {
        let mut muxed = AttachWriter::new(Vec::new(), false);
        muxed.write(STREAM_STDERR, b"oops").await.unwrap();
        let buf = muxed.into_inner();
        assert_eq!(buf[0], 2);
        assert_eq!(&buf[8..], b"oops");

        let mut raw = AttachWriter::new(Vec::new(), true);
        raw.write(STREAM_STDOUT, b"tty bytes").await.unwrap();
        assert_eq!(raw.into_inner(), b"tty bytes");
    }

    #[test]
    fn test_parse_detach_keys() {
        assert_eq!(parse_detach_keys("ctrl-p,ctrl-q").unwrap(), vec![16, 17]);
        assert_eq!(parse_detach_keys("ctrl-@,x").unwrap(), vec![0, b'x']);
        assert!(parse_detach_keys("").unwrap().is_empty());
        assert!(parse_detach_keys("ctrl-pq").is_err());
    }

    #[test]
    fn test_detach_scanner_triggers() {
        let mut scanner = DetachScanner::new(vec![16, 17]);
        assert_eq!(scanner.scan(b"abc").unwrap(), b"abc");
        assert_eq!(scanner.scan(&[16]).unwrap(), b"");
        assert!(matches!(scanner.scan(&[17]), Err(EngineError::Detach)));
    }

    #[test]
    fn test_detach_scanner_flushes_false_prefix() {
        let mut scanner = DetachScanner::new(vec![16, 17]);
        // ctrl-p followed by a normal byte: both must reach the container.
        assert_eq!(scanner.scan(&[16, b'z']).unwrap(), vec![16, b'z']);
        // ctrl-p ctrl-p ctrl-q: the first ctrl-p is forwarded, then detach.
        assert_eq!(scanner.scan(&[16]).unwrap(), b"");
        let result = scanner.scan(&[16, 17]);
        assert!(matches!(result, Err(EngineError::Detach)));
    }

    #[test]
    fn test_disabled_detach_passthrough() {
        let mut scanner = DetachScanner::new(Vec::new());
        assert_eq!(scanner.scan(&[16, 17]).unwrap(), vec![16, 17]);
    }
}
