use bytes::{Buf, Bytes, BytesMut};

use crate::proto::error::{Error, Result};
use crate::proto::frame::Frame;

const DEFAULT_MAX_FRAME_SIZE: usize = 512 * 1024 * 1024; // 512 MB default

/// Array slots reserved up front; the header's count is not trusted further.
const MAX_PREALLOCATED_ITEMS: usize = 1024;

/// A streaming RESP2 decoder.
///
/// Bytes are appended as they arrive from the socket; [`decode`](Decoder::decode)
/// only consumes input once a complete frame is available, so a reply split
/// across several reads is never partially lost.
///
/// # Example
///
/// ```
/// use slotwise::proto::codec::Decoder;
/// use slotwise::proto::frame::Frame;
///
/// let mut decoder = Decoder::new();
/// decoder.append(b"-MOVED 3999 127.0.0.1:7000\r\n");
/// let frame = decoder.decode().unwrap().unwrap();
/// assert_eq!(frame, Frame::Error(b"MOVED 3999 127.0.0.1:7000".to_vec()));
/// ```
#[derive(Debug)]
pub struct Decoder {
    buf: BytesMut,
    max_frame_size: usize,
    /// Buffer length below which the pending frame cannot be complete.
    need: usize,
}

impl Decoder {
    /// Creates a new decoder with an empty buffer.
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Creates a new decoder with a custom maximum frame size.
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_frame_size,
            need: 0,
        }
    }

    /// Appends raw bytes to the internal buffer.
    pub fn append(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Attempts to decode one frame from the buffer.
    ///
    /// Returns `Ok(None)` if more data is needed; nothing is consumed in that case.
    /// A large bulk string arriving in pieces is not re-parsed until all of
    /// it is buffered.
    pub fn decode(&mut self) -> Result<Option<Frame>> {
        if self.buf.is_empty() || self.buf.len() < self.need {
            return Ok(None);
        }
        if self.buf.len() > self.max_frame_size {
            return Err(Error::protocol("buffer size exceeded maximum frame size"));
        }

        let mut need = 0;
        match self.parse(0, &mut need)? {
            Some((frame, consumed)) => {
                self.buf.advance(consumed);
                self.need = 0;
                Ok(Some(frame))
            }
            None => {
                self.need = need;
                Ok(None)
            }
        }
    }

    /// Parses a frame starting at `pos`, returning it with the position just past it.
    ///
    /// When the frame is incomplete, `need` is set to the buffer length the
    /// next attempt requires.
    fn parse(&self, pos: usize, need: &mut usize) -> Result<Option<(Frame, usize)>> {
        let Some(&tag) = self.buf.get(pos) else {
            *need = pos + 1;
            return Ok(None);
        };
        let Some(line_end) = self.find_crlf(pos + 1) else {
            *need = self.buf.len() + 1;
            return Ok(None);
        };
        let line = &self.buf[pos + 1..line_end];
        let next = line_end + 2;

        match tag {
            b'+' => Ok(Some((Frame::SimpleString(line.to_vec()), next))),
            b'-' => Ok(Some((Frame::Error(line.to_vec()), next))),
            b':' => Ok(Some((Frame::Integer(parse_int(line)?), next))),
            b'$' => {
                let len = parse_int(line)?;
                if len < 0 {
                    return Ok(Some((Frame::BulkString(None), next)));
                }
                let len = len as usize;
                if len > self.max_frame_size {
                    return Err(Error::protocol("bulk string length exceeds maximum frame size"));
                }
                if self.buf.len() < next + len + 2 {
                    *need = next + len + 2;
                    return Ok(None);
                }
                let data = Bytes::copy_from_slice(&self.buf[next..next + len]);
                Ok(Some((Frame::BulkString(Some(data)), next + len + 2)))
            }
            b'*' => {
                let len = parse_int(line)?;
                if len < 0 {
                    return Ok(Some((Frame::Null, next)));
                }
                let len = len as usize;
                // Assume minimum 16 bytes per item
                if len > self.max_frame_size / 16 {
                    return Err(Error::protocol("array length exceeds reasonable maximum"));
                }
                let mut items = Vec::with_capacity(len.min(MAX_PREALLOCATED_ITEMS));
                let mut cursor = next;
                for _ in 0..len {
                    match self.parse(cursor, need)? {
                        Some((frame, after)) => {
                            items.push(frame);
                            cursor = after;
                        }
                        None => return Ok(None),
                    }
                }
                Ok(Some((Frame::Array(items), cursor)))
            }
            other => Err(Error::protocol(format!(
                "unknown frame type: {}",
                other as char
            ))),
        }
    }

    /// Index of the next `\r\n` at or after `from`.
    fn find_crlf(&self, from: usize) -> Option<usize> {
        if self.buf.len() < from + 2 {
            return None;
        }
        self.buf[from..]
            .windows(2)
            .position(|w| w == b"\r\n")
            .map(|i| from + i)
    }
}

fn parse_int(line: &[u8]) -> Result<i64> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| Error::protocol("invalid integer in frame header"))
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
