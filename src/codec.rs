//! Length-prefixed framing for byte-stream transports.
//!
//! Every message is written as a metadata prefix followed by the payload:
//!
//! ```text
//! short form:  [len | 0x80] payload            0 <= len < 128
//! long form:   [d0][d1][d2][d3] payload         128 <= len <= 2^31 - 1
//!              d0 < 128, len = ((d0*256 + d1)*256 + d2)*256 + d3
//! ```
//!
//! The top bit of the first byte tells the two forms apart. There is no
//! version byte, checksum, or end-of-stream marker.
//!
//! Decoding is incremental: [`FrameCodec`] keeps the state of one connection
//! and accepts input split at arbitrary points. One call may yield zero, one,
//! or several messages.

use crate::error::Error;
use tracing::{error, trace};

// ============================================================================
// Constants
// ============================================================================

/// Largest payload the wire format can describe: `128 * 256^3 - 1`.
pub const MAX_MESSAGE_LEN: usize = 0x7FFF_FFFF;

const SHORT_FORM_FLAG: u8 = 0x80;
const SHORT_FORM_MAX: usize = 0x7F;
const METADATA_LEN: usize = 4;

// Upper bound on capacity reserved from a declared length before the bytes
// actually arrive.
const MAX_PREALLOCATION: usize = 64 * 1024;

// ============================================================================
// Decoder State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Waiting for the first byte of a frame.
    Idle,
    /// Collecting the 4 bytes of a long-form prefix.
    Metadata,
    /// Collecting payload bytes; `remaining` says how many are left.
    Payload,
    /// A protocol violation was seen. Terminal.
    Corrupted,
}

/// Streaming encoder/decoder for one connection.
///
/// Not thread-safe: a connection's bytes must be fed from a single
/// reader. Encoding is stateless and exposed as associated functions.
#[derive(Debug)]
pub struct FrameCodec {
    phase: Phase,
    header: [u8; METADATA_LEN],
    header_len: usize,
    payload: Vec<u8>,
    remaining: usize,
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl FrameCodec {
    /// Creates a decoder that accepts every length the wire format allows.
    pub fn new() -> Self {
        Self::with_max_frame_size(MAX_MESSAGE_LEN)
    }

    /// Creates a decoder that rejects frames declaring more than
    /// `max_frame_size` payload bytes.
    ///
    /// Values above [`MAX_MESSAGE_LEN`] are clamped.
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            phase: Phase::Idle,
            header: [0; METADATA_LEN],
            header_len: 0,
            payload: Vec::new(),
            remaining: 0,
            max_frame_size: max_frame_size.min(MAX_MESSAGE_LEN),
        }
    }
}

// ============================================================================
// Encoding
// ============================================================================

impl FrameCodec {
    /// Returns the size of the frame for a payload of `len` bytes.
    pub fn encoded_len(len: usize) -> Result<usize, Error> {
        check_len(len)?;
        if len <= SHORT_FORM_MAX {
            Ok(1 + len)
        } else {
            Ok(METADATA_LEN + len)
        }
    }

    /// Appends the metadata prefix for a payload of `len` bytes.
    ///
    /// Fails without touching `buf` if `len` exceeds [`MAX_MESSAGE_LEN`].
    pub fn write_header(len: usize, buf: &mut Vec<u8>) -> Result<(), Error> {
        check_len(len)?;
        if len <= SHORT_FORM_MAX {
            buf.push(len as u8 | SHORT_FORM_FLAG);
        } else {
            // The mixed-radix digits (128, 256, 256, 256) of a value below
            // 2^31 are exactly its big-endian bytes, with the top bit clear.
            buf.extend_from_slice(&(len as u32).to_be_bytes());
        }
        Ok(())
    }

    /// Appends the complete frame for `msg` to `buf`.
    pub fn encode_into(msg: &[u8], buf: &mut Vec<u8>) -> Result<(), Error> {
        buf.reserve(Self::encoded_len(msg.len())?);
        Self::write_header(msg.len(), buf)?;
        buf.extend_from_slice(msg);
        Ok(())
    }

    /// Encodes `msg` into a new frame.
    pub fn encode(msg: &[u8]) -> Result<Vec<u8>, Error> {
        let mut buf = Vec::with_capacity(Self::encoded_len(msg.len())?);
        Self::write_header(msg.len(), &mut buf)?;
        buf.extend_from_slice(msg);
        trace!(len = msg.len(), frame_len = buf.len(), "Encoded frame");
        Ok(buf)
    }
}

fn check_len(len: usize) -> Result<(), Error> {
    if len > MAX_MESSAGE_LEN {
        return Err(Error::MessageTooLarge {
            len,
            max: MAX_MESSAGE_LEN,
        });
    }
    Ok(())
}

// ============================================================================
// Decoding
// ============================================================================

impl FrameCodec {
    /// Feeds `input` to the decoder and returns the messages it completed.
    ///
    /// See [`Self::decode_into`] for the error behavior. Messages completed
    /// before an error in the same call are dropped by this variant.
    pub fn decode(&mut self, input: &[u8]) -> Result<Vec<Vec<u8>>, Error> {
        let mut out = Vec::new();
        self.decode_into(input, &mut out)?;
        Ok(out)
    }

    /// Feeds `input` to the decoder and appends every completed message to
    /// `out`, in stream order. Returns how many messages were appended.
    ///
    /// Empty input changes nothing. A frame declaring more than the maximum
    /// frame size returns [`Error::FrameTooLarge`] and leaves the decoder
    /// corrupted; every later call returns [`Error::StreamCorrupted`]. Messages
    /// completed before the violation are still in `out`.
    pub fn decode_into(&mut self, mut input: &[u8], out: &mut Vec<Vec<u8>>) -> Result<usize, Error> {
        if self.phase == Phase::Corrupted {
            return Err(Error::StreamCorrupted);
        }

        let before = out.len();

        while let Some((&first, rest)) = input.split_first() {
            match self.phase {
                Phase::Idle => {
                    input = rest;
                    if first & SHORT_FORM_FLAG != 0 {
                        self.begin_payload((first & !SHORT_FORM_FLAG) as usize, out)?;
                    } else {
                        self.header[0] = first;
                        self.header_len = 1;
                        self.phase = Phase::Metadata;
                    }
                }
                Phase::Metadata => {
                    let take = (METADATA_LEN - self.header_len).min(input.len());
                    self.header[self.header_len..self.header_len + take]
                        .copy_from_slice(&input[..take]);
                    self.header_len += take;
                    input = &input[take..];

                    if self.header_len == METADATA_LEN {
                        self.header_len = 0;
                        let len = u32::from_be_bytes(self.header) as usize;
                        self.begin_payload(len, out)?;
                    }
                }
                Phase::Payload => {
                    let take = self.remaining.min(input.len());
                    self.payload.extend_from_slice(&input[..take]);
                    self.remaining -= take;
                    input = &input[take..];

                    if self.remaining == 0 {
                        self.finish_frame(out);
                    }
                }
                Phase::Corrupted => unreachable!("corrupted decoder returns early"),
            }
        }

        Ok(out.len() - before)
    }

    /// Returns `true` if no partial frame is buffered.
    pub fn is_idle(&self) -> bool {
        self.phase == Phase::Idle
    }

    /// Returns `true` once a protocol violation has been seen.
    pub fn is_corrupted(&self) -> bool {
        self.phase == Phase::Corrupted
    }

    /// Number of bytes of the current partial frame held by the decoder.
    pub fn buffered_len(&self) -> usize {
        self.header_len + self.payload.len()
    }

    /// Returns the frame size limit of this decoder.
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Drops any partial frame and clears the corrupted state.
    pub fn reset(&mut self) {
        self.phase = Phase::Idle;
        self.header_len = 0;
        self.payload = Vec::new();
        self.remaining = 0;
    }

    fn begin_payload(&mut self, len: usize, out: &mut Vec<Vec<u8>>) -> Result<(), Error> {
        if len > self.max_frame_size {
            error!(len, max = self.max_frame_size, "Frame exceeds size limit");
            self.phase = Phase::Corrupted;
            self.payload = Vec::new();
            return Err(Error::FrameTooLarge {
                len,
                max: self.max_frame_size,
            });
        }

        self.remaining = len;
        if len == 0 {
            self.finish_frame(out);
        } else {
            self.payload.reserve(len.min(MAX_PREALLOCATION));
            self.phase = Phase::Payload;
        }
        Ok(())
    }

    fn finish_frame(&mut self, out: &mut Vec<Vec<u8>>) {
        let msg = std::mem::take(&mut self.payload);
        trace!(len = msg.len(), "Decoded frame");
        out.push(msg);
        self.phase = Phase::Idle;
    }
}
