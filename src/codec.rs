//! The frame codec.
//!
//! A [`Frame`] is the unit carried by the tunnel's stream connection once
//! the handshake (if any) has been consumed: a big-endian 16-bit length
//! followed by that many bytes of opaque datagram payload. [`Decoder`] is a
//! pure state machine: `(state, new bytes)` in, `(new state, yielded
//! payloads)` out. It never blocks and never owns the socket it is fed
//! from.
//!
//! ## Buffer model
//!
//! The decoder owns one fixed-size buffer (`65536` bytes, `BUFFER_CAPACITY`)
//! with two offsets: `write_off`, where the next read should deposit bytes,
//! and `parse_off`, the first byte not yet consumed by the state machine.
//! [`Decoder::writable`] compacts the buffer (shifting `[parse_off,
//! write_off)` down to zero) whenever the tail has run out of room, so a
//! caller can always find somewhere to read into as long as a single frame
//! plus its header fits in `BUFFER_CAPACITY`.

use thiserror::Error;

/// Capacity of the decoder's internal parse buffer, in bytes.
pub const BUFFER_CAPACITY: usize = 65_536;
/// Length of the handshake token, in bytes.
pub const HANDSHAKE_LEN: usize = 32;
/// The largest payload a single frame may carry.
pub const MAX_PAYLOAD_LEN: usize = BUFFER_CAPACITY - 2;

/// Errors produced by [`Frame`] and [`Decoder`].
#[derive(Debug, Error)]
pub enum Error {
    /// A payload larger than [`MAX_PAYLOAD_LEN`] was passed to [`Frame::encode`].
    #[error("payload of {0} bytes exceeds the maximum frame payload of {MAX_PAYLOAD_LEN}")]
    PayloadTooLarge(usize),
    /// The first `HANDSHAKE_LEN` bytes on the stream did not match the
    /// expected token. Non-retryable: the tunnel must be closed.
    #[error("peer sent a handshake that does not match the expected token")]
    HandshakeRejected,
    /// Forwarding a decoded payload failed; carries the underlying cause so
    /// callers can distinguish a transient send from a fatal one.
    #[error(transparent)]
    Forward(#[from] std::io::Error),
}

/// Parser states, following the stream's grammar: an optional handshake,
/// then an alternation of a 2-byte length and that many payload bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserState {
    /// Waiting for the 32-byte handshake token.
    NeedHandshake,
    /// Waiting for the 2-byte big-endian length prefix of the next frame.
    NeedLength,
    /// Waiting for `n` bytes of payload.
    NeedPayload(u16),
}

/// A single encode operation: length-prefix `payload` and hand the result to
/// `out` in one call, so that a short write on the underlying stream cannot
/// split the header from the payload.
pub struct Frame;

impl Frame {
    /// Encode `payload` as a frame, appending the 2-byte big-endian length
    /// and the payload bytes to `out`. `out` is not cleared first so frames
    /// can be batched into a single buffer before writing.
    pub fn encode(payload: &[u8], out: &mut Vec<u8>) -> Result<(), Error> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(Error::PayloadTooLarge(payload.len()));
        }
        #[allow(clippy::cast_possible_truncation)]
        let len = payload.len() as u16;
        out.reserve(2 + payload.len());
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(payload);
        Ok(())
    }
}

/// Stateful, non-blocking, buffered parser for the stream's frame grammar.
///
/// The caller reads bytes from the stream socket into [`Decoder::writable`],
/// calls [`Decoder::commit`] with the number of bytes actually read, and
/// then calls [`Decoder::decode`] to extract as many complete frames as the
/// buffer currently holds.
pub struct Decoder {
    buf: Vec<u8>,
    write_off: usize,
    parse_off: usize,
    state: ParserState,
    handshake: [u8; HANDSHAKE_LEN],
}

impl Decoder {
    /// Create a decoder. `expect_handshake` selects the initial state: the
    /// server side validates a handshake before any frame; the client side
    /// does not (it only ever sends one).
    #[must_use]
    pub fn new(expect_handshake: bool, handshake: [u8; HANDSHAKE_LEN]) -> Self {
        Self {
            buf: vec![0u8; BUFFER_CAPACITY],
            write_off: 0,
            parse_off: 0,
            state: if expect_handshake {
                ParserState::NeedHandshake
            } else {
                ParserState::NeedLength
            },
            handshake,
        }
    }

    /// The writable tail of the internal buffer. Compacts first if the tail
    /// is empty and there is unparsed data to shift down, so repeated reads
    /// never get stuck with zero room even though no single frame can
    /// exceed the buffer.
    pub fn writable(&mut self) -> &mut [u8] {
        if self.write_off == self.buf.len() {
            self.compact();
        }
        &mut self.buf[self.write_off..]
    }

    /// Record that `n` bytes were written into the slice returned by the
    /// most recent [`Decoder::writable`] call.
    pub fn commit(&mut self, n: usize) {
        debug_assert!(self.write_off + n <= self.buf.len());
        self.write_off += n;
    }

    fn compact(&mut self) {
        if self.parse_off == 0 {
            return;
        }
        self.buf.copy_within(self.parse_off..self.write_off, 0);
        self.write_off -= self.parse_off;
        self.parse_off = 0;
    }

    /// Drive the state machine as far as the currently buffered bytes
    /// allow, invoking `on_payload` once per complete frame in arrival
    /// order. Returns as soon as progress stalls (not enough bytes for the
    /// next state) or `on_payload`/handshake validation fails.
    pub fn decode(
        &mut self,
        mut on_payload: impl FnMut(&[u8]) -> Result<(), Error>,
    ) -> Result<(), Error> {
        loop {
            match self.state {
                ParserState::NeedHandshake => {
                    if self.write_off - self.parse_off < HANDSHAKE_LEN {
                        break;
                    }
                    let got = &self.buf[self.parse_off..self.parse_off + HANDSHAKE_LEN];
                    if got != self.handshake {
                        return Err(Error::HandshakeRejected);
                    }
                    self.parse_off += HANDSHAKE_LEN;
                    self.state = ParserState::NeedLength;
                }
                ParserState::NeedLength => {
                    if self.write_off - self.parse_off < 2 {
                        break;
                    }
                    let len =
                        u16::from_be_bytes([self.buf[self.parse_off], self.buf[self.parse_off + 1]]);
                    self.parse_off += 2;
                    self.state = ParserState::NeedPayload(len);
                }
                ParserState::NeedPayload(n) => {
                    let n = n as usize;
                    if self.write_off - self.parse_off < n {
                        break;
                    }
                    on_payload(&self.buf[self.parse_off..self.parse_off + n])?;
                    self.parse_off += n;
                    self.state = ParserState::NeedLength;
                }
            }
        }
        self.compact();
        Ok(())
    }

    /// The current parser state, exposed for tests and diagnostics.
    #[must_use]
    pub fn state(&self) -> ParserState {
        self.state
    }
}
