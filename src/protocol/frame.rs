//! Frame encoding and reassembly.
//!
//! Outbound commands are single self-contained frames in one of two
//! envelopes, selected per model:
//! ```text
//! Header:   ┌─────────┬────────┬───────┬─────────┬────────────┬───────────┐
//!           │  magic  │ opcode │ [key] │ [flags] │ length     │  payload  │
//!           │ n bytes │ 1 byte │ 0/1   │ n bytes │ 1 / 2 (BE) │           │
//!           └─────────┴────────┴───────┴─────────┴────────────┴───────────┘
//! Trailer:  ┌───────────┬────────┐
//!           │  payload  │ opcode │
//!           └───────────┴────────┘
//! ```
//!
//! Inbound notifications are reassembled by a [`FrameCodec`] running one
//! [`Framing`] strategy. The long form carries a shared preamble on every
//! packet:
//! ```text
//! ┌─────────┬──────────┬──────────────┬────────────────┬────────────────┐
//! │  magic  │ sequence │ total length │ packet length  │ packet payload │
//! │ 2 bytes │  1 byte  │    1 byte    │     1 byte     │                │
//! └─────────┴──────────┴──────────────┴────────────────┴────────────────┘
//! ```
//! The indexed form splits a fixed number of parts behind a two byte tag,
//! `[0x00, part, body...]`, with parts numbered from 1.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::FrameError;

/// Size of the long-form packet preamble.
pub const LONG_HEADER_LEN: usize = 5;

/// Size of the indexed-form packet tag.
pub const INDEXED_HEADER_LEN: usize = 2;

/// Maximum size of a reassembled frame.
pub const MAX_FRAME_SIZE: usize = 4096;

/// Width of a length field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthField {
    /// One byte.
    U8,
    /// Two bytes, big-endian.
    U16,
}

impl LengthField {
    /// Number of bytes the field occupies.
    #[must_use]
    pub const fn width(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::U16 => 2,
        }
    }

    fn read(self, data: &[u8]) -> usize {
        match self {
            Self::U8 => usize::from(data[0]),
            Self::U16 => usize::from(u16::from_be_bytes([data[0], data[1]])),
        }
    }
}

/// Header envelope description.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderForm {
    /// Leading magic bytes.
    pub magic: &'static [u8],
    /// Encoder key byte following the opcode, if the family has one.
    pub key: Option<u8>,
    /// Fixed bytes between key and length.
    pub flags: &'static [u8],
    /// Width of the payload length field.
    pub length: LengthField,
}

/// Outbound command envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Envelope {
    /// `[payload..., opcode]`.
    Trailer,
    /// `[magic, opcode, key?, flags, length, payload...]`.
    Header(HeaderForm),
}

impl Envelope {
    /// Encodes a trailer frame, which has no length field to overflow.
    #[must_use]
    pub fn trailer(opcode: u8, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(payload.len() + 1);
        buf.put_slice(payload);
        buf.put_u8(opcode);
        buf.freeze()
    }

    /// Encodes one command frame.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::TooLarge`] if the payload does not fit the
    /// envelope's length field.
    pub fn encode(&self, opcode: u8, payload: &[u8]) -> Result<Bytes, FrameError> {
        let form = match self {
            Self::Trailer => return Ok(Self::trailer(opcode, payload)),
            Self::Header(form) => form,
        };
        let max = match form.length {
            LengthField::U8 => usize::from(u8::MAX),
            LengthField::U16 => usize::from(u16::MAX),
        };
        if payload.len() > max {
            return Err(FrameError::TooLarge {
                size: payload.len(),
                max,
            });
        }

        let mut buf = BytesMut::with_capacity(
            form.magic.len() + 2 + form.flags.len() + form.length.width() + payload.len(),
        );
        buf.put_slice(form.magic);
        buf.put_u8(opcode);
        if let Some(key) = form.key {
            buf.put_u8(key);
        }
        buf.put_slice(form.flags);
        match form.length {
            LengthField::U8 => buf.put_u8(payload.len() as u8),
            LengthField::U16 => buf.put_u16(payload.len() as u16),
        }
        buf.put_slice(payload);
        Ok(buf.freeze())
    }
}

/// Long-form framing parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LongForm {
    /// Two-byte preamble magic.
    pub magic: [u8; 2],
}

/// Indexed framing parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexedForm {
    /// Number of parts in one frame.
    pub parts: u8,
}

/// Length-prefixed stream framing parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefixedForm {
    /// Leading magic bytes.
    pub magic: &'static [u8],
    /// Total header length including magic.
    pub header_len: usize,
    /// Offset of the payload length field within the header.
    pub length_offset: usize,
    /// Width of the payload length field.
    pub length: LengthField,
}

/// Inbound reassembly strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Every packet is one complete payload.
    Single,
    /// Multi-packet notifications with sequence and length preamble.
    Long(LongForm),
    /// Byte stream of header + payload frames. The complete frame, header
    /// included, is yielded.
    Prefixed(PrefixedForm),
    /// Fixed count of tagged parts, concatenated without their tags.
    Indexed(IndexedForm),
}

/// Accumulates a multi-packet payload.
#[derive(Debug)]
pub struct InFlightFrame {
    total: usize,
    last_sequence: u8,
    payload: BytesMut,
}

impl InFlightFrame {
    fn new(total: usize) -> Self {
        Self {
            total,
            last_sequence: 1,
            payload: BytesMut::with_capacity(total),
        }
    }

    /// Declared total length.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.total
    }

    /// Bytes received so far.
    #[must_use]
    pub fn received(&self) -> usize {
        self.payload.len()
    }

    /// Sequence number of the last accepted packet.
    #[must_use]
    pub const fn last_sequence(&self) -> u8 {
        self.last_sequence
    }
}

/// Per-session inbound frame reassembler.
#[derive(Debug)]
pub struct FrameCodec {
    framing: Framing,
    in_flight: Option<InFlightFrame>,
    stream: BytesMut,
    part: u8,
}

impl FrameCodec {
    /// Creates a codec running the given strategy.
    #[must_use]
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            in_flight: None,
            stream: BytesMut::new(),
            part: 0,
        }
    }

    /// Returns the strategy in use.
    #[must_use]
    pub const fn framing(&self) -> Framing {
        self.framing
    }

    /// Returns the partially assembled frame, if any.
    #[must_use]
    pub const fn in_flight(&self) -> Option<&InFlightFrame> {
        self.in_flight.as_ref()
    }

    /// Returns the number of stream bytes buffered.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.stream.len()
    }

    /// Discards all partial state.
    pub fn clear(&mut self) {
        self.in_flight = None;
        self.stream.clear();
        self.part = 0;
    }

    /// Feeds one inbound packet.
    ///
    /// Returns `Ok(Some(payload))` when a frame completes and `Ok(None)` when
    /// more packets are needed. On error all partial state is discarded.
    pub fn feed(&mut self, packet: &[u8]) -> Result<Option<Bytes>, FrameError> {
        let result = match self.framing {
            Framing::Single => Ok(Some(Bytes::copy_from_slice(packet))),
            Framing::Long(form) => self.feed_long(form, packet),
            Framing::Prefixed(form) => {
                self.stream.extend_from_slice(packet);
                self.poll_prefixed(form)
            }
            Framing::Indexed(form) => self.feed_indexed(form, packet),
        };
        if result.is_err() {
            self.clear();
        }
        result
    }

    /// Yields the next frame already buffered by a stream strategy.
    pub fn poll(&mut self) -> Result<Option<Bytes>, FrameError> {
        let Framing::Prefixed(form) = self.framing else {
            return Ok(None);
        };
        let result = self.poll_prefixed(form);
        if result.is_err() {
            self.clear();
        }
        result
    }

    fn feed_long(&mut self, form: LongForm, packet: &[u8]) -> Result<Option<Bytes>, FrameError> {
        if packet.len() < LONG_HEADER_LEN {
            return Err(FrameError::TooShort {
                need: LONG_HEADER_LEN,
                got: packet.len(),
            });
        }
        if packet[..2] != form.magic {
            return Err(FrameError::Unrecognized(hex::encode(&packet[..2])));
        }

        let sequence = packet[2];
        let total = usize::from(packet[3]);
        let declared = usize::from(packet[4]);
        let body = &packet[LONG_HEADER_LEN..];

        if body.len() != declared {
            return Err(FrameError::Corrupt {
                reason: format!(
                    "packet {sequence} declares {declared} bytes, carries {}",
                    body.len()
                ),
            });
        }

        let mut frame = if sequence == 1 {
            if self.in_flight.is_some() {
                tracing::debug!("abandoning partial frame for new sequence");
            }
            InFlightFrame::new(total)
        } else {
            let Some(frame) = self.in_flight.take() else {
                return Err(FrameError::OutOfSequence {
                    expected: 1,
                    got: sequence,
                });
            };
            if sequence != frame.last_sequence.wrapping_add(1) {
                return Err(FrameError::OutOfSequence {
                    expected: frame.last_sequence.wrapping_add(1),
                    got: sequence,
                });
            }
            if total != frame.total {
                return Err(FrameError::Corrupt {
                    reason: format!(
                        "total length changed from {} to {total}",
                        frame.total
                    ),
                });
            }
            frame
        };

        frame.last_sequence = sequence;
        frame.payload.extend_from_slice(body);
        tracing::trace!(
            "packet {}: {} of {} bytes",
            sequence,
            frame.received(),
            frame.total
        );

        if frame.received() > frame.total {
            return Err(FrameError::Corrupt {
                reason: format!(
                    "received {} bytes, declared {}",
                    frame.received(),
                    frame.total
                ),
            });
        }
        if frame.received() == frame.total {
            return Ok(Some(frame.payload.freeze()));
        }
        self.in_flight = Some(frame);
        Ok(None)
    }

    fn feed_indexed(&mut self, form: IndexedForm, packet: &[u8]) -> Result<Option<Bytes>, FrameError> {
        if packet.len() < INDEXED_HEADER_LEN {
            return Err(FrameError::TooShort {
                need: INDEXED_HEADER_LEN,
                got: packet.len(),
            });
        }
        if packet[0] != 0x00 || packet[1] == 0 || packet[1] > form.parts {
            return Err(FrameError::Unrecognized(hex::encode(&packet[..INDEXED_HEADER_LEN])));
        }

        let part = packet[1];
        if part == 1 {
            if self.part != 0 {
                tracing::debug!("abandoning {} parts for a new frame", self.part);
            }
            self.stream.clear();
        } else if part != self.part + 1 {
            return Err(FrameError::OutOfSequence {
                expected: self.part + 1,
                got: part,
            });
        }

        self.stream.extend_from_slice(&packet[INDEXED_HEADER_LEN..]);
        if self.stream.len() > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge {
                size: self.stream.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        tracing::trace!("part {} of {}: {} bytes so far", part, form.parts, self.stream.len());

        if part < form.parts {
            self.part = part;
            return Ok(None);
        }
        self.part = 0;
        Ok(Some(self.stream.split().freeze()))
    }

    fn poll_prefixed(&mut self, form: PrefixedForm) -> Result<Option<Bytes>, FrameError> {
        let seen = self.stream.len().min(form.magic.len());
        if self.stream[..seen] != form.magic[..seen] {
            return Err(FrameError::Unrecognized(hex::encode(&self.stream[..seen])));
        }
        if self.stream.len() < form.header_len {
            return Ok(None);
        }

        let length = form.length.read(&self.stream[form.length_offset..]);
        let frame_len = form.header_len + length;
        if frame_len > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge {
                size: frame_len,
                max: MAX_FRAME_SIZE,
            });
        }
        if self.stream.len() < frame_len {
            return Ok(None);
        }

        let frame = self.stream.split_to(frame_len).freeze();
        if self.stream.is_empty() {
            // Release the allocation between frames
            self.stream = BytesMut::new();
        } else {
            tracing::trace!("{} bytes left after frame", self.stream.remaining());
        }
        Ok(Some(frame))
    }
}
