//! Wire framing.
//!
//! Outbound commands are wrapped in a family envelope; inbound packets are
//! reassembled into complete payloads by a [`FrameCodec`].

pub mod frame;

pub use frame::{
    Envelope, FrameCodec, Framing, HeaderForm, InFlightFrame, IndexedForm, LengthField, LongForm,
    PrefixedForm,
};
