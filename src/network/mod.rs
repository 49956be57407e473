//! Byte-stream framing.
//!
//! This module turns a TCP byte stream into application-level frames:
//! - `FrameConfig` describes a protocol's wire format (sentinels, length
//!   field, checksum field, framing family)
//! - `decode_frames` runs the stateful read loop, tolerating partial reads
//!   and resynchronizing past invalid prefixes
//!
//! Two framing families are supported: length-prefixed TLV with optional
//! sentinels, and sentinel-delimited head/tail framing.

pub use decoder::{decode_frames, FrameDecoder};
pub use frame::{ByteOrder, Frame, FrameConfig, FramingKind};
pub use frame::{DEFAULT_MAX_FRAME_SIZE, DEFAULT_READ_CHUNK};

mod decoder;
mod frame;
