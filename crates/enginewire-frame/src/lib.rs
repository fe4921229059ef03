//! Framing shared by every engine/host connection.
//!
//! Each frame carries:
//! - a 2-byte magic (`"EW"`) for stream synchronization
//! - a 4-byte little-endian payload length
//! - a 1-byte [`FrameKind`] and one reserved byte that must be zero
//!
//! Readers resume partial reads and writers retry interrupted writes, so
//! callers only ever see whole frames.

pub mod codec;
pub mod error;
pub mod kind;
pub mod reader;
pub mod writer;

pub use codec::{decode_frame, encode_header, Frame, FrameConfig, DEFAULT_MAX_PAYLOAD, HEADER_SIZE, MAGIC};
pub use error::{FrameError, Result};
pub use kind::FrameKind;
pub use reader::FrameReader;
pub use writer::FrameWriter;
