//! The fixed message set spoken between a host and its rendering engine.
//!
//! Encoding is pure: no I/O, no shared state. Integers are little-endian
//! and fixed width, strings are a `u32` byte length followed by UTF-8, and
//! arrays are a `u32` count followed by their elements. Every message starts
//! with a one-byte tag. Decoding is strict: unknown tags, lengths that run
//! past the input, invalid UTF-8, out-of-range discriminants and trailing
//! bytes are all rejected with [`CodecError`].

pub mod error;
pub mod input;
pub mod message;
pub mod popup;
pub mod surface;
pub mod wire;

pub use error::{CodecError, Result};
pub use input::{
    KeyboardEvent, MouseAction, MouseButton, MouseClickEvent, MouseMoveEvent, MouseScrollEvent,
};
pub use message::{EngineCall, HostNotification, Reply};
pub use popup::PopupId;
pub use surface::{Color, Resolution, FRAME_REPLY_OVERHEAD};
