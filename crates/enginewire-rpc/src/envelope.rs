//! Call-id prefix carried by `Call`, `Reply` and `Fault` frames.
//!
//! `Notify` frames carry a bare message; nobody answers them.

use bytes::{Buf, Bytes};
use enginewire_protocol::CodecError;

pub const CALL_ID_LEN: usize = 4;

/// A call, reply or fault body together with the call it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub call_id: u32,
    pub body: Bytes,
}

/// The bytes that precede `body` on the wire.
pub fn prefix(call_id: u32) -> [u8; CALL_ID_LEN] {
    call_id.to_le_bytes()
}

/// Split a frame payload into call id and body without copying.
pub fn open(mut payload: Bytes) -> Result<Envelope, CodecError> {
    if payload.len() < CALL_ID_LEN {
        return Err(CodecError::Truncated {
            field: "call_id",
            offset: 0,
            needed: CALL_ID_LEN,
            available: payload.len(),
        });
    }
    let call_id = payload.get_u32_le();
    Ok(Envelope {
        call_id,
        body: payload,
    })
}

/// Monotonic call ids, skipping zero on wrap-around.
#[derive(Debug)]
pub struct CallIds(u32);

impl Default for CallIds {
    fn default() -> Self {
        Self(1)
    }
}

impl CallIds {
    pub fn next_id(&mut self) -> u32 {
        let id = self.0;
        self.0 = self.0.wrapping_add(1).max(1);
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_splits_prefix_from_body() {
        let mut wire = prefix(0x0102_0304).to_vec();
        wire.extend_from_slice(b"body");
        let envelope = open(Bytes::from(wire)).unwrap();
        assert_eq!(envelope.call_id, 0x0102_0304);
        assert_eq!(envelope.body.as_ref(), b"body");
    }

    #[test]
    fn short_payload_is_malformed() {
        assert!(matches!(
            open(Bytes::from_static(&[1, 2])),
            Err(CodecError::Truncated { field: "call_id", .. })
        ));
    }

    #[test]
    fn pixels_reply_overhead_matches_the_wire() {
        use enginewire_protocol::{Reply, Resolution, FRAME_REPLY_OVERHEAD};

        let resolution = Resolution::new(3, 2);
        let reply = Reply::Pixels(Bytes::from(vec![0u8; resolution.byte_len()])).to_bytes();
        assert_eq!(
            CALL_ID_LEN + reply.len(),
            resolution.byte_len() + FRAME_REPLY_OVERHEAD
        );
    }

    #[test]
    fn ids_skip_zero_on_wrap() {
        let mut ids = CallIds(u32::MAX);
        assert_eq!(ids.next_id(), u32::MAX);
        assert_eq!(ids.next_id(), 1);
        assert_eq!(ids.next_id(), 2);
    }
}
