/// What a frame carries. Stored as one byte in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    /// Connection setup (handshake JSON).
    Control = 0,
    /// A request that expects exactly one `Reply` or `Fault`.
    Call = 1,
    /// A one-way message; no reply is sent.
    Notify = 2,
    /// Successful answer to a `Call`.
    Reply = 3,
    /// The handler for a `Call` failed; payload names the failure.
    Fault = 4,
}

impl FrameKind {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(FrameKind::Control),
            1 => Some(FrameKind::Call),
            2 => Some(FrameKind::Notify),
            3 => Some(FrameKind::Reply),
            4 => Some(FrameKind::Fault),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            FrameKind::Control => "control",
            FrameKind::Call => "call",
            FrameKind::Notify => "notify",
            FrameKind::Reply => "reply",
            FrameKind::Fault => "fault",
        }
    }
}

impl std::fmt::Display for FrameKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
