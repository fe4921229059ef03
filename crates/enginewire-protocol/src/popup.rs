use std::fmt;

/// Engine-assigned handle for a window a page opened.
///
/// Unique for the lifetime of one engine process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PopupId(pub u64);

impl fmt::Display for PopupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "popup-{}", self.0)
    }
}
