/// Why a payload could not be decoded.
///
/// Every variant is a malformed message; the variants only say where the
/// input went wrong.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("malformed message: empty payload")]
    Empty,

    #[error("malformed message: {field} needs {needed} bytes at offset {offset}, {available} left")]
    Truncated {
        field: &'static str,
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("malformed message: unknown {family} tag {tag:#04x}")]
    UnknownTag { family: &'static str, tag: u8 },

    #[error("malformed message: {field} is not valid UTF-8")]
    InvalidUtf8 { field: &'static str },

    #[error("malformed message: {field} has out-of-range value {value}")]
    InvalidDiscriminant { field: &'static str, value: u32 },

    #[error("malformed message: {count} trailing bytes after {family}")]
    TrailingBytes { family: &'static str, count: usize },
}

pub type Result<T> = std::result::Result<T, CodecError>;
