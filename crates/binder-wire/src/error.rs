//! Errors local to the coder/decoder and framing helpers. Small and
//! locally scoped, so a manual `Display`/`Error` impl is used instead of
//! pulling in `thiserror` for a two-variant enum.

/// Something went wrong encoding or decoding a wire message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    /// The coder's fixed segment or dispose-chain table is full.
    CoderFull,
    /// A decode read past the end of the input buffer.
    Truncated,
    /// A length, alignment, or tag value was not one the decoder accepts.
    Malformed,
    /// A position passed to `set_position` lies outside the written range.
    BadPosition,
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireError::CoderFull => write!(f, "coder segment or dispose table is full"),
            WireError::Truncated => write!(f, "input buffer exhausted before read completed"),
            WireError::Malformed => write!(f, "malformed wire value"),
            WireError::BadPosition => write!(f, "position out of range"),
        }
    }
}

impl std::error::Error for WireError {}

pub type WireResult<T> = Result<T, WireError>;
