use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlaylistError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("playlist contains no complete segment entries")]
    Empty,

    #[error("invalid segment duration `{value}` on line {line}")]
    InvalidDuration { line: usize, value: String },

    #[error("invalid byte range `{value}` on line {line}")]
    InvalidByteRange { line: usize, value: String },

    #[error("segments not downloaded: {indices:?}")]
    MissingSegments { indices: Vec<u32> },
}

impl PlaylistError {
    pub fn invalid_duration(line: usize, value: impl Into<String>) -> Self {
        Self::InvalidDuration {
            line,
            value: value.into(),
        }
    }

    pub fn invalid_byte_range(line: usize, value: impl Into<String>) -> Self {
        Self::InvalidByteRange {
            line,
            value: value.into(),
        }
    }
}
