use std::path::PathBuf;

use playlist::PlaylistError;
use reqwest::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum StitchError {
    #[error("playlist error: {0}")]
    Playlist(#[from] PlaylistError),

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("request failed with HTTP {status} for {url}")]
    HttpStatus { status: StatusCode, url: String },

    #[error("session state at `{}` is corrupted: {reason}", path.display())]
    StateCorrupted { path: PathBuf, reason: String },

    #[error("incomplete download: segments {missing:?} are not on disk")]
    IncompleteDownload { missing: Vec<u32> },

    #[error("segments failed after exhausting retries: {indices:?}")]
    SegmentsFailed { indices: Vec<u32> },

    #[error("refreshed playlist has {found} segments but the session has {expected}")]
    ManifestMismatch { expected: usize, found: usize },

    #[error("muxer failed: {reason}")]
    Muxer { reason: String },

    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    #[error("download cancelled")]
    Cancelled,

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl StitchError {
    pub fn state_corrupted(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::StateCorrupted {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn muxer(reason: impl Into<String>) -> Self {
        Self::Muxer {
            reason: reason.into(),
        }
    }

    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }

    /// Whether running the same session again can make progress.
    ///
    /// Parse errors, corrupted state and a mismatched refresh need a caller
    /// decision first; everything else picks up from the last checkpoint.
    pub fn is_resumable(&self) -> bool {
        match self {
            Self::Playlist(_)
            | Self::StateCorrupted { .. }
            | Self::ManifestMismatch { .. }
            | Self::Configuration { .. } => false,
            Self::Io { .. }
            | Self::Network { .. }
            | Self::HttpStatus { .. }
            | Self::IncompleteDownload { .. }
            | Self::SegmentsFailed { .. }
            | Self::Muxer { .. }
            | Self::Cancelled
            | Self::Internal { .. } => true,
        }
    }
}

/// Failure of a single segment fetch.
///
/// Everything except [`FetchError::Cancelled`] means the segment stays
/// undownloaded for this run.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("retries exhausted after {attempts} attempts: {reason}")]
    Exhausted { attempts: u32, reason: String },

    #[error("transient failure: {reason}")]
    Transient { reason: String },

    #[error("request rejected: {reason}")]
    Rejected { reason: String },

    #[error("requested range {range} is not satisfiable")]
    RangeNotSatisfiable { range: String },

    #[error("server ignored requested range {range}")]
    RangeIgnored { range: String },

    #[error("I/O error writing segment: {0}")]
    Io(#[from] std::io::Error),

    #[error("fetch cancelled")]
    Cancelled,
}

impl FetchError {
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Transient {
            reason: reason.into(),
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resumability_follows_taxonomy() {
        assert!(!StitchError::Playlist(PlaylistError::Empty).is_resumable());
        assert!(!StitchError::state_corrupted("/tmp/parts.json", "bad json").is_resumable());
        assert!(StitchError::SegmentsFailed { indices: vec![4] }.is_resumable());
        assert!(StitchError::Cancelled.is_resumable());
        assert!(StitchError::IncompleteDownload { missing: vec![7] }.is_resumable());
    }

    #[test]
    fn incomplete_download_is_distinct_from_muxer_failure() {
        let incomplete = StitchError::IncompleteDownload { missing: vec![7] };
        let muxer = StitchError::muxer("ffmpeg exited with status 1");
        assert!(incomplete.to_string().contains("incomplete download"));
        assert!(muxer.to_string().starts_with("muxer failed"));
    }
}
