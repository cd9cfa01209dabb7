//! # Stitch Engine
//!
//! Resumable, bounded-concurrency download of segmented media.
//!
//! A [`Session`] is keyed by the output path and persists its segment list
//! after every completed segment, so an interrupted download picks up where
//! it stopped. The [`DownloadScheduler`] fetches missing segments through a
//! [`SegmentFetcher`], and assembly hands a local manifest to a [`Muxer`].
//! [`StitchDownloader`] wires the three together.
//!
//! ```no_run
//! use stitch_engine::{ManifestSource, StitchConfig, StitchDownloader};
//!
//! # async fn run() -> Result<(), stitch_engine::StitchError> {
//! let config = StitchConfig::builder()
//!     .with_max_in_flight(5)
//!     .with_header("referer", "https://example.com/")
//!     .build()?;
//! let downloader = StitchDownloader::new(config)?;
//! let source = downloader.manifest_from_url("https://example.com/video/index.m3u8")?;
//! let summary = downloader.download(&source, "video.mp4").await?;
//! println!("wrote {}", summary.output().display());
//! # Ok(())
//! # }
//! ```

pub mod assembly;
pub mod config;
pub mod downloader;
pub mod error;
pub mod events;
pub mod fetcher;
pub mod muxer;
pub mod retry;
pub mod scheduler;
pub mod session;

#[cfg(test)]
mod test_utils;

pub use assembly::{AssemblyReport, assemble};
pub use config::{
    AssemblyPolicy, FetcherConfig, MuxerConfig, SchedulerConfig, SessionConfig, StitchConfig,
    StitchConfigBuilder,
};
pub use downloader::{DownloadSummary, StitchDownloader};
pub use error::{FetchError, StitchError};
pub use events::DownloadEvent;
pub use fetcher::{FetchRequest, HttpFetcher, SegmentFetcher, create_client, segment_headers};
pub use muxer::{FfmpegMuxer, Muxer};
pub use scheduler::{DownloadReport, DownloadScheduler, FailedSegment};
pub use session::{ManifestSource, Session, SessionId, SessionPaths};

pub use playlist::{ByteRange, Segment};
