//! # Playlist
//!
//! Format layer for segmented media downloads.
//!
//! - [`PlaylistParser`] turns the text of a line-oriented media playlist
//!   (`#EXTINF` durations, optional `#EXT-X-BYTERANGE`, absolute segment URLs)
//!   into an ordered list of [`Segment`]s.
//! - [`LocalManifestWriter`] renders the playlist that points at the locally
//!   downloaded segment files, ready to be handed to a muxer.
//!
//! Encryption keys, discontinuities and init sections are not interpreted.
//! They are reported through [`ParsedPlaylist::unsupported`] so callers can
//! decide whether a download is still meaningful.

pub mod error;
pub mod parser;
pub mod segment;
pub mod writer;

pub use error::PlaylistError;
pub use parser::{ParsedPlaylist, PlaylistParser, UnsupportedTag};
pub use segment::{ByteRange, Segment};
pub use writer::LocalManifestWriter;
