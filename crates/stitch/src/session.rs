//! Durable, resumable session state.
//!
//! A session is keyed by the SHA-256 of the canonical output path, so running
//! the same output again finds the same working directory:
//!
//! ```text
//! <work_root>/<session id>/
//!     parts.json        persisted segment list
//!     local.m3u8        manifest handed to the muxer
//!     segments/0001.ts  downloaded payloads
//! ```

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use playlist::{LocalManifestWriter, PlaylistParser, Segment};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::SessionConfig;
use crate::error::StitchError;

pub const STATE_SCHEMA_VERSION: u32 = 1;
pub const STATE_FILE_NAME: &str = "parts.json";
pub const SEGMENTS_DIR_NAME: &str = "segments";
pub const LOCAL_MANIFEST_NAME: &str = "local.m3u8";

const DEFAULT_SEGMENT_EXTENSION: &str = "ts";

/// Stable identifier of one output file's worth of work.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    /// Hashes an already canonical path.
    pub fn from_canonical_path(path: &Path) -> Self {
        let digest = Sha256::digest(path.to_string_lossy().as_bytes());
        Self(hex::encode(digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where the segment list comes from on the first open of a session.
#[derive(Debug, Clone)]
pub enum ManifestSource {
    Path(PathBuf),
    Text(String),
    Url { url: Url, client: Client },
}

impl ManifestSource {
    pub fn url(url: Url, client: Client) -> Self {
        Self::Url { url, client }
    }

    async fn parse(&self) -> Result<Vec<Segment>, StitchError> {
        let parsed = match self {
            Self::Path(path) => {
                let text = tokio::fs::read_to_string(path).await?;
                PlaylistParser::new().parse(&text)?
            }
            Self::Text(text) => PlaylistParser::new().parse(text)?,
            Self::Url { url, client } => {
                let response = client.get(url.clone()).send().await?;
                let status = response.status();
                if !status.is_success() {
                    return Err(StitchError::HttpStatus {
                        status,
                        url: url.to_string(),
                    });
                }
                let text = response.text().await?;
                PlaylistParser::new()
                    .with_base_url(url.clone())
                    .parse(&text)?
            }
        };
        Ok(parsed.into_segments())
    }
}

#[derive(Debug, Clone)]
pub struct SessionPaths {
    pub root: PathBuf,
    pub segments_dir: PathBuf,
    pub state_file: PathBuf,
    pub local_manifest: PathBuf,
}

impl SessionPaths {
    fn new(work_root: &Path, id: &SessionId) -> Self {
        let root = work_root.join(id.as_str());
        Self {
            segments_dir: root.join(SEGMENTS_DIR_NAME),
            state_file: root.join(STATE_FILE_NAME),
            local_manifest: root.join(LOCAL_MANIFEST_NAME),
            root,
        }
    }
}

#[derive(Serialize)]
struct PersistedStateRef<'a> {
    schema_version: u32,
    output: &'a Path,
    segments: &'a [Segment],
}

#[derive(Deserialize)]
struct PersistedState {
    schema_version: u32,
    output: PathBuf,
    segments: Vec<Segment>,
}

/// The ordered segment list of one output file plus its working directory.
///
/// Only the owner of a `Session` mutates it; the scheduler's fetch tasks
/// report back instead of touching it.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    label: String,
    output_path: PathBuf,
    paths: SessionPaths,
    extension: String,
    segments: Vec<Segment>,
    cursor: usize,
    resumed: bool,
}

impl Session {
    /// Opens the session for `output_path`.
    ///
    /// Existing state is reloaded without reading `source`. Otherwise the
    /// source is parsed and the fresh segment list is persisted right away.
    pub async fn open(
        output_path: impl AsRef<Path>,
        source: &ManifestSource,
        config: &SessionConfig,
    ) -> Result<Self, StitchError> {
        let output_path = canonical_output_path(output_path.as_ref()).await?;
        let id = SessionId::from_canonical_path(&output_path);
        let paths = SessionPaths::new(&absolute_work_root(&config.work_root)?, &id);

        let label = config.label.clone().unwrap_or_else(|| {
            output_path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| id.to_string())
        });
        let extension = config
            .segment_extension
            .clone()
            .or_else(|| {
                output_path
                    .extension()
                    .map(|ext| ext.to_string_lossy().into_owned())
            })
            .unwrap_or_else(|| DEFAULT_SEGMENT_EXTENSION.to_owned());

        let (segments, resumed) = match load_state(&paths.state_file, &output_path).await? {
            Some(segments) => (segments, true),
            None => (source.parse().await?, false),
        };
        tokio::fs::create_dir_all(&paths.segments_dir).await?;

        let mut session = Self {
            id,
            label,
            output_path,
            paths,
            extension,
            segments,
            cursor: 0,
            resumed,
        };

        if !resumed {
            session.save().await?;
            info!(
                session = %session.label,
                id = %session.id,
                segments = session.segments.len(),
                "Created download session"
            );
        } else {
            info!(
                session = %session.label,
                id = %session.id,
                segments = session.segments.len(),
                downloaded = session.downloaded_count(),
                "Resumed download session"
            );
            if config.refresh_urls_on_resume {
                let fresh = source.parse().await?;
                if session.refresh_sources(fresh)? > 0 {
                    session.save().await?;
                }
            }
        }

        Ok(session)
    }

    /// Removes the persisted state of the session for `output_path`, so the
    /// next [`Session::open`] parses the source again.
    ///
    /// Returns whether a state file existed.
    pub async fn discard(
        output_path: impl AsRef<Path>,
        config: &SessionConfig,
    ) -> Result<bool, StitchError> {
        let output_path = canonical_output_path(output_path.as_ref()).await?;
        let id = SessionId::from_canonical_path(&output_path);
        let paths = SessionPaths::new(&absolute_work_root(&config.work_root)?, &id);
        match tokio::fs::remove_file(&paths.state_file).await {
            Ok(()) => {
                warn!(id = %id, path = %paths.state_file.display(), "Discarded session state");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Writes the full segment list, replacing the previous state file.
    pub async fn save(&self) -> Result<(), StitchError> {
        let state = PersistedStateRef {
            schema_version: STATE_SCHEMA_VERSION,
            output: &self.output_path,
            segments: &self.segments,
        };
        let json = serde_json::to_vec_pretty(&state)
            .map_err(|e| StitchError::internal(format!("failed to serialize state: {e}")))?;

        let tmp = self.paths.state_file.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, &self.paths.state_file).await?;
        debug!(
            session = %self.label,
            downloaded = self.downloaded_count(),
            "Checkpointed session state"
        );
        Ok(())
    }

    /// Replaces the URLs of undownloaded segments with those from a fresh
    /// parse of the source. Returns how many segments changed.
    ///
    /// The fresh list must have the same length; otherwise nothing changes
    /// and [`StitchError::ManifestMismatch`] is returned.
    pub fn refresh_sources(&mut self, fresh: Vec<Segment>) -> Result<usize, StitchError> {
        if fresh.len() != self.segments.len() {
            return Err(StitchError::ManifestMismatch {
                expected: self.segments.len(),
                found: fresh.len(),
            });
        }

        let mut changed = 0;
        for (current, fresh) in self.segments.iter_mut().zip(fresh) {
            if current.url() == fresh.url() && current.byte_range() == fresh.byte_range() {
                continue;
            }
            if current.refresh_source(fresh.url(), fresh.byte_range()) {
                changed += 1;
            }
        }
        if changed > 0 {
            info!(session = %self.label, changed, "Refreshed segment URLs from source");
        }
        Ok(changed)
    }

    /// Marks a segment downloaded. Returns `false` for an unknown index.
    pub fn mark_downloaded(&mut self, index: u32) -> bool {
        match self.segment_mut(index) {
            Some(segment) => {
                segment.mark_downloaded();
                true
            }
            None => false,
        }
    }

    /// Records that one more segment has been visited by a run.
    pub fn advance_cursor(&mut self) {
        self.cursor = (self.cursor + 1).min(self.segments.len());
    }

    /// Fraction of segments visited in this session, in `0.0..=1.0`.
    pub fn progress(&self) -> f64 {
        if self.segments.is_empty() {
            return 0.0;
        }
        self.cursor as f64 / self.segments.len() as f64
    }

    pub fn pending_indices(&self) -> Vec<u32> {
        self.segments
            .iter()
            .filter(|s| !s.is_downloaded())
            .map(Segment::index)
            .collect()
    }

    pub fn downloaded_count(&self) -> usize {
        self.segments.iter().filter(|s| s.is_downloaded()).count()
    }

    pub fn is_complete(&self) -> bool {
        self.segments.iter().all(Segment::is_downloaded)
    }

    pub fn segment(&self, index: u32) -> Option<&Segment> {
        let position = usize::try_from(index).ok()?.checked_sub(1)?;
        self.segments.get(position)
    }

    fn segment_mut(&mut self, index: u32) -> Option<&mut Segment> {
        let position = usize::try_from(index).ok()?.checked_sub(1)?;
        self.segments.get_mut(position)
    }

    pub fn segment_path(&self, index: u32) -> PathBuf {
        self.paths
            .segments_dir
            .join(format!("{index:04}.{}", self.extension))
    }

    pub fn local_manifest_writer(&self) -> LocalManifestWriter {
        LocalManifestWriter::new(&self.paths.segments_dir, &self.extension)
    }

    /// Removes the whole session directory.
    pub async fn cleanup(self) -> Result<(), StitchError> {
        match tokio::fs::remove_dir_all(&self.paths.root).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        info!(session = %self.label, path = %self.paths.root.display(), "Removed session directory");
        Ok(())
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    pub fn paths(&self) -> &SessionPaths {
        &self.paths
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn total(&self) -> usize {
        self.segments.len()
    }

    /// Whether this session was reloaded from persisted state.
    pub fn is_resumed(&self) -> bool {
        self.resumed
    }
}

/// Absolute, canonical form of an output path that may not exist yet.
async fn canonical_output_path(path: &Path) -> Result<PathBuf, StitchError> {
    if let Ok(canonical) = tokio::fs::canonicalize(path).await {
        return Ok(canonical);
    }

    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };

    let (Some(parent), Some(file_name)) = (absolute.parent(), absolute.file_name()) else {
        return Err(StitchError::configuration(format!(
            "output path `{}` has no file name",
            path.display()
        )));
    };
    match tokio::fs::canonicalize(parent).await {
        Ok(parent) => Ok(parent.join(file_name)),
        Err(_) => Ok(absolute),
    }
}

/// Work root resolved against the current directory.
///
/// Manifest entries are resolved by the muxer relative to the manifest
/// itself, so every segment path must be absolute.
fn absolute_work_root(work_root: &Path) -> Result<PathBuf, StitchError> {
    let absolute = if work_root.is_absolute() {
        work_root.to_path_buf()
    } else {
        std::env::current_dir()?.join(work_root)
    };
    Ok(absolute
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect())
}

async fn load_state(
    state_file: &Path,
    output_path: &Path,
) -> Result<Option<Vec<Segment>>, StitchError> {
    let bytes = match tokio::fs::read(state_file).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let state: PersistedState = serde_json::from_slice(&bytes)
        .map_err(|e| StitchError::state_corrupted(state_file, e.to_string()))?;

    if state.schema_version != STATE_SCHEMA_VERSION {
        return Err(StitchError::state_corrupted(
            state_file,
            format!(
                "unsupported schema version {} (expected {STATE_SCHEMA_VERSION})",
                state.schema_version
            ),
        ));
    }
    if state.output != output_path {
        return Err(StitchError::state_corrupted(
            state_file,
            format!("state belongs to `{}`", state.output.display()),
        ));
    }
    if state.segments.is_empty() {
        return Err(StitchError::state_corrupted(state_file, "no segments"));
    }
    for (position, segment) in state.segments.iter().enumerate() {
        let expected = position + 1;
        if usize::try_from(segment.index()).ok() != Some(expected) {
            return Err(StitchError::state_corrupted(
                state_file,
                format!(
                    "segment at position {expected} has index {}",
                    segment.index()
                ),
            ));
        }
    }

    Ok(Some(state.segments))
}
