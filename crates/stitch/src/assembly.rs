use std::path::PathBuf;

use playlist::PlaylistError;
use tracing::{info, warn};

use crate::config::AssemblyPolicy;
use crate::error::StitchError;
use crate::muxer::Muxer;
use crate::session::Session;

#[derive(Debug, Clone)]
pub struct AssemblyReport {
    pub output: PathBuf,
    pub segments_muxed: usize,
    /// Undownloaded segments left out under [`AssemblyPolicy::SkipMissing`].
    pub omitted: Vec<u32>,
}

/// Writes the local manifest for `session` and hands it to `muxer`.
///
/// Under [`AssemblyPolicy::RequireComplete`] any undownloaded segment is
/// [`StitchError::IncompleteDownload`] and the muxer is never invoked. The
/// same applies when a segment marked downloaded has no file on disk.
/// After a successful mux the session directory is removed unless
/// `keep_segments` is set.
pub async fn assemble(
    session: Session,
    muxer: &dyn Muxer,
    policy: AssemblyPolicy,
    keep_segments: bool,
) -> Result<AssemblyReport, StitchError> {
    let writer = session.local_manifest_writer();
    let (manifest, omitted) = match policy {
        AssemblyPolicy::RequireComplete => match writer.render(session.segments()) {
            Ok(manifest) => (manifest, Vec::new()),
            Err(PlaylistError::MissingSegments { indices }) => {
                return Err(StitchError::IncompleteDownload { missing: indices });
            }
            Err(e) => return Err(e.into()),
        },
        AssemblyPolicy::SkipMissing => writer.render_available(session.segments())?,
    };

    let mut missing_files = Vec::new();
    for segment in session.segments().iter().filter(|s| s.is_downloaded()) {
        if !tokio::fs::try_exists(writer.segment_path(segment))
            .await
            .unwrap_or(false)
        {
            missing_files.push(segment.index());
        }
    }
    if !missing_files.is_empty() {
        return Err(StitchError::IncompleteDownload {
            missing: missing_files,
        });
    }

    if !omitted.is_empty() {
        warn!(session = %session.label(), omitted = ?omitted, "Assembling with missing segments");
    }

    let manifest_path = session.paths().local_manifest.clone();
    tokio::fs::write(&manifest_path, manifest).await?;

    let output = session.output_path().to_path_buf();
    if let Some(parent) = output.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    muxer.mux(&manifest_path, &output).await?;

    let segments_muxed = session.total() - omitted.len();
    info!(
        session = %session.label(),
        output = %output.display(),
        segments = segments_muxed,
        "Assembled output"
    );

    if keep_segments {
        info!(path = %session.paths().root.display(), "Keeping session directory");
    } else if let Err(e) = session.cleanup().await {
        warn!(error = %e, "Failed to remove session directory");
    }

    Ok(AssemblyReport {
        output,
        segments_muxed,
        omitted,
    })
}
