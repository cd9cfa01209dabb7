// Local Manifest Writer: renders the playlist handed to the muxer.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::PlaylistError;
use crate::segment::Segment;

/// Renders a VOD playlist whose entries are the local segment files.
///
/// Every entry is `<segment_dir>/<index>.<extension>`, written in index order
/// with the segment's original duration. Byte ranges are not emitted because
/// each local file already holds only its own range.
#[derive(Debug, Clone)]
pub struct LocalManifestWriter {
    segment_dir: PathBuf,
    extension: String,
}

impl LocalManifestWriter {
    pub fn new(segment_dir: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        Self {
            segment_dir: segment_dir.into(),
            extension: extension.into(),
        }
    }

    pub fn segment_dir(&self) -> &Path {
        &self.segment_dir
    }

    pub fn segment_path(&self, segment: &Segment) -> PathBuf {
        self.segment_dir.join(segment.file_name(&self.extension))
    }

    /// Renders all segments, refusing if any of them is not downloaded.
    pub fn render(&self, segments: &[Segment]) -> Result<String, PlaylistError> {
        let missing: Vec<u32> = segments
            .iter()
            .filter(|s| !s.is_downloaded())
            .map(Segment::index)
            .collect();
        if !missing.is_empty() {
            return Err(PlaylistError::MissingSegments { indices: missing });
        }
        self.render_entries(segments.iter())
    }

    /// Renders only downloaded segments and returns the indices left out.
    pub fn render_available(
        &self,
        segments: &[Segment],
    ) -> Result<(String, Vec<u32>), PlaylistError> {
        let omitted: Vec<u32> = segments
            .iter()
            .filter(|s| !s.is_downloaded())
            .map(Segment::index)
            .collect();
        let manifest = self.render_entries(segments.iter().filter(|s| s.is_downloaded()))?;
        Ok((manifest, omitted))
    }

    fn render_entries<'a>(
        &self,
        segments: impl Iterator<Item = &'a Segment> + Clone,
    ) -> Result<String, PlaylistError> {
        let target_duration = segments
            .clone()
            .map(Segment::duration)
            .fold(0.0_f64, f64::max)
            .ceil() as u64;

        let mut out = String::new();
        out.push_str("#EXTM3U\n");
        out.push_str("#EXT-X-VERSION:3\n");
        out.push_str("#EXT-X-PLAYLIST-TYPE:VOD\n");
        let _ = writeln!(out, "#EXT-X-TARGETDURATION:{target_duration}");
        out.push_str("#EXT-X-MEDIA-SEQUENCE:0\n");

        let mut entries = 0usize;
        for segment in segments {
            let _ = writeln!(out, "#EXTINF:{},", segment.duration());
            let _ = writeln!(out, "{}", self.segment_path(segment).display());
            entries += 1;
        }
        if entries == 0 {
            return Err(PlaylistError::Empty);
        }

        out.push_str("#EXT-X-ENDLIST\n");
        debug!(entries, "Rendered local manifest");
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segments(count: u32) -> Vec<Segment> {
        (1..=count)
            .map(|i| Segment::new(i, format!("https://cdn.example.com/{i}.ts"), 4.5))
            .collect()
    }

    #[test]
    fn renders_absolute_local_paths_in_index_order() {
        let mut segments = segments(3);
        segments.iter_mut().for_each(Segment::mark_downloaded);

        let writer = LocalManifestWriter::new("/tmp/session/segments", "ts");
        let manifest = writer.render(&segments).unwrap();

        let expected = "#EXTM3U
#EXT-X-VERSION:3
#EXT-X-PLAYLIST-TYPE:VOD
#EXT-X-TARGETDURATION:5
#EXT-X-MEDIA-SEQUENCE:0
#EXTINF:4.5,
/tmp/session/segments/0001.ts
#EXTINF:4.5,
/tmp/session/segments/0002.ts
#EXTINF:4.5,
/tmp/session/segments/0003.ts
#EXT-X-ENDLIST
";
        assert_eq!(manifest, expected);
    }

    #[test]
    fn refuses_to_reference_missing_segments() {
        let mut segments = segments(10);
        for segment in segments.iter_mut().filter(|s| s.index() != 7) {
            segment.mark_downloaded();
        }

        let writer = LocalManifestWriter::new("/tmp/session/segments", "ts");
        let err = writer.render(&segments).unwrap_err();
        match err {
            PlaylistError::MissingSegments { indices } => assert_eq!(indices, vec![7]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn render_available_skips_and_reports_gaps() {
        let mut segments = segments(4);
        segments[0].mark_downloaded();
        segments[3].mark_downloaded();

        let writer = LocalManifestWriter::new("/data/seg", "mp4");
        let (manifest, omitted) = writer.render_available(&segments).unwrap();
        assert_eq!(omitted, vec![2, 3]);
        assert!(manifest.contains("/data/seg/0001.mp4"));
        assert!(manifest.contains("/data/seg/0004.mp4"));
        assert!(!manifest.contains("0002"));
    }

    #[test]
    fn nothing_downloaded_is_empty() {
        let writer = LocalManifestWriter::new("/data/seg", "ts");
        let err = writer.render_available(&segments(2)).unwrap_err();
        assert!(matches!(err, PlaylistError::Empty));
    }
}
