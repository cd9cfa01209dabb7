// Playlist Parser: converts manifest text into ordered segment descriptors.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, trace, warn};
use url::Url;

use crate::error::PlaylistError;
use crate::segment::{ByteRange, Segment};

static EXTINF_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^#EXTINF:\s*([^,]*)").unwrap());
static BYTERANGE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^#EXT-X-BYTERANGE:\s*(\d+)(?:@(\d+))?\s*$").unwrap());
static ABSOLUTE_URL_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^https?://\S+").unwrap());

/// Tags that change how segments must be interpreted but are not handled.
const UNSUPPORTED_TAGS: &[&str] = &[
    "#EXT-X-KEY",
    "#EXT-X-DISCONTINUITY",
    "#EXT-X-GAP",
    "#EXT-X-MAP",
];

/// A recognised tag that the parser does not act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsupportedTag {
    /// 1-based line number in the source text.
    pub line: usize,
    pub tag: &'static str,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedPlaylist {
    pub segments: Vec<Segment>,
    pub unsupported: Vec<UnsupportedTag>,
}

impl ParsedPlaylist {
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn total_duration(&self) -> f64 {
        self.segments.iter().map(Segment::duration).sum()
    }

    pub fn into_segments(self) -> Vec<Segment> {
        self.segments
    }
}

/// State of the segment under construction.
enum ScanState {
    AwaitingDuration,
    AwaitingUri {
        duration: f64,
        byte_range: Option<ByteRange>,
    },
}

#[derive(Debug, Clone, Default)]
pub struct PlaylistParser {
    base_url: Option<Url>,
}

impl PlaylistParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve relative segment URIs against `base_url`.
    ///
    /// Without a base only absolute `http(s)` lines complete a segment.
    pub fn with_base_url(mut self, base_url: Url) -> Self {
        self.base_url = Some(base_url);
        self
    }

    pub fn parse_file(&self, path: impl AsRef<Path>) -> Result<ParsedPlaylist, PlaylistError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        self.parse(&text)
    }

    /// Scans `text` line by line.
    ///
    /// Segment order equals the order of the URI lines. A duration that is
    /// never followed by a URI is dropped. Unknown lines are skipped.
    pub fn parse(&self, text: &str) -> Result<ParsedPlaylist, PlaylistError> {
        let mut segments: Vec<Segment> = Vec::new();
        let mut unsupported = Vec::new();
        let mut state = ScanState::AwaitingDuration;
        // End of the last finalized byte range, used by `length` without `@offset`.
        let mut previous_range_end: Option<u64> = None;
        let mut next_index: u32 = 1;

        for (line_idx, raw_line) in text.lines().enumerate() {
            let line_no = line_idx + 1;
            let line = raw_line.trim();
            if line.is_empty() {
                continue;
            }

            if let Some(tag) = unsupported_tag(line) {
                unsupported.push(UnsupportedTag { line: line_no, tag });
                continue;
            }

            state = match state {
                ScanState::AwaitingDuration => match EXTINF_REGEX.captures(line) {
                    Some(caps) => {
                        let value = caps[1].trim();
                        let duration = parse_duration(value)
                            .ok_or_else(|| PlaylistError::invalid_duration(line_no, value))?;
                        trace!(line = line_no, duration, "Segment duration found");
                        ScanState::AwaitingUri {
                            duration,
                            byte_range: None,
                        }
                    }
                    None => ScanState::AwaitingDuration,
                },
                ScanState::AwaitingUri {
                    duration,
                    byte_range,
                } => {
                    if line.starts_with("#EXT-X-BYTERANGE") {
                        let range = parse_byte_range(line, line_no, previous_range_end)?;
                        ScanState::AwaitingUri {
                            duration,
                            byte_range: Some(range),
                        }
                    } else if let Some(url) = self.segment_url(line) {
                        let index = next_index;
                        next_index += 1;
                        previous_range_end = byte_range.map(|range| range.end);
                        segments.push(Segment::new(index, url, duration).with_byte_range(byte_range));
                        ScanState::AwaitingDuration
                    } else {
                        ScanState::AwaitingUri {
                            duration,
                            byte_range,
                        }
                    }
                }
            };
        }

        if let ScanState::AwaitingUri { duration, .. } = state {
            debug!(duration, "Discarding trailing segment entry without a URI");
        }

        if segments.is_empty() {
            return Err(PlaylistError::Empty);
        }

        if !unsupported.is_empty() {
            let tags: Vec<&str> = unsupported.iter().map(|t| t.tag).collect();
            warn!(
                count = unsupported.len(),
                tags = ?tags,
                "Playlist contains tags that are not handled; output may be incomplete"
            );
        }

        debug!(segments = segments.len(), "Parsed playlist");
        Ok(ParsedPlaylist {
            segments,
            unsupported,
        })
    }

    fn segment_url(&self, line: &str) -> Option<String> {
        if let Some(found) = ABSOLUTE_URL_REGEX.find(line) {
            return match Url::parse(found.as_str()) {
                Ok(url) => Some(url.to_string()),
                Err(e) => {
                    debug!(line, error = %e, "Ignoring malformed segment URL");
                    None
                }
            };
        }

        if line.starts_with('#') {
            return None;
        }

        let base = self.base_url.as_ref()?;
        match base.join(line) {
            Ok(url) => Some(url.to_string()),
            Err(e) => {
                debug!(line, error = %e, "Ignoring unresolvable segment URI");
                None
            }
        }
    }
}

fn unsupported_tag(line: &str) -> Option<&'static str> {
    UNSUPPORTED_TAGS.iter().copied().find(|tag| {
        line.strip_prefix(tag)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with(':'))
    })
}

fn parse_duration(value: &str) -> Option<f64> {
    let duration: f64 = value.parse().ok()?;
    (duration.is_finite() && duration >= 0.0).then_some(duration)
}

fn parse_byte_range(
    line: &str,
    line_no: usize,
    previous_range_end: Option<u64>,
) -> Result<ByteRange, PlaylistError> {
    let value = line.trim_start_matches("#EXT-X-BYTERANGE:");
    let caps = BYTERANGE_REGEX
        .captures(line)
        .ok_or_else(|| PlaylistError::invalid_byte_range(line_no, value))?;

    let length: u64 = caps[1]
        .parse()
        .map_err(|_| PlaylistError::invalid_byte_range(line_no, value))?;
    let offset = match caps.get(2) {
        Some(offset) => offset
            .as_str()
            .parse()
            .map_err(|_| PlaylistError::invalid_byte_range(line_no, value))?,
        None => previous_range_end.map_or(0, |end| end + 1),
    };

    ByteRange::from_length_offset(length, offset)
        .ok_or_else(|| PlaylistError::invalid_byte_range(line_no, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const VOD_PLAYLIST: &str = "#EXTM3U
#EXT-X-VERSION:3
#EXT-X-TARGETDURATION:10
#EXT-X-MEDIA-SEQUENCE:0
#EXTINF:9.009,
https://cdn.example.com/seg/0.ts
#EXTINF:9.009,
https://cdn.example.com/seg/1.ts?token=abc
#EXTINF:3.003,
https://cdn.example.com/seg/2.ts
#EXT-X-ENDLIST
";

    #[test]
    fn parses_segments_in_source_order() {
        let parsed = PlaylistParser::new().parse(VOD_PLAYLIST).unwrap();
        assert_eq!(parsed.len(), 3);

        let indices: Vec<u32> = parsed.segments.iter().map(Segment::index).collect();
        assert_eq!(indices, vec![1, 2, 3]);
        assert_eq!(parsed.segments[1].url(), "https://cdn.example.com/seg/1.ts?token=abc");
        assert_eq!(parsed.segments[2].duration(), 3.003);
        assert!(parsed.segments.iter().all(|s| !s.is_downloaded()));
        assert!(parsed.unsupported.is_empty());
        assert!((parsed.total_duration() - 21.021).abs() < 1e-9);
    }

    #[test]
    fn converts_length_at_offset_to_inclusive_range() {
        let text = "#EXTM3U
#EXTINF:4.0,
#EXT-X-BYTERANGE:500000@1000000
https://cdn.example.com/video.mp4
";
        let parsed = PlaylistParser::new().parse(text).unwrap();
        let range = parsed.segments[0].byte_range().unwrap();
        assert_eq!(range.to_string(), "1000000-1499999");
    }

    #[test]
    fn byte_range_without_offset_continues_previous_range() {
        let text = "#EXTINF:4.0,
#EXT-X-BYTERANGE:100@0
https://cdn.example.com/video.mp4
#EXTINF:4.0,
#EXT-X-BYTERANGE:50
https://cdn.example.com/video.mp4
";
        let parsed = PlaylistParser::new().parse(text).unwrap();
        assert_eq!(parsed.segments[0].byte_range().unwrap().to_string(), "0-99");
        assert_eq!(parsed.segments[1].byte_range().unwrap().to_string(), "100-149");
    }

    #[test]
    fn discards_duration_without_uri() {
        let text = "#EXTINF:5.0,
https://cdn.example.com/a.ts
#EXTINF:5.0,
";
        let parsed = PlaylistParser::new().parse(text).unwrap();
        assert_eq!(parsed.len(), 1);
    }

    #[test]
    fn ignores_unknown_lines_and_urls_before_duration() {
        let text = "#EXTM3U
https://cdn.example.com/orphan.ts
#EXT-X-PROGRAM-DATE-TIME:2024-01-01T00:00:00Z
#EXTINF:2.0,title
#EXT-X-SOMETHING-NEW:1
https://cdn.example.com/a.ts
";
        let parsed = PlaylistParser::new().parse(text).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed.segments[0].url(), "https://cdn.example.com/a.ts");
        assert_eq!(parsed.segments[0].duration(), 2.0);
    }

    #[test]
    fn reports_unsupported_tags_without_miscounting() {
        let text = "#EXTM3U
#EXT-X-KEY:METHOD=AES-128,URI=\"https://keys.example.com/k\"
#EXTINF:2.0,
https://cdn.example.com/a.ts
#EXT-X-DISCONTINUITY
#EXTINF:2.0,
https://cdn.example.com/b.ts
";
        let parsed = PlaylistParser::new().parse(text).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(
            parsed.unsupported,
            vec![
                UnsupportedTag { line: 2, tag: "#EXT-X-KEY" },
                UnsupportedTag { line: 5, tag: "#EXT-X-DISCONTINUITY" },
            ]
        );
    }

    #[test]
    fn relative_uris_need_a_base_url() {
        let text = "#EXTINF:2.0,
seg/a.ts
#EXTINF:2.0,
https://other.example.com/b.ts
";
        let parsed = PlaylistParser::new().parse(text).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed.segments[0].url(), "https://other.example.com/b.ts");

        let base = Url::parse("https://cdn.example.com/live/index.m3u8").unwrap();
        let parsed = PlaylistParser::new().with_base_url(base).parse(text).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed.segments[0].url(), "https://cdn.example.com/live/seg/a.ts");
    }

    #[test]
    fn empty_playlist_is_an_error() {
        let err = PlaylistParser::new().parse("#EXTM3U\n#EXT-X-ENDLIST\n").unwrap_err();
        assert!(matches!(err, PlaylistError::Empty));
    }

    #[test]
    fn malformed_values_name_the_line() {
        let err = PlaylistParser::new()
            .parse("#EXTM3U\n#EXTINF:abc,\nhttps://cdn.example.com/a.ts\n")
            .unwrap_err();
        assert!(matches!(err, PlaylistError::InvalidDuration { line: 2, .. }));

        let err = PlaylistParser::new()
            .parse("#EXTINF:1.0,\n#EXT-X-BYTERANGE:0@10\nhttps://cdn.example.com/a.ts\n")
            .unwrap_err();
        assert!(matches!(err, PlaylistError::InvalidByteRange { line: 2, .. }));
    }

    #[test]
    fn parsing_twice_yields_identical_segments() {
        let parser = PlaylistParser::new();
        assert_eq!(parser.parse(VOD_PLAYLIST).unwrap(), parser.parse(VOD_PLAYLIST).unwrap());
    }

    proptest! {
        #[test]
        fn k_entries_yield_indices_one_to_k(
            durations in proptest::collection::vec(0.1f64..30.0, 1..64)
        ) {
            let mut text = String::from("#EXTM3U\n");
            for (i, duration) in durations.iter().enumerate() {
                text.push_str(&format!("#EXTINF:{duration},\nhttps://cdn.example.com/{i}.ts\n"));
            }

            let parsed = PlaylistParser::new().parse(&text).unwrap();
            prop_assert_eq!(parsed.len(), durations.len());
            for (i, segment) in parsed.segments.iter().enumerate() {
                prop_assert_eq!(segment.index() as usize, i + 1);
                prop_assert_eq!(segment.url(), format!("https://cdn.example.com/{i}.ts"));
                prop_assert_eq!(segment.duration(), durations[i]);
            }
        }
    }
}
