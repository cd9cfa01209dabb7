use std::fmt;

use serde::{Deserialize, Serialize};

/// Inclusive byte range of a segment inside a larger remote resource.
///
/// Persisted and displayed as `start-end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Builds a range from the playlist encoding `length@offset`.
    ///
    /// Returns `None` for a zero length or when the end would overflow.
    pub fn from_length_offset(length: u64, offset: u64) -> Option<Self> {
        if length == 0 {
            return None;
        }
        let end = offset.checked_add(length - 1)?;
        Some(Self { start: offset, end })
    }

    /// Number of bytes covered, always at least one.
    pub fn length(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Value for an HTTP `Range` request header.
    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

impl From<ByteRange> for String {
    fn from(range: ByteRange) -> Self {
        range.to_string()
    }
}

impl TryFrom<String> for ByteRange {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let (start, end) = value
            .split_once('-')
            .ok_or_else(|| format!("byte range `{value}` is not `start-end`"))?;
        let start: u64 = start
            .trim()
            .parse()
            .map_err(|_| format!("invalid range start in `{value}`"))?;
        let end: u64 = end
            .trim()
            .parse()
            .map_err(|_| format!("invalid range end in `{value}`"))?;
        if end < start {
            return Err(format!("byte range `{value}` ends before it starts"));
        }
        Ok(Self { start, end })
    }
}

/// One playable chunk of the stream.
///
/// `index` is 1-based and fixed at parse time. `downloaded` only ever moves
/// from `false` to `true`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    index: u32,
    url: String,
    duration: f64,
    #[serde(rename = "range", default)]
    byte_range: Option<ByteRange>,
    #[serde(default)]
    downloaded: bool,
}

impl Segment {
    pub fn new(index: u32, url: impl Into<String>, duration: f64) -> Self {
        Self {
            index,
            url: url.into(),
            duration,
            byte_range: None,
            downloaded: false,
        }
    }

    pub fn with_byte_range(mut self, byte_range: Option<ByteRange>) -> Self {
        self.byte_range = byte_range;
        self
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn duration(&self) -> f64 {
        self.duration
    }

    pub fn byte_range(&self) -> Option<ByteRange> {
        self.byte_range
    }

    pub fn is_downloaded(&self) -> bool {
        self.downloaded
    }

    pub fn mark_downloaded(&mut self) {
        self.downloaded = true;
    }

    /// Replaces the remote location of a segment that has not been fetched yet.
    ///
    /// Returns `false` and leaves the segment untouched once it is downloaded,
    /// since its bytes already came from the previous location.
    pub fn refresh_source(&mut self, url: impl Into<String>, byte_range: Option<ByteRange>) -> bool {
        if self.downloaded {
            return false;
        }
        self.url = url.into();
        self.byte_range = byte_range;
        true
    }

    /// Zero-padded, sortable file stem, e.g. `0007`.
    pub fn file_stem(&self) -> String {
        format!("{:04}", self.index)
    }

    pub fn file_name(&self, extension: &str) -> String {
        format!("{}.{}", self.file_stem(), extension)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_range_from_length_offset_is_inclusive() {
        let range = ByteRange::from_length_offset(500_000, 1_000_000).unwrap();
        assert_eq!(range.to_string(), "1000000-1499999");
        assert_eq!(range.length(), 500_000);
        assert_eq!(range.header_value(), "bytes=1000000-1499999");
    }

    #[test]
    fn byte_range_rejects_zero_length_and_overflow() {
        assert!(ByteRange::from_length_offset(0, 10).is_none());
        assert!(ByteRange::from_length_offset(2, u64::MAX).is_none());
    }

    #[test]
    fn byte_range_parses_persisted_form() {
        let range = ByteRange::try_from("10-19".to_string()).unwrap();
        assert_eq!(range, ByteRange { start: 10, end: 19 });
        assert!(ByteRange::try_from("19-10".to_string()).is_err());
        assert!(ByteRange::try_from("abc".to_string()).is_err());
    }

    #[test]
    fn file_names_are_zero_padded() {
        let segment = Segment::new(7, "https://cdn.example.com/7.ts", 4.0);
        assert_eq!(segment.file_stem(), "0007");
        assert_eq!(segment.file_name("ts"), "0007.ts");

        let segment = Segment::new(12345, "https://cdn.example.com/x.ts", 4.0);
        assert_eq!(segment.file_stem(), "12345");
    }

    #[test]
    fn downloaded_segments_keep_their_source() {
        let mut segment = Segment::new(1, "https://old.example.com/1.ts", 6.0);
        assert!(segment.refresh_source("https://new.example.com/1.ts", None));
        assert_eq!(segment.url(), "https://new.example.com/1.ts");

        segment.mark_downloaded();
        assert!(!segment.refresh_source("https://newer.example.com/1.ts", None));
        assert_eq!(segment.url(), "https://new.example.com/1.ts");
        assert!(segment.is_downloaded());
    }

    #[test]
    fn serialized_form_uses_range_string() {
        let segment = Segment::new(3, "https://cdn.example.com/a.mp4", 2.5)
            .with_byte_range(ByteRange::from_length_offset(100, 200));
        let json = serde_json::to_value(&segment).unwrap();
        assert_eq!(json["range"], "200-299");
        assert_eq!(json["index"], 3);
        assert_eq!(json["downloaded"], false);

        let back: Segment = serde_json::from_value(json).unwrap();
        assert_eq!(back, segment);
    }
}
