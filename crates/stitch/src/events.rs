/// Progress notifications emitted by a scheduler run.
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadEvent {
    Started {
        session: String,
        total: usize,
        /// Segments still to fetch when the run began.
        pending: usize,
    },
    /// Already downloaded in an earlier run.
    SegmentSkipped { index: u32 },
    SegmentCompleted {
        index: u32,
        bytes: u64,
        /// Fraction of segments visited so far.
        progress: f64,
    },
    SegmentFailed { index: u32, reason: String },
    Finished { completed: usize, failed: usize },
}
