// Download Scheduler: bounded-concurrency fetch of every segment a session still needs.

use std::sync::Arc;

use futures::FutureExt;
use futures::stream::{FuturesUnordered, StreamExt};
use reqwest::header::HeaderMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, debug_span, error, info, instrument, warn};

use crate::config::{FetcherConfig, SchedulerConfig};
use crate::error::{FetchError, StitchError};
use crate::events::DownloadEvent;
use crate::fetcher::{FetchRequest, SegmentFetcher, segment_headers};
use crate::session::Session;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedSegment {
    pub index: u32,
    pub reason: String,
}

/// Outcome of one scheduler run.
#[derive(Debug, Clone, Default)]
pub struct DownloadReport {
    /// Fetched during this run.
    pub completed: usize,
    /// Already downloaded before this run.
    pub skipped: usize,
    /// Left undownloaded after the fetch primitive gave up.
    pub failed: Vec<FailedSegment>,
}

impl DownloadReport {
    /// Failed indices in ascending order.
    pub fn failed_indices(&self) -> Vec<u32> {
        let mut indices: Vec<u32> = self.failed.iter().map(|f| f.index).collect();
        indices.sort_unstable();
        indices
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// Turns any failure into [`StitchError::SegmentsFailed`].
    pub fn into_result(self) -> Result<Self, StitchError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(StitchError::SegmentsFailed {
                indices: self.failed_indices(),
            })
        }
    }
}

type InFlight = (u32, Result<Result<u64, FetchError>, tokio::task::JoinError>);

/// Fetches undownloaded segments with at most `max_in_flight` requests at
/// a time.
///
/// Segments are submitted in index order. Fetches run as separate tasks and
/// report back here; only the scheduler marks segments downloaded and writes
/// a checkpoint, one per completed segment.
pub struct DownloadScheduler {
    fetcher: Arc<dyn SegmentFetcher>,
    config: SchedulerConfig,
    max_retries: u32,
    base_headers: HeaderMap,
    token: CancellationToken,
    events: Option<mpsc::Sender<DownloadEvent>>,
}

impl DownloadScheduler {
    pub fn new(
        fetcher: Arc<dyn SegmentFetcher>,
        config: SchedulerConfig,
        fetcher_config: &FetcherConfig,
    ) -> Self {
        Self {
            fetcher,
            config,
            max_retries: fetcher_config.max_retries,
            base_headers: fetcher_config.headers.clone(),
            token: CancellationToken::new(),
            events: None,
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    pub fn with_events(mut self, events: mpsc::Sender<DownloadEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Runs until every segment has been attempted.
    ///
    /// Exhausted segments do not stop the run; they are listed in the
    /// returned report. Cancellation waits for in-flight fetches to settle,
    /// keeps their successes and returns [`StitchError::Cancelled`].
    #[instrument(name = "download", skip_all, fields(session = %session.label()))]
    pub async fn run(&self, session: &mut Session) -> Result<DownloadReport, StitchError> {
        let window = self.config.max_in_flight.max(1);
        let mut queue: std::collections::VecDeque<u32> =
            session.segments().iter().map(|s| s.index()).collect();
        let mut unsubmitted = session.pending_indices().len();
        let run_token = self.token.child_token();

        info!(
            total = session.total(),
            pending = unsubmitted,
            max_in_flight = window,
            "Starting segment downloads"
        );
        self.emit(DownloadEvent::Started {
            session: session.label().to_owned(),
            total: session.total(),
            pending: unsubmitted,
        })
        .await;

        let mut report = DownloadReport::default();
        let mut in_flight = FuturesUnordered::new();
        let mut tail_released = false;
        let mut cancelled = false;

        loop {
            if !cancelled && self.token.is_cancelled() {
                info!(in_flight = in_flight.len(), "Cancellation requested, settling in-flight fetches");
                cancelled = true;
                self.checkpoint(session).await;
            }

            while !cancelled && let Some(&index) = queue.front() {
                if session.segment(index).is_none_or(|s| s.is_downloaded()) {
                    queue.pop_front();
                    session.advance_cursor();
                    report.skipped += 1;
                    self.emit(DownloadEvent::SegmentSkipped { index }).await;
                    continue;
                }
                if in_flight.len() >= window {
                    break;
                }
                if self.config.drain_tail && !tail_released && unsubmitted <= window {
                    if !in_flight.is_empty() {
                        break;
                    }
                    debug!(remaining = unsubmitted, "Releasing tail segments");
                    tail_released = true;
                }

                queue.pop_front();
                session.advance_cursor();
                unsubmitted -= 1;
                in_flight.push(self.submit(session, index, &run_token));
            }

            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                biased;

                _ = self.token.cancelled(), if !cancelled => {}

                Some((index, joined)) = in_flight.next() => {
                    match joined {
                        Ok(result) => self.record(session, &mut report, index, result).await,
                        Err(e) => {
                            error!(index, error = %e, "Segment task aborted");
                            run_token.cancel();
                            while let Some((other, joined)) = in_flight.next().await {
                                match joined {
                                    Ok(result) => self.record(session, &mut report, other, result).await,
                                    Err(e) => error!(index = other, error = %e, "Segment task aborted"),
                                }
                            }
                            self.checkpoint(session).await;
                            return Err(StitchError::internal(format!(
                                "fetch task for segment {index} failed: {e}"
                            )));
                        }
                    }
                }
            }
        }

        self.checkpoint(session).await;

        if cancelled {
            info!(
                completed = report.completed,
                pending = session.pending_indices().len(),
                "Download cancelled, progress saved"
            );
            return Err(StitchError::Cancelled);
        }

        if report.failed.is_empty() {
            info!(completed = report.completed, skipped = report.skipped, "All segments downloaded");
        } else {
            warn!(
                completed = report.completed,
                failed = ?report.failed_indices(),
                "Download finished with failed segments"
            );
        }
        self.emit(DownloadEvent::Finished {
            completed: report.completed,
            failed: report.failed.len(),
        })
        .await;

        Ok(report)
    }

    fn submit(
        &self,
        session: &Session,
        index: u32,
        token: &CancellationToken,
    ) -> impl Future<Output = InFlight> + use<> {
        let byte_range = session.segment(index).and_then(|s| s.byte_range());
        let request = FetchRequest {
            index,
            url: session
                .segment(index)
                .map(|s| s.url().to_owned())
                .unwrap_or_default(),
            destination: session.segment_path(index),
            headers: segment_headers(&self.base_headers, byte_range),
            max_retries: self.max_retries,
        };
        debug!(index, url = %request.url, "Submitting segment");

        let fetcher = Arc::clone(&self.fetcher);
        let token = token.clone();
        let task = tokio::spawn(
            async move { fetcher.fetch(request, token).await }
                .instrument(debug_span!("segment", index)),
        );
        task.map(move |joined| (index, joined))
    }

    async fn record(
        &self,
        session: &mut Session,
        report: &mut DownloadReport,
        index: u32,
        result: Result<u64, FetchError>,
    ) {
        let failure = match result {
            Ok(bytes) => {
                let path = session.segment_path(index);
                if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                    session.mark_downloaded(index);
                    self.checkpoint(session).await;
                    report.completed += 1;
                    debug!(index, bytes, progress = session.progress(), "Segment downloaded");
                    self.emit(DownloadEvent::SegmentCompleted {
                        index,
                        bytes,
                        progress: session.progress(),
                    })
                    .await;
                    return;
                }
                format!("fetch succeeded but `{}` is missing", path.display())
            }
            Err(FetchError::Cancelled) => {
                debug!(index, "Segment fetch cancelled");
                return;
            }
            Err(e) => e.to_string(),
        };

        warn!(index, reason = %failure, "Segment failed, continuing");
        self.emit(DownloadEvent::SegmentFailed {
            index,
            reason: failure.clone(),
        })
        .await;
        report.failed.push(FailedSegment {
            index,
            reason: failure,
        });
    }

    async fn checkpoint(&self, session: &Session) {
        if let Err(e) = session.save().await {
            warn!(error = %e, "Failed to checkpoint session state");
        }
    }

    async fn emit(&self, event: DownloadEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event).await;
        }
    }
}
