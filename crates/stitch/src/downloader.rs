use std::path::Path;
use std::sync::Arc;

use reqwest::Client;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

use crate::assembly::{AssemblyReport, assemble};
use crate::config::{AssemblyPolicy, StitchConfig};
use crate::error::StitchError;
use crate::events::DownloadEvent;
use crate::fetcher::{HttpFetcher, SegmentFetcher, create_client};
use crate::muxer::{FfmpegMuxer, Muxer};
use crate::scheduler::{DownloadReport, DownloadScheduler};
use crate::session::{ManifestSource, Session, SessionId};

/// Result of a full download: the run report plus the assembled output.
#[derive(Debug, Clone)]
pub struct DownloadSummary {
    pub session_id: SessionId,
    pub resumed: bool,
    pub report: DownloadReport,
    pub assembly: AssemblyReport,
}

impl DownloadSummary {
    pub fn output(&self) -> &Path {
        &self.assembly.output
    }
}

/// Opens a session, downloads what is missing and assembles the output.
///
/// The HTTP fetcher and ffmpeg muxer are the defaults; both can be replaced.
pub struct StitchDownloader {
    config: StitchConfig,
    client: Client,
    fetcher: Arc<dyn SegmentFetcher>,
    muxer: Arc<dyn Muxer>,
    token: CancellationToken,
    events: Option<mpsc::Sender<DownloadEvent>>,
}

impl StitchDownloader {
    pub fn new(config: StitchConfig) -> Result<Self, StitchError> {
        if config.scheduler.max_in_flight == 0 {
            return Err(StitchError::configuration("max_in_flight must be at least 1"));
        }
        let client = create_client(&config.fetcher)?;
        let fetcher = Arc::new(HttpFetcher::new(client.clone(), &config.fetcher));
        let muxer = Arc::new(FfmpegMuxer::new(config.muxer.clone()));
        Ok(Self {
            config,
            client,
            fetcher,
            muxer,
            token: CancellationToken::new(),
            events: None,
        })
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn SegmentFetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn with_muxer(mut self, muxer: Arc<dyn Muxer>) -> Self {
        self.muxer = muxer;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    pub fn with_events(mut self, events: mpsc::Sender<DownloadEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(&self) -> &StitchConfig {
        &self.config
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Remote playlist fetched with this downloader's HTTP client.
    pub fn manifest_from_url(&self, url: &str) -> Result<ManifestSource, StitchError> {
        let url = Url::parse(url)
            .map_err(|e| StitchError::configuration(format!("invalid playlist URL `{url}`: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(StitchError::configuration(format!(
                "unsupported playlist URL scheme `{}`",
                url.scheme()
            )));
        }
        Ok(ManifestSource::url(url, self.client.clone()))
    }

    pub async fn open_session(
        &self,
        source: &ManifestSource,
        output: impl AsRef<Path>,
    ) -> Result<Session, StitchError> {
        Session::open(output, source, &self.config.session).await
    }

    pub fn scheduler(&self) -> DownloadScheduler {
        let scheduler = DownloadScheduler::new(
            Arc::clone(&self.fetcher),
            self.config.scheduler.clone(),
            &self.config.fetcher,
        )
        .with_cancellation(self.token.clone());
        match &self.events {
            Some(events) => scheduler.with_events(events.clone()),
            None => scheduler,
        }
    }

    /// Runs a session for `output` to completion.
    ///
    /// Failed segments under [`AssemblyPolicy::RequireComplete`] end the call
    /// with [`StitchError::SegmentsFailed`] before muxing; the session stays on
    /// disk so the next call only fetches what is still missing.
    pub async fn download(
        &self,
        source: &ManifestSource,
        output: impl AsRef<Path>,
    ) -> Result<DownloadSummary, StitchError> {
        let mut session = self.open_session(source, output).await?;
        let session_id = session.id().clone();
        let resumed = session.is_resumed();

        let report = self.scheduler().run(&mut session).await?;
        if !report.is_success() && self.config.assembly_policy == AssemblyPolicy::RequireComplete
        {
            warn!(
                session = %session.label(),
                failed = ?report.failed_indices(),
                "Not assembling, segments are missing"
            );
            return Err(StitchError::SegmentsFailed {
                indices: report.failed_indices(),
            });
        }

        let assembly = assemble(
            session,
            self.muxer.as_ref(),
            self.config.assembly_policy,
            self.config.session.keep_segments,
        )
        .await?;
        info!(output = %assembly.output.display(), "Download complete");

        Ok(DownloadSummary {
            session_id,
            resumed,
            report,
            assembly,
        })
    }
}
