use std::path::PathBuf;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Deserialize;

use crate::StitchError;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/142.0.0.0 Safari/537.36";

/// Directory under which per-session working directories are created.
pub const DEFAULT_WORK_ROOT: &str = "./temp_m3u8_downloader";

// --- Session Configuration ---
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Root for session directories; each session lives in `<work_root>/<session id>`.
    pub work_root: PathBuf,
    /// Extension of local segment files. Falls back to the output file's
    /// extension, then to `ts`.
    pub segment_extension: Option<String>,
    /// Name shown in logs and events. Defaults to the output file name.
    pub label: Option<String>,
    /// Re-parse the source playlist on resume and pick up new segment URLs.
    pub refresh_urls_on_resume: bool,
    /// Keep the session directory after a successful assembly.
    pub keep_segments: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            work_root: PathBuf::from(DEFAULT_WORK_ROOT),
            segment_extension: None,
            label: None,
            refresh_urls_on_resume: false,
            keep_segments: false,
        }
    }
}

// --- Scheduler Configuration ---
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Max concurrent segment fetches (default: 5)
    pub max_in_flight: usize,
    /// Once no more than `max_in_flight` segments remain unsubmitted, wait
    /// for the window to empty and submit the tail together (default: true)
    pub drain_tail: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 5,
            drain_tail: true,
        }
    }
}

// --- Fetcher Configuration ---
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetcherConfig {
    /// Retries per segment, not counting the first attempt (default: 5)
    pub max_retries: u32,
    pub retry_base_delay: Duration, // Base for exponential backoff
    pub retry_max_delay: Duration,
    pub jitter: bool,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub user_agent: String,
    /// Base headers sent with every segment request.
    #[serde(skip)]
    pub headers: HeaderMap,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_base_delay: Duration::from_millis(500),
            retry_max_delay: Duration::from_secs(10),
            jitter: true,
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            headers: HeaderMap::new(),
        }
    }
}

// --- Muxer Configuration ---
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MuxerConfig {
    pub ffmpeg_path: PathBuf,
    /// Extra arguments placed before the output path.
    pub extra_args: Vec<String>,
    /// Overwrite an existing output file (`-y`) instead of failing (`-n`).
    pub overwrite: bool,
}

impl Default for MuxerConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            extra_args: Vec::new(),
            overwrite: true,
        }
    }
}

/// What assembly does with segments that never downloaded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssemblyPolicy {
    /// Refuse to mux while any segment is missing.
    #[default]
    RequireComplete,
    /// Mux what is on disk and report the gaps.
    SkipMissing,
}

// --- Top-Level Configuration ---
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StitchConfig {
    pub session: SessionConfig,
    pub scheduler: SchedulerConfig,
    pub fetcher: FetcherConfig,
    pub muxer: MuxerConfig,
    pub assembly_policy: AssemblyPolicy,
}

impl StitchConfig {
    pub fn builder() -> StitchConfigBuilder {
        StitchConfigBuilder::new()
    }
}

#[derive(Debug, Default)]
pub struct StitchConfigBuilder {
    config: StitchConfig,
    invalid_headers: Vec<String>,
}

impl StitchConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_work_root(mut self, work_root: impl Into<PathBuf>) -> Self {
        self.config.session.work_root = work_root.into();
        self
    }

    pub fn with_segment_extension(mut self, extension: impl Into<String>) -> Self {
        self.config.session.segment_extension = Some(extension.into());
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.config.session.label = Some(label.into());
        self
    }

    pub fn with_url_refresh_on_resume(mut self, enabled: bool) -> Self {
        self.config.session.refresh_urls_on_resume = enabled;
        self
    }

    pub fn with_keep_segments(mut self, keep: bool) -> Self {
        self.config.session.keep_segments = keep;
        self
    }

    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.config.scheduler.max_in_flight = max_in_flight;
        self
    }

    pub fn with_tail_drain(mut self, enabled: bool) -> Self {
        self.config.scheduler.drain_tail = enabled;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.config.fetcher.max_retries = max_retries;
        self
    }

    pub fn with_retry_delays(mut self, base: Duration, max: Duration) -> Self {
        self.config.fetcher.retry_base_delay = base;
        self.config.fetcher.retry_max_delay = max;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.fetcher.request_timeout = timeout;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.fetcher.user_agent = user_agent.into();
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                self.config.fetcher.headers.insert(name, value);
            }
            _ => self.invalid_headers.push(name.to_owned()),
        }
        self
    }

    pub fn with_ffmpeg_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.muxer.ffmpeg_path = path.into();
        self
    }

    pub fn with_assembly_policy(mut self, policy: AssemblyPolicy) -> Self {
        self.config.assembly_policy = policy;
        self
    }

    pub fn build(self) -> Result<StitchConfig, StitchError> {
        if !self.invalid_headers.is_empty() {
            return Err(StitchError::configuration(format!(
                "invalid headers: {}",
                self.invalid_headers.join(", ")
            )));
        }
        if self.config.scheduler.max_in_flight == 0 {
            return Err(StitchError::configuration(
                "max_in_flight must be at least 1",
            ));
        }
        Ok(self.config)
    }
}
