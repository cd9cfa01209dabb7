use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::SessionConfig;
use crate::error::FetchError;
use crate::fetcher::{FetchRequest, SegmentFetcher};
use crate::session::{ManifestSource, Session};

/// Initialize tracing for tests with appropriate settings
#[inline]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// A well-formed playlist with `count` four-second segments.
pub fn playlist_text(count: u32) -> String {
    let mut text = String::from("#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:4\n");
    for i in 1..=count {
        text.push_str(&format!("#EXTINF:4.0,\nhttps://cdn.example.com/seg{i}.ts\n"));
    }
    text.push_str("#EXT-X-ENDLIST\n");
    text
}

/// Opens (or resumes) the session for `<dir>/out.ts` with `count` segments.
pub async fn open_session(dir: &Path, count: u32) -> Session {
    open_session_with(dir, &playlist_text(count)).await
}

pub async fn open_session_with(dir: &Path, text: &str) -> Session {
    let config = SessionConfig {
        work_root: dir.join("work"),
        ..SessionConfig::default()
    };
    Session::open(
        dir.join("out.ts"),
        &ManifestSource::Text(text.to_owned()),
        &config,
    )
    .await
    .unwrap()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchLog {
    Started(u32),
    Finished(u32),
}

/// In-process fetch primitive that records concurrency and call order.
#[derive(Default)]
pub struct MockFetcher {
    default_delay: Duration,
    delays: HashMap<u32, Duration>,
    failing: HashSet<u32>,
    panicking: HashSet<u32>,
    not_writing: HashSet<u32>,
    uncancellable: HashSet<u32>,
    in_flight: AtomicUsize,
    high_water: AtomicUsize,
    log: Mutex<Vec<FetchLog>>,
    requests: Mutex<Vec<FetchRequest>>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_delay(mut self, delay: Duration) -> Self {
        self.default_delay = delay;
        self
    }

    pub fn with_delay(mut self, index: u32, delay: Duration) -> Self {
        self.delays.insert(index, delay);
        self
    }

    /// Reports retry exhaustion for `index`.
    pub fn failing(mut self, index: u32) -> Self {
        self.failing.insert(index);
        self
    }

    pub fn panicking(mut self, index: u32) -> Self {
        self.panicking.insert(index);
        self
    }

    /// Reports success for `index` without writing the file.
    pub fn not_writing(mut self, index: u32) -> Self {
        self.not_writing.insert(index);
        self
    }

    /// Finishes `index` even after its token is cancelled.
    pub fn uncancellable(mut self, index: u32) -> Self {
        self.uncancellable.insert(index);
        self
    }

    pub fn high_water(&self) -> usize {
        self.high_water.load(Ordering::SeqCst)
    }

    pub fn log(&self) -> Vec<FetchLog> {
        self.log.lock().unwrap().clone()
    }

    pub fn started(&self) -> Vec<u32> {
        self.log()
            .into_iter()
            .filter_map(|e| match e {
                FetchLog::Started(i) => Some(i),
                FetchLog::Finished(_) => None,
            })
            .collect()
    }

    pub fn finished(&self) -> Vec<u32> {
        self.log()
            .into_iter()
            .filter_map(|e| match e {
                FetchLog::Finished(i) => Some(i),
                FetchLog::Started(_) => None,
            })
            .collect()
    }

    pub fn requests(&self) -> Vec<FetchRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl SegmentFetcher for MockFetcher {
    async fn fetch(
        &self,
        request: FetchRequest,
        token: CancellationToken,
    ) -> Result<u64, FetchError> {
        let index = request.index;
        self.log.lock().unwrap().push(FetchLog::Started(index));
        self.requests.lock().unwrap().push(request.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.high_water.fetch_max(now, Ordering::SeqCst);

        let delay = self
            .delays
            .get(&index)
            .copied()
            .unwrap_or(self.default_delay);
        let outcome = if self.uncancellable.contains(&index) {
            tokio::time::sleep(delay).await;
            Ok(())
        } else {
            tokio::select! {
                _ = token.cancelled() => Err(FetchError::Cancelled),
                _ = tokio::time::sleep(delay) => Ok(()),
            }
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.log.lock().unwrap().push(FetchLog::Finished(index));
        outcome?;

        if self.panicking.contains(&index) {
            panic!("mock fetcher panicked on segment {index}");
        }
        if self.failing.contains(&index) {
            return Err(FetchError::Exhausted {
                attempts: request.max_retries + 1,
                reason: "mock failure".to_owned(),
            });
        }
        if self.not_writing.contains(&index) {
            return Ok(0);
        }

        let payload = format!("segment {index}");
        tokio::fs::write(&request.destination, payload.as_bytes()).await?;
        Ok(payload.len() as u64)
    }
}
