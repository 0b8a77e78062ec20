//! Annotated feed: the backend's `multipart/x-mixed-replace` MJPEG stream
//! with recognition boxes drawn in.
//!
//! `AnnotatedFeed` splits the byte stream into JPEG frames by scanning for
//! SOI/EOI markers, so it does not depend on the part boundary. `FeedViewer`
//! reads it on a helper thread and keeps only the newest frame.

use anyhow::{anyhow, Context, Result};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

use crate::error::ApiError;

/// Upper bound on one JPEG part; larger buffers are resynchronised.
const MAX_JPEG_BYTES: usize = 4 * 1024 * 1024;
const READ_CHUNK: usize = 8192;

pub struct AnnotatedFeed {
    reader: Box<dyn Read + Send>,
    buffer: Vec<u8>,
}

impl AnnotatedFeed {
    pub fn new(reader: Box<dyn Read + Send>) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(64 * 1024),
        }
    }

    /// Block until the next complete JPEG is available.
    pub fn next_jpeg(&mut self) -> Result<Vec<u8>> {
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            if let Some((start, end)) = find_jpeg_bounds(&self.buffer) {
                let frame = self.buffer[start..end].to_vec();
                self.buffer.drain(..end);
                return Ok(frame);
            }

            let read = self.reader.read(&mut chunk).context("read annotated feed")?;
            if read == 0 {
                return Err(anyhow!("annotated feed ended"));
            }
            self.buffer.extend_from_slice(&chunk[..read]);

            if self.buffer.len() > MAX_JPEG_BYTES * 2 {
                // Keep the tail in case it holds a split marker.
                let drain_len = self.buffer.len() - 2;
                self.buffer.drain(..drain_len);
            }
        }
    }
}

fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer.windows(2).position(|w| w == [0xFF, 0xD8])?;
    let end = buffer[start + 2..]
        .windows(2)
        .position(|w| w == [0xFF, 0xD9])?;
    Some((start, start + 2 + end + 2))
}

/// Newest frame from the annotated feed.
#[derive(Clone, Debug)]
pub struct FeedFrame {
    pub jpeg: Vec<u8>,
    pub received_at: SystemTime,
    pub sequence: u64,
}

pub type FeedOpener = Box<dyn FnMut() -> Result<AnnotatedFeed, ApiError> + Send>;

#[derive(Clone, Debug)]
pub struct FeedViewerSettings {
    /// Delay before reopening a feed that failed or ended.
    pub reopen_delay: Duration,
    /// When set, each frame is also written here (replaced atomically).
    pub snapshot_path: Option<PathBuf>,
}

impl Default for FeedViewerSettings {
    fn default() -> Self {
        Self {
            reopen_delay: Duration::from_secs(3),
            snapshot_path: None,
        }
    }
}

pub struct FeedViewer {
    shutdown: Arc<AtomicBool>,
    latest: Arc<Mutex<Option<FeedFrame>>>,
    frames: Arc<AtomicU64>,
    join: Option<JoinHandle<()>>,
}

impl FeedViewer {
    pub fn spawn(opener: FeedOpener, settings: FeedViewerSettings) -> Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let latest = Arc::new(Mutex::new(None));
        let frames = Arc::new(AtomicU64::new(0));

        let worker = FeedWorker {
            opener,
            settings,
            shutdown: Arc::clone(&shutdown),
            latest: Arc::clone(&latest),
            frames: Arc::clone(&frames),
        };
        let join = std::thread::Builder::new()
            .name("annotated-feed".to_string())
            .spawn(move || worker.run())
            .context("spawn annotated feed thread")?;

        Ok(Self {
            shutdown,
            latest,
            frames,
            join: Some(join),
        })
    }

    pub fn latest(&self) -> Option<FeedFrame> {
        self.latest
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn frames_received(&self) -> u64 {
        self.frames.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.join
            .as_ref()
            .map(|join| !join.is_finished())
            .unwrap_or(false)
    }

    /// Signal the reader to stop. A reader blocked inside a socket read is
    /// detached and exits on its next wakeup.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            if join.is_finished() {
                if join.join().is_err() {
                    log::warn!("annotated feed thread panicked");
                }
            } else {
                log::debug!("annotated feed reader detached");
            }
        }
    }
}

impl Drop for FeedViewer {
    fn drop(&mut self) {
        self.stop();
    }
}

struct FeedWorker {
    opener: FeedOpener,
    settings: FeedViewerSettings,
    shutdown: Arc<AtomicBool>,
    latest: Arc<Mutex<Option<FeedFrame>>>,
    frames: Arc<AtomicU64>,
}

impl FeedWorker {
    fn run(mut self) {
        while !self.stopped() {
            match (self.opener)() {
                Ok(feed) => {
                    log::info!("annotated feed opened");
                    if let Err(err) = self.read_frames(feed) {
                        log::warn!("annotated feed interrupted: {:#}", err);
                    }
                }
                Err(err) => log::warn!("annotated feed unavailable: {}", err),
            }
            self.sleep_until_reopen();
        }
        log::debug!("annotated feed reader stopped");
    }

    fn stopped(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn read_frames(&mut self, mut feed: AnnotatedFeed) -> Result<()> {
        while !self.stopped() {
            let jpeg = feed.next_jpeg()?;
            let sequence = self.frames.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(path) = &self.settings.snapshot_path {
                if let Err(err) = write_snapshot(path, &jpeg) {
                    log::warn!("annotated snapshot write failed: {:#}", err);
                }
            }
            let frame = FeedFrame {
                jpeg,
                received_at: SystemTime::now(),
                sequence,
            };
            *self
                .latest
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(frame);
        }
        Ok(())
    }

    fn sleep_until_reopen(&self) {
        let deadline = Instant::now() + self.settings.reopen_delay;
        while !self.stopped() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(50));
        }
    }
}

fn write_snapshot(path: &Path, jpeg: &[u8]) -> Result<()> {
    let tmp = path.with_extension("jpg.tmp");
    std::fs::write(&tmp, jpeg).with_context(|| format!("write {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("rename to {}", path.display()))?;
    Ok(())
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
