//! Per-stream statistics and the registry that owns them

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Instant;

use metrics::{counter, gauge};
use proctor::{FaceRecognition, FrameVerdict};
use ring_buffer::BufferStats;
use serde::Serialize;

use crate::trend::{FaceCountTrend, TrendSnapshot};
use crate::{StreamConfig, StreamError};

/// Lifecycle of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    Running,
    /// Stopped on request
    Stopped,
    /// The capture source failed or disconnected
    Failed,
    /// Source exhausted or the monitored session ended
    Finished,
}

/// Point-in-time view of one stream
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub stream_id: String,
    pub source: String,
    pub state: StreamState,
    pub frames_captured: u64,
    /// Evicted by the buffer or superseded by a newer frame
    pub frames_dropped: u64,
    pub frames_processed: u64,
    /// Frames whose analysis or evaluation returned an error
    pub frames_failed: u64,
    pub fps: f64,
    pub trend: Option<TrendSnapshot>,
    pub last_verdict: Option<FrameVerdict>,
    /// Faces matched to an enrolled identity, over all frames
    pub faces_recognized: u64,
    /// Per-face results of the most recent recognized frame
    pub last_recognitions: Vec<FaceRecognition>,
    pub error: Option<String>,
    pub uptime_secs: f64,
}

struct Inner {
    state: StreamState,
    frames_captured: u64,
    frames_dropped: u64,
    frames_processed: u64,
    frames_failed: u64,
    fps: f64,
    sample_started: Instant,
    sample_frames: u64,
    trend: FaceCountTrend,
    last_verdict: Option<FrameVerdict>,
    faces_recognized: u64,
    last_recognitions: Vec<FaceRecognition>,
    error: Option<String>,
}

/// Statistics owned by a single stream.
///
/// Updated by that stream's producer and consumer only; readers take
/// snapshots.
pub struct StreamStats {
    stream_id: String,
    source: String,
    fps_sample_frames: u64,
    started: Instant,
    inner: Mutex<Inner>,
}

impl StreamStats {
    pub fn new(stream_id: impl Into<String>, source: impl Into<String>, config: &StreamConfig) -> Self {
        let now = Instant::now();
        Self {
            stream_id: stream_id.into(),
            source: source.into(),
            fps_sample_frames: config.fps_sample_frames.max(1),
            started: now,
            inner: Mutex::new(Inner {
                state: StreamState::Running,
                frames_captured: 0,
                frames_dropped: 0,
                frames_processed: 0,
                frames_failed: 0,
                fps: 0.0,
                sample_started: now,
                sample_frames: 0,
                trend: FaceCountTrend::new(config.trend_window),
                last_verdict: None,
                faces_recognized: 0,
                last_recognitions: Vec::new(),
                error: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn state(&self) -> StreamState {
        self.lock().state
    }

    pub fn record_captured(&self) {
        self.lock().frames_captured += 1;
        counter!("stream_frames_captured_total", "stream" => self.stream_id.clone()).increment(1);
    }

    /// Take the drop count from the buffer's own counters
    pub fn record_buffer(&self, buffer: BufferStats) {
        let dropped = buffer.evicted + buffer.superseded;
        let mut inner = self.lock();
        let delta = dropped.saturating_sub(inner.frames_dropped);
        inner.frames_dropped = dropped;
        drop(inner);
        if delta > 0 {
            counter!("stream_frames_dropped_total", "stream" => self.stream_id.clone())
                .increment(delta);
        }
    }

    /// Count a processed frame and feed the trend; FPS is resampled every
    /// `fps_sample_frames` frames
    pub fn record_processed(&self, faces: usize) {
        let mut inner = self.lock();
        inner.frames_processed += 1;
        inner.trend.push(faces);
        inner.sample_frames += 1;

        if inner.sample_frames >= self.fps_sample_frames {
            let elapsed = inner.sample_started.elapsed().as_secs_f64();
            if elapsed > 0.0 {
                inner.fps = inner.sample_frames as f64 / elapsed;
            }
            inner.sample_frames = 0;
            inner.sample_started = Instant::now();
            gauge!("stream_fps", "stream" => self.stream_id.clone()).set(inner.fps);
        }

        if let Some(trend) = inner.trend.snapshot() {
            gauge!("stream_face_count_avg", "stream" => self.stream_id.clone()).set(trend.average);
        }
        drop(inner);
        counter!("stream_frames_processed_total", "stream" => self.stream_id.clone()).increment(1);
    }

    pub fn record_failure(&self) {
        self.lock().frames_failed += 1;
    }

    pub fn record_verdict(&self, verdict: FrameVerdict) {
        self.lock().last_verdict = Some(verdict);
    }

    pub fn record_recognitions(&self, results: Vec<FaceRecognition>) {
        let recognized = results.iter().filter(|r| r.recognized).count() as u64;
        let mut inner = self.lock();
        inner.faces_recognized += recognized;
        inner.last_recognitions = results;
        drop(inner);
        if recognized > 0 {
            counter!("stream_faces_recognized_total", "stream" => self.stream_id.clone())
                .increment(recognized);
        }
    }

    /// Mark the stream failed; the first error is kept
    pub fn fail(&self, error: impl Into<String>) {
        let mut inner = self.lock();
        inner.state = StreamState::Failed;
        if inner.error.is_none() {
            inner.error = Some(error.into());
        }
    }

    /// Move a running stream to its final state. A failed stream stays failed.
    pub fn settle(&self, state: StreamState) {
        let mut inner = self.lock();
        if inner.state == StreamState::Running {
            inner.state = state;
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let inner = self.lock();
        StatsSnapshot {
            stream_id: self.stream_id.clone(),
            source: self.source.clone(),
            state: inner.state,
            frames_captured: inner.frames_captured,
            frames_dropped: inner.frames_dropped,
            frames_processed: inner.frames_processed,
            frames_failed: inner.frames_failed,
            fps: inner.fps,
            trend: inner.trend.snapshot(),
            last_verdict: inner.last_verdict.clone(),
            faces_recognized: inner.faces_recognized,
            last_recognitions: inner.last_recognitions.clone(),
            error: inner.error.clone(),
            uptime_secs: self.started.elapsed().as_secs_f64(),
        }
    }
}

/// Registry of stream statistics, shared by handle
#[derive(Default)]
pub struct StatsRegistry {
    streams: RwLock<HashMap<String, Arc<StreamStats>>>,
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register the statistics of a new stream
    pub fn register(
        &self,
        stream_id: &str,
        source: &str,
        config: &StreamConfig,
    ) -> Result<Arc<StreamStats>, StreamError> {
        let mut streams = self.streams.write().unwrap_or_else(|e| e.into_inner());
        if streams.contains_key(stream_id) {
            return Err(StreamError::AlreadyRegistered(stream_id.to_string()));
        }
        let stats = Arc::new(StreamStats::new(stream_id, source, config));
        streams.insert(stream_id.to_string(), stats.clone());
        gauge!("streams_registered").set(streams.len() as f64);
        Ok(stats)
    }

    pub fn get(&self, stream_id: &str) -> Option<Arc<StreamStats>> {
        self.streams
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(stream_id)
            .cloned()
    }

    pub fn remove(&self, stream_id: &str) -> Option<Arc<StreamStats>> {
        let mut streams = self.streams.write().unwrap_or_else(|e| e.into_inner());
        let removed = streams.remove(stream_id);
        gauge!("streams_registered").set(streams.len() as f64);
        removed
    }

    /// Snapshots of every registered stream, ordered by id
    pub fn snapshots(&self) -> Vec<StatsSnapshot> {
        let mut snapshots: Vec<_> = self
            .streams
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|stats| stats.snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.stream_id.cmp(&b.stream_id));
        snapshots
    }

    pub fn len(&self) -> usize {
        self.streams.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
