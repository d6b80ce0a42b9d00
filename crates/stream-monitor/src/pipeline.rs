//! Producer/consumer pipeline for one capture source

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use camera_capture::{CaptureSource, VideoFrame};
use face_analysis::FaceAnalyzer;
use proctor::{ErrorCategory, ProctorError, ProctorService};
use ring_buffer::{ConsumeOrder, FrameBuffer, PushOutcome};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::stats::{StatsRegistry, StatsSnapshot, StreamState, StreamStats};
use crate::{StreamConfig, StreamError};

type SharedBuffer = Arc<FrameBuffer<Arc<VideoFrame>>>;

/// What the consumer does with analyzed frames
#[derive(Clone)]
pub enum MonitorMode {
    /// Face counting and trend only
    Detection,
    /// Drive the state machine of one session
    Exam {
        service: Arc<ProctorService>,
        session_id: Uuid,
    },
    /// Label every face with its best gallery match
    Recognition { service: Arc<ProctorService> },
}

impl MonitorMode {
    fn name(&self) -> &'static str {
        match self {
            MonitorMode::Detection => "detection",
            MonitorMode::Exam { .. } => "exam",
            MonitorMode::Recognition { .. } => "recognition",
        }
    }
}

pub struct StreamMonitor;

impl StreamMonitor {
    /// Start the producer thread and consumer task for `source`.
    ///
    /// Must be called from within a tokio runtime. The stream's statistics
    /// are registered under a fresh id in `registry`.
    pub fn spawn(
        config: StreamConfig,
        source: Box<dyn CaptureSource>,
        analyzer: FaceAnalyzer,
        mode: MonitorMode,
        registry: &StatsRegistry,
    ) -> Result<StreamHandle, StreamError> {
        let stream_id = Uuid::new_v4().to_string();
        let description = source.describe();
        let buffer: SharedBuffer = Arc::new(FrameBuffer::new(config.buffer_capacity)?);
        let stats = registry.register(&stream_id, &description, &config)?;

        let stop_flag = Arc::new(AtomicBool::new(false));
        let (stop_tx, stop_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);

        let producer = {
            let buffer = buffer.clone();
            let stats = stats.clone();
            let stop_flag = stop_flag.clone();
            thread::Builder::new()
                .name(format!("capture-{}", &stream_id[..8]))
                .spawn(move || produce(source, buffer, stats, stop_flag))
        };
        let producer = producer.map_err(|e| {
            stats.fail(format!("producer thread not spawned: {e}"));
            StreamError::Spawn(e.to_string())
        })?;

        let consumer = Consumer {
            order: config.consume_order,
            buffer: buffer.clone(),
            stats: stats.clone(),
            analyzer,
            mode,
        };
        let consumer = tokio::spawn(async move {
            let state = consumer.run(stop_rx).await;
            consumer.stats.settle(state);
            let _ = done_tx.send(true);
        });

        info!(
            stream_id = %stream_id,
            source = %description,
            capacity = config.buffer_capacity,
            "stream started"
        );

        Ok(StreamHandle {
            stream_id,
            stats,
            buffer,
            stop_flag,
            stop_tx,
            done_rx,
            producer: Some(producer),
            consumer,
        })
    }
}

/// Producer loop. Owns the source and drops it on exit.
fn produce(
    mut source: Box<dyn CaptureSource>,
    buffer: SharedBuffer,
    stats: Arc<StreamStats>,
    stop: Arc<AtomicBool>,
) {
    while !stop.load(Ordering::Acquire) {
        match source.next_frame() {
            Ok(Some(frame)) => {
                let sequence = frame.sequence;
                match buffer.push(Arc::new(frame)) {
                    Ok(PushOutcome::Stored) => {}
                    Ok(PushOutcome::EvictedOldest) => {
                        debug!(stream_id = stats.stream_id(), sequence, "oldest frame evicted");
                    }
                    Err(_) => break,
                }
                stats.record_captured();
            }
            Ok(None) => {
                info!(stream_id = stats.stream_id(), "capture source exhausted");
                break;
            }
            Err(e) => {
                warn!(stream_id = stats.stream_id(), error = %e, "capture source failed");
                stats.fail(e.to_string());
                break;
            }
        }

        if let Some(interval) = source.frame_interval() {
            thread::sleep(interval);
        }
    }

    buffer.close();
    debug!(stream_id = stats.stream_id(), "producer exited");
}

struct Consumer {
    order: ConsumeOrder,
    buffer: SharedBuffer,
    stats: Arc<StreamStats>,
    analyzer: FaceAnalyzer,
    mode: MonitorMode,
}

enum Outcome {
    Continue,
    SessionEnded,
    SessionLost(String),
}

impl Consumer {
    /// Consume until stopped, drained, failed, or the session ends.
    /// Returns the state the stream should settle in.
    async fn run(&self, mut stop: watch::Receiver<bool>) -> StreamState {
        loop {
            let frame = tokio::select! {
                biased;
                _ = stop.changed() => return StreamState::Stopped,
                frame = self.buffer.recv(self.order) => frame,
            };
            self.stats.record_buffer(self.buffer.stats());

            let Some(frame) = frame else {
                return StreamState::Finished;
            };
            if *stop.borrow() {
                return StreamState::Stopped;
            }
            if self.stats.state() == StreamState::Failed {
                return StreamState::Failed;
            }

            match self.process(frame).await {
                Outcome::Continue => {}
                Outcome::SessionEnded => return StreamState::Finished,
                Outcome::SessionLost(error) => {
                    self.stats.fail(error);
                    return StreamState::Failed;
                }
            }
        }
    }

    async fn process(&self, frame: Arc<VideoFrame>) -> Outcome {
        if let MonitorMode::Recognition { service } = &self.mode {
            self.recognize(service, frame).await;
            return Outcome::Continue;
        }

        let sequence = frame.sequence;
        let signals = match self.analyzer.analyze(frame).await {
            Ok(signals) => signals,
            Err(e) => {
                warn!(stream_id = self.stats.stream_id(), sequence, error = %e, "frame analysis failed");
                self.stats.record_failure();
                return Outcome::Continue;
            }
        };
        self.stats.record_processed(signals.face_count());

        let MonitorMode::Exam {
            service,
            session_id,
        } = &self.mode
        else {
            return Outcome::Continue;
        };

        match service.apply_signals(*session_id, &signals).await {
            Ok(verdict) => {
                let terminal = verdict.status.is_terminal();
                self.stats.record_verdict(verdict);
                if terminal {
                    info!(stream_id = self.stats.stream_id(), session_id = %session_id, "session ended, stopping stream");
                    Outcome::SessionEnded
                } else {
                    Outcome::Continue
                }
            }
            Err(ProctorError::UnknownSession(id)) => {
                Outcome::SessionLost(format!("unknown session {id}"))
            }
            Err(e) => {
                warn!(
                    stream_id = self.stats.stream_id(),
                    session_id = %session_id,
                    category = ?e.category(),
                    error = %e,
                    "frame not applied"
                );
                self.stats.record_failure();
                if e.category() == ErrorCategory::Input {
                    return Outcome::SessionLost(e.to_string());
                }
                Outcome::Continue
            }
        }
    }

    async fn recognize(&self, service: &ProctorService, frame: Arc<VideoFrame>) {
        let sequence = frame.sequence;
        let faces = match self.analyzer.analyze_faces(frame).await {
            Ok(faces) => faces,
            Err(e) => {
                warn!(stream_id = self.stats.stream_id(), sequence, error = %e, "frame analysis failed");
                self.stats.record_failure();
                return;
            }
        };
        self.stats.record_processed(faces.len());

        let results = service.recognize_faces(&faces);
        debug!(
            stream_id = self.stats.stream_id(),
            sequence,
            faces = results.len(),
            recognized = results.iter().filter(|r| r.recognized).count(),
            "faces recognized"
        );
        self.stats.record_recognitions(results);
    }
}

/// Handle to a running stream
pub struct StreamHandle {
    stream_id: String,
    stats: Arc<StreamStats>,
    buffer: SharedBuffer,
    stop_flag: Arc<AtomicBool>,
    stop_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
    producer: Option<thread::JoinHandle<()>>,
    consumer: JoinHandle<()>,
}

impl StreamHandle {
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn stats(&self) -> Arc<StreamStats> {
        self.stats.clone()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Wait until the consumer exits on its own
    pub async fn finished(&self) {
        let mut done = self.done_rx.clone();
        let _ = done.wait_for(|done| *done).await;
    }

    /// Stop the stream and return its final statistics.
    ///
    /// Frames still buffered are discarded; a frame already being processed
    /// completes before the source is released.
    pub async fn stop(mut self) -> StatsSnapshot {
        self.stop_flag.store(true, Ordering::Release);
        let _ = self.stop_tx.send(true);

        if let Err(e) = (&mut self.consumer).await {
            warn!(stream_id = %self.stream_id, error = %e, "consumer task ended abnormally");
            self.stats.fail(e.to_string());
        }

        self.buffer.close();
        let discarded = self.buffer.clear();
        self.stats.record_buffer(self.buffer.stats());

        if let Some(producer) = self.producer.take() {
            match tokio::task::spawn_blocking(move || producer.join()).await {
                Ok(Ok(())) => {}
                _ => {
                    warn!(stream_id = %self.stream_id, "producer thread panicked");
                    self.stats.fail("producer thread panicked");
                }
            }
        }

        self.stats.settle(StreamState::Stopped);
        let snapshot = self.stats.snapshot();
        info!(
            stream_id = %self.stream_id,
            state = ?snapshot.state,
            processed = snapshot.frames_processed,
            dropped = snapshot.frames_dropped,
            discarded,
            "stream stopped"
        );
        snapshot
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        // A dropped handle still halts the producer and releases the source
        self.stop_flag.store(true, Ordering::Release);
        self.buffer.close();
    }
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("stream_id", &self.stream_id)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for MonitorMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MonitorMode::Exam { session_id, .. } => {
                write!(f, "{}({})", self.name(), session_id)
            }
            MonitorMode::Detection | MonitorMode::Recognition { .. } => f.write_str(self.name()),
        }
    }
}
