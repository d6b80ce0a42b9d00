//! Capture sources for the continuous monitor

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::frame::{decode_image, VideoFrame};
use crate::{CameraConfig, CameraError};

/// Anything that yields frames at its own native rate.
///
/// A source is owned by exactly one producer thread and dropped when that
/// thread exits, which releases the underlying device or files.
pub trait CaptureSource: Send {
    /// Next frame, `Ok(None)` once the source is exhausted.
    fn next_frame(&mut self) -> Result<Option<VideoFrame>, CameraError>;

    /// Pause the producer should take between frames, if the source does not
    /// already block at its native rate.
    fn frame_interval(&self) -> Option<Duration> {
        None
    }

    /// Human-readable name for logs
    fn describe(&self) -> String;
}

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp"];

/// Replays image files from a directory in file-name order
pub struct DirectorySource {
    directory: PathBuf,
    files: Vec<PathBuf>,
    position: usize,
    sequence: u64,
    loop_playback: bool,
    interval: Duration,
    started: Instant,
}

impl DirectorySource {
    /// Open a directory of recorded frames
    pub fn open(config: &CameraConfig) -> Result<Self, CameraError> {
        let files = list_images(&config.directory)?;
        if files.is_empty() {
            return Err(CameraError::Open(format!(
                "no image files in {}",
                config.directory.display()
            )));
        }

        info!(
            directory = %config.directory.display(),
            frames = files.len(),
            fps = config.fps,
            "directory source opened"
        );

        Ok(Self {
            directory: config.directory.clone(),
            files,
            position: 0,
            sequence: 0,
            loop_playback: config.loop_playback,
            interval: config.frame_interval(),
            started: Instant::now(),
        })
    }

    /// Number of frame files discovered at open time
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Whether the directory held no frames (never true after a successful open)
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl CaptureSource for DirectorySource {
    fn next_frame(&mut self) -> Result<Option<VideoFrame>, CameraError> {
        if self.position >= self.files.len() {
            if !self.loop_playback {
                return Ok(None);
            }
            self.position = 0;
        }

        if !self.directory.is_dir() {
            return Err(CameraError::Disconnected);
        }

        let path = &self.files[self.position];
        self.position += 1;

        let bytes = std::fs::read(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CameraError::Disconnected
            } else {
                CameraError::Stream(format!("{}: {}", path.display(), e))
            }
        })?;

        let timestamp_ns = self.started.elapsed().as_nanos() as u64;
        let frame = decode_image(&bytes, timestamp_ns, self.sequence)?;
        debug!(path = %path.display(), sequence = self.sequence, "frame read");
        self.sequence += 1;

        Ok(Some(frame))
    }

    fn frame_interval(&self) -> Option<Duration> {
        Some(self.interval)
    }

    fn describe(&self) -> String {
        format!("directory:{}", self.directory.display())
    }
}

fn list_images(directory: &Path) -> Result<Vec<PathBuf>, CameraError> {
    let entries = std::fs::read_dir(directory)
        .map_err(|e| CameraError::Open(format!("{}: {}", directory.display(), e)))?;

    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.is_file()
                && path
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                    .unwrap_or(false)
        })
        .collect();
    files.sort();
    Ok(files)
}

/// In-memory source that replays a fixed list of frames.
///
/// Can be told to fail with `Disconnected` after a number of frames, which
/// mimics a camera being unplugged mid-exam.
pub struct ReplaySource {
    frames: VecDeque<VideoFrame>,
    interval: Option<Duration>,
    fail_after: Option<usize>,
    emitted: usize,
}

impl ReplaySource {
    pub fn new(frames: Vec<VideoFrame>) -> Self {
        Self {
            frames: frames.into(),
            interval: None,
            fail_after: None,
            emitted: 0,
        }
    }

    /// Pace frames at a fixed interval
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    /// Report a disconnect after `count` frames have been emitted
    pub fn fail_after(mut self, count: usize) -> Self {
        self.fail_after = Some(count);
        self
    }
}

impl CaptureSource for ReplaySource {
    fn next_frame(&mut self) -> Result<Option<VideoFrame>, CameraError> {
        if self.fail_after.is_some_and(|limit| self.emitted >= limit) {
            return Err(CameraError::Disconnected);
        }
        let frame = self.frames.pop_front();
        if frame.is_some() {
            self.emitted += 1;
        }
        Ok(frame)
    }

    fn frame_interval(&self) -> Option<Duration> {
        self.interval
    }

    fn describe(&self) -> String {
        format!("replay:{} frames", self.frames.len() + self.emitted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "camera-capture-{}-{}",
            name,
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write_png(path: &Path, rgb: [u8; 3]) {
        let img = image::RgbImage::from_pixel(4, 4, image::Rgb(rgb));
        img.save(path).unwrap();
    }

    #[test]
    fn test_replay_source_order_and_end() {
        let frames = (0..3).map(|i| VideoFrame::filled(2, 2, [0, 0, 0], i)).collect();
        let mut source = ReplaySource::new(frames);

        for expected in 0..3 {
            assert_eq!(source.next_frame().unwrap().unwrap().sequence, expected);
        }
        assert!(source.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_replay_source_disconnect() {
        let frames = (0..5).map(|i| VideoFrame::filled(2, 2, [0, 0, 0], i)).collect();
        let mut source = ReplaySource::new(frames).fail_after(2);

        assert!(source.next_frame().unwrap().is_some());
        assert!(source.next_frame().unwrap().is_some());
        assert!(matches!(source.next_frame(), Err(CameraError::Disconnected)));
    }

    #[test]
    fn test_directory_source_sorted_playback() {
        let dir = temp_dir("sorted");
        write_png(&dir.join("b.png"), [0, 255, 0]);
        write_png(&dir.join("a.png"), [255, 0, 0]);
        std::fs::write(dir.join("notes.txt"), "ignored").unwrap();

        let config = CameraConfig {
            directory: dir.clone(),
            fps: 30,
            loop_playback: false,
        };
        let mut source = DirectorySource::open(&config).unwrap();
        assert_eq!(source.len(), 2);

        let first = source.next_frame().unwrap().unwrap();
        assert_eq!(first.get_pixel(0, 0), Some([255, 0, 0]));
        assert_eq!(first.sequence, 0);
        let second = source.next_frame().unwrap().unwrap();
        assert_eq!(second.get_pixel(0, 0), Some([0, 255, 0]));
        assert!(source.next_frame().unwrap().is_none());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_directory_source_loops() {
        let dir = temp_dir("loop");
        write_png(&dir.join("only.png"), [9, 9, 9]);

        let config = CameraConfig {
            directory: dir.clone(),
            fps: 30,
            loop_playback: true,
        };
        let mut source = DirectorySource::open(&config).unwrap();
        for expected in 0..3 {
            assert_eq!(source.next_frame().unwrap().unwrap().sequence, expected);
        }

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_directory_source_disconnect_when_removed() {
        let dir = temp_dir("vanish");
        write_png(&dir.join("a.png"), [1, 2, 3]);

        let config = CameraConfig {
            directory: dir.clone(),
            fps: 30,
            loop_playback: false,
        };
        let mut source = DirectorySource::open(&config).unwrap();
        std::fs::remove_dir_all(&dir).unwrap();

        assert!(matches!(source.next_frame(), Err(CameraError::Disconnected)));
    }

    #[test]
    fn test_empty_directory_rejected() {
        let dir = temp_dir("empty");
        let config = CameraConfig {
            directory: dir.clone(),
            ..Default::default()
        };
        assert!(matches!(
            DirectorySource::open(&config),
            Err(CameraError::Open(_))
        ));
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
