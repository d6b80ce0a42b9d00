//! Video frame types and processing

use crate::CameraError;

/// Decoded RGB video frame
#[derive(Debug, Clone)]
pub struct VideoFrame {
    /// RGB pixel data (width * height * 3)
    pub data: Vec<u8>,
    /// Frame width
    pub width: u32,
    /// Frame height
    pub height: u32,
    /// Capture timestamp (nanoseconds)
    pub timestamp_ns: u64,
    /// Frame sequence number
    pub sequence: u64,
}

impl VideoFrame {
    /// Create a new video frame from raw RGB data.
    ///
    /// Fails if `data` is not exactly `width * height * 3` bytes.
    pub fn new(
        data: Vec<u8>,
        width: u32,
        height: u32,
        timestamp_ns: u64,
        sequence: u64,
    ) -> Result<Self, CameraError> {
        let expected = width as usize * height as usize * 3;
        if data.len() != expected || expected == 0 {
            return Err(CameraError::Decode(format!(
                "RGB buffer is {} bytes, expected {} for {}x{}",
                data.len(),
                expected,
                width,
                height
            )));
        }
        Ok(Self {
            data,
            width,
            height,
            timestamp_ns,
            sequence,
        })
    }

    /// Solid-colour frame, mostly useful for tests and scripted replays
    pub fn filled(width: u32, height: u32, rgb: [u8; 3], sequence: u64) -> Self {
        let data = rgb
            .iter()
            .copied()
            .cycle()
            .take(width as usize * height as usize * 3)
            .collect();
        Self {
            data,
            width,
            height,
            timestamp_ns: 0,
            sequence,
        }
    }

    /// Get pixel at (x, y)
    pub fn get_pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let idx = ((y as usize * self.width as usize) + x as usize) * 3;
        Some([self.data[idx], self.data[idx + 1], self.data[idx + 2]])
    }

    /// Convert to grayscale
    pub fn to_grayscale(&self) -> Vec<u8> {
        let mut gray = Vec::with_capacity(self.width as usize * self.height as usize);
        for pixel in self.data.chunks_exact(3) {
            // Luminance formula: 0.299*R + 0.587*G + 0.114*B
            let y = (pixel[0] as f32 * 0.299 + pixel[1] as f32 * 0.587 + pixel[2] as f32 * 0.114)
                as u8;
            gray.push(y);
        }
        gray
    }

    /// Mean luminance in [0, 255]
    pub fn mean_luminance(&self) -> f32 {
        let gray = self.to_grayscale();
        if gray.is_empty() {
            return 0.0;
        }
        gray.iter().map(|&v| v as u64).sum::<u64>() as f32 / gray.len() as f32
    }

    /// Crop a region of the frame
    pub fn crop(&self, x: u32, y: u32, w: u32, h: u32) -> Option<VideoFrame> {
        if w == 0 || h == 0 || x.checked_add(w)? > self.width || y.checked_add(h)? > self.height {
            return None;
        }

        let mut cropped = Vec::with_capacity(w as usize * h as usize * 3);
        for row in y..(y + h) {
            let start = (row as usize * self.width as usize + x as usize) * 3;
            let end = start + w as usize * 3;
            cropped.extend_from_slice(&self.data[start..end]);
        }

        Some(VideoFrame {
            data: cropped,
            width: w,
            height: h,
            timestamp_ns: self.timestamp_ns,
            sequence: self.sequence,
        })
    }
}

/// Decode an encoded image (JPEG, PNG, ...) into an RGB frame
pub fn decode_image(
    bytes: &[u8],
    timestamp_ns: u64,
    sequence: u64,
) -> Result<VideoFrame, CameraError> {
    if bytes.is_empty() {
        return Err(CameraError::Decode("empty image payload".to_string()));
    }

    let img = image::load_from_memory(bytes).map_err(|e| CameraError::Decode(e.to_string()))?;
    let rgb = img.to_rgb8();
    let (width, height) = rgb.dimensions();

    VideoFrame::new(rgb.into_raw(), width, height, timestamp_ns, sequence)
}
