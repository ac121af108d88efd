/// Single face returned by the detector.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Detection {
    /// `[x, y, width, height]` in frame pixels.
    pub bbox_xywh: [f32; 4],
    pub score: f32,
}

/// Detections produced for one frame.
#[derive(Debug, Clone, Default)]
pub struct DetectionResult {
    pub timestamp_ms: i64,
    pub detections: Vec<Detection>,
}

impl DetectionResult {
    pub fn new(timestamp_ms: i64, detections: Vec<Detection>) -> Self {
        Self {
            timestamp_ms,
            detections,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }

    pub fn len(&self) -> usize {
        self.detections.len()
    }
}
