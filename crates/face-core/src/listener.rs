use crate::detection::DetectionResult;

/// Observer the inference engine drives from its own worker thread.
///
/// Both callbacks run on the engine thread, one at a time, so implementors
/// may keep unsynchronised state behind `&mut self`.
pub trait ResultListener: Send {
    /// Detection results for the latest processed frame (possibly empty).
    fn on_detection(&mut self, result: &DetectionResult);

    /// Free-form recognizer message, see [`crate::RecognitionMessage`].
    fn on_recognition(&mut self, text: &str);
}

/// One-shot control signals accepted by the inference engine.
pub trait RecognitionControl: Send + Sync {
    /// Run recognition once on the next frame with a face.
    fn request_recognize(&self);

    /// Enroll the next detected face under a new id.
    fn request_enroll(&self);

    /// Forget every enrolled id.
    fn request_clear_all(&self);

    /// Whether a recognition pass is requested or in progress.
    fn is_recognition_active(&self) -> bool;
}
