//! Interface to the face detection/recognition engine.
//!
//! The engine itself is a black box: it invokes a [`ResultListener`] from its
//! own thread and accepts one-shot requests through [`RecognitionControl`].
//! [`ReplayEngine`] drives the same interface from a JSONL script.

mod detection;
mod listener;
mod recognition;
mod replay;

pub use detection::{Detection, DetectionResult};
pub use listener::{RecognitionControl, ResultListener};
pub use recognition::{RecognitionMessage, RecognitionOutcome};
pub use replay::{ReplayControl, ReplayEngine, ReplayScript, ScriptEntry, ScriptError};
