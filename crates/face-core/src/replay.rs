//! Scripted inference engine used for host runs and tests.
//!
//! A script is JSON Lines, one entry per processed frame:
//!
//! ```text
//! {"at_ms": 0,   "faces": []}
//! {"at_ms": 100, "faces": [[40, 30, 80, 96, 0.93]], "identity": "id: 3, sim: 0.87"}
//! ```
//!
//! `faces` holds `[x, y, w, h, score]` boxes. `identity` is what a
//! recognition pass would report at that moment; entries without one report
//! `"who?"`.

use std::{
    fs,
    io::{self, BufRead, BufReader},
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    detection::{Detection, DetectionResult},
    listener::{RecognitionControl, ResultListener},
};

const UNKNOWN_FACE: &str = "who?";

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("failed to read replay script: {0}")]
    Io(#[from] io::Error),
    #[error("replay script line {line}: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("replay script has no entries")]
    Empty,
    #[error("replay script line {line}: at_ms goes backwards")]
    OutOfOrder { line: usize },
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScriptEntry {
    pub at_ms: u64,
    #[serde(default)]
    pub faces: Vec<[f32; 5]>,
    #[serde(default)]
    pub identity: Option<String>,
}

impl ScriptEntry {
    fn detection_result(&self, timestamp_ms: i64) -> DetectionResult {
        let detections = self
            .faces
            .iter()
            .map(|face| Detection {
                bbox_xywh: [face[0], face[1], face[2], face[3]],
                score: face[4],
            })
            .collect();
        DetectionResult::new(timestamp_ms, detections)
    }
}

#[derive(Debug, Clone)]
pub struct ReplayScript {
    entries: Vec<ScriptEntry>,
}

impl ReplayScript {
    pub fn from_path(path: &Path) -> Result<Self, ScriptError> {
        let file = fs::File::open(path)?;
        Self::from_reader(BufReader::new(file))
    }

    pub fn from_reader(reader: impl BufRead) -> Result<Self, ScriptError> {
        let mut entries: Vec<ScriptEntry> = Vec::new();
        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            let text = line.trim();
            if text.is_empty() || text.starts_with('#') {
                continue;
            }
            let entry: ScriptEntry =
                serde_json::from_str(text).map_err(|source| ScriptError::Parse {
                    line: idx + 1,
                    source,
                })?;
            if entries.last().is_some_and(|prev| prev.at_ms > entry.at_ms) {
                return Err(ScriptError::OutOfOrder { line: idx + 1 });
            }
            entries.push(entry);
        }
        if entries.is_empty() {
            return Err(ScriptError::Empty);
        }
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[ScriptEntry] {
        &self.entries
    }

    /// Time of the last entry; one loop of the script lasts this long.
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.entries.last().map(|e| e.at_ms).unwrap_or(0))
    }
}

/// Control flags shared between the replay thread and its callers.
#[derive(Default)]
pub struct ReplayControl {
    recognize: AtomicBool,
    enroll: AtomicBool,
    clear_all: AtomicBool,
    next_id: AtomicU32,
}

impl RecognitionControl for ReplayControl {
    fn request_recognize(&self) {
        self.recognize.store(true, Ordering::Release);
    }

    fn request_enroll(&self) {
        self.enroll.store(true, Ordering::Release);
    }

    fn request_clear_all(&self) {
        self.clear_all.store(true, Ordering::Release);
    }

    fn is_recognition_active(&self) -> bool {
        self.recognize.load(Ordering::Acquire)
    }
}

pub struct ReplayEngine {
    script: ReplayScript,
    control: Arc<ReplayControl>,
    looped: bool,
}

impl ReplayEngine {
    pub fn new(script: ReplayScript, looped: bool) -> Self {
        Self {
            script,
            control: Arc::new(ReplayControl::default()),
            looped,
        }
    }

    pub fn control(&self) -> Arc<ReplayControl> {
        self.control.clone()
    }

    /// Run the script on a dedicated engine thread until it ends (or, when
    /// looping, until `running` is cleared).
    pub fn spawn(
        self,
        mut listener: Box<dyn ResultListener>,
        running: Arc<AtomicBool>,
    ) -> io::Result<thread::JoinHandle<()>> {
        let dispatch = tracing::dispatcher::get_default(|current| current.clone());
        thread::Builder::new()
            .name("engine-replay".into())
            .spawn(move || tracing::dispatcher::with_default(&dispatch, || {
                let span = self.script.duration().max(Duration::from_millis(1));
                let mut loop_start = Instant::now();
                'outer: loop {
                    for entry in self.script.entries() {
                        if !running.load(Ordering::Relaxed) {
                            break 'outer;
                        }
                        let due = loop_start + Duration::from_millis(entry.at_ms);
                        let now = Instant::now();
                        if due > now {
                            thread::sleep(due - now);
                        }
                        let timestamp_ms = loop_start.elapsed().as_millis() as i64;
                        self.step(entry, timestamp_ms, listener.as_mut());
                    }
                    if !self.looped {
                        break;
                    }
                    loop_start += span;
                    debug!("replay script restarting");
                }
                info!("replay engine finished");
            }))
    }

    /// Deliver one script entry: the detection callback first, then any
    /// requested recognition or enrollment result.
    pub fn step(&self, entry: &ScriptEntry, timestamp_ms: i64, listener: &mut dyn ResultListener) {
        let result = entry.detection_result(timestamp_ms);
        listener.on_detection(&result);

        if self.control.clear_all.swap(false, Ordering::AcqRel) {
            self.control.next_id.store(0, Ordering::Relaxed);
            listener.on_recognition("all ids cleared.");
        }
        if result.is_empty() {
            return;
        }
        if self.control.enroll.swap(false, Ordering::AcqRel) {
            let id = self.control.next_id.fetch_add(1, Ordering::Relaxed) + 1;
            listener.on_recognition(&format!("id: {id} enrolled."));
        }
        if self.control.recognize.load(Ordering::Acquire) {
            let text = entry.identity.as_deref().unwrap_or(UNKNOWN_FACE);
            self.control.recognize.store(false, Ordering::Release);
            listener.on_recognition(text);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        detections: Vec<usize>,
        messages: Vec<String>,
    }

    impl ResultListener for Recorder {
        fn on_detection(&mut self, result: &DetectionResult) {
            self.detections.push(result.len());
        }

        fn on_recognition(&mut self, text: &str) {
            self.messages.push(text.to_string());
        }
    }

    const SCRIPT: &str = r#"
# comment lines are skipped
{"at_ms": 0, "faces": []}
{"at_ms": 50, "faces": [[1, 2, 3, 4, 0.9]], "identity": "id: 3, sim: 0.87"}
{"at_ms": 100, "faces": [[1, 2, 3, 4, 0.9]]}
"#;

    #[test]
    fn parses_jsonl_script() {
        let script = ReplayScript::from_reader(SCRIPT.as_bytes()).unwrap();
        assert_eq!(script.entries().len(), 3);
        assert_eq!(script.duration(), Duration::from_millis(100));
    }

    #[test]
    fn rejects_backwards_timestamps() {
        let text = "{\"at_ms\": 10}\n{\"at_ms\": 5}\n";
        assert!(matches!(
            ReplayScript::from_reader(text.as_bytes()),
            Err(ScriptError::OutOfOrder { line: 2 })
        ));
    }

    #[test]
    fn recognition_only_reported_when_requested() {
        let script = ReplayScript::from_reader(SCRIPT.as_bytes()).unwrap();
        let engine = ReplayEngine::new(script.clone(), false);
        let control = engine.control();
        let mut recorder = Recorder::default();

        engine.step(&script.entries()[1], 50, &mut recorder);
        assert!(recorder.messages.is_empty());

        control.request_recognize();
        assert!(control.is_recognition_active());
        // No face on this entry: the request stays pending.
        engine.step(&script.entries()[0], 60, &mut recorder);
        assert!(recorder.messages.is_empty());

        engine.step(&script.entries()[1], 70, &mut recorder);
        engine.step(&script.entries()[2], 80, &mut recorder);
        control.request_recognize();
        engine.step(&script.entries()[2], 90, &mut recorder);

        assert_eq!(recorder.detections, vec![1, 0, 1, 1, 1]);
        assert_eq!(recorder.messages, vec!["id: 3, sim: 0.87", "who?"]);
        assert!(!control.is_recognition_active());
    }

    #[test]
    fn enroll_and_clear_produce_housekeeping_messages() {
        let script = ReplayScript::from_reader(SCRIPT.as_bytes()).unwrap();
        let engine = ReplayEngine::new(script.clone(), false);
        let control = engine.control();
        let mut recorder = Recorder::default();

        control.request_enroll();
        engine.step(&script.entries()[1], 0, &mut recorder);
        control.request_enroll();
        engine.step(&script.entries()[1], 1, &mut recorder);
        control.request_clear_all();
        engine.step(&script.entries()[0], 2, &mut recorder);

        assert_eq!(
            recorder.messages,
            vec!["id: 1 enrolled.", "id: 2 enrolled.", "all ids cleared."]
        );
    }
}
