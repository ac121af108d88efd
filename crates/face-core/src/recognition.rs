//! Parsing of the recognizer's free-form result text.
//!
//! The engine reports results as short strings: `"id: 3, sim: 0.87"` for a
//! match, `"who?"` for an unknown face, and housekeeping messages such as
//! `"id: 3 enrolled."` that carry no outcome.

use std::fmt;

/// Outcome of one recognition pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RecognitionOutcome {
    Known { id: u32, similarity: f32 },
    Unknown,
}

impl RecognitionOutcome {
    /// Whether two outcomes describe the same subject. Similarity jitter
    /// between frames does not count as a change.
    pub fn same_subject(&self, other: &RecognitionOutcome) -> bool {
        match (self, other) {
            (RecognitionOutcome::Known { id: a, .. }, RecognitionOutcome::Known { id: b, .. }) => {
                a == b
            }
            (RecognitionOutcome::Unknown, RecognitionOutcome::Unknown) => true,
            _ => false,
        }
    }

    /// Plain-text status body sent to the remote peer.
    pub fn status_body(&self) -> String {
        match self {
            RecognitionOutcome::Known { similarity, .. } => format!("authorized,{similarity:.2}"),
            RecognitionOutcome::Unknown => "denied,0".to_string(),
        }
    }
}

impl fmt::Display for RecognitionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecognitionOutcome::Known { id, similarity } => {
                write!(f, "id {id} (sim {similarity:.2})")
            }
            RecognitionOutcome::Unknown => f.write_str("unknown"),
        }
    }
}

/// A recognizer message, classified.
#[derive(Debug, Clone, PartialEq)]
pub enum RecognitionMessage {
    Outcome(RecognitionOutcome),
    Other(String),
}

impl RecognitionMessage {
    pub fn parse(text: &str) -> Self {
        let trimmed = text.trim();
        if trimmed.eq_ignore_ascii_case("who?") {
            return RecognitionMessage::Outcome(RecognitionOutcome::Unknown);
        }
        match parse_known(trimmed) {
            Some(outcome) => RecognitionMessage::Outcome(outcome),
            None => RecognitionMessage::Other(trimmed.to_string()),
        }
    }

    pub fn outcome(&self) -> Option<RecognitionOutcome> {
        match self {
            RecognitionMessage::Outcome(outcome) => Some(*outcome),
            RecognitionMessage::Other(_) => None,
        }
    }
}

fn parse_known(text: &str) -> Option<RecognitionOutcome> {
    let (id_part, sim_part) = text.split_once(',')?;
    let id = id_part.trim().strip_prefix("id:")?.trim().parse::<u32>().ok()?;
    let similarity = sim_part
        .trim()
        .strip_prefix("sim:")?
        .trim()
        .parse::<f32>()
        .ok()?;
    if !similarity.is_finite() {
        return None;
    }
    Some(RecognitionOutcome::Known { id, similarity })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_identity() {
        let msg = RecognitionMessage::parse("id: 3, sim: 0.87");
        assert_eq!(
            msg.outcome(),
            Some(RecognitionOutcome::Known {
                id: 3,
                similarity: 0.87
            })
        );
    }

    #[test]
    fn parses_unknown_face() {
        assert_eq!(
            RecognitionMessage::parse(" who? ").outcome(),
            Some(RecognitionOutcome::Unknown)
        );
    }

    #[test]
    fn housekeeping_messages_have_no_outcome() {
        for text in ["id: 3 enrolled.", "all ids cleared.", "id: x, sim: 0.5", ""] {
            assert!(
                RecognitionMessage::parse(text).outcome().is_none(),
                "{text:?} should not parse"
            );
        }
    }

    #[test]
    fn status_bodies_match_wire_format() {
        let known = RecognitionOutcome::Known {
            id: 3,
            similarity: 0.87,
        };
        assert_eq!(known.status_body(), "authorized,0.87");
        assert_eq!(RecognitionOutcome::Unknown.status_body(), "denied,0");
    }

    #[test]
    fn similarity_jitter_is_same_subject() {
        let a = RecognitionOutcome::Known {
            id: 1,
            similarity: 0.81,
        };
        let b = RecognitionOutcome::Known {
            id: 1,
            similarity: 0.79,
        };
        let c = RecognitionOutcome::Known {
            id: 2,
            similarity: 0.81,
        };
        assert!(a.same_subject(&b));
        assert!(!a.same_subject(&c));
        assert!(!a.same_subject(&RecognitionOutcome::Unknown));
    }
}
