//! Annotation parsing: annotator output to ordered speech/movement segments.
//!
//! Pure functions, no I/O. Two input shapes are accepted:
//!
//! - marker text: `Hello [TLTFRONT,1.0] world`
//! - structured lists: `{"speech": [...], "movements": [{"type": .., "duration": ..}]}`
//!
//! Output order always follows input order.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::types::{MovementType, Segment};

// Anything shaped like `[WORD,value]`. Validity of the code and the value is
// decided afterwards so a bad marker can be skipped without losing its neighbours.
static RE_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[\s*([A-Za-z_]+)\s*,\s*([^\[\]]*?)\s*\]").unwrap());

static RE_WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// A marker that could not become a movement. Recoverable: the marker is skipped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SegmentParseError {
    #[error("unknown movement code {0:?}")]
    UnknownCode(String),
    #[error("malformed duration {value:?} in {code} marker")]
    MalformedDuration { code: String, value: String },
}

/// Parser output plus the markers it had to skip.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Parsed {
    pub segments: Vec<Segment>,
    pub skipped: Vec<SegmentParseError>,
}

// ─── Marker text ───────────────────────────────────────────────────────────

/// Parse marker-annotated text.
///
/// Text between markers becomes speech (blank runs are dropped), each valid
/// marker becomes a movement. Unknown codes and malformed durations are logged
/// and skipped. Input with no valid marker at all comes back as one speech
/// segment holding the trimmed input unchanged.
pub fn parse_marked(text: &str) -> Parsed {
    let mut parsed = Parsed::default();
    let mut run = String::new();
    let mut last = 0;
    let mut any_movement = false;

    for caps in RE_MARKER.captures_iter(text) {
        let (Some(whole), Some(code), Some(value)) = (caps.get(0), caps.get(1), caps.get(2))
        else {
            continue;
        };

        run.push_str(&text[last..whole.start()]);
        last = whole.end();

        match resolve_marker(code.as_str(), value.as_str()) {
            Ok(segment) => {
                flush_speech(&mut run, &mut parsed.segments);
                parsed.segments.push(segment);
                any_movement = true;
            }
            Err(e) => {
                warn!("annotate: skipping marker {}: {e}", whole.as_str());
                parsed.skipped.push(e);
                run.push(' ');
            }
        }
    }

    if !any_movement {
        parsed.segments = Segment::speech(text).into_iter().collect();
        return parsed;
    }

    run.push_str(&text[last..]);
    flush_speech(&mut run, &mut parsed.segments);
    parsed
}

fn resolve_marker(code: &str, value: &str) -> Result<Segment, SegmentParseError> {
    let movement = MovementType::from_code(code)
        .ok_or_else(|| SegmentParseError::UnknownCode(code.to_string()))?;
    let malformed = || SegmentParseError::MalformedDuration {
        code: code.to_string(),
        value: value.to_string(),
    };
    let duration = parse_duration(value).ok_or_else(malformed)?;
    Segment::movement(movement, duration).ok_or_else(malformed)
}

/// Plain non-negative decimal: digits with at most one point. No signs, exponents or `inf`.
fn parse_duration(value: &str) -> Option<f32> {
    let digits = value.chars().filter(|c| c.is_ascii_digit()).count();
    let points = value.chars().filter(|&c| c == '.').count();
    if digits == 0 || points > 1 || digits + points != value.chars().count() {
        return None;
    }
    value.parse().ok()
}

fn flush_speech(run: &mut String, segments: &mut Vec<Segment>) {
    let collapsed = RE_WHITESPACE.replace_all(run.trim(), " ");
    if let Some(segment) = Segment::speech(collapsed.into_owned()) {
        segments.push(segment);
    }
    run.clear();
}

// ─── Structured lists ──────────────────────────────────────────────────────

/// Movement type as the annotator wrote it: numeric id or code/name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MovementKey {
    Id(i64),
    Name(String),
}

impl MovementKey {
    pub fn resolve(&self) -> Option<MovementType> {
        match self {
            MovementKey::Id(id) => u8::try_from(*id).ok().and_then(MovementType::from_id),
            MovementKey::Name(name) => name.parse().ok(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovementDescriptor {
    #[serde(rename = "type")]
    pub key: MovementKey,
    #[serde(default = "default_descriptor_duration")]
    pub duration: f32,
}

fn default_descriptor_duration() -> f32 {
    1.0
}

/// Parallel speech / movement arrays.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StructuredSegments {
    #[serde(default, alias = "speech_segments")]
    pub speech: Vec<String>,
    #[serde(default, alias = "movement_segments")]
    pub movements: Vec<MovementDescriptor>,
}

/// Pair `movements[i]` with `speech[i]` (movement first, so it starts just
/// before its speech). Surplus speech follows in order; surplus movements are
/// dropped. Invalid descriptors and blank speech are skipped individually.
pub fn parse_structured(input: &StructuredSegments) -> Vec<Segment> {
    let paired = input.speech.len().min(input.movements.len());
    let mut segments = Vec::with_capacity(input.speech.len() + paired);

    for (i, text) in input.speech.iter().enumerate() {
        if let Some(descriptor) = input.movements.get(i).filter(|_| i < paired) {
            match descriptor
                .key
                .resolve()
                .and_then(|m| Segment::movement(m, descriptor.duration))
            {
                Some(segment) => segments.push(segment),
                None => warn!("annotate: dropping movement descriptor {descriptor:?}"),
            }
        }
        if let Some(segment) = Segment::speech(text.as_str()) {
            segments.push(segment);
        }
    }

    if input.movements.len() > paired {
        warn!(
            "annotate: dropping {} unpaired movement descriptor(s)",
            input.movements.len() - paired
        );
    }

    segments
}

// ─── Annotator output ──────────────────────────────────────────────────────

/// What the external annotator handed back.
#[derive(Debug, Clone, PartialEq)]
pub enum AnnotatorOutput {
    Marked(String),
    Structured(StructuredSegments),
}

impl AnnotatorOutput {
    pub fn segments(&self) -> Vec<Segment> {
        match self {
            AnnotatorOutput::Marked(text) => parse_marked(text).segments,
            AnnotatorOutput::Structured(lists) => parse_structured(lists),
        }
    }
}

// ─── Rendering ─────────────────────────────────────────────────────────────

/// Render segments back to marker text. Re-parsing gives an equivalent list
/// as long as no two speech segments are adjacent (those merge into one run).
pub fn render_marked(segments: &[Segment]) -> String {
    segments
        .iter()
        .map(|segment| match segment {
            Segment::Speech { text } => text.clone(),
            Segment::Movement { movement, duration } => {
                format!("[{},{}]", movement.code(), duration)
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn speech(text: &str) -> Segment {
        Segment::speech(text).unwrap()
    }

    fn movement(m: MovementType, duration: f32) -> Segment {
        Segment::movement(m, duration).unwrap()
    }

    #[test]
    fn parses_speech_around_marker() {
        let parsed = parse_marked("Hello [TLTFRONT,1.0] world");
        assert_eq!(
            parsed.segments,
            vec![
                speech("Hello"),
                movement(MovementType::TiltFront, 1.0),
                speech("world")
            ]
        );
        assert!(parsed.skipped.is_empty());
    }

    #[test]
    fn unknown_code_alone_keeps_input_whole() {
        let parsed = parse_marked("[FOO,1.0]");
        assert_eq!(parsed.segments, vec![speech("[FOO,1.0]")]);
        assert_eq!(
            parsed.skipped,
            vec![SegmentParseError::UnknownCode("FOO".into())]
        );
    }

    #[test]
    fn unknown_code_next_to_valid_marker_is_dropped() {
        let parsed = parse_marked("Look [FOO,1.0] here [ROTLEFT,0.5] now");
        assert_eq!(
            parsed.segments,
            vec![
                speech("Look here"),
                movement(MovementType::RotateLeft, 0.5),
                speech("now")
            ]
        );
    }

    #[test]
    fn malformed_duration_skips_only_that_marker() {
        let parsed = parse_marked("A [TLTBACK,abc] B [TLTLEFT,2] C [TLTRIGHT,-1] D");
        assert_eq!(
            parsed.segments,
            vec![
                speech("A B"),
                movement(MovementType::TiltLeft, 2.0),
                speech("C D")
            ]
        );
        assert_eq!(parsed.skipped.len(), 2);
        assert!(matches!(
            parsed.skipped[0],
            SegmentParseError::MalformedDuration { .. }
        ));
    }

    #[test]
    fn markers_at_edges_produce_no_blank_speech() {
        let parsed = parse_marked("[ROTRIGHT,1] Hi there. [TLTFRONT,0.5]");
        assert_eq!(
            parsed.segments,
            vec![
                movement(MovementType::RotateRight, 1.0),
                speech("Hi there."),
                movement(MovementType::TiltFront, 0.5)
            ]
        );
    }

    #[test]
    fn consecutive_markers_keep_order() {
        let parsed = parse_marked("Wow[TLTRIGHT,0.7][TLTLEFT,0.7]!");
        assert_eq!(
            parsed.segments,
            vec![
                speech("Wow"),
                movement(MovementType::TiltRight, 0.7),
                movement(MovementType::TiltLeft, 0.7),
                speech("!")
            ]
        );
    }

    #[test]
    fn plain_text_is_one_speech_segment() {
        assert_eq!(
            parse_marked("  just words  ").segments,
            vec![speech("just words")]
        );
        assert!(parse_marked("   ").segments.is_empty());
    }

    #[test]
    fn tolerates_spaces_inside_marker() {
        let parsed = parse_marked("Yes [ TLTFRONT , 1.5 ] indeed");
        assert_eq!(parsed.segments[1], movement(MovementType::TiltFront, 1.5));
    }

    #[test]
    fn duration_grammar() {
        assert_eq!(parse_duration("1"), Some(1.0));
        assert_eq!(parse_duration("0.25"), Some(0.25));
        assert_eq!(parse_duration(".5"), Some(0.5));
        assert_eq!(parse_duration("1."), Some(1.0));
        assert_eq!(parse_duration(""), None);
        assert_eq!(parse_duration("."), None);
        assert_eq!(parse_duration("1.2.3"), None);
        assert_eq!(parse_duration("1e3"), None);
        assert_eq!(parse_duration("inf"), None);
        assert_eq!(parse_duration("-0.5"), None);
    }

    #[test]
    fn structured_pairs_then_appends_surplus_speech() {
        let input = StructuredSegments {
            speech: vec!["one".into(), "two".into(), "three".into()],
            movements: vec![MovementDescriptor {
                key: MovementKey::Name("TLTFRONT".into()),
                duration: 1.0,
            }],
        };
        assert_eq!(
            parse_structured(&input),
            vec![
                movement(MovementType::TiltFront, 1.0),
                speech("one"),
                speech("two"),
                speech("three")
            ]
        );
    }

    #[test]
    fn structured_drops_surplus_movements() {
        let input: StructuredSegments = serde_json::from_str(
            r#"{"speech": ["hi"], "movements": [{"type": 3, "duration": 0.5}, {"type": 4}]}"#,
        )
        .unwrap();
        assert_eq!(
            parse_structured(&input),
            vec![movement(MovementType::RotateRight, 0.5), speech("hi")]
        );
    }

    #[test]
    fn structured_skips_invalid_descriptor_but_keeps_speech() {
        let input: StructuredSegments = serde_json::from_str(
            r#"{"speech_segments": ["a", " ", "c"],
                "movement_segments": [{"type": "SPIN"}, {"type": 1}, {"type": 2, "duration": -1}]}"#,
        )
        .unwrap();
        assert_eq!(
            parse_structured(&input),
            vec![speech("a"), movement(MovementType::TiltFront, 1.0), speech("c")]
        );
    }

    #[test]
    fn annotator_output_dispatches_on_shape() {
        let marked = AnnotatorOutput::Marked("Hi [TLTLEFT,1]".into());
        assert_eq!(marked.segments().len(), 2);
        let structured = AnnotatorOutput::Structured(StructuredSegments::default());
        assert!(structured.segments().is_empty());
    }

    #[test]
    fn render_then_parse_round_trips() {
        let segments = vec![
            movement(MovementType::RotateRight, 0.5),
            speech("Good morning."),
            movement(MovementType::TiltFront, 1.25),
            speech("Time for your pills."),
            movement(MovementType::TiltLeft, 0.0),
        ];
        let rendered = render_marked(&segments);
        let reparsed = parse_marked(&rendered).segments;

        assert_eq!(reparsed.len(), segments.len());
        for (a, b) in segments.iter().zip(&reparsed) {
            match (a, b) {
                (Segment::Speech { text: x }, Segment::Speech { text: y }) => assert_eq!(x, y),
                (
                    Segment::Movement { movement: m1, duration: d1 },
                    Segment::Movement { movement: m2, duration: d2 },
                ) => {
                    assert_eq!(m1, m2);
                    assert!((d1 - d2).abs() < 1e-6);
                }
                _ => panic!("segment kind changed: {a:?} vs {b:?}"),
            }
        }
    }

    #[test]
    fn render_uses_marker_codes() {
        let rendered = render_marked(&[speech("Hi"), movement(MovementType::TiltBack, 1.0)]);
        assert_eq!(rendered, "Hi [TLTBACK,1]");
    }
}
