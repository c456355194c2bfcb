use serde::{Deserialize, Deserializer};
use serde_json::Value;

use super::JudgeError;
use crate::models::{Evaluation, TurnAnalysis};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Label {
    HasHole,
    Hole,
    Strength,
    Probe,
}

// HAS_HOLE must be tried before HOLE
const LABELS: [(&str, Label); 4] = [
    ("HAS_HOLE", Label::HasHole),
    ("HOLE", Label::Hole),
    ("STRENGTH", Label::Strength),
    ("PROBE", Label::Probe),
];

/// Parse a labelled per-turn analysis:
///
/// ```text
/// HAS_HOLE: yes
/// HOLE: confuses attention with recurrence
/// STRENGTH: none
/// PROBE: What does each position attend to?
/// ```
///
/// Labels are case-insensitive and values may continue over several lines.
/// `none` or an empty value means absent.
pub fn parse_turn_analysis(reply: &str) -> Result<TurnAnalysis, JudgeError> {
    let mut has_hole: Option<String> = None;
    let mut hole: Option<String> = None;
    let mut strength: Option<String> = None;
    let mut probe: Option<String> = None;
    let mut current: Option<Label> = None;

    for line in reply.lines() {
        if let Some((label, value)) = split_label(line) {
            current = Some(label);
            let slot = match label {
                Label::HasHole => &mut has_hole,
                Label::Hole => &mut hole,
                Label::Strength => &mut strength,
                Label::Probe => &mut probe,
            };
            *slot = Some(value.to_string());
            continue;
        }

        let slot = match current {
            Some(Label::Hole) => &mut hole,
            Some(Label::Strength) => &mut strength,
            Some(Label::Probe) => &mut probe,
            Some(Label::HasHole) | None => continue,
        };
        if let Some(text) = slot.as_mut() {
            text.push('\n');
            text.push_str(line);
        }
    }

    let has_hole = has_hole
        .ok_or_else(|| JudgeError::Parse("reply has no HAS_HOLE line".to_string()))?
        .trim()
        .to_ascii_lowercase()
        .starts_with("yes");

    Ok(TurnAnalysis {
        has_hole,
        hole: present(hole),
        strength: present(strength),
        probe: present(probe),
    })
}

fn split_label(line: &str) -> Option<(Label, &str)> {
    let trimmed = line.trim_start_matches(|c: char| c == '*' || c == '-' || c.is_whitespace());
    let (head, rest) = trimmed.split_once(':')?;
    let head = head.trim().trim_end_matches('*');

    LABELS
        .iter()
        .find(|(name, _)| head.eq_ignore_ascii_case(name))
        .map(|(_, label)| (*label, rest.trim_start_matches('*')))
}

fn present(value: Option<String>) -> Option<String> {
    let value = value?;
    let cleaned = value
        .trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim();
    if cleaned.is_empty() || cleaned.eq_ignore_ascii_case("none") {
        None
    } else {
        Some(cleaned.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct EvaluationPayload {
    #[serde(default)]
    score: Option<ScoreValue>,
    #[serde(default, deserialize_with = "lenient_list")]
    covered: Vec<String>,
    #[serde(default, deserialize_with = "lenient_list")]
    missed: Vec<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    feedback: String,
}

/// A list of strings. Anything that is not an array reads as empty and
/// non-string items are dropped.
fn lenient_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let items = match Value::deserialize(deserializer)? {
        Value::Array(items) => items,
        _ => return Ok(Vec::new()),
    };
    Ok(items
        .into_iter()
        .filter_map(|item| match item {
            Value::String(s) if !s.trim().is_empty() => Some(s),
            _ => None,
        })
        .collect())
}

fn lenient_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        _ => Ok(String::new()),
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ScoreValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl ScoreValue {
    fn to_score(&self) -> Result<i32, JudgeError> {
        match self {
            ScoreValue::Int(n) => Ok((*n).clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32),
            ScoreValue::Float(f) => Ok(f.trunc() as i32),
            ScoreValue::Text(s) => {
                let s = s.trim();
                s.parse::<i32>()
                    .or_else(|_| s.parse::<f64>().map(|f| f.trunc() as i32))
                    .map_err(|_| JudgeError::Parse(format!("score '{}' is not a number", s)))
            }
        }
    }
}

/// Parse a JSON evaluation reply, tolerating a surrounding Markdown code
/// fence. A missing score becomes `fallback_score`; clamping is left to the
/// caller.
pub fn parse_evaluation(reply: &str, fallback_score: i32) -> Result<Evaluation, JudgeError> {
    let body = strip_code_fence(reply);

    let payload: EvaluationPayload = match serde_json::from_str(body) {
        Ok(p) => p,
        Err(first) => match (body.find('{'), body.rfind('}')) {
            (Some(start), Some(end)) if start < end => serde_json::from_str(&body[start..=end])
                .map_err(|e| JudgeError::Parse(e.to_string()))?,
            _ => return Err(JudgeError::Parse(first.to_string())),
        },
    };

    let score = match &payload.score {
        Some(value) => value.to_score()?,
        None => fallback_score,
    };

    Ok(Evaluation {
        score,
        covered: payload.covered,
        missed: payload.missed,
        feedback: payload.feedback,
    })
}

fn strip_code_fence(reply: &str) -> &str {
    let trimmed = reply.trim();
    let Some(after_open) = trimmed.strip_prefix("```") else {
        return trimmed;
    };

    // Drop the info string (e.g. `json`) on the opening line
    let body = match after_open.find('\n') {
        Some(idx) => &after_open[idx + 1..],
        None => after_open,
    };
    match body.find("```") {
        Some(end) => body[..end].trim(),
        None => body.trim(),
    }
}
