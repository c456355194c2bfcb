use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::SchedulerConfig;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Source {
    pub id: i64,
    pub url: String,
    pub title: String,
    pub source_type: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceWithCount {
    pub source: Source,
    pub concept_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Concept {
    pub id: i64,
    pub source_id: Option<i64>,
    pub name: String,
    pub source_quote: String,
    pub question: Option<String>,
    pub skipped: bool,
    pub created_at: DateTime<Utc>,
}

impl Concept {
    /// The opening question for a study turn.
    pub fn challenge(&self) -> String {
        match self.question.as_deref().map(str::trim) {
            Some(q) if !q.is_empty() => q.to_string(),
            _ => format!("Explain {} in your own words.", self.name),
        }
    }
}

// Scheduling record, one per concept
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReviewState {
    pub ease: f64,
    /// Days until the next review.
    pub interval: f64,
    pub due_at: DateTime<Utc>,
    pub review_count: u32,
    pub last_score: Option<i32>,
    pub last_reviewed_at: Option<DateTime<Utc>>,
}

impl ReviewState {
    /// A fresh record for a newly added concept; due immediately.
    pub fn initial(config: &SchedulerConfig, now: DateTime<Utc>) -> Self {
        Self {
            ease: config.initial_ease,
            interval: config.initial_interval,
            due_at: now,
            review_count: 0,
            last_score: None,
            last_reviewed_at: None,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.due_at <= now
    }

    pub fn is_mastered(&self, config: &SchedulerConfig) -> bool {
        self.ease >= config.mastery_min_ease && self.review_count >= config.mastery_min_reviews
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConceptWithState {
    pub concept: Concept,
    pub state: ReviewState,
}

// Append-only history entry written when a study turn concludes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewExplanation {
    pub concept_id: i64,
    pub text: String,
    pub score: i32,
    pub covered: Vec<String>,
    pub missed: Vec<String>,
    pub feedback: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Explanation {
    pub id: i64,
    pub concept_id: i64,
    pub text: String,
    pub score: i32,
    pub covered: Vec<String>,
    pub missed: Vec<String>,
    pub feedback: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    Coach,
    Learner,
}

impl Speaker {
    pub fn as_str(&self) -> &'static str {
        match self {
            Speaker::Coach => "coach",
            Speaker::Learner => "learner",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub speaker: Speaker,
    pub text: String,
}

impl Turn {
    pub fn coach(text: impl Into<String>) -> Self {
        Self {
            speaker: Speaker::Coach,
            text: text.into(),
        }
    }

    pub fn learner(text: impl Into<String>) -> Self {
        Self {
            speaker: Speaker::Learner,
            text: text.into(),
        }
    }
}

/// Render a transcript as `speaker: text` lines.
pub fn format_transcript(turns: &[Turn]) -> String {
    turns
        .iter()
        .map(|t| format!("{}: {}", t.speaker.as_str(), t.text))
        .collect::<Vec<_>>()
        .join("\n")
}

// What the judge made of the learner's latest turn
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnAnalysis {
    pub has_hole: bool,
    pub hole: Option<String>,
    pub strength: Option<String>,
    pub probe: Option<String>,
}

impl TurnAnalysis {
    /// A hole only counts when the judge also said what it is.
    pub fn hole(&self) -> Option<&str> {
        if self.has_hole {
            self.hole.as_deref()
        } else {
            None
        }
    }
}

// Single-shot grading of one explanation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evaluation {
    pub score: i32,
    pub covered: Vec<String>,
    pub missed: Vec<String>,
    pub feedback: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalVerdict {
    pub score: i32,
    pub holes: Vec<String>,
    pub strengths: Vec<String>,
    pub feedback: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Verdict {
    Followup { message: String },
    Final(FinalVerdict),
}

impl Verdict {
    pub fn is_final(&self) -> bool {
        matches!(self, Verdict::Final(_))
    }
}

pub fn score_label(score: i32) -> &'static str {
    match score {
        s if s >= 5 => "Perfect",
        4 => "Great",
        3 => "Good",
        2 => "Getting There",
        _ => "Needs Work",
    }
}

/// Five-cell bar, e.g. `|||..` for 3.
pub fn score_bar(score: i32, max: i32) -> String {
    let max = max.max(1) as usize;
    let filled = score.clamp(0, max as i32) as usize;
    format!("{}{}", "|".repeat(filled), ".".repeat(max - filled))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Summary {
    pub due_now: usize,
    pub total_concepts: usize,
    pub mastered: usize,
}

// JSON output wrapper for CLI
#[derive(Debug, Serialize)]
pub struct JsonOutput<T: Serialize> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T: Serialize> JsonOutput<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn concept(question: Option<&str>) -> Concept {
        Concept {
            id: 1,
            source_id: None,
            name: "Self-attention".to_string(),
            source_quote: "Attention relates every position to every other.".to_string(),
            question: question.map(str::to_string),
            skipped: false,
            created_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    mod concept_tests {
        use super::*;

        #[test]
        fn challenge_uses_stored_question() {
            let c = concept(Some("What problem does self-attention solve?"));
            assert_eq!(c.challenge(), "What problem does self-attention solve?");
        }

        #[test]
        fn challenge_defaults_when_missing() {
            let c = concept(None);
            assert_eq!(c.challenge(), "Explain Self-attention in your own words.");
        }

        #[test]
        fn challenge_defaults_when_blank() {
            let c = concept(Some("   "));
            assert_eq!(c.challenge(), "Explain Self-attention in your own words.");
        }
    }

    mod review_state_tests {
        use super::*;

        #[test]
        fn initial_state_is_due_now() {
            let now = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
            let state = ReviewState::initial(&SchedulerConfig::default(), now);
            assert_eq!(state.ease, 2.5);
            assert_eq!(state.interval, 1.0);
            assert_eq!(state.review_count, 0);
            assert!(state.last_score.is_none());
            assert!(state.is_due(now));
        }

        #[test]
        fn mastery_needs_both_thresholds() {
            let config = SchedulerConfig::default();
            let now = Utc::now();
            let mut state = ReviewState::initial(&config, now);

            state.review_count = 5;
            state.ease = 2.4;
            assert!(!state.is_mastered(&config));

            state.ease = 2.6;
            state.review_count = 2;
            assert!(!state.is_mastered(&config));

            state.review_count = 3;
            assert!(state.is_mastered(&config));
        }
    }

    mod turn_analysis_tests {
        use super::*;

        #[test]
        fn hole_flag_without_description_is_ignored() {
            let a = TurnAnalysis {
                has_hole: true,
                ..Default::default()
            };
            assert!(a.hole().is_none());
        }

        #[test]
        fn description_without_flag_is_ignored() {
            let a = TurnAnalysis {
                has_hole: false,
                hole: Some("vague".to_string()),
                ..Default::default()
            };
            assert!(a.hole().is_none());
        }
    }

    mod verdict_tests {
        use super::*;

        #[test]
        fn followup_serializes_with_type_tag() {
            let v = Verdict::Followup {
                message: "Why?".to_string(),
            };
            let json = serde_json::to_string(&v).unwrap();
            assert!(json.contains("\"type\":\"followup\""));
            assert!(!v.is_final());
        }

        #[test]
        fn final_serializes_with_type_tag() {
            let v = Verdict::Final(FinalVerdict {
                score: 4,
                holes: vec!["parallelism".to_string()],
                strengths: vec![],
                feedback: "Review parallelism.".to_string(),
            });
            let json = serde_json::to_string(&v).unwrap();
            assert!(json.contains("\"type\":\"final\""));
            assert!(json.contains("\"score\":4"));
            assert!(v.is_final());
        }
    }

    mod score_display_tests {
        use super::*;

        #[test]
        fn labels_cover_the_scale() {
            assert_eq!(score_label(5), "Perfect");
            assert_eq!(score_label(4), "Great");
            assert_eq!(score_label(3), "Good");
            assert_eq!(score_label(2), "Getting There");
            assert_eq!(score_label(1), "Needs Work");
        }

        #[test]
        fn bar_fills_proportionally() {
            assert_eq!(score_bar(4, 5), "||||.");
            assert_eq!(score_bar(1, 5), "|....");
            assert_eq!(score_bar(9, 5), "|||||");
        }
    }

    #[test]
    fn transcript_formats_speakers() {
        let turns = vec![Turn::coach("Explain it."), Turn::learner("It focuses.")];
        assert_eq!(
            format_transcript(&turns),
            "coach: Explain it.\nlearner: It focuses."
        );
    }

    mod json_output_tests {
        use super::*;

        #[test]
        fn ok_with_number() {
            let output = JsonOutput::ok(42);
            assert!(output.success);
            assert_eq!(output.data, Some(42));
            assert!(output.error.is_none());
        }

        #[test]
        fn err_with_string() {
            let output = JsonOutput::<()>::err("something went wrong");
            assert!(!output.success);
            assert!(output.data.is_none());
            assert_eq!(output.error, Some("something went wrong".to_string()));
        }

        #[test]
        fn serializes_err_correctly() {
            let output = JsonOutput::<()>::err("error");
            let json = serde_json::to_string(&output).unwrap();
            assert!(json.contains("\"success\":false"));
            assert!(json.contains("\"data\":null"));
            assert!(json.contains("\"error\":\"error\""));
        }
    }
}
