//! The judging boundary: everything that turns a learner's words into a
//! structured verdict goes through [`Judge`].

pub mod llm;
pub mod parse;
pub mod provider;

use thiserror::Error;
use tracing::{debug, warn};

use crate::config::GradingConfig;
use crate::models::{Concept, Evaluation, Turn, TurnAnalysis};
use provider::ProviderErrorKind;

pub use llm::{judges_from_config, LlmJudge};

#[derive(Debug, Error)]
pub enum JudgeError {
    #[error("{0} is not set")]
    MissingCredential(String),

    #[error("request failed: {0}")]
    Transport(reqwest::Error),

    #[error("{provider} returned {kind}: {message}")]
    Status {
        provider: String,
        kind: ProviderErrorKind,
        message: String,
    },

    #[error("unreadable reply: {0}")]
    Parse(String),
}

// Request URLs can carry credentials; keep them out of messages and logs.
impl From<reqwest::Error> for JudgeError {
    fn from(e: reqwest::Error) -> Self {
        JudgeError::Transport(e.without_url())
    }
}

pub trait Judge {
    fn name(&self) -> &str;

    /// Look for a hole or a strength in the learner's latest turn.
    fn analyze_turn(&self, concept: &Concept, transcript: &[Turn])
        -> Result<TurnAnalysis, JudgeError>;

    /// One pointed question that targets `hole`.
    fn request_probe(&self, concept: &Concept, hole: &str) -> Result<String, JudgeError>;

    /// One sentence of closing feedback for a finished dialogue.
    fn summarize(
        &self,
        concept: &Concept,
        transcript: &[Turn],
        holes: &[String],
        strengths: &[String],
    ) -> Result<String, JudgeError>;

    fn evaluate_once(&self, concept: &Concept, explanation: &str)
        -> Result<Evaluation, JudgeError>;
}

/// Grade one explanation, trying each judge in order until one answers.
///
/// Never fails: when no judge succeeds the configured fallback score is
/// returned with empty point lists and feedback naming the last failure.
pub fn evaluate_with_fallback(
    judges: &[&dyn Judge],
    concept: &Concept,
    explanation: &str,
    grading: &GradingConfig,
) -> Evaluation {
    let mut last_error: Option<JudgeError> = None;

    for judge in judges {
        match judge.evaluate_once(concept, explanation) {
            Ok(mut evaluation) => {
                debug!(judge = judge.name(), score = evaluation.score, "evaluation received");
                evaluation.score = grading.clamp(evaluation.score);
                return evaluation;
            }
            Err(e) => {
                warn!(judge = judge.name(), error = %e, "evaluation failed");
                last_error = Some(e);
            }
        }
    }

    let reason = last_error
        .map(|e| e.to_string())
        .unwrap_or_else(|| "no judge configured".to_string());

    Evaluation {
        score: grading.fallback_score,
        covered: Vec::new(),
        missed: Vec::new(),
        feedback: format!("Evaluation unavailable: {}", reason),
    }
}

#[cfg(test)]
pub mod testing {
    use std::cell::RefCell;
    use std::collections::VecDeque;

    use super::*;

    /// A judge that replays canned answers; `None` entries fail.
    #[derive(Default)]
    pub struct ScriptedJudge {
        pub name: String,
        pub analyses: RefCell<VecDeque<Option<TurnAnalysis>>>,
        pub probe: Option<String>,
        pub summary: Option<String>,
        pub evaluation: Option<Evaluation>,
        pub seen_transcripts: RefCell<Vec<Vec<Turn>>>,
        pub probe_requests: RefCell<Vec<String>>,
        pub evaluate_calls: RefCell<usize>,
    }

    impl ScriptedJudge {
        pub fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                ..Default::default()
            }
        }

        pub fn with_analyses(self, analyses: Vec<Option<TurnAnalysis>>) -> Self {
            *self.analyses.borrow_mut() = analyses.into();
            self
        }

        pub fn with_probe(mut self, probe: &str) -> Self {
            self.probe = Some(probe.to_string());
            self
        }

        pub fn with_summary(mut self, summary: &str) -> Self {
            self.summary = Some(summary.to_string());
            self
        }

        pub fn with_evaluation(mut self, evaluation: Evaluation) -> Self {
            self.evaluation = Some(evaluation);
            self
        }

        fn failure(&self) -> JudgeError {
            JudgeError::Parse(format!("{} scripted failure", self.name))
        }
    }

    impl Judge for ScriptedJudge {
        fn name(&self) -> &str {
            &self.name
        }

        fn analyze_turn(
            &self,
            _concept: &Concept,
            transcript: &[Turn],
        ) -> Result<TurnAnalysis, JudgeError> {
            self.seen_transcripts.borrow_mut().push(transcript.to_vec());
            self.analyses
                .borrow_mut()
                .pop_front()
                .flatten()
                .ok_or_else(|| self.failure())
        }

        fn request_probe(&self, _concept: &Concept, hole: &str) -> Result<String, JudgeError> {
            self.probe_requests.borrow_mut().push(hole.to_string());
            self.probe.clone().ok_or_else(|| self.failure())
        }

        fn summarize(
            &self,
            _concept: &Concept,
            _transcript: &[Turn],
            _holes: &[String],
            _strengths: &[String],
        ) -> Result<String, JudgeError> {
            self.summary.clone().ok_or_else(|| self.failure())
        }

        fn evaluate_once(
            &self,
            _concept: &Concept,
            _explanation: &str,
        ) -> Result<Evaluation, JudgeError> {
            *self.evaluate_calls.borrow_mut() += 1;
            self.evaluation.clone().ok_or_else(|| self.failure())
        }
    }

    pub fn hole(description: &str, probe: Option<&str>) -> Option<TurnAnalysis> {
        Some(TurnAnalysis {
            has_hole: true,
            hole: Some(description.to_string()),
            strength: None,
            probe: probe.map(str::to_string),
        })
    }

    pub fn strength(description: &str) -> Option<TurnAnalysis> {
        Some(TurnAnalysis {
            has_hole: false,
            hole: None,
            strength: Some(description.to_string()),
            probe: None,
        })
    }
}
