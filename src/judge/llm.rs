use tracing::{debug, info};

use super::parse::{parse_evaluation, parse_turn_analysis};
use super::provider::{CompletionProvider, GeminiProvider, GroqProvider};
use super::{Judge, JudgeError};
use crate::config::{GradingConfig, JudgeConfig};
use crate::models::{format_transcript, Concept, Evaluation, Turn, TurnAnalysis};

const SOCRATIC_SYSTEM: &str = "You are a strict Socratic teacher. You look for gaps in a student's \
understanding and never accept vague answers as complete.";

const GRADER_SYSTEM: &str =
    "You grade student explanations against a source text. Be strict but fair.";

/// A [`Judge`] backed by a language model behind a [`CompletionProvider`].
pub struct LlmJudge {
    provider: Box<dyn CompletionProvider>,
    grading: GradingConfig,
}

impl LlmJudge {
    pub fn new(provider: Box<dyn CompletionProvider>, grading: GradingConfig) -> Self {
        Self { provider, grading }
    }

    fn analysis_prompt(concept: &Concept, transcript: &[Turn]) -> String {
        format!(
            r#"CONCEPT: {name}
SOURCE TRUTH: "{quote}"
ORIGINAL QUESTION: {question}

CONVERSATION SO FAR:
{history}

Analyze only the student's LATEST answer. Look for:
1. HOLES: misconceptions, oversimplifications, missing key points, confident but wrong claims
2. STRENGTHS: correct understanding, accurate details, good analogies

Reply in exactly this format and nothing else:
HAS_HOLE: yes/no
HOLE: <the gap or misconception, or "none">
STRENGTH: <what they got right, or "none">
PROBE: <one pointed follow-up question that exposes the hole, or "none">"#,
            name = concept.name,
            quote = concept.source_quote,
            question = concept.challenge(),
            history = format_transcript(transcript),
        )
    }

    fn probe_prompt(concept: &Concept, hole: &str) -> String {
        format!(
            r#"CONCEPT: {}
GAP FOUND: {}

Write ONE follow-up question that targets this gap directly, cannot be
answered vaguely, and makes the student confront what they do not know.
Reply with only the question."#,
            concept.name, hole
        )
    }

    fn summary_prompt(
        concept: &Concept,
        transcript: &[Turn],
        holes: &[String],
        strengths: &[String],
    ) -> String {
        format!(
            r#"CONCEPT: {}
CONVERSATION:
{}

HOLES FOUND: {}
STRENGTHS: {}

Write ONE sentence of direct, honest feedback. No filler. Say exactly what to review."#,
            concept.name,
            format_transcript(transcript),
            list_or_none(holes),
            list_or_none(strengths),
        )
    }

    fn evaluation_prompt(&self, concept: &Concept, explanation: &str) -> String {
        let min = self.grading.score_min;
        let max = self.grading.score_max;
        format!(
            r#"CONCEPT: {name}

SOURCE (ground truth):
"{quote}"

STUDENT'S EXPLANATION:
"{explanation}"

Compare the explanation to the source and return ONLY valid JSON:
{{
  "score": <{min}-{max}>,
  "covered": ["key point they got right"],
  "missed": ["key point they missed"],
  "feedback": "one sentence summary of their understanding"
}}

Scoring guide:
{min} = completely wrong or empty
2 = missed most key points
3 = got the gist, missed important details
4 = good understanding, minor gaps
{max} = fully captured the concept

Vague language in place of precise terms counts as a partial miss."#,
            name = concept.name,
            quote = concept.source_quote,
        )
    }
}

fn list_or_none(items: &[String]) -> String {
    if items.is_empty() {
        "none".to_string()
    } else {
        items.join("; ")
    }
}

impl Judge for LlmJudge {
    fn name(&self) -> &str {
        self.provider.name()
    }

    fn analyze_turn(
        &self,
        concept: &Concept,
        transcript: &[Turn],
    ) -> Result<TurnAnalysis, JudgeError> {
        debug!(judge = self.name(), concept = %concept.name, turns = transcript.len(), "analyzing turn");
        let reply = self
            .provider
            .complete(Some(SOCRATIC_SYSTEM), &Self::analysis_prompt(concept, transcript))?;
        parse_turn_analysis(&reply)
    }

    fn request_probe(&self, concept: &Concept, hole: &str) -> Result<String, JudgeError> {
        let reply = self
            .provider
            .complete(Some(SOCRATIC_SYSTEM), &Self::probe_prompt(concept, hole))?;
        let probe = reply.trim().trim_matches('"').trim();
        if probe.is_empty() {
            return Err(JudgeError::Parse("empty probe".to_string()));
        }
        Ok(probe.to_string())
    }

    fn summarize(
        &self,
        concept: &Concept,
        transcript: &[Turn],
        holes: &[String],
        strengths: &[String],
    ) -> Result<String, JudgeError> {
        let prompt = Self::summary_prompt(concept, transcript, holes, strengths);
        let reply = self.provider.complete(Some(SOCRATIC_SYSTEM), &prompt)?;
        let summary = reply.trim();
        if summary.is_empty() {
            return Err(JudgeError::Parse("empty summary".to_string()));
        }
        Ok(summary.to_string())
    }

    fn evaluate_once(&self, concept: &Concept, explanation: &str) -> Result<Evaluation, JudgeError> {
        debug!(judge = self.name(), concept = %concept.name, "evaluating explanation");
        let reply = self
            .provider
            .complete(Some(GRADER_SYSTEM), &self.evaluation_prompt(concept, explanation))?;
        parse_evaluation(&reply, self.grading.fallback_score)
    }
}

/// Judges for every provider with a key set, Gemini first.
pub fn judges_from_config(
    config: &JudgeConfig,
    grading: &GradingConfig,
) -> Result<Vec<LlmJudge>, JudgeError> {
    let mut judges = Vec::new();

    if config.gemini_api_key.is_some() {
        let provider = GeminiProvider::from_config(config)?;
        judges.push(LlmJudge::new(Box::new(provider), grading.clone()));
    }
    if config.groq_api_key.is_some() {
        let provider = GroqProvider::from_config(config)?;
        judges.push(LlmJudge::new(Box::new(provider), grading.clone()));
    }

    info!(
        judges = ?judges.iter().map(|j| j.name()).collect::<Vec<_>>(),
        "configured judges"
    );
    Ok(judges)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Clone, Default)]
    struct CannedProvider {
        reply: Option<String>,
        prompts: Rc<RefCell<Vec<String>>>,
    }

    impl CompletionProvider for CannedProvider {
        fn name(&self) -> &str {
            "canned"
        }

        fn complete(&self, _system: Option<&str>, prompt: &str) -> Result<String, JudgeError> {
            self.prompts.borrow_mut().push(prompt.to_string());
            self.reply
                .clone()
                .ok_or_else(|| JudgeError::MissingCredential("CANNED_KEY".to_string()))
        }
    }

    fn judge_replying(reply: Option<&str>) -> (LlmJudge, Rc<RefCell<Vec<String>>>) {
        let provider = CannedProvider {
            reply: reply.map(str::to_string),
            ..Default::default()
        };
        let prompts = provider.prompts.clone();
        (
            LlmJudge::new(Box::new(provider), GradingConfig::default()),
            prompts,
        )
    }

    fn concept() -> Concept {
        Concept {
            id: 3,
            source_id: None,
            name: "Self-attention".to_string(),
            source_quote: "Each token attends to every other token.".to_string(),
            question: Some("Why does self-attention parallelize?".to_string()),
            skipped: false,
            created_at: Utc::now(),
        }
    }

    mod analysis_tests {
        use super::*;

        #[test]
        fn prompt_carries_concept_and_transcript() {
            let (judge, prompts) =
                judge_replying(Some("HAS_HOLE: no\nHOLE: none\nSTRENGTH: clear\nPROBE: none"));
            let transcript = vec![
                Turn::coach("Why does self-attention parallelize?"),
                Turn::learner("Because tokens are independent."),
            ];

            let analysis = judge.analyze_turn(&concept(), &transcript).unwrap();
            assert!(!analysis.has_hole);

            let prompt = &prompts.borrow()[0];
            assert!(prompt.contains("CONCEPT: Self-attention"));
            assert!(prompt.contains("Each token attends to every other token."));
            assert!(prompt.contains("learner: Because tokens are independent."));
        }

        #[test]
        fn provider_failure_propagates() {
            let (judge, _) = judge_replying(None);
            assert!(judge.analyze_turn(&concept(), &[]).is_err());
        }
    }

    mod probe_tests {
        use super::*;

        #[test]
        fn strips_quotes() {
            let (judge, prompts) = judge_replying(Some("  \"What breaks without masking?\"\n"));
            let probe = judge.request_probe(&concept(), "ignores masking").unwrap();
            assert_eq!(probe, "What breaks without masking?");
            assert!(prompts.borrow()[0].contains("GAP FOUND: ignores masking"));
        }

        #[test]
        fn blank_reply_is_error() {
            let (judge, _) = judge_replying(Some("   "));
            assert!(judge.request_probe(&concept(), "x").is_err());
        }
    }

    mod summary_tests {
        use super::*;

        #[test]
        fn lists_holes_and_strengths() {
            let (judge, prompts) = judge_replying(Some("Review the scaling factor."));
            let summary = judge
                .summarize(
                    &concept(),
                    &[],
                    &["scaling".to_string(), "masking".to_string()],
                    &[],
                )
                .unwrap();

            assert_eq!(summary, "Review the scaling factor.");
            let prompt = &prompts.borrow()[0];
            assert!(prompt.contains("HOLES FOUND: scaling; masking"));
            assert!(prompt.contains("STRENGTHS: none"));
        }
    }

    mod evaluation_tests {
        use super::*;

        #[test]
        fn parses_reply() {
            let (judge, prompts) = judge_replying(Some(
                r#"{"score": 4, "covered": ["parallel"], "missed": [], "feedback": "Good."}"#,
            ));
            let eval = judge.evaluate_once(&concept(), "All at once.").unwrap();

            assert_eq!(eval.score, 4);
            assert_eq!(eval.covered, vec!["parallel".to_string()]);
            assert!(prompts.borrow()[0].contains("\"All at once.\""));
            assert!(prompts.borrow()[0].contains("<1-5>"));
        }

        #[test]
        fn missing_score_uses_fallback() {
            let (judge, _) = judge_replying(Some(r#"{"feedback": "?"}"#));
            let eval = judge.evaluate_once(&concept(), "hmm").unwrap();
            assert_eq!(eval.score, GradingConfig::default().fallback_score);
        }

        #[test]
        fn unreachable_gemini_feedback_omits_key() {
            let config = JudgeConfig {
                gemini_api_key: Some("SECRET-GEMINI-KEY".to_string()),
                gemini_model: "m".to_string(),
                ..JudgeConfig::default()
            };
            let provider = GeminiProvider::from_config(&config)
                .unwrap()
                .with_base_url("http://127.0.0.1:9");
            let judge = LlmJudge::new(Box::new(provider), GradingConfig::default());

            let eval = crate::judge::evaluate_with_fallback(
                &[&judge],
                &concept(),
                "All at once.",
                &GradingConfig::default(),
            );

            assert_eq!(eval.score, GradingConfig::default().fallback_score);
            assert!(eval.feedback.starts_with("Evaluation unavailable: request failed"));
            assert!(!eval.feedback.contains("SECRET-GEMINI-KEY"));
        }
    }

    mod config_tests {
        use super::*;

        #[test]
        fn no_keys_no_judges() {
            let judges =
                judges_from_config(&JudgeConfig::default(), &GradingConfig::default()).unwrap();
            assert!(judges.is_empty());
        }

        #[test]
        fn gemini_comes_first() {
            let config = JudgeConfig {
                gemini_api_key: Some("g".to_string()),
                groq_api_key: Some("q".to_string()),
                ..JudgeConfig::default()
            };
            let judges = judges_from_config(&config, &GradingConfig::default()).unwrap();
            let names: Vec<&str> = judges.iter().map(|j| j.name()).collect();
            assert_eq!(names, vec!["gemini", "groq"]);
        }

        #[test]
        fn only_keyed_providers() {
            let config = JudgeConfig {
                groq_api_key: Some("q".to_string()),
                ..JudgeConfig::default()
            };
            let judges = judges_from_config(&config, &GradingConfig::default()).unwrap();
            assert_eq!(judges.len(), 1);
            assert_eq!(judges[0].name(), "groq");
        }
    }
}
