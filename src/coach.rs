use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{CoachConfig, GradingConfig};
use crate::judge::Judge;
use crate::models::{Concept, FinalVerdict, Speaker, Turn, TurnAnalysis, Verdict};

const FEEDBACK_LIMIT: usize = 200;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoachError {
    #[error("this dialogue has already concluded")]
    AlreadyConcluded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoachState {
    AwaitingTurn,
    Concluded,
}

/// An adversarial dialogue about a single concept.
///
/// Every learner turn is analysed by the judge. A hole found with turns to
/// spare earns a follow-up probe; anything else concludes the dialogue with
/// a score that starts at the top of the scale and loses one point per hole.
pub struct Coach<'j> {
    judge: &'j dyn Judge,
    concept: Concept,
    grading: GradingConfig,
    max_turns: u32,
    transcript: Vec<Turn>,
    turn: u32,
    confidence: i32,
    holes: Vec<String>,
    strengths: Vec<String>,
    state: CoachState,
}

impl<'j> Coach<'j> {
    pub fn new(
        judge: &'j dyn Judge,
        concept: Concept,
        coach: &CoachConfig,
        grading: &GradingConfig,
    ) -> Self {
        let challenge = concept.challenge();
        Self {
            judge,
            concept,
            grading: grading.clone(),
            max_turns: coach.max_turns,
            transcript: vec![Turn::coach(challenge)],
            turn: 0,
            confidence: grading.score_max,
            holes: Vec::new(),
            strengths: Vec::new(),
            state: CoachState::AwaitingTurn,
        }
    }

    pub fn initial_challenge(&self) -> String {
        self.concept.challenge()
    }

    pub fn respond(&mut self, utterance: &str) -> Result<Verdict, CoachError> {
        if self.state == CoachState::Concluded {
            return Err(CoachError::AlreadyConcluded);
        }

        self.turn += 1;
        self.transcript.push(Turn::learner(utterance));

        let analysis = match self.judge.analyze_turn(&self.concept, &self.transcript) {
            Ok(analysis) => analysis,
            Err(e) => {
                warn!(judge = self.judge.name(), error = %e, "turn analysis failed");
                TurnAnalysis::default()
            }
        };
        let hole = analysis.hole().map(str::to_string);

        match hole {
            Some(hole) if self.turn < self.max_turns => {
                debug!(turn = self.turn, %hole, "hole found, probing");
                self.holes.push(hole.clone());
                self.lose_confidence();

                let probe = match analysis.probe {
                    Some(probe) => probe,
                    None => self.request_probe(&hole),
                };
                self.transcript.push(Turn::coach(probe.clone()));
                Ok(Verdict::Followup { message: probe })
            }
            hole => {
                if let Some(strength) = analysis.strength {
                    self.strengths.push(strength);
                }
                if let Some(hole) = hole {
                    self.holes.push(hole);
                    self.lose_confidence();
                }
                self.state = CoachState::Concluded;

                let feedback = self.feedback();
                debug!(
                    turn = self.turn,
                    score = self.confidence,
                    holes = self.holes.len(),
                    "dialogue concluded"
                );
                Ok(Verdict::Final(FinalVerdict {
                    score: self.confidence,
                    holes: self.holes.clone(),
                    strengths: self.strengths.clone(),
                    feedback,
                }))
            }
        }
    }

    /// Everything the learner said, in order.
    pub fn learner_text(&self) -> String {
        self.transcript
            .iter()
            .filter(|t| t.speaker == Speaker::Learner)
            .map(|t| t.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn is_concluded(&self) -> bool {
        self.state == CoachState::Concluded
    }

    pub fn state(&self) -> CoachState {
        self.state
    }

    pub fn turn(&self) -> u32 {
        self.turn
    }

    pub fn confidence(&self) -> i32 {
        self.confidence
    }

    pub fn transcript(&self) -> &[Turn] {
        &self.transcript
    }

    pub fn concept(&self) -> &Concept {
        &self.concept
    }

    fn lose_confidence(&mut self) {
        self.confidence = (self.confidence - 1).max(self.grading.score_min);
    }

    fn request_probe(&self, hole: &str) -> String {
        match self.judge.request_probe(&self.concept, hole) {
            Ok(probe) => probe,
            Err(e) => {
                warn!(judge = self.judge.name(), error = %e, "probe request failed");
                format!(
                    "Can you explain more specifically how {} handles {}?",
                    self.concept.name, hole
                )
            }
        }
    }

    fn feedback(&self) -> String {
        if self.holes.is_empty() && self.strengths.is_empty() {
            return "Explanation recorded.".to_string();
        }

        match self
            .judge
            .summarize(&self.concept, &self.transcript, &self.holes, &self.strengths)
        {
            Ok(summary) => summary.chars().take(FEEDBACK_LIMIT).collect(),
            Err(e) => {
                warn!(judge = self.judge.name(), error = %e, "summary failed");
                match self.holes.first() {
                    Some(hole) => format!("Review: {}", hole),
                    None => "Good understanding demonstrated.".to_string(),
                }
            }
        }
    }
}
