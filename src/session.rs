use std::io::{self, BufRead, Write};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::coach::{Coach, CoachError};
use crate::config::Config;
use crate::judge::{evaluate_with_fallback, Judge};
use crate::models::{score_bar, score_label, Concept, NewExplanation, Verdict};
use crate::scheduler::{ReviewOutcome, Scheduler, SchedulerError};
use crate::store::{ConceptFilter, ProgressStore, StoreError};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no judge configured; set GEMINI_API_KEY or GROQ_API_KEY")]
    NoJudge,

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Coach(#[from] CoachError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StudyMode {
    /// Multi-turn Socratic dialogue per concept.
    Dialogue,
    /// One answer per concept, graded once.
    Quick,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionReport {
    pub studied: usize,
    pub skipped: usize,
}

#[derive(Debug, PartialEq, Eq)]
enum Answer {
    Text(String),
    Skip,
    Quit,
    Empty,
}

// Outcome of one concept, whichever mode produced it
struct Graded {
    text: String,
    score: i32,
    covered: Vec<String>,
    missed: Vec<String>,
    feedback: String,
}

enum Step {
    Graded(Graded),
    Skipped,
    Quit,
}

pub struct StudySession<'a, S: ProgressStore> {
    store: &'a S,
    config: &'a Config,
    judges: &'a [&'a dyn Judge],
    mode: StudyMode,
}

impl<'a, S: ProgressStore> StudySession<'a, S> {
    pub fn new(
        store: &'a S,
        config: &'a Config,
        judges: &'a [&'a dyn Judge],
        mode: StudyMode,
    ) -> Self {
        Self {
            store,
            config,
            judges,
            mode,
        }
    }

    fn scheduler(&self) -> Scheduler<'a, S> {
        Scheduler::new(self.store, &self.config.scheduler, &self.config.grading)
    }

    /// Work through due concepts until none remain or the learner stops.
    pub fn run<R: BufRead, W: Write>(
        &self,
        input: &mut R,
        out: &mut W,
    ) -> Result<SessionReport, SessionError> {
        if self.judges.is_empty() {
            return Err(SessionError::NoJudge);
        }

        let scheduler = self.scheduler();
        let mut report = SessionReport::default();

        let Some(mut concept) = scheduler.next_due_concept()? else {
            if self.store.list_concepts(ConceptFilter::All)?.is_empty() {
                writeln!(out, "No concepts yet. Add one with `learnlock concept add`.")?;
            } else {
                writeln!(out, "All caught up! Nothing due for review.")?;
            }
            return Ok(report);
        };

        info!(mode = ?self.mode, "study session started");
        loop {
            let position = report.studied + report.skipped + 1;
            let total = position + scheduler.all_due()?.len() - 1;
            self.print_header(out, &concept, position, total)?;

            let step = match self.mode {
                StudyMode::Dialogue => self.dialogue(&concept, input, out)?,
                StudyMode::Quick => self.quick(&concept, input, out)?,
            };

            match step {
                Step::Quit => break,
                Step::Skipped => {
                    self.store.set_skipped(concept.id, true)?;
                    report.skipped += 1;
                    writeln!(out, "Skipped: {}", concept.name)?;
                }
                Step::Graded(graded) => {
                    let outcome = self.record(&concept, graded, out)?;
                    report.studied += 1;
                    debug!(concept_id = concept.id, next = %outcome.next_review_at, "concept studied");
                }
            }

            match scheduler.next_due_concept()? {
                Some(next) => {
                    if !self.keep_going(input, out, scheduler.all_due()?.len())? {
                        break;
                    }
                    concept = next;
                }
                None => {
                    writeln!(out)?;
                    writeln!(out, "Study session complete!")?;
                    break;
                }
            }
        }

        info!(studied = report.studied, skipped = report.skipped, "study session ended");
        Ok(report)
    }

    fn print_header<W: Write>(
        &self,
        out: &mut W,
        concept: &Concept,
        position: usize,
        total: usize,
    ) -> io::Result<()> {
        writeln!(out)?;
        writeln!(out, "Concept {} of {}", position, total)?;
        writeln!(out, "=== {} ===", concept.name)?;
        writeln!(out)?;
        writeln!(out, "Source says:")?;
        writeln!(out, "  {}", concept.source_quote)?;
        writeln!(out)?;
        writeln!(out, "{}", concept.challenge())?;
        writeln!(
            out,
            "(finish with a blank line; 'skip' to skip, 'quit' to stop)"
        )
    }

    fn dialogue<R: BufRead, W: Write>(
        &self,
        concept: &Concept,
        input: &mut R,
        out: &mut W,
    ) -> Result<Step, SessionError> {
        let mut coach = Coach::new(
            self.judges[0],
            concept.clone(),
            &self.config.coach,
            &self.config.grading,
        );

        loop {
            let text = match prompt_answer(input, out)? {
                Answer::Quit => return Ok(Step::Quit),
                Answer::Skip => return Ok(Step::Skipped),
                Answer::Empty => {
                    writeln!(out, "Empty response. Type something or 'skip'.")?;
                    continue;
                }
                Answer::Text(text) => text,
            };

            match coach.respond(&text)? {
                Verdict::Followup { message } => {
                    writeln!(out)?;
                    writeln!(out, "Coach: {}", message)?;
                }
                Verdict::Final(verdict) => {
                    return Ok(Step::Graded(Graded {
                        text: coach.learner_text(),
                        score: verdict.score,
                        covered: verdict.strengths,
                        missed: verdict.holes,
                        feedback: verdict.feedback,
                    }));
                }
            }
        }
    }

    fn quick<R: BufRead, W: Write>(
        &self,
        concept: &Concept,
        input: &mut R,
        out: &mut W,
    ) -> Result<Step, SessionError> {
        loop {
            match prompt_answer(input, out)? {
                Answer::Quit => return Ok(Step::Quit),
                Answer::Skip => return Ok(Step::Skipped),
                Answer::Empty => {
                    writeln!(out, "Empty response. Type something or 'skip'.")?;
                }
                Answer::Text(text) => {
                    let evaluation =
                        evaluate_with_fallback(self.judges, concept, &text, &self.config.grading);
                    return Ok(Step::Graded(Graded {
                        text,
                        score: evaluation.score,
                        covered: evaluation.covered,
                        missed: evaluation.missed,
                        feedback: evaluation.feedback,
                    }));
                }
            }
        }
    }

    fn record<W: Write>(
        &self,
        concept: &Concept,
        graded: Graded,
        out: &mut W,
    ) -> Result<ReviewOutcome, SessionError> {
        let outcome = self.scheduler().record_review(&NewExplanation {
            concept_id: concept.id,
            text: graded.text,
            score: graded.score,
            covered: graded.covered.clone(),
            missed: graded.missed.clone(),
            feedback: graded.feedback.clone(),
        })?;

        let (got, lacked) = match self.mode {
            StudyMode::Dialogue => ("Strengths:", "Holes:"),
            StudyMode::Quick => ("You covered:", "You missed:"),
        };
        let max = self.config.grading.score_max;

        writeln!(out)?;
        writeln!(
            out,
            "Score: {}/{} {} {}",
            graded.score,
            max,
            score_bar(graded.score, max),
            score_label(graded.score)
        )?;
        if !graded.feedback.is_empty() {
            writeln!(out, "{}", graded.feedback)?;
        }
        if !graded.covered.is_empty() {
            writeln!(out, "{}", got)?;
            for point in &graded.covered {
                writeln!(out, "  + {}", point)?;
            }
        }
        if !graded.missed.is_empty() {
            writeln!(out, "{}", lacked)?;
            for point in &graded.missed {
                writeln!(out, "  - {}", point)?;
            }
        }
        writeln!(
            out,
            "Next review: {}",
            outcome.next_review_at.format("%Y-%m-%d %H:%M UTC")
        )?;

        Ok(outcome)
    }

    fn keep_going<R: BufRead, W: Write>(
        &self,
        input: &mut R,
        out: &mut W,
        remaining: usize,
    ) -> io::Result<bool> {
        writeln!(out)?;
        write!(out, "{} more due. Continue? (Enter/q) ", remaining)?;
        out.flush()?;

        let mut line = String::new();
        if input.read_line(&mut line)? == 0 {
            return Ok(false);
        }
        Ok(!matches!(
            line.trim().to_lowercase().as_str(),
            "q" | "quit" | "n" | "no"
        ))
    }
}

fn prompt_answer<R: BufRead, W: Write>(input: &mut R, out: &mut W) -> io::Result<Answer> {
    write!(out, "> ")?;
    out.flush()?;
    read_answer(input)
}

/// Read lines until a blank line. A lone `skip`/`quit` on the first line is
/// a command; end of input before any text is a quit.
fn read_answer<R: BufRead>(input: &mut R) -> io::Result<Answer> {
    let mut lines: Vec<String> = Vec::new();

    loop {
        let mut line = String::new();
        if input.read_line(&mut line)? == 0 {
            if lines.is_empty() {
                return Ok(Answer::Quit);
            }
            break;
        }

        let line = line.trim_end_matches(&['\n', '\r'][..]);
        if line.trim().is_empty() {
            break;
        }

        if lines.is_empty() {
            match line.trim().to_lowercase().as_str() {
                "skip" | "s" | "/skip" => return Ok(Answer::Skip),
                "quit" | "q" | "/quit" => return Ok(Answer::Quit),
                _ => {}
            }
        }
        lines.push(line.to_string());
    }

    if lines.is_empty() {
        Ok(Answer::Empty)
    } else {
        Ok(Answer::Text(lines.join("\n").trim().to_string()))
    }
}
