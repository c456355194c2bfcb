use std::collections::BTreeMap;
use std::error::Error;
use std::io::{self, BufRead, Write};
use std::path::Path;

use serde::Serialize;
use serde_json::json;

use crate::config::Config;
use crate::db::Database;
use crate::judge::{judges_from_config, Judge};
use crate::models::{Concept, ConceptWithState, JsonOutput, ReviewState};
use crate::scheduler::Scheduler;
use crate::session::{SessionError, SessionReport, StudyMode, StudySession};
use crate::store::{ConceptFilter, ProgressStore};

pub type CommandResult = Result<(), Box<dyn Error>>;

const DEFAULT_SOURCE_KIND: &str = "article";

/// Everything a command needs: the store, the configuration, and whether
/// output should be the JSON envelope instead of text.
pub struct Context<'a> {
    pub db: &'a Database,
    pub config: &'a Config,
    pub json: bool,
}

impl<'a> Context<'a> {
    pub fn new(db: &'a Database, config: &'a Config, json: bool) -> Self {
        Self { db, config, json }
    }

    fn scheduler(&self) -> Scheduler<'a, Database> {
        Scheduler::new(self.db, &self.config.scheduler, &self.config.grading)
    }

    pub fn init<W: Write>(&self, db_path: &Path, out: &mut W) -> CommandResult {
        self.db.init()?;
        if self.json {
            emit(out, json!({ "db_path": db_path.display().to_string() }))
        } else {
            writeln!(out, "Database initialized at: {}", db_path.display())?;
            Ok(())
        }
    }

    pub fn source_add<W: Write>(
        &self,
        url: &str,
        title: &str,
        kind: Option<&str>,
        out: &mut W,
    ) -> CommandResult {
        if let Some(existing) = self.db.get_source_by_url(url)? {
            if self.json {
                return emit(
                    out,
                    json!({ "id": existing.id, "title": existing.title, "existing": true }),
                );
            }
            writeln!(
                out,
                "Already added: '{}' (ID: {})",
                existing.title, existing.id
            )?;
            return Ok(());
        }

        let kind = kind.unwrap_or(DEFAULT_SOURCE_KIND);
        let id = self.db.add_source(url, title, kind)?;
        if self.json {
            emit(out, json!({ "id": id, "title": title, "existing": false }))
        } else {
            writeln!(out, "Added source '{}' with ID: {}", title, id)?;
            Ok(())
        }
    }

    pub fn source_list<W: Write>(&self, out: &mut W) -> CommandResult {
        let sources = self.db.list_sources()?;
        if self.json {
            return emit(out, &sources);
        }

        if sources.is_empty() {
            writeln!(out, "No sources yet.")?;
            return Ok(());
        }

        writeln!(out, "{:<5} {:<40} {:<10} CONCEPTS", "ID", "TITLE", "KIND")?;
        writeln!(out, "{}", "-".repeat(70))?;
        for s in sources {
            writeln!(
                out,
                "{:<5} {:<40} {:<10} {}",
                s.source.id,
                truncate(&s.source.title, 38),
                s.source.source_type,
                s.concept_count
            )?;
            writeln!(out, "      {}", s.source.url)?;
        }
        Ok(())
    }

    pub fn concept_add<W: Write>(
        &self,
        name: &str,
        quote: &str,
        question: Option<&str>,
        source_id: Option<i64>,
        out: &mut W,
    ) -> CommandResult {
        let name = name.trim();
        let quote = quote.trim();
        if name.is_empty() || quote.is_empty() {
            return Err("concept name and source quote cannot be empty".into());
        }
        if let Some(id) = source_id {
            if self.db.get_source(id)?.is_none() {
                return Err(format!("source {} not found", id).into());
            }
        }

        let initial = ReviewState::initial(&self.config.scheduler, chrono::Utc::now());
        let question = question.map(str::trim).filter(|q| !q.is_empty());
        let id = self
            .db
            .add_concept(source_id, name, quote, question, &initial)?;

        if self.json {
            emit(out, json!({ "id": id, "name": name }))
        } else {
            writeln!(out, "Added concept '{}' with ID: {}", name, id)?;
            Ok(())
        }
    }

    pub fn concept_list<W: Write>(&self, out: &mut W) -> CommandResult {
        let concepts = self.db.list_concepts_with_state(ConceptFilter::All)?;
        if self.json {
            return emit(out, &concepts);
        }

        if concepts.is_empty() {
            writeln!(out, "No concepts yet. Add one with `learnlock concept add`.")?;
            return Ok(());
        }

        let titles: BTreeMap<i64, String> = self
            .db
            .list_sources()?
            .into_iter()
            .map(|s| (s.source.id, s.source.title))
            .collect();

        let mut groups: BTreeMap<Option<i64>, Vec<&ConceptWithState>> = BTreeMap::new();
        for c in &concepts {
            groups.entry(c.concept.source_id).or_default().push(c);
        }

        for (source_id, members) in groups {
            let heading = source_id
                .and_then(|id| titles.get(&id).cloned())
                .unwrap_or_else(|| "(no source)".to_string());
            writeln!(out)?;
            writeln!(out, "{}", heading)?;
            for c in members {
                writeln!(
                    out,
                    "  {:<4} {} {}",
                    c.concept.id,
                    c.concept.name,
                    progress_note(c, self.config.grading.score_max)
                )?;
            }
        }
        Ok(())
    }

    pub fn concept_show<W: Write>(&self, id: i64, out: &mut W) -> CommandResult {
        let Some(concept) = self.db.get_concept(id)? else {
            return not_found(self.json, out, "Concept not found");
        };
        let state = self.db.get_review_state(id)?;
        let history = self.db.list_explanations(id)?;

        if self.json {
            return emit(
                out,
                json!({ "concept": concept, "review_state": state, "explanations": history }),
            );
        }

        writeln!(out, "Concept: {}", concept.name)?;
        writeln!(out, "ID: {}", concept.id)?;
        if let Some(source_id) = concept.source_id {
            if let Some(source) = self.db.get_source(source_id)? {
                writeln!(out, "Source: {} ({})", source.title, source.url)?;
            }
        }
        writeln!(out, "Challenge: {}", concept.challenge())?;
        writeln!(out, "Source says: {}", concept.source_quote)?;
        if concept.skipped {
            writeln!(out, "Status: skipped")?;
        }

        if let Some(s) = state {
            writeln!(out)?;
            writeln!(out, "--- Schedule ---")?;
            writeln!(out, "Ease: {:.2}", s.ease)?;
            writeln!(out, "Interval: {:.1} days", s.interval)?;
            writeln!(out, "Reviews: {}", s.review_count)?;
            if let Some(score) = s.last_score {
                writeln!(out, "Last score: {}/{}", score, self.config.grading.score_max)?;
            }
            if let Some(last) = s.last_reviewed_at {
                writeln!(out, "Last reviewed: {}", last.format("%Y-%m-%d %H:%M UTC"))?;
            }
            writeln!(out, "Next review: {}", s.due_at.format("%Y-%m-%d %H:%M UTC"))?;
        }

        if !history.is_empty() {
            writeln!(out)?;
            writeln!(out, "--- History ---")?;
            for e in history {
                writeln!(
                    out,
                    "{}  {}/{}  {}",
                    e.created_at.format("%Y-%m-%d"),
                    e.score,
                    self.config.grading.score_max,
                    truncate(&e.feedback, 60)
                )?;
            }
        }
        Ok(())
    }

    pub fn due<W: Write>(&self, out: &mut W) -> CommandResult {
        let due = self.scheduler().all_due()?;
        if self.json {
            return emit(out, &due);
        }

        if due.is_empty() {
            writeln!(out, "Nothing due! All caught up.")?;
            return Ok(());
        }

        writeln!(out, "{} concepts due for review:", due.len())?;
        writeln!(out)?;
        for c in &due {
            writeln!(out, "  {:<4} {}", c.id, c.name)?;
        }
        writeln!(out)?;
        writeln!(out, "Run `learnlock study` to start reviewing.")?;
        Ok(())
    }

    pub fn stats<W: Write>(&self, out: &mut W) -> CommandResult {
        let stats = self.db.get_stats()?;
        let summary = self.scheduler().summary()?;

        if self.json {
            return emit(
                out,
                json!({
                    "total_sources": stats.total_sources,
                    "total_concepts": stats.total_concepts,
                    "due_now": summary.due_now,
                    "total_reviews": stats.total_reviews,
                    "avg_score": stats.avg_score,
                    "mastered": summary.mastered,
                    "skipped": stats.skipped_concepts
                }),
            );
        }

        writeln!(out, "=== Learning Statistics ===")?;
        writeln!(out, "Sources: {}", stats.total_sources)?;
        writeln!(out, "Concepts: {}", stats.total_concepts)?;
        writeln!(out, "Due now: {}", summary.due_now)?;
        writeln!(out, "Reviews: {}", stats.total_reviews)?;
        writeln!(
            out,
            "Average score: {:.1}/{}",
            stats.avg_score, self.config.grading.score_max
        )?;
        writeln!(out, "Mastered: {}", summary.mastered)?;
        if stats.skipped_concepts > 0 {
            writeln!(out, "Skipped: {}", stats.skipped_concepts)?;
        }
        Ok(())
    }

    pub fn skip<W: Write>(&self, name: &str, out: &mut W) -> CommandResult {
        self.toggle_skip(name, true, out)
    }

    /// Without a name, lists what is currently skipped.
    pub fn unskip<W: Write>(&self, name: Option<&str>, out: &mut W) -> CommandResult {
        match name.map(str::trim).filter(|n| !n.is_empty()) {
            Some(name) => self.toggle_skip(name, false, out),
            None => {
                let skipped = self.db.list_concepts(ConceptFilter::Skipped)?;
                if self.json {
                    return emit(out, &skipped);
                }
                if skipped.is_empty() {
                    writeln!(out, "No skipped concepts.")?;
                } else {
                    writeln!(out, "Skipped concepts:")?;
                    for c in &skipped {
                        writeln!(out, "  {}", c.name)?;
                    }
                    writeln!(out, "Usage: unskip <name>")?;
                }
                Ok(())
            }
        }
    }

    fn toggle_skip<W: Write>(&self, name: &str, skip: bool, out: &mut W) -> CommandResult {
        let name = name.trim();
        let verb = if skip { "skip" } else { "unskip" };
        if name.is_empty() {
            return not_found(self.json, out, &format!("Usage: {} <concept-name>", verb));
        }

        let pool = if skip {
            ConceptFilter::Active
        } else {
            ConceptFilter::Skipped
        };
        let candidates = self.db.list_concepts(pool)?;
        let matches = match_by_name(&candidates, name);

        match matches.as_slice() {
            [] => {
                let what = if skip { "concept" } else { "skipped concept" };
                not_found(self.json, out, &format!("No {} matching '{}'", what, name))
            }
            [only] => {
                self.db.set_skipped(only.id, skip)?;
                if self.json {
                    emit(out, json!({ "id": only.id, "name": only.name, "skipped": skip }))
                } else {
                    let done = if skip { "Skipped" } else { "Restored" };
                    writeln!(out, "{}: {}", done, only.name)?;
                    Ok(())
                }
            }
            many => {
                if self.json {
                    let names: Vec<&str> = many.iter().map(|c| c.name.as_str()).collect();
                    return emit_err(
                        out,
                        format!("Multiple matches: {}. Be more specific.", names.join(", ")),
                    );
                }
                writeln!(out, "Multiple matches:")?;
                for c in many {
                    writeln!(out, "  {}", c.name)?;
                }
                writeln!(out, "Be more specific.")?;
                Ok(())
            }
        }
    }

    pub fn show_config<W: Write>(&self, out: &mut W) -> CommandResult {
        let judge = &self.config.judge;
        if self.json {
            let config = serde_json::to_value(self.config)?;
            return emit(
                out,
                json!({
                    "config": config,
                    "gemini_api_key_set": judge.gemini_api_key.is_some(),
                    "groq_api_key_set": judge.groq_api_key.is_some()
                }),
            );
        }

        let set = |present: bool| if present { "set" } else { "not set" };
        let s = &self.config.scheduler;

        writeln!(out, "Configuration:")?;
        writeln!(out)?;
        writeln!(out, "  Data directory: {}", self.config.data_dir.display())?;
        writeln!(out, "  Database: {}", self.config.db_path.display())?;
        writeln!(out)?;
        writeln!(out, "  Gemini model: {}", judge.gemini_model)?;
        writeln!(out, "  Groq model: {}", judge.groq_model)?;
        writeln!(out, "  GEMINI_API_KEY: {}", set(judge.gemini_api_key.is_some()))?;
        writeln!(out, "  GROQ_API_KEY: {}", set(judge.groq_api_key.is_some()))?;
        writeln!(out)?;
        writeln!(
            out,
            "  Ease: initial {}, range {}-{}, step {}, fail penalty {}",
            s.initial_ease, s.min_ease, s.max_ease, s.ease_step, s.fail_ease_penalty
        )?;
        writeln!(
            out,
            "  Interval: initial {} days, max {} days",
            s.initial_interval, s.max_interval
        )?;
        writeln!(
            out,
            "  Mastery: ease >= {} and {} reviews",
            s.mastery_min_ease, s.mastery_min_reviews
        )?;
        writeln!(
            out,
            "  Pass threshold: {}, fallback score: {}, max turns: {}",
            self.config.grading.pass_threshold,
            self.config.grading.fallback_score,
            self.config.coach.max_turns
        )?;
        Ok(())
    }

    pub fn study<R: BufRead, W: Write>(
        &self,
        quick: bool,
        input: &mut R,
        out: &mut W,
    ) -> CommandResult {
        let judges = judges_from_config(&self.config.judge, &self.config.grading)?;
        let refs: Vec<&dyn Judge> = judges.iter().map(|j| j as &dyn Judge).collect();
        self.study_with(&refs, quick, input, out)
    }

    pub fn study_with<R: BufRead, W: Write>(
        &self,
        judges: &[&dyn Judge],
        quick: bool,
        input: &mut R,
        out: &mut W,
    ) -> CommandResult {
        if self.json {
            // stdout carries only the JSON report; the dialogue goes to stderr
            let report = self.run_session(judges, quick, input, &mut io::stderr())?;
            emit(out, report)
        } else {
            let report = self.run_session(judges, quick, input, out)?;
            writeln!(
                out,
                "Studied {}, skipped {}.",
                report.studied, report.skipped
            )?;
            Ok(())
        }
    }

    fn run_session<R: BufRead, W: Write>(
        &self,
        judges: &[&dyn Judge],
        quick: bool,
        input: &mut R,
        out: &mut W,
    ) -> Result<SessionReport, SessionError> {
        let mode = if quick {
            StudyMode::Quick
        } else {
            StudyMode::Dialogue
        };
        StudySession::new(self.db, self.config, judges, mode).run(input, out)
    }
}

fn progress_note(c: &ConceptWithState, max: i32) -> String {
    let mut note = if c.state.review_count == 0 {
        "(new)".to_string()
    } else {
        match c.state.last_score {
            Some(score) => format!("({}x, last: {}/{})", c.state.review_count, score, max),
            None => format!("({}x)", c.state.review_count),
        }
    };
    if c.concept.skipped {
        note.push_str(" [skipped]");
    }
    note
}

/// Case-insensitive substring match on concept names.
pub fn match_by_name<'c>(concepts: &'c [Concept], needle: &str) -> Vec<&'c Concept> {
    let needle = needle.to_lowercase();
    concepts
        .iter()
        .filter(|c| c.name.to_lowercase().contains(&needle))
        .collect()
}

fn emit<T: Serialize, W: Write>(out: &mut W, data: T) -> CommandResult {
    writeln!(out, "{}", serde_json::to_string(&JsonOutput::ok(data))?)?;
    Ok(())
}

fn emit_err<W: Write>(out: &mut W, msg: impl Into<String>) -> CommandResult {
    writeln!(out, "{}", serde_json::to_string(&JsonOutput::<()>::err(msg))?)?;
    Ok(())
}

fn not_found<W: Write>(json: bool, out: &mut W, msg: &str) -> CommandResult {
    if json {
        emit_err(out, msg)
    } else {
        writeln!(out, "{}.", msg.trim_end_matches('.'))?;
        Ok(())
    }
}

pub fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
