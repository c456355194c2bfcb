use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{GradingConfig, SchedulerConfig};
use crate::models::{Concept, NewExplanation, ReviewState, Summary};
use crate::store::{ConceptFilter, ProgressStore, StoreError};

const MILLIS_PER_DAY: f64 = 86_400_000.0;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("no concept with id {0}")]
    UnknownConcept(i64),

    #[error("concept {0} is skipped; unskip it before reviewing")]
    SkippedConcept(i64),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ReviewOutcome {
    pub next_review_at: DateTime<Utc>,
    pub state: ReviewState,
}

/// Apply one graded review to a scheduling record.
///
/// Pure: the same state, score and clock always produce the same result.
/// Scores outside the grading scale are clamped first.
pub fn next_state(
    state: &ReviewState,
    score: i32,
    now: DateTime<Utc>,
    config: &SchedulerConfig,
    grading: &GradingConfig,
) -> ReviewState {
    let score = grading.clamp(score);

    let (ease, interval, review_count) = if grading.passes(score) {
        let ease = (state.ease + config.ease_step * (f64::from(score) - grading.midpoint()))
            .clamp(config.min_ease, config.max_ease);
        let base = if state.interval > 0.0 {
            state.interval
        } else {
            config.initial_interval
        };
        (ease, base * ease, state.review_count + 1)
    } else {
        let ease = (state.ease - config.fail_ease_penalty).max(config.min_ease);
        (ease, config.initial_interval, 0)
    };

    let interval = interval.clamp(config.initial_interval, config.max_interval);

    ReviewState {
        ease,
        interval,
        due_at: now + days(interval),
        review_count,
        last_score: Some(score),
        last_reviewed_at: Some(now),
    }
}

fn days(interval: f64) -> Duration {
    Duration::milliseconds((interval * MILLIS_PER_DAY).round() as i64)
}

pub struct Scheduler<'a, S: ProgressStore> {
    store: &'a S,
    config: &'a SchedulerConfig,
    grading: &'a GradingConfig,
}

impl<'a, S: ProgressStore> Scheduler<'a, S> {
    pub fn new(store: &'a S, config: &'a SchedulerConfig, grading: &'a GradingConfig) -> Self {
        Self {
            store,
            config,
            grading,
        }
    }

    pub fn next_due_concept(&self) -> Result<Option<Concept>, SchedulerError> {
        self.next_due_concept_at(Utc::now())
    }

    pub fn next_due_concept_at(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<Concept>, SchedulerError> {
        Ok(self.all_due_at(now)?.into_iter().next())
    }

    pub fn all_due(&self) -> Result<Vec<Concept>, SchedulerError> {
        self.all_due_at(Utc::now())
    }

    /// Active concepts whose review is due, oldest due first.
    pub fn all_due_at(&self, now: DateTime<Utc>) -> Result<Vec<Concept>, SchedulerError> {
        let mut due = Vec::new();
        for concept in self.store.list_concepts(ConceptFilter::Active)? {
            let state = self.state_of(concept.id)?;
            if state.is_due(now) {
                due.push((state.due_at, concept));
            }
        }

        due.sort_by(|(a_due, a), (b_due, b)| a_due.cmp(b_due).then(a.id.cmp(&b.id)));
        Ok(due.into_iter().map(|(_, concept)| concept).collect())
    }

    pub fn summary(&self) -> Result<Summary, SchedulerError> {
        self.summary_at(Utc::now())
    }

    pub fn summary_at(&self, now: DateTime<Utc>) -> Result<Summary, SchedulerError> {
        let concepts = self.store.list_concepts(ConceptFilter::All)?;

        let mut summary = Summary {
            due_now: 0,
            total_concepts: concepts.len(),
            mastered: 0,
        };
        for concept in &concepts {
            let state = self.state_of(concept.id)?;
            if !concept.skipped && state.is_due(now) {
                summary.due_now += 1;
            }
            if state.is_mastered(self.config) {
                summary.mastered += 1;
            }
        }
        Ok(summary)
    }

    pub fn update_after_review(
        &self,
        concept_id: i64,
        score: i32,
    ) -> Result<ReviewOutcome, SchedulerError> {
        self.update_after_review_at(concept_id, score, Utc::now())
    }

    pub fn update_after_review_at(
        &self,
        concept_id: i64,
        score: i32,
        now: DateTime<Utc>,
    ) -> Result<ReviewOutcome, SchedulerError> {
        let state = self.reviewed_state(concept_id, score, now)?;
        self.store.put_review_state(concept_id, &state)?;
        Ok(self.persisted(concept_id, state))
    }

    /// Apply a review and store its explanation in the same write.
    pub fn record_review(&self, record: &NewExplanation) -> Result<ReviewOutcome, SchedulerError> {
        self.record_review_at(record, Utc::now())
    }

    pub fn record_review_at(
        &self,
        record: &NewExplanation,
        now: DateTime<Utc>,
    ) -> Result<ReviewOutcome, SchedulerError> {
        let concept_id = record.concept_id;
        let state = self.reviewed_state(concept_id, record.score, now)?;
        self.store.record_review(concept_id, &state, record)?;
        Ok(self.persisted(concept_id, state))
    }

    fn reviewed_state(
        &self,
        concept_id: i64,
        score: i32,
        now: DateTime<Utc>,
    ) -> Result<ReviewState, SchedulerError> {
        let concept = self
            .store
            .get_concept(concept_id)?
            .ok_or(SchedulerError::UnknownConcept(concept_id))?;
        if concept.skipped {
            return Err(SchedulerError::SkippedConcept(concept_id));
        }

        let previous = self.state_of(concept_id)?;
        let state = next_state(&previous, score, now, self.config, self.grading);
        debug!(
            concept_id,
            score,
            old_ease = previous.ease,
            new_ease = state.ease,
            "applied review"
        );
        Ok(state)
    }

    fn persisted(&self, concept_id: i64, state: ReviewState) -> ReviewOutcome {
        info!(
            concept_id,
            score = state.last_score,
            interval_days = state.interval,
            due_at = %state.due_at,
            "review persisted"
        );
        ReviewOutcome {
            next_review_at: state.due_at,
            state,
        }
    }

    fn state_of(&self, concept_id: i64) -> Result<ReviewState, SchedulerError> {
        self.store
            .get_review_state(concept_id)?
            .ok_or(SchedulerError::Store(StoreError::MissingReviewState(concept_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, 1, 12, 0, 0).unwrap()
    }

    fn fresh_state() -> ReviewState {
        ReviewState::initial(&SchedulerConfig::default(), now())
    }

    fn setup_db() -> Database {
        let db = Database::open(":memory:").expect("Failed to create in-memory database");
        db.init().expect("Failed to initialize database");
        db
    }

    fn add_due(db: &Database, name: &str, due_at: DateTime<Utc>) -> i64 {
        let mut state = fresh_state();
        state.due_at = due_at;
        db.add_concept(None, name, "quote", None, &state).unwrap()
    }

    mod update_rule_tests {
        use super::*;

        #[test]
        fn perfect_first_review_grows_interval() {
            let s = SchedulerConfig::default();
            let g = GradingConfig::default();
            let next = next_state(&fresh_state(), 5, now(), &s, &g);

            assert!((next.ease - 2.7).abs() < 1e-9);
            assert!((next.interval - 2.7).abs() < 1e-9);
            assert!(next.interval > s.initial_interval);
            assert_eq!(next.review_count, 1);
            assert_eq!(next.last_score, Some(5));
            assert_eq!(next.last_reviewed_at, Some(now()));
            assert_eq!(next.due_at, now() + Duration::milliseconds(233_280_000));
        }

        #[test]
        fn failing_review_resets_progress() {
            let s = SchedulerConfig::default();
            let g = GradingConfig::default();
            let reviewed = ReviewState {
                ease: 2.7,
                interval: 20.0,
                review_count: 4,
                ..fresh_state()
            };

            let next = next_state(&reviewed, 2, now(), &s, &g);
            assert_eq!(next.interval, s.initial_interval);
            assert_eq!(next.review_count, 0);
            assert!((next.ease - 2.5).abs() < 1e-9);
            assert_eq!(next.due_at, now() + Duration::days(1));
        }

        #[test]
        fn failing_review_floors_ease() {
            let s = SchedulerConfig::default();
            let g = GradingConfig::default();
            let weak = ReviewState {
                ease: 1.35,
                ..fresh_state()
            };
            let next = next_state(&weak, 1, now(), &s, &g);
            assert_eq!(next.ease, s.min_ease);
        }

        #[test]
        fn middling_pass_keeps_ease() {
            let s = SchedulerConfig::default();
            let g = GradingConfig::default();
            let next = next_state(&fresh_state(), 3, now(), &s, &g);
            assert!((next.ease - 2.5).abs() < 1e-9);
            assert!((next.interval - 2.5).abs() < 1e-9);
            assert_eq!(next.review_count, 1);
        }

        #[test]
        fn interval_never_exceeds_ceiling() {
            let s = SchedulerConfig::default();
            let g = GradingConfig::default();
            let mut state = fresh_state();
            for _ in 0..20 {
                state = next_state(&state, 5, now(), &s, &g);
                assert!(state.interval <= s.max_interval);
                assert!(state.interval >= s.initial_interval);
                assert!(state.ease <= s.max_ease);
            }
            assert_eq!(state.interval, s.max_interval);
        }

        #[test]
        fn longest_allowed_interval_stays_representable() {
            let s = SchedulerConfig {
                max_interval: crate::config::MAX_INTERVAL_CEILING,
                ..SchedulerConfig::default()
            };
            let g = GradingConfig::default();
            let mut state = fresh_state();
            for _ in 0..40 {
                state = next_state(&state, 5, now(), &s, &g);
            }
            assert_eq!(state.interval, s.max_interval);
            assert_eq!(state.due_at, now() + Duration::days(36_500));
        }

        #[test]
        fn ease_never_drops_below_floor() {
            let s = SchedulerConfig::default();
            let g = GradingConfig::default();
            let mut state = fresh_state();
            for score in [1, 2, 1, 3, 1, 1, 2, 1] {
                state = next_state(&state, score, now(), &s, &g);
                assert!(state.ease >= s.min_ease);
            }
        }

        #[test]
        fn non_positive_interval_uses_initial_base() {
            let s = SchedulerConfig::default();
            let g = GradingConfig::default();
            let broken = ReviewState {
                interval: 0.0,
                ..fresh_state()
            };
            let next = next_state(&broken, 3, now(), &s, &g);
            assert!((next.interval - 2.5).abs() < 1e-9);
        }

        #[test]
        fn out_of_range_scores_are_clamped() {
            let s = SchedulerConfig::default();
            let g = GradingConfig::default();
            assert_eq!(next_state(&fresh_state(), 11, now(), &s, &g).last_score, Some(5));
            assert_eq!(next_state(&fresh_state(), -3, now(), &s, &g).last_score, Some(1));
        }

        #[test]
        fn update_is_deterministic() {
            let s = SchedulerConfig::default();
            let g = GradingConfig::default();
            let a = next_state(&fresh_state(), 4, now(), &s, &g);
            let b = next_state(&fresh_state(), 4, now(), &s, &g);
            assert_eq!(a, b);
        }

        #[test]
        fn due_never_precedes_review() {
            let s = SchedulerConfig::default();
            let g = GradingConfig::default();
            for score in 1..=5 {
                let next = next_state(&fresh_state(), score, now(), &s, &g);
                assert!(next.due_at >= next.last_reviewed_at.unwrap());
            }
        }
    }

    mod due_selection_tests {
        use super::*;

        #[test]
        fn due_ordered_oldest_first() {
            let db = setup_db();
            let later = add_due(&db, "Later", now() - Duration::hours(1));
            let earliest = add_due(&db, "Earliest", now() - Duration::days(3));
            add_due(&db, "Future", now() + Duration::days(1));

            let s = SchedulerConfig::default();
            let g = GradingConfig::default();
            let scheduler = Scheduler::new(&db, &s, &g);

            let due = scheduler.all_due_at(now()).unwrap();
            assert_eq!(
                due.iter().map(|c| c.id).collect::<Vec<_>>(),
                vec![earliest, later]
            );

            let next = scheduler.next_due_concept_at(now()).unwrap().unwrap();
            assert_eq!(next.id, due[0].id);
        }

        #[test]
        fn nothing_due() {
            let db = setup_db();
            add_due(&db, "Future", now() + Duration::days(1));

            let s = SchedulerConfig::default();
            let g = GradingConfig::default();
            let scheduler = Scheduler::new(&db, &s, &g);

            assert!(scheduler.all_due_at(now()).unwrap().is_empty());
            assert!(scheduler.next_due_concept_at(now()).unwrap().is_none());
        }

        #[test]
        fn skipped_concepts_are_never_due() {
            let db = setup_db();
            let skipped = add_due(&db, "Skipped", now() - Duration::days(5));
            let active = add_due(&db, "Active", now() - Duration::days(1));
            db.set_skipped(skipped, true).unwrap();

            let s = SchedulerConfig::default();
            let g = GradingConfig::default();
            let scheduler = Scheduler::new(&db, &s, &g);

            let due = scheduler.all_due_at(now()).unwrap();
            assert_eq!(due.iter().map(|c| c.id).collect::<Vec<_>>(), vec![active]);

            db.set_skipped(skipped, false).unwrap();
            let next = scheduler.next_due_concept_at(now()).unwrap().unwrap();
            assert_eq!(next.id, skipped);
        }

        #[test]
        fn due_exactly_now_counts() {
            let db = setup_db();
            let id = add_due(&db, "Now", now());

            let s = SchedulerConfig::default();
            let g = GradingConfig::default();
            let scheduler = Scheduler::new(&db, &s, &g);
            assert_eq!(scheduler.next_due_concept_at(now()).unwrap().unwrap().id, id);
        }
    }

    mod summary_tests {
        use super::*;

        #[test]
        fn summary_counts_due_and_mastered() {
            let db = setup_db();
            add_due(&db, "Due", now() - Duration::days(1));
            let skipped = add_due(&db, "Skipped", now() - Duration::days(1));
            db.set_skipped(skipped, true).unwrap();

            let mastered = add_due(&db, "Mastered", now() + Duration::days(10));
            db.put_review_state(
                mastered,
                &ReviewState {
                    ease: 2.8,
                    interval: 10.0,
                    due_at: now() + Duration::days(10),
                    review_count: 3,
                    last_score: Some(5),
                    last_reviewed_at: Some(now()),
                },
            )
            .unwrap();

            let s = SchedulerConfig::default();
            let g = GradingConfig::default();
            let summary = Scheduler::new(&db, &s, &g).summary_at(now()).unwrap();

            assert_eq!(summary.total_concepts, 3);
            assert_eq!(summary.due_now, 1);
            assert_eq!(summary.mastered, 1);
        }

        #[test]
        fn summary_empty_store() {
            let db = setup_db();
            let s = SchedulerConfig::default();
            let g = GradingConfig::default();
            let summary = Scheduler::new(&db, &s, &g).summary_at(now()).unwrap();
            assert_eq!(summary.total_concepts, 0);
            assert_eq!(summary.due_now, 0);
            assert_eq!(summary.mastered, 0);
        }
    }

    mod persistence_tests {
        use super::*;

        #[test]
        fn update_persists_new_state() {
            let db = setup_db();
            let id = add_due(&db, "Attention", now());

            let s = SchedulerConfig::default();
            let g = GradingConfig::default();
            let scheduler = Scheduler::new(&db, &s, &g);

            let outcome = scheduler.update_after_review_at(id, 5, now()).unwrap();
            let stored = db.get_review_state(id).unwrap().unwrap();

            assert_eq!(stored, outcome.state);
            assert_eq!(outcome.next_review_at, stored.due_at);
            assert_eq!(stored.review_count, 1);
            assert!(scheduler.all_due_at(now()).unwrap().is_empty());
        }

        #[test]
        fn pass_then_fail_resets() {
            let db = setup_db();
            let id = add_due(&db, "Attention", now());

            let s = SchedulerConfig::default();
            let g = GradingConfig::default();
            let scheduler = Scheduler::new(&db, &s, &g);

            scheduler.update_after_review_at(id, 5, now()).unwrap();
            let outcome = scheduler.update_after_review_at(id, 2, now()).unwrap();
            assert_eq!(outcome.state.interval, s.initial_interval);
            assert_eq!(outcome.state.review_count, 0);
        }

        #[test]
        fn record_review_stores_state_and_explanation() {
            let db = setup_db();
            let id = add_due(&db, "Attention", now());

            let s = SchedulerConfig::default();
            let g = GradingConfig::default();
            let record = NewExplanation {
                concept_id: id,
                text: "tokens attend in parallel".to_string(),
                score: 4,
                covered: vec!["parallelism".to_string()],
                missed: vec![],
                feedback: "Good.".to_string(),
            };

            let outcome = Scheduler::new(&db, &s, &g)
                .record_review_at(&record, now())
                .unwrap();

            assert_eq!(db.get_review_state(id).unwrap().unwrap(), outcome.state);
            assert_eq!(outcome.state.last_score, Some(4));
            let history = db.list_explanations(id).unwrap();
            assert_eq!(history.len(), 1);
            assert_eq!(history[0].score, 4);
        }

        #[test]
        fn record_review_rejects_skipped_without_writing() {
            let db = setup_db();
            let id = add_due(&db, "Skipped", now());
            db.set_skipped(id, true).unwrap();

            let s = SchedulerConfig::default();
            let g = GradingConfig::default();
            let record = NewExplanation {
                concept_id: id,
                text: "x".to_string(),
                score: 5,
                covered: vec![],
                missed: vec![],
                feedback: String::new(),
            };
            let result = Scheduler::new(&db, &s, &g).record_review_at(&record, now());

            assert!(matches!(result, Err(SchedulerError::SkippedConcept(_))));
            assert!(db.list_explanations(id).unwrap().is_empty());
        }

        #[test]
        fn unknown_concept_rejected() {
            let db = setup_db();
            let s = SchedulerConfig::default();
            let g = GradingConfig::default();
            let result = Scheduler::new(&db, &s, &g).update_after_review_at(77, 4, now());
            assert!(matches!(result, Err(SchedulerError::UnknownConcept(77))));
        }

        #[test]
        fn skipped_concept_rejected() {
            let db = setup_db();
            let id = add_due(&db, "Skipped", now());
            db.set_skipped(id, true).unwrap();

            let s = SchedulerConfig::default();
            let g = GradingConfig::default();
            let before = db.get_review_state(id).unwrap().unwrap();
            let result = Scheduler::new(&db, &s, &g).update_after_review_at(id, 4, now());

            assert!(matches!(result, Err(SchedulerError::SkippedConcept(_))));
            assert_eq!(db.get_review_state(id).unwrap().unwrap(), before);
        }
    }
}
