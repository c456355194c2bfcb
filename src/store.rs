use thiserror::Error;

use crate::models::{Concept, NewExplanation, ReviewState};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("corrupt list column: {0}")]
    Json(#[from] serde_json::Error),

    #[error("concept {0} has no review state")]
    MissingReviewState(i64),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConceptFilter {
    #[default]
    All,
    Active,
    Skipped,
}

impl ConceptFilter {
    pub fn matches(&self, concept: &Concept) -> bool {
        match self {
            ConceptFilter::All => true,
            ConceptFilter::Active => !concept.skipped,
            ConceptFilter::Skipped => concept.skipped,
        }
    }
}

/// Durable progress the scheduler and study loop read and write through.
pub trait ProgressStore {
    fn get_concept(&self, concept_id: i64) -> StoreResult<Option<Concept>>;

    fn list_concepts(&self, filter: ConceptFilter) -> StoreResult<Vec<Concept>>;

    fn get_review_state(&self, concept_id: i64) -> StoreResult<Option<ReviewState>>;

    fn put_review_state(&self, concept_id: i64, state: &ReviewState) -> StoreResult<()>;

    fn append_explanation(&self, record: &NewExplanation) -> StoreResult<i64>;

    /// Save a concluded review: the new schedule and its explanation are
    /// written together or not at all.
    fn record_review(
        &self,
        concept_id: i64,
        state: &ReviewState,
        record: &NewExplanation,
    ) -> StoreResult<i64>;

    /// Returns false when no such concept exists.
    fn set_skipped(&self, concept_id: i64, skipped: bool) -> StoreResult<bool>;
}
