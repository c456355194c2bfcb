use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::path::Path;
use tracing::debug;

use crate::models::{
    Concept, ConceptWithState, Explanation, NewExplanation, ReviewState, Source, SourceWithCount,
};
use crate::store::{ConceptFilter, ProgressStore, StoreResult};

const CONCEPT_COLUMNS: &str = "c.id, c.source_id, c.name, c.source_quote, c.question, c.skipped, c.created_at";
const STATE_COLUMNS: &str =
    "r.ease, r.interval_days, r.due_at, r.review_count, r.last_score, r.last_reviewed_at";

pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self { conn })
    }

    pub fn init(&self) -> StoreResult<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sources (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                url TEXT NOT NULL UNIQUE,
                title TEXT NOT NULL,
                source_type TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS concepts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source_id INTEGER,
                name TEXT NOT NULL,
                source_quote TEXT NOT NULL,
                question TEXT,
                skipped INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                FOREIGN KEY (source_id) REFERENCES sources(id) ON DELETE SET NULL
            );

            CREATE TABLE IF NOT EXISTS review_state (
                concept_id INTEGER PRIMARY KEY,
                ease REAL NOT NULL,
                interval_days REAL NOT NULL,
                due_at TEXT NOT NULL,
                review_count INTEGER NOT NULL DEFAULT 0,
                last_score INTEGER,
                last_reviewed_at TEXT,
                FOREIGN KEY (concept_id) REFERENCES concepts(id) ON DELETE CASCADE
            );

            -- Append-only record of every concluded study turn
            CREATE TABLE IF NOT EXISTS explanations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                concept_id INTEGER NOT NULL,
                text TEXT NOT NULL,
                score INTEGER NOT NULL,
                covered TEXT NOT NULL DEFAULT '[]',
                missed TEXT NOT NULL DEFAULT '[]',
                feedback TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL,
                FOREIGN KEY (concept_id) REFERENCES concepts(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_concepts_source ON concepts(source_id);
            CREATE INDEX IF NOT EXISTS idx_concepts_skipped ON concepts(skipped);
            CREATE INDEX IF NOT EXISTS idx_review_state_due ON review_state(due_at);
            CREATE INDEX IF NOT EXISTS idx_explanations_concept ON explanations(concept_id);
            "#,
        )?;
        Ok(())
    }

    // Source operations
    pub fn add_source(&self, url: &str, title: &str, source_type: &str) -> StoreResult<i64> {
        self.conn.execute(
            "INSERT INTO sources (url, title, source_type, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![url, title, source_type, format_ts(Utc::now())],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_source_by_url(&self, url: &str) -> StoreResult<Option<Source>> {
        let source = self
            .conn
            .query_row(
                "SELECT id, url, title, source_type, created_at FROM sources WHERE url = ?1",
                params![url],
                source_from_row,
            )
            .optional()?;
        Ok(source)
    }

    pub fn get_source(&self, id: i64) -> StoreResult<Option<Source>> {
        let source = self
            .conn
            .query_row(
                "SELECT id, url, title, source_type, created_at FROM sources WHERE id = ?1",
                params![id],
                source_from_row,
            )
            .optional()?;
        Ok(source)
    }

    pub fn list_sources(&self) -> StoreResult<Vec<SourceWithCount>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT s.id, s.url, s.title, s.source_type, s.created_at, COUNT(c.id)
            FROM sources s
            LEFT JOIN concepts c ON c.source_id = s.id
            GROUP BY s.id
            ORDER BY s.created_at, s.id
            "#,
        )?;

        let rows = stmt.query_map([], |row| {
            Ok(SourceWithCount {
                source: source_from_row(row)?,
                concept_count: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // Concept operations
    pub fn add_concept(
        &self,
        source_id: Option<i64>,
        name: &str,
        source_quote: &str,
        question: Option<&str>,
        initial: &ReviewState,
    ) -> StoreResult<i64> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            r#"
            INSERT INTO concepts (source_id, name, source_quote, question, skipped, created_at)
            VALUES (?1, ?2, ?3, ?4, 0, ?5)
            "#,
            params![source_id, name, source_quote, question, format_ts(Utc::now())],
        )?;
        let concept_id = tx.last_insert_rowid();
        write_review_state(&tx, concept_id, initial)?;
        tx.commit()?;

        debug!(concept_id, name, "added concept");
        Ok(concept_id)
    }

    pub fn list_concepts_with_state(
        &self,
        filter: ConceptFilter,
    ) -> StoreResult<Vec<ConceptWithState>> {
        let query = format!(
            r#"
            SELECT {CONCEPT_COLUMNS}, {STATE_COLUMNS}
            FROM concepts c
            JOIN review_state r ON r.concept_id = c.id
            {}
            ORDER BY c.source_id, c.id
            "#,
            filter_clause(filter)
        );

        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map([], |row| {
            Ok(ConceptWithState {
                concept: concept_from_row(row)?,
                state: review_state_from_row(row, 7)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn list_explanations(&self, concept_id: i64) -> StoreResult<Vec<Explanation>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, concept_id, text, score, covered, missed, feedback, created_at
            FROM explanations
            WHERE concept_id = ?1
            ORDER BY created_at DESC, id DESC
            "#,
        )?;

        let rows = stmt.query_map(params![concept_id], |row| {
            Ok(Explanation {
                id: row.get(0)?,
                concept_id: row.get(1)?,
                text: row.get(2)?,
                score: row.get(3)?,
                covered: list_column(row, 4)?,
                missed: list_column(row, 5)?,
                feedback: row.get(6)?,
                created_at: ts_column(row, 7)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn get_stats(&self) -> StoreResult<Stats> {
        let total_sources: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM sources", [], |row| row.get(0))?;

        let total_concepts: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM concepts", [], |row| row.get(0))?;

        let skipped_concepts: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM concepts WHERE skipped = 1",
            [],
            |row| row.get(0),
        )?;

        let total_reviews: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM explanations", [], |row| row.get(0))?;

        let avg_score: f64 = self.conn.query_row(
            "SELECT COALESCE(AVG(score), 0.0) FROM explanations",
            [],
            |row| row.get(0),
        )?;

        Ok(Stats {
            total_sources,
            total_concepts,
            skipped_concepts,
            total_reviews,
            avg_score: (avg_score * 10.0).round() / 10.0,
        })
    }
}

impl ProgressStore for Database {
    fn get_concept(&self, concept_id: i64) -> StoreResult<Option<Concept>> {
        let query = format!("SELECT {CONCEPT_COLUMNS} FROM concepts c WHERE c.id = ?1");
        let concept = self
            .conn
            .query_row(&query, params![concept_id], concept_from_row)
            .optional()?;
        Ok(concept)
    }

    fn list_concepts(&self, filter: ConceptFilter) -> StoreResult<Vec<Concept>> {
        let query = format!(
            "SELECT {CONCEPT_COLUMNS} FROM concepts c {} ORDER BY c.id",
            filter_clause(filter)
        );
        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map([], concept_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn get_review_state(&self, concept_id: i64) -> StoreResult<Option<ReviewState>> {
        let query = format!("SELECT {STATE_COLUMNS} FROM review_state r WHERE r.concept_id = ?1");
        let state = self
            .conn
            .query_row(&query, params![concept_id], |row| {
                review_state_from_row(row, 0)
            })
            .optional()?;
        Ok(state)
    }

    fn put_review_state(&self, concept_id: i64, state: &ReviewState) -> StoreResult<()> {
        write_review_state(&self.conn, concept_id, state)?;
        Ok(())
    }

    fn append_explanation(&self, record: &NewExplanation) -> StoreResult<i64> {
        insert_explanation(&self.conn, record)
    }

    fn record_review(
        &self,
        concept_id: i64,
        state: &ReviewState,
        record: &NewExplanation,
    ) -> StoreResult<i64> {
        let tx = self.conn.unchecked_transaction()?;
        write_review_state(&tx, concept_id, state)?;
        let explanation_id = insert_explanation(&tx, record)?;
        tx.commit()?;

        debug!(concept_id, explanation_id, "recorded review");
        Ok(explanation_id)
    }

    fn set_skipped(&self, concept_id: i64, skipped: bool) -> StoreResult<bool> {
        let rows = self.conn.execute(
            "UPDATE concepts SET skipped = ?1 WHERE id = ?2",
            params![skipped, concept_id],
        )?;
        Ok(rows > 0)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    pub total_sources: i64,
    pub total_concepts: i64,
    pub skipped_concepts: i64,
    pub total_reviews: i64,
    pub avg_score: f64,
}

// Fixed width so stored timestamps sort lexically and round-trip exactly
fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|dt| dt.with_timezone(&Utc))
}

fn ts_column(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_ts(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn opt_ts_column(row: &Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|r| {
        parse_ts(&r)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

fn list_column(row: &Row, idx: usize) -> rusqlite::Result<Vec<String>> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn filter_clause(filter: ConceptFilter) -> &'static str {
    match filter {
        ConceptFilter::All => "",
        ConceptFilter::Active => "WHERE c.skipped = 0",
        ConceptFilter::Skipped => "WHERE c.skipped = 1",
    }
}

fn source_from_row(row: &Row) -> rusqlite::Result<Source> {
    Ok(Source {
        id: row.get(0)?,
        url: row.get(1)?,
        title: row.get(2)?,
        source_type: row.get(3)?,
        created_at: ts_column(row, 4)?,
    })
}

fn concept_from_row(row: &Row) -> rusqlite::Result<Concept> {
    Ok(Concept {
        id: row.get(0)?,
        source_id: row.get(1)?,
        name: row.get(2)?,
        source_quote: row.get(3)?,
        question: row.get(4)?,
        skipped: row.get(5)?,
        created_at: ts_column(row, 6)?,
    })
}

fn review_state_from_row(row: &Row, offset: usize) -> rusqlite::Result<ReviewState> {
    Ok(ReviewState {
        ease: row.get(offset)?,
        interval: row.get(offset + 1)?,
        due_at: ts_column(row, offset + 2)?,
        review_count: row.get(offset + 3)?,
        last_score: row.get(offset + 4)?,
        last_reviewed_at: opt_ts_column(row, offset + 5)?,
    })
}

fn insert_explanation(conn: &Connection, record: &NewExplanation) -> StoreResult<i64> {
    conn.execute(
        r#"
        INSERT INTO explanations (concept_id, text, score, covered, missed, feedback, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
        params![
            record.concept_id,
            record.text,
            record.score,
            serde_json::to_string(&record.covered)?,
            serde_json::to_string(&record.missed)?,
            record.feedback,
            format_ts(Utc::now()),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn write_review_state(
    conn: &Connection,
    concept_id: i64,
    state: &ReviewState,
) -> rusqlite::Result<usize> {
    conn.execute(
        r#"
        INSERT INTO review_state
            (concept_id, ease, interval_days, due_at, review_count, last_score, last_reviewed_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ON CONFLICT(concept_id) DO UPDATE SET
            ease = excluded.ease,
            interval_days = excluded.interval_days,
            due_at = excluded.due_at,
            review_count = excluded.review_count,
            last_score = excluded.last_score,
            last_reviewed_at = excluded.last_reviewed_at
        "#,
        params![
            concept_id,
            state.ease,
            state.interval,
            format_ts(state.due_at),
            state.review_count,
            state.last_score,
            state.last_reviewed_at.map(format_ts),
        ],
    )
}
