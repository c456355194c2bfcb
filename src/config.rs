use std::path::PathBuf;
use std::str::FromStr;

use serde::Serialize;
use thiserror::Error;
use tracing::warn;

pub const SCORE_MIN: i32 = 1;
pub const SCORE_MAX: i32 = 5;

const DEFAULT_DB_NAME: &str = "data.db";

/// Longest review interval accepted, in days. Keeps due dates representable.
pub const MAX_INTERVAL_CEILING: f64 = 36_500.0;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Knobs for the SM-2 style update rule and the mastery thresholds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchedulerConfig {
    pub initial_ease: f64,
    pub initial_interval: f64,
    pub min_ease: f64,
    pub max_ease: f64,
    pub max_interval: f64,
    /// Ease change per point of distance from the middle of the score scale.
    pub ease_step: f64,
    pub fail_ease_penalty: f64,
    pub mastery_min_ease: f64,
    pub mastery_min_reviews: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            initial_ease: 2.5,
            initial_interval: 1.0,
            min_ease: 1.3,
            max_ease: 3.0,
            max_interval: 180.0,
            ease_step: 0.1,
            fail_ease_penalty: 0.2,
            mastery_min_ease: 2.5,
            mastery_min_reviews: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GradingConfig {
    pub score_min: i32,
    pub score_max: i32,
    pub pass_threshold: i32,
    pub fallback_score: i32,
}

impl GradingConfig {
    pub fn clamp(&self, score: i32) -> i32 {
        score.clamp(self.score_min, self.score_max)
    }

    pub fn midpoint(&self) -> f64 {
        f64::from(self.score_min + self.score_max) / 2.0
    }

    pub fn passes(&self, score: i32) -> bool {
        score >= self.pass_threshold
    }
}

impl Default for GradingConfig {
    fn default() -> Self {
        Self {
            score_min: SCORE_MIN,
            score_max: SCORE_MAX,
            pass_threshold: 3,
            fallback_score: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoachConfig {
    pub max_turns: u32,
}

impl Default for CoachConfig {
    fn default() -> Self {
        Self { max_turns: 3 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JudgeConfig {
    pub gemini_model: String,
    pub groq_model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    #[serde(skip)]
    pub gemini_api_key: Option<String>,
    #[serde(skip)]
    pub groq_api_key: Option<String>,
}

impl JudgeConfig {
    pub fn has_any_key(&self) -> bool {
        self.gemini_api_key.is_some() || self.groq_api_key.is_some()
    }
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            gemini_model: "gemini-2.5-flash".to_string(),
            groq_model: "openai/gpt-oss-120b".to_string(),
            max_tokens: 2000,
            temperature: 0.3,
            gemini_api_key: None,
            groq_api_key: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Config {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub scheduler: SchedulerConfig,
    pub grading: GradingConfig,
    pub coach: CoachConfig,
    pub judge: JudgeConfig,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            db_path: data_dir.join(DEFAULT_DB_NAME),
            data_dir,
            scheduler: SchedulerConfig::default(),
            grading: GradingConfig::default(),
            coach: CoachConfig::default(),
            judge: JudgeConfig::default(),
        }
    }
}

impl Config {
    /// Build the configuration from `LEARNLOCK_*` variables, falling back to
    /// defaults for anything unset or unparseable.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();

        let data_dir = lookup("LEARNLOCK_DATA_DIR")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);
        let db_path = lookup("LEARNLOCK_DB")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join(DEFAULT_DB_NAME));

        let s = defaults.scheduler;
        let scheduler = SchedulerConfig {
            initial_ease: parse_or(&lookup, "LEARNLOCK_SM2_INITIAL_EASE", s.initial_ease),
            initial_interval: parse_or(
                &lookup,
                "LEARNLOCK_SM2_INITIAL_INTERVAL",
                s.initial_interval,
            ),
            min_ease: parse_or(&lookup, "LEARNLOCK_SM2_MIN_EASE", s.min_ease),
            max_ease: parse_or(&lookup, "LEARNLOCK_SM2_MAX_EASE", s.max_ease),
            max_interval: parse_or(&lookup, "LEARNLOCK_SM2_MAX_INTERVAL", s.max_interval),
            ease_step: parse_or(&lookup, "LEARNLOCK_SM2_EASE_STEP", s.ease_step),
            fail_ease_penalty: parse_or(
                &lookup,
                "LEARNLOCK_SM2_FAIL_PENALTY",
                s.fail_ease_penalty,
            ),
            mastery_min_ease: parse_or(&lookup, "LEARNLOCK_MASTERY_MIN_EASE", s.mastery_min_ease),
            mastery_min_reviews: parse_or(
                &lookup,
                "LEARNLOCK_MASTERY_MIN_REVIEWS",
                s.mastery_min_reviews,
            ),
        };

        let g = defaults.grading;
        let grading = GradingConfig {
            pass_threshold: parse_or(&lookup, "LEARNLOCK_SCORE_PASS_THRESHOLD", g.pass_threshold),
            fallback_score: parse_or(
                &lookup,
                "LEARNLOCK_DEFAULT_FALLBACK_SCORE",
                g.fallback_score,
            ),
            ..g
        };

        let coach = CoachConfig {
            max_turns: parse_or(&lookup, "LEARNLOCK_MAX_TURNS", defaults.coach.max_turns),
        };

        let j = defaults.judge;
        let judge = JudgeConfig {
            gemini_model: lookup("LEARNLOCK_GEMINI_MODEL").unwrap_or(j.gemini_model),
            groq_model: lookup("LEARNLOCK_GROQ_MODEL").unwrap_or(j.groq_model),
            max_tokens: parse_or(&lookup, "LEARNLOCK_LLM_MAX_TOKENS", j.max_tokens),
            temperature: parse_or(&lookup, "LEARNLOCK_LLM_TEMPERATURE", j.temperature),
            gemini_api_key: lookup("GEMINI_API_KEY").filter(|k| !k.trim().is_empty()),
            groq_api_key: lookup("GROQ_API_KEY").filter(|k| !k.trim().is_empty()),
        };

        let config = Config {
            data_dir,
            db_path,
            scheduler,
            grading,
            coach,
            judge,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.scheduler;
        let g = &self.grading;

        let knobs = [
            ("initial ease", s.initial_ease),
            ("initial interval", s.initial_interval),
            ("minimum ease", s.min_ease),
            ("maximum ease", s.max_ease),
            ("max interval", s.max_interval),
            ("ease step", s.ease_step),
            ("fail penalty", s.fail_ease_penalty),
            ("mastery ease", s.mastery_min_ease),
            ("temperature", f64::from(self.judge.temperature)),
        ];
        if let Some((name, _)) = knobs.iter().find(|(_, v)| !v.is_finite()) {
            return Err(ConfigError::Invalid(format!("{} must be a finite number", name)));
        }

        if !(s.initial_interval > 0.0) {
            return Err(invalid("initial interval must be positive"));
        }
        if s.max_interval < s.initial_interval {
            return Err(invalid("max interval is below the initial interval"));
        }
        if s.max_interval > MAX_INTERVAL_CEILING {
            return Err(ConfigError::Invalid(format!(
                "max interval cannot exceed {} days",
                MAX_INTERVAL_CEILING
            )));
        }
        if !(s.min_ease > 0.0) {
            return Err(invalid("minimum ease must be positive"));
        }
        if s.min_ease > s.initial_ease || s.initial_ease > s.max_ease {
            return Err(invalid("initial ease must lie between the minimum and maximum ease"));
        }
        if s.ease_step < 0.0 || s.fail_ease_penalty < 0.0 {
            return Err(invalid("ease step and fail penalty cannot be negative"));
        }
        if g.score_min >= g.score_max {
            return Err(invalid("score scale is empty"));
        }
        if !(g.score_min..=g.score_max).contains(&g.pass_threshold) {
            return Err(invalid("pass threshold is outside the score scale"));
        }
        if !(g.score_min..=g.score_max).contains(&g.fallback_score) {
            return Err(invalid("fallback score is outside the score scale"));
        }
        if self.coach.max_turns == 0 {
            return Err(invalid("max turns must be at least 1"));
        }
        Ok(())
    }
}

fn invalid(msg: &str) -> ConfigError {
    ConfigError::Invalid(msg.to_string())
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".learnlock")
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> T
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => match raw.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                warn!(key, value = %raw, "ignoring unparseable config value");
                default
            }
        },
        None => default,
    }
}
