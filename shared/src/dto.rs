use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use strum_macros::{Display, EnumString};
use uuid::Uuid;

/// The four comprehension question kinds every complete story carries.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum QuestionKind {
    Literal,
    Inference,
    Vocabulary,
    Summary,
}

impl QuestionKind {
    pub const ALL: [QuestionKind; 4] = [
        QuestionKind::Literal,
        QuestionKind::Inference,
        QuestionKind::Vocabulary,
        QuestionKind::Summary,
    ];
}

/// Narrative tone, ordered from purely educational to fully fantastical.
/// Cache lookups match tone exactly; prompts interpolate it as style
/// guidance.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Tone {
    Educational,
    Balanced,
    Creative,
    Fantastical,
}

impl Default for Tone {
    fn default() -> Self {
        Tone::Balanced
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RewriteDirection {
    Simplify,
    Elevate,
}

/// Direction of a coarse reading-level move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Direction {
    Up,
    Hold,
    Down,
}

/* ---------------- generation ---------------- */

/// One orchestrator run. Not persisted as its own record.
#[derive(Debug, Clone, Deserialize)]
pub struct GenerationRequest {
    pub learner_id: Uuid,
    /// Explicit topic: a catalogue slug or free text for an ad-hoc story.
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub force_regenerate: bool,
    /// Externally supplied trace id; a fresh one is minted when absent.
    #[serde(default)]
    pub trace_id: Option<Uuid>,
    #[serde(default)]
    pub level_override: Option<f64>,
}

/// Read-only pedagogical snapshot driving one generation run.
#[derive(Debug, Clone)]
pub struct PedagogicalProfile {
    pub age_years: i16,
    /// Continuous target level in [1, 10]; prompt templates discretize it.
    pub target_level: f64,
    pub topic_slug: String,
    pub topic_name: String,
    pub topic_description: String,
    pub core_concept: String,
    pub tone: Tone,
    pub interests: Vec<String>,
    pub favorite_characters: Vec<String>,
    pub personalization: String,
    pub recent_titles: Vec<String>,
}

/// Terminal result of a generation run, also mirrored into the trace.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationOutcome {
    pub story_id: Uuid,
    pub session_id: Uuid,
    pub trace_id: Uuid,
    pub topic_slug: String,
    pub title: String,
    pub level: f64,
    pub from_cache: bool,
    pub expected_reading_ms: i64,
}

/* ---------------- topic routing ---------------- */

/// What the skill-tree router is asked with.
#[derive(Debug, Clone, Serialize)]
pub struct RouterInput {
    pub learner_id: Uuid,
    pub age_years: i16,
    pub interests: Vec<String>,
    pub skill_progress: HashMap<String, f64>,
    pub current_skill_slug: Option<String>,
    pub recent_topic_slugs: Vec<String>,
}

/// A ranked topic suggestion; the first one is authoritative when the
/// caller did not request a topic explicitly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicSuggestion {
    pub slug: String,
    pub name: String,
    pub emoji: String,
    pub domain: String,
    pub reason_tag: String,
}

/* ---------------- generated payloads (post-validation) ---------------- */

/// Story fields as returned by the model, after structural validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoryPayload {
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub new_vocabulary: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionPayload {
    #[serde(rename = "type")]
    pub kind: QuestionKind,
    pub question: String,
    pub options: Vec<String>,
    pub correct_index: usize,
    #[serde(default)]
    pub explanation: String,
    #[serde(default)]
    pub difficulty: Option<i32>,
}

/// Structured metadata stored beside every story body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoryMetadata {
    pub word_count: i64,
    pub avg_sentence_len: f64,
    pub new_vocabulary: Vec<String>,
    pub expected_reading_ms: i64,
    pub flags: StoryFlags,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoryFlags {
    pub tone: Tone,
    #[serde(default)]
    pub fun_mode: bool,
    /// Set on rewrite rows: which way the original was moved.
    #[serde(default)]
    pub rewrite: Option<RewriteDirection>,
}

/* ---------------- session finalization ---------------- */

#[derive(Debug, Clone, Deserialize)]
pub struct AnsweredQuestion {
    pub question_id: Uuid,
    #[serde(rename = "type")]
    pub kind: QuestionKind,
    pub selected_option: usize,
    pub is_correct: bool,
    #[serde(default)]
    pub response_time_ms: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FinishSessionRequest {
    pub learner_id: Uuid,
    pub elapsed_ms: i64,
    pub answers: Vec<AnsweredQuestion>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FinishSessionResponse {
    pub correct: usize,
    pub total: usize,
    /// 0..100, rounded.
    pub comprehension_score: i32,
    pub stars: u8,
    pub level_before: f64,
    pub level_after: f64,
    pub direction: Direction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub global_rating_before: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub global_rating_after: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn question_kind_roundtrip() {
        let k: QuestionKind = "inference".parse().unwrap();
        assert_eq!(k, QuestionKind::Inference);
        assert_eq!(k.to_string(), "inference");
    }

    #[test]
    fn tone_is_ordered() {
        assert!(Tone::Educational < Tone::Fantastical);
        assert_eq!(Tone::default(), Tone::Balanced);
    }
}
