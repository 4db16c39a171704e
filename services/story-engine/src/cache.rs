//! Cache lookup for reusable stories: a filtered candidate fetch plus a
//! pure ranking step, so the policy is testable without a database.

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use shared::db::StoryRow;
use shared::dto::Tone;
use sqlx::{PgPool, Row};
use tracing::debug;
use uuid::Uuid;

/// Symmetric level window around the target, in level units.
pub const LEVEL_WINDOW: f64 = 0.18;
/// Stories older than this never serve a cache hit.
pub const CACHE_TTL_DAYS: i64 = 7;
/// A hit without questions still needs the background question batch, so
/// it ranks slightly behind a fully ready story.
pub const MISSING_QUESTIONS_PENALTY: f64 = 0.15;

#[derive(Debug, Clone)]
pub struct CacheCandidate {
    pub story_id: Uuid,
    pub level: f64,
    pub tone: Option<Tone>,
    pub question_count: i64,
}

/// Rank candidates for a target level and tone. Tone must match exactly;
/// among the rest the smallest `|level − target|` wins, nudged by the
/// missing-questions penalty.
pub fn pick_cached_story(
    candidates: &[CacheCandidate],
    target_level: f64,
    tone: Tone,
) -> Option<&CacheCandidate> {
    candidates
        .iter()
        .filter(|c| c.tone == Some(tone))
        .min_by(|a, b| {
            let rank = |c: &CacheCandidate| {
                (c.level - target_level).abs()
                    + if c.question_count == 0 {
                        MISSING_QUESTIONS_PENALTY
                    } else {
                        0.0
                    }
            };
            rank(a).total_cmp(&rank(b))
        })
}

fn tone_of(metadata: &serde_json::Value) -> Option<Tone> {
    metadata
        .get("flags")
        .and_then(|f| f.get("tone"))
        .and_then(|t| t.as_str())
        .and_then(|s| s.parse().ok())
}

/// Look up one reusable story for (learner, topic, level, tone), or none.
/// `skip` is set by the orchestrator on forced regeneration and for
/// ad-hoc free-text topics, which are never cached.
pub async fn resolve(
    pool: &PgPool,
    learner_id: Uuid,
    topic_slug: &str,
    target_level: f64,
    tone: Tone,
    skip: bool,
) -> Result<Option<StoryRow>> {
    if skip {
        return Ok(None);
    }

    let cutoff = Utc::now() - Duration::days(CACHE_TTL_DAYS);
    let rows = sqlx::query(
        "SELECT s.id, s.level, s.metadata, count(q.id) AS question_count
           FROM stories s
           LEFT JOIN story_questions q ON q.story_id = s.id
          WHERE s.learner_id = $1 AND s.topic_slug = $2
            AND s.reusable AND s.approved
            AND s.created_at >= $3
            AND abs(s.level - $4) <= $5
          GROUP BY s.id",
    )
    .bind(learner_id)
    .bind(topic_slug)
    .bind(cutoff)
    .bind(target_level)
    .bind(LEVEL_WINDOW)
    .fetch_all(pool)
    .await
    .context("cache candidate query")?;

    let candidates: Vec<CacheCandidate> = rows
        .iter()
        .map(|r| CacheCandidate {
            story_id: r.get("id"),
            level: r.get("level"),
            tone: tone_of(&r.get::<serde_json::Value, _>("metadata")),
            question_count: r.get("question_count"),
        })
        .collect();

    let Some(best) = pick_cached_story(&candidates, target_level, tone) else {
        debug!(%learner_id, topic_slug, candidates = candidates.len(), "cache miss");
        return Ok(None);
    };

    debug!(%learner_id, topic_slug, story_id = %best.story_id, "cache hit");
    shared::db::fetch_story(pool, best.story_id).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(level: f64, tone: Tone, question_count: i64) -> CacheCandidate {
        CacheCandidate {
            story_id: Uuid::new_v4(),
            level,
            tone: Some(tone),
            question_count,
        }
    }

    #[test]
    fn closest_level_with_matching_tone_wins() {
        // scenario: target 2.2, an approved reusable story at 2.3
        let candidates = vec![
            candidate(2.3, Tone::Balanced, 4),
            candidate(2.0, Tone::Balanced, 4),
        ];
        let hit = pick_cached_story(&candidates, 2.2, Tone::Balanced).unwrap();
        assert!((hit.level - 2.3).abs() < f64::EPSILON);
    }

    #[test]
    fn tone_is_never_fuzzy_matched() {
        let candidates = vec![candidate(2.2, Tone::Creative, 4)];
        assert!(pick_cached_story(&candidates, 2.2, Tone::Balanced).is_none());
    }

    #[test]
    fn missing_questions_cost_the_tie() {
        let ready = candidate(2.3, Tone::Balanced, 4);
        let bare = candidate(2.25, Tone::Balanced, 0);
        // bare is nearer in level, but the 0.15 penalty outweighs 0.05
        let candidates = [ready.clone(), bare];
        let hit = pick_cached_story(&candidates, 2.2, Tone::Balanced).unwrap();
        assert_eq!(hit.story_id, ready.story_id);
    }

    #[test]
    fn unknown_tone_metadata_is_excluded() {
        let mut c = candidate(2.2, Tone::Balanced, 4);
        c.tone = None;
        assert!(pick_cached_story(&[c], 2.2, Tone::Balanced).is_none());
    }
}
