//! Postgres query layer for the persisted entities: learners, stories,
//! questions, reading sessions, difficulty adjustments and skill ratings.
//! Generation traces are owned by the engine's trace module.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row};
use uuid::Uuid;

/// Idempotent schema bootstrap, run once at service start.
pub async fn init_schema(pool: &PgPool) -> Result<()> {
    const STATEMENTS: &[&str] = &[
        "CREATE TABLE IF NOT EXISTS learners (
            id UUID PRIMARY KEY,
            name TEXT NOT NULL,
            age_years SMALLINT NOT NULL,
            reading_level DOUBLE PRECISION NOT NULL DEFAULT 2.0,
            tone TEXT NOT NULL DEFAULT 'balanced',
            interests JSONB NOT NULL DEFAULT '[]',
            favorite_characters JSONB NOT NULL DEFAULT '[]',
            personalization TEXT,
            created_at TIMESTAMPTZ DEFAULT now()
        )",
        "CREATE TABLE IF NOT EXISTS stories (
            id UUID PRIMARY KEY,
            learner_id UUID NOT NULL REFERENCES learners(id),
            topic_slug TEXT NOT NULL,
            title TEXT NOT NULL,
            body TEXT NOT NULL,
            level DOUBLE PRECISION NOT NULL,
            metadata JSONB NOT NULL DEFAULT '{}',
            model TEXT NOT NULL,
            approved BOOLEAN NOT NULL DEFAULT false,
            rejection_reason TEXT,
            reusable BOOLEAN NOT NULL DEFAULT false,
            created_at TIMESTAMPTZ DEFAULT now()
        )",
        "CREATE TABLE IF NOT EXISTS story_questions (
            id UUID PRIMARY KEY,
            story_id UUID NOT NULL REFERENCES stories(id) ON DELETE CASCADE,
            kind TEXT NOT NULL,
            prompt TEXT NOT NULL,
            options JSONB NOT NULL,
            correct_index INT NOT NULL,
            explanation TEXT NOT NULL DEFAULT '',
            difficulty INT NOT NULL DEFAULT 3,
            position INT NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS generation_traces (
            id UUID PRIMARY KEY,
            learner_id UUID NOT NULL,
            status TEXT NOT NULL,
            progress INT NOT NULL,
            current_stage TEXT,
            stages JSONB NOT NULL,
            started_at TIMESTAMPTZ NOT NULL,
            finished_at TIMESTAMPTZ,
            total_ms BIGINT
        )",
        "CREATE TABLE IF NOT EXISTS reading_sessions (
            id UUID PRIMARY KEY,
            learner_id UUID NOT NULL REFERENCES learners(id),
            story_id UUID NOT NULL REFERENCES stories(id),
            topic_slug TEXT NOT NULL,
            level DOUBLE PRECISION NOT NULL,
            expected_reading_ms BIGINT NOT NULL,
            status TEXT NOT NULL DEFAULT 'assigned',
            comprehension_score INT,
            stars INT,
            wpm DOUBLE PRECISION,
            created_at TIMESTAMPTZ DEFAULT now(),
            finished_at TIMESTAMPTZ
        )",
        "CREATE TABLE IF NOT EXISTS difficulty_adjustments (
            id UUID PRIMARY KEY,
            learner_id UUID NOT NULL,
            session_id UUID NOT NULL,
            level_before DOUBLE PRECISION NOT NULL,
            level_after DOUBLE PRECISION NOT NULL,
            direction TEXT NOT NULL,
            reason TEXT NOT NULL,
            evidence JSONB NOT NULL DEFAULT '{}',
            created_at TIMESTAMPTZ DEFAULT now()
        )",
        "CREATE TABLE IF NOT EXISTS skill_ratings (
            learner_id UUID PRIMARY KEY,
            global DOUBLE PRECISION NOT NULL,
            literal DOUBLE PRECISION NOT NULL,
            inference DOUBLE PRECISION NOT NULL,
            vocabulary DOUBLE PRECISION NOT NULL,
            summary DOUBLE PRECISION NOT NULL,
            rd DOUBLE PRECISION NOT NULL,
            updated_at TIMESTAMPTZ DEFAULT now()
        )",
        "CREATE TABLE IF NOT EXISTS rating_snapshots (
            id UUID PRIMARY KEY,
            learner_id UUID NOT NULL,
            session_id UUID NOT NULL,
            global DOUBLE PRECISION NOT NULL,
            literal DOUBLE PRECISION NOT NULL,
            inference DOUBLE PRECISION NOT NULL,
            vocabulary DOUBLE PRECISION NOT NULL,
            summary DOUBLE PRECISION NOT NULL,
            rd DOUBLE PRECISION NOT NULL,
            wpm DOUBLE PRECISION,
            created_at TIMESTAMPTZ DEFAULT now()
        )",
        "CREATE INDEX IF NOT EXISTS idx_stories_cache
            ON stories (learner_id, topic_slug, created_at DESC)",
        "CREATE INDEX IF NOT EXISTS idx_sessions_learner
            ON reading_sessions (learner_id, finished_at DESC)",
    ];

    for stmt in STATEMENTS {
        sqlx::query(stmt)
            .execute(pool)
            .await
            .with_context(|| format!("schema bootstrap failed: {}", &stmt[..stmt.len().min(48)]))?;
    }
    Ok(())
}

/* ---------------- learners ---------------- */

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LearnerRow {
    pub id: Uuid,
    pub name: String,
    pub age_years: i16,
    pub reading_level: f64,
    pub tone: String,
    pub interests: Value,
    pub favorite_characters: Value,
    pub personalization: Option<String>,
}

pub async fn fetch_learner(pool: &PgPool, id: Uuid) -> Result<Option<LearnerRow>> {
    let row = sqlx::query_as::<_, LearnerRow>(
        "SELECT id, name, age_years, reading_level, tone, interests,
                favorite_characters, personalization
           FROM learners WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("fetch_learner")?;
    Ok(row)
}

pub async fn update_learner_level(pool: &PgPool, id: Uuid, level: f64) -> Result<()> {
    sqlx::query("UPDATE learners SET reading_level = $2 WHERE id = $1")
        .bind(id)
        .bind(level)
        .execute(pool)
        .await
        .context("update_learner_level")?;
    Ok(())
}

/* ---------------- stories & questions ---------------- */

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoryRow {
    pub id: Uuid,
    pub learner_id: Uuid,
    pub topic_slug: String,
    pub title: String,
    pub body: String,
    pub level: f64,
    pub metadata: Value,
    pub model: String,
    pub approved: bool,
    pub rejection_reason: Option<String>,
    pub reusable: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewStory {
    pub id: Uuid,
    pub learner_id: Uuid,
    pub topic_slug: String,
    pub title: String,
    pub body: String,
    pub level: f64,
    pub metadata: Value,
    pub model: String,
    pub approved: bool,
    pub rejection_reason: Option<String>,
    pub reusable: bool,
}

pub async fn insert_story(pool: &PgPool, story: &NewStory) -> Result<()> {
    sqlx::query(
        "INSERT INTO stories (id, learner_id, topic_slug, title, body, level,
                              metadata, model, approved, rejection_reason, reusable)
         VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11)",
    )
    .bind(story.id)
    .bind(story.learner_id)
    .bind(&story.topic_slug)
    .bind(&story.title)
    .bind(&story.body)
    .bind(story.level)
    .bind(&story.metadata)
    .bind(&story.model)
    .bind(story.approved)
    .bind(&story.rejection_reason)
    .bind(story.reusable)
    .execute(pool)
    .await
    .context("insert_story")?;
    Ok(())
}

pub async fn fetch_story(pool: &PgPool, id: Uuid) -> Result<Option<StoryRow>> {
    let row = sqlx::query_as::<_, StoryRow>(
        "SELECT id, learner_id, topic_slug, title, body, level, metadata, model,
                approved, rejection_reason, reusable, created_at
           FROM stories WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("fetch_story")?;
    Ok(row)
}

/// Titles recently generated for this learner and topic, newest first.
/// Feeds the duplicate-title guard.
pub async fn recent_titles(
    pool: &PgPool,
    learner_id: Uuid,
    topic_slug: &str,
    limit: i64,
) -> Result<Vec<String>> {
    let rows = sqlx::query(
        "SELECT title FROM stories
          WHERE learner_id = $1 AND topic_slug = $2
          ORDER BY created_at DESC LIMIT $3",
    )
    .bind(learner_id)
    .bind(topic_slug)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("recent_titles")?;
    Ok(rows.into_iter().map(|r| r.get("title")).collect())
}

pub async fn recent_topic_slugs(pool: &PgPool, learner_id: Uuid, limit: i64) -> Result<Vec<String>> {
    let rows = sqlx::query(
        "SELECT topic_slug FROM (
            SELECT DISTINCT ON (topic_slug) topic_slug, created_at
              FROM stories WHERE learner_id = $1
             ORDER BY topic_slug, created_at DESC
         ) t ORDER BY created_at DESC LIMIT $2",
    )
    .bind(learner_id)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("recent_topic_slugs")?;
    Ok(rows.into_iter().map(|r| r.get("topic_slug")).collect())
}

/// Stories created since midnight UTC, for the daily quota gate.
pub async fn count_stories_today(pool: &PgPool, learner_id: Uuid) -> Result<i64> {
    let row = sqlx::query(
        "SELECT count(*) AS n FROM stories
          WHERE learner_id = $1 AND created_at >= date_trunc('day', now())",
    )
    .bind(learner_id)
    .fetch_one(pool)
    .await
    .context("count_stories_today")?;
    Ok(row.get("n"))
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct QuestionRow {
    pub id: Uuid,
    pub story_id: Uuid,
    pub kind: String,
    pub prompt: String,
    pub options: Value,
    pub correct_index: i32,
    pub explanation: String,
    pub difficulty: i32,
    pub position: i32,
}

pub async fn questions_for_story(pool: &PgPool, story_id: Uuid) -> Result<Vec<QuestionRow>> {
    let rows = sqlx::query_as::<_, QuestionRow>(
        "SELECT id, story_id, kind, prompt, options, correct_index, explanation,
                difficulty, position
           FROM story_questions WHERE story_id = $1 ORDER BY position",
    )
    .bind(story_id)
    .fetch_all(pool)
    .await
    .context("questions_for_story")?;
    Ok(rows)
}

pub async fn insert_question(
    pool: &PgPool,
    story_id: Uuid,
    kind: &str,
    prompt: &str,
    options: &Value,
    correct_index: i32,
    explanation: &str,
    difficulty: i32,
    position: i32,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO story_questions (id, story_id, kind, prompt, options,
                                      correct_index, explanation, difficulty, position)
         VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)",
    )
    .bind(Uuid::new_v4())
    .bind(story_id)
    .bind(kind)
    .bind(prompt)
    .bind(options)
    .bind(correct_index)
    .bind(explanation)
    .bind(difficulty)
    .bind(position)
    .execute(pool)
    .await
    .context("insert_question")?;
    Ok(())
}

pub async fn question_by_id(pool: &PgPool, id: Uuid) -> Result<Option<QuestionRow>> {
    let row = sqlx::query_as::<_, QuestionRow>(
        "SELECT id, story_id, kind, prompt, options, correct_index, explanation,
                difficulty, position
           FROM story_questions WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("question_by_id")?;
    Ok(row)
}

/* ---------------- reading sessions ---------------- */

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SessionRow {
    pub id: Uuid,
    pub learner_id: Uuid,
    pub story_id: Uuid,
    pub topic_slug: String,
    pub level: f64,
    pub expected_reading_ms: i64,
    pub status: String,
    pub comprehension_score: Option<i32>,
    pub stars: Option<i32>,
    pub wpm: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

pub async fn insert_session(
    pool: &PgPool,
    id: Uuid,
    learner_id: Uuid,
    story_id: Uuid,
    topic_slug: &str,
    level: f64,
    expected_reading_ms: i64,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO reading_sessions (id, learner_id, story_id, topic_slug,
                                       level, expected_reading_ms)
         VALUES ($1,$2,$3,$4,$5,$6)",
    )
    .bind(id)
    .bind(learner_id)
    .bind(story_id)
    .bind(topic_slug)
    .bind(level)
    .bind(expected_reading_ms)
    .execute(pool)
    .await
    .context("insert_session")?;
    Ok(())
}

pub async fn fetch_session(pool: &PgPool, id: Uuid) -> Result<Option<SessionRow>> {
    let row = sqlx::query_as::<_, SessionRow>(
        "SELECT id, learner_id, story_id, topic_slug, level, expected_reading_ms,
                status, comprehension_score, stars, wpm, created_at, finished_at
           FROM reading_sessions WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("fetch_session")?;
    Ok(row)
}

pub async fn complete_session(
    pool: &PgPool,
    id: Uuid,
    comprehension_score: i32,
    stars: i32,
    wpm: Option<f64>,
) -> Result<()> {
    sqlx::query(
        "UPDATE reading_sessions
            SET status = 'completed', comprehension_score = $2, stars = $3,
                wpm = $4, finished_at = now()
          WHERE id = $1",
    )
    .bind(id)
    .bind(comprehension_score)
    .bind(stars)
    .bind(wpm)
    .execute(pool)
    .await
    .context("complete_session")?;
    Ok(())
}

/// Comprehension scores (0..100) of the most recent completed sessions,
/// newest first. Feeds the stability term of the coarse adjustment.
pub async fn recent_comprehension_scores(
    pool: &PgPool,
    learner_id: Uuid,
    limit: i64,
) -> Result<Vec<i32>> {
    let rows = sqlx::query(
        "SELECT comprehension_score FROM reading_sessions
          WHERE learner_id = $1 AND status = 'completed'
            AND comprehension_score IS NOT NULL
          ORDER BY finished_at DESC LIMIT $2",
    )
    .bind(learner_id)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("recent_comprehension_scores")?;
    Ok(rows.into_iter().map(|r| r.get("comprehension_score")).collect())
}

pub async fn last_completed_session_at(
    pool: &PgPool,
    learner_id: Uuid,
) -> Result<Option<DateTime<Utc>>> {
    let row = sqlx::query(
        "SELECT max(finished_at) AS t FROM reading_sessions
          WHERE learner_id = $1 AND status = 'completed'",
    )
    .bind(learner_id)
    .fetch_one(pool)
    .await
    .context("last_completed_session_at")?;
    Ok(row.get("t"))
}

/* ---------------- difficulty & ratings ---------------- */

pub async fn insert_adjustment(
    pool: &PgPool,
    learner_id: Uuid,
    session_id: Uuid,
    level_before: f64,
    level_after: f64,
    direction: &str,
    reason: &str,
    evidence: &Value,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO difficulty_adjustments (id, learner_id, session_id,
                level_before, level_after, direction, reason, evidence)
         VALUES ($1,$2,$3,$4,$5,$6,$7,$8)",
    )
    .bind(Uuid::new_v4())
    .bind(learner_id)
    .bind(session_id)
    .bind(level_before)
    .bind(level_after)
    .bind(direction)
    .bind(reason)
    .bind(evidence)
    .execute(pool)
    .await
    .context("insert_adjustment")?;
    Ok(())
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SkillRatingRow {
    pub learner_id: Uuid,
    pub global: f64,
    pub literal: f64,
    pub inference: f64,
    pub vocabulary: f64,
    pub summary: f64,
    pub rd: f64,
}

pub async fn fetch_skill_rating(pool: &PgPool, learner_id: Uuid) -> Result<Option<SkillRatingRow>> {
    let row = sqlx::query_as::<_, SkillRatingRow>(
        "SELECT learner_id, global, literal, inference, vocabulary, summary, rd
           FROM skill_ratings WHERE learner_id = $1",
    )
    .bind(learner_id)
    .fetch_optional(pool)
    .await
    .context("fetch_skill_rating")?;
    Ok(row)
}

/// Last-writer-wins on the rating row; history lives in the snapshots.
pub async fn upsert_skill_rating(pool: &PgPool, rating: &SkillRatingRow) -> Result<()> {
    sqlx::query(
        "INSERT INTO skill_ratings (learner_id, global, literal, inference,
                                    vocabulary, summary, rd, updated_at)
         VALUES ($1,$2,$3,$4,$5,$6,$7, now())
         ON CONFLICT (learner_id) DO UPDATE
            SET global = EXCLUDED.global, literal = EXCLUDED.literal,
                inference = EXCLUDED.inference, vocabulary = EXCLUDED.vocabulary,
                summary = EXCLUDED.summary, rd = EXCLUDED.rd, updated_at = now()",
    )
    .bind(rating.learner_id)
    .bind(rating.global)
    .bind(rating.literal)
    .bind(rating.inference)
    .bind(rating.vocabulary)
    .bind(rating.summary)
    .bind(rating.rd)
    .execute(pool)
    .await
    .context("upsert_skill_rating")?;
    Ok(())
}

pub async fn insert_rating_snapshot(
    pool: &PgPool,
    rating: &SkillRatingRow,
    session_id: Uuid,
    wpm: Option<f64>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO rating_snapshots (id, learner_id, session_id, global, literal,
                                       inference, vocabulary, summary, rd, wpm)
         VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10)",
    )
    .bind(Uuid::new_v4())
    .bind(rating.learner_id)
    .bind(session_id)
    .bind(rating.global)
    .bind(rating.literal)
    .bind(rating.inference)
    .bind(rating.vocabulary)
    .bind(rating.summary)
    .bind(rating.rd)
    .bind(wpm)
    .execute(pool)
    .await
    .context("insert_rating_snapshot")?;
    Ok(())
}
