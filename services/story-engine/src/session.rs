//! Session finalization: aggregate the answers, reward stars, move the
//! coarse reading level, and feed the Glicko ratings. The session's
//! completion is made durable first; the coarse adjustment degrades to
//! "hold" on infrastructure failure and the rating step is swallowed
//! entirely — neither may fail the call.

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use shared::db::{self, SessionRow, SkillRatingRow};
use shared::dto::{AnsweredQuestion, FinishSessionRequest, FinishSessionResponse};
use shared::error::EngineError;

use crate::orchestrator::EngineCtx;
use crate::rating::{self, LevelDecision, RatedAnswer, Ratings, SessionSignals};

/// How many prior sessions feed the stability term.
const STABILITY_WINDOW: i64 = 10;

pub async fn finalize_session(
    ctx: &EngineCtx,
    session_id: Uuid,
    req: FinishSessionRequest,
) -> Result<FinishSessionResponse, EngineError> {
    if req.answers.is_empty() || req.answers.len() > 4 {
        return Err(EngineError::GenerationFailed(
            "se esperaban entre 1 y 4 respuestas".into(),
        ));
    }

    let pool = &ctx.pool;
    let session = db::fetch_session(pool, session_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| EngineError::GenerationFailed(format!("session {session_id} not found")))?;
    if session.learner_id != req.learner_id {
        return Err(EngineError::GenerationFailed(
            "session belongs to another learner".into(),
        ));
    }
    if session.status == "completed" {
        return Err(EngineError::GenerationFailed("session already finalized".into()));
    }

    let learner = db::fetch_learner(pool, req.learner_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| EngineError::GenerationFailed("learner not found".into()))?;
    let story = db::fetch_story(pool, session.story_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| EngineError::GenerationFailed("story not found".into()))?;

    // history snapshots taken before this session becomes "completed"
    let prior_ratios: Vec<f64> = db::recent_comprehension_scores(pool, learner.id, STABILITY_WINDOW)
        .await
        .map_err(internal)?
        .into_iter()
        .map(|s| s as f64 / 100.0)
        .collect();
    let idle_days = db::last_completed_session_at(pool, learner.id)
        .await
        .map_err(internal)?
        .map(|t| ((Utc::now() - t).num_hours() as f64 / 24.0).max(0.0))
        .unwrap_or(0.0);

    let total = req.answers.len();
    let correct = req.answers.iter().filter(|a| a.is_correct).count();
    let ratio = correct as f64 / total as f64;
    let comprehension_score = (ratio * 100.0).round() as i32;
    let stars = rating::stars_for(ratio);

    let word_count = story.body.split_whitespace().count() as f64;
    let wpm = if req.elapsed_ms > 0 {
        Some(word_count / (req.elapsed_ms as f64 / 60_000.0))
    } else {
        None
    };

    db::complete_session(pool, session_id, comprehension_score, stars as i32, wpm)
        .await
        .map_err(internal)?;

    // coarse level move; on infrastructure failure the learner holds the
    // current level rather than ending up undefined
    let decision = match adjust_level(ctx, &session, learner.reading_level, ratio, &prior_ratios, &req)
        .await
    {
        Ok(d) => d,
        Err(e) => {
            warn!(learner_id = %learner.id, "level adjustment failed, holding: {e}");
            LevelDecision::hold(
                learner.reading_level,
                "Ajuste no disponible: mantenemos el nivel actual.",
            )
        }
    };

    // fine-grained ratings are advisory; failures are logged and dropped
    let (rating_before, rating_after) = match update_ratings(
        ctx,
        learner.id,
        session_id,
        story.level,
        idle_days,
        &req.answers,
        wpm,
    )
    .await
    {
        Ok(pair) => (Some(pair.0), Some(pair.1)),
        Err(e) => {
            warn!(learner_id = %learner.id, "skill rating update failed (non-critical): {e}");
            (None, None)
        }
    };

    info!(
        learner_id = %learner.id,
        %session_id,
        comprehension_score,
        stars,
        direction = %decision.direction,
        "session finalized"
    );

    Ok(FinishSessionResponse {
        correct,
        total,
        comprehension_score,
        stars,
        level_before: decision.level_before,
        level_after: decision.level_after,
        direction: decision.direction,
        global_rating_before: rating_before,
        global_rating_after: rating_after,
    })
}

async fn adjust_level(
    ctx: &EngineCtx,
    session: &SessionRow,
    level_before: f64,
    ratio: f64,
    prior_ratios: &[f64],
    req: &FinishSessionRequest,
) -> anyhow::Result<LevelDecision> {
    let signals = SessionSignals {
        comprehension: ratio,
        actual_ms: req.elapsed_ms,
        expected_ms: session.expected_reading_ms,
        recent_ratios: prior_ratios.to_vec(),
    };
    let decision = rating::evaluate_level(level_before, &signals);

    db::update_learner_level(&ctx.pool, session.learner_id, decision.level_after).await?;
    db::insert_adjustment(
        &ctx.pool,
        session.learner_id,
        session.id,
        decision.level_before,
        decision.level_after,
        &decision.direction.to_string(),
        &decision.reason,
        &decision.evidence(ratio),
    )
    .await?;
    Ok(decision)
}

async fn update_ratings(
    ctx: &EngineCtx,
    learner_id: Uuid,
    session_id: Uuid,
    text_level: f64,
    idle_days: f64,
    answers: &[AnsweredQuestion],
    wpm: Option<f64>,
) -> anyhow::Result<(f64, f64)> {
    let pool = &ctx.pool;
    let mut ratings = match db::fetch_skill_rating(pool, learner_id).await? {
        Some(row) => Ratings {
            global: row.global,
            literal: row.literal,
            inference: row.inference,
            vocabulary: row.vocabulary,
            summary: row.summary,
            rd: row.rd,
        },
        None => Ratings::default(),
    };
    let before = ratings.global;

    let mut rated = Vec::with_capacity(answers.len());
    for answer in answers {
        // the stored question is authoritative for kind and difficulty;
        // the client-reported kind is only a fallback
        let stored = db::question_by_id(pool, answer.question_id).await?;
        let (kind, difficulty) = match stored {
            Some(q) => (q.kind.parse().unwrap_or(answer.kind), Some(q.difficulty)),
            None => (answer.kind, None),
        };
        rated.push(RatedAnswer {
            kind,
            difficulty,
            correct: answer.is_correct,
        });
    }

    rating::apply_session(&mut ratings, idle_days, text_level, &rated);

    let row = SkillRatingRow {
        learner_id,
        global: ratings.global,
        literal: ratings.literal,
        inference: ratings.inference,
        vocabulary: ratings.vocabulary,
        summary: ratings.summary,
        rd: ratings.rd,
    };
    db::upsert_skill_rating(pool, &row).await?;
    db::insert_rating_snapshot(pool, &row, session_id, wpm).await?;
    Ok((before, ratings.global))
}

fn internal(e: anyhow::Error) -> EngineError {
    EngineError::GenerationFailed(e.to_string())
}
