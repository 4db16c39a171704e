//! End-to-end generation: limits → topic → cache → prompt → model → QA →
//! persistence → session, advancing the polled trace at every step. Also
//! hosts the background question batch and the rewrite entry, which are
//! smaller orchestrator-style calls over an already-persisted story.

use std::sync::Arc;

use anyhow::{anyhow, Context};
use serde_json::Value;
use sqlx::PgPool;
use tracing::{error, info, warn};
use uuid::Uuid;

use shared::config::Settings;
use shared::db::{self, LearnerRow, NewStory, QuestionRow, StoryRow};
use shared::dto::{
    GenerationOutcome, GenerationRequest, PedagogicalProfile, QuestionPayload, RewriteDirection,
    RouterInput, StoryFlags, StoryMetadata, StoryPayload, Tone,
};
use shared::error::EngineError;
use shared::openai_client::{self, InvokeOptions, TokenUsage};

use crate::cache;
use crate::prompt;
use crate::qa::{self, QaConfig};
use crate::rating;
use crate::topics::{self, TopicRouter};
use crate::trace::{save_trace, GenerationTrace, StageId, CONTENT_STAGES};

/// Free-form personalization facts are length-capped before prompting.
const PERSONALIZATION_MAX_CHARS: usize = 400;
/// Recent titles fed to the duplicate-title guard.
const RECENT_TITLES_LIMIT: i64 = 5;
/// Interest tags woven into the prompt.
const MAX_INTEREST_TAGS: usize = 3;

/// Everything one generation or finalization request needs.
pub struct EngineCtx {
    pub pool: PgPool,
    pub http: reqwest::Client,
    pub settings: Settings,
    pub router: Arc<dyn TopicRouter>,
    pub qa: QaConfig,
}

impl EngineCtx {
    fn invoke_options(&self) -> InvokeOptions {
        InvokeOptions {
            max_retries: self.settings.openai_retries,
            temperature: 0.8,
            max_tokens: Some(2048),
            timeout_ms: self.settings.openai_timeout_ms,
        }
    }
}

#[derive(Debug, Clone)]
struct RoutedTopic {
    slug: String,
    name: String,
    description: String,
    core_concept: String,
    /// Free-text topics bypass the cache and are never reusable.
    ad_hoc: bool,
}

/// Run one generation request. The trace is the caller-visible progress
/// signal; any error — typed or unexpected — lands on the stage that was
/// active when it happened, and nothing escapes without updating the
/// trace first.
pub async fn run_generation(
    ctx: &EngineCtx,
    req: GenerationRequest,
) -> Result<GenerationOutcome, EngineError> {
    let trace_id = req.trace_id.unwrap_or_else(Uuid::new_v4);
    let mut trace = GenerationTrace::new(trace_id, req.learner_id);

    match generate(ctx, &req, &mut trace).await {
        Ok(outcome) => Ok(outcome),
        Err(err) => {
            let engine_err = match err.downcast::<EngineError>() {
                Ok(typed) => typed,
                Err(other) => EngineError::GenerationFailed(other.to_string()),
            };
            let stage = trace.current_stage.unwrap_or(StageId::Validations);
            error!(
                learner_id = %req.learner_id,
                stage = %stage,
                code = engine_err.code(),
                "generation failed: {engine_err}"
            );
            trace.mark_error(stage, format!("{}: {engine_err}", engine_err.code()));
            if let Err(e) = save_trace(&ctx.pool, &trace).await {
                warn!(%trace_id, "failed to persist error trace: {e}");
            }
            Err(engine_err)
        }
    }
}

async fn generate(
    ctx: &EngineCtx,
    req: &GenerationRequest,
    trace: &mut GenerationTrace,
) -> anyhow::Result<GenerationOutcome> {
    let pool = &ctx.pool;

    // -- validations ------------------------------------------------------
    trace.mark_running(StageId::Validations, "comprobando acceso y límite diario");
    save_trace(pool, trace).await?;

    if openai_client::resolve_api_key(&ctx.settings.openai_api_key).is_none() {
        return Err(anyhow!(EngineError::NoApiKey));
    }
    let learner = db::fetch_learner(pool, req.learner_id)
        .await?
        .ok_or_else(|| {
            anyhow!(EngineError::GenerationFailed(format!(
                "learner {} not found",
                req.learner_id
            )))
        })?;
    let generated_today = db::count_stories_today(pool, learner.id).await?;
    if generated_today >= ctx.settings.daily_generation_limit {
        return Err(anyhow!(EngineError::RateLimit));
    }
    trace.mark_done(
        StageId::Validations,
        format!(
            "{generated_today} de {} historias hoy",
            ctx.settings.daily_generation_limit
        ),
    );
    save_trace(pool, trace).await?;

    // -- route ------------------------------------------------------------
    trace.mark_running(StageId::Route, "eligiendo el siguiente tema");
    save_trace(pool, trace).await?;
    let topic = route_topic(ctx, req, &learner).await?;
    trace.mark_done(StageId::Route, format!("tema: {}", topic.name));
    save_trace(pool, trace).await?;

    // -- cache ------------------------------------------------------------
    trace.mark_running(StageId::Cache, "buscando una historia reutilizable");
    save_trace(pool, trace).await?;
    let target_level = rating::clamp_reading_level(
        req.level_override.unwrap_or(learner.reading_level),
    );
    let tone: Tone = learner.tone.parse().unwrap_or_default();
    let skip_cache = req.force_regenerate || topic.ad_hoc;

    if let Some(story) =
        cache::resolve(pool, learner.id, &topic.slug, target_level, tone, skip_cache).await?
    {
        trace.mark_done(StageId::Cache, "historia reutilizada de los últimos días");
        trace.skip_remaining(&CONTENT_STAGES, "omitida: historia reutilizada");
        save_trace(pool, trace).await?;

        let expected_reading_ms = expected_reading_ms_of(&story.metadata);
        let session_id = Uuid::new_v4();
        trace.mark_running(StageId::Session, "creando la sesión de lectura");
        db::insert_session(
            pool,
            session_id,
            learner.id,
            story.id,
            &story.topic_slug,
            story.level,
            expected_reading_ms,
        )
        .await?;
        trace.mark_done(StageId::Session, format!("sesión {session_id}"));
        trace.finalize_ok(format!("historia {} lista desde caché", story.id));
        save_trace(pool, trace).await?;

        info!(learner_id = %learner.id, story_id = %story.id, "cache hit served");
        return Ok(GenerationOutcome {
            story_id: story.id,
            session_id,
            trace_id: trace.id,
            topic_slug: story.topic_slug,
            title: story.title,
            level: story.level,
            from_cache: true,
            expected_reading_ms,
        });
    }
    trace.mark_done(StageId::Cache, "sin historias reutilizables");
    save_trace(pool, trace).await?;

    // -- prompt -----------------------------------------------------------
    trace.mark_running(StageId::Prompt, "preparando instrucciones");
    save_trace(pool, trace).await?;
    let recent_titles = db::recent_titles(pool, learner.id, &topic.slug, RECENT_TITLES_LIMIT).await?;
    let profile = build_profile(&learner, &topic, target_level, tone, recent_titles);
    let (system, user) = prompt::build_story_prompt(&profile);
    trace.mark_done(StageId::Prompt, format!("nivel {:.1}", target_level));
    save_trace(pool, trace).await?;

    // -- llm --------------------------------------------------------------
    trace.mark_running(StageId::Llm, "escribiendo la historia");
    save_trace(pool, trace).await?;
    let candidate = generate_candidate(ctx, &profile, &system, &user).await?;
    trace.mark_done(
        StageId::Llm,
        format!("{} tokens usados", candidate.usage.total_tokens),
    );
    save_trace(pool, trace).await?;

    // -- persistence ------------------------------------------------------
    trace.mark_running(StageId::Persistence, "validando y guardando la historia");
    save_trace(pool, trace).await?;

    let approved = candidate.rejection.is_none();
    let metadata = build_metadata(&candidate.story, &profile, None);
    let expected_reading_ms = metadata.expected_reading_ms;
    let story_id = Uuid::new_v4();
    let new_story = NewStory {
        id: story_id,
        learner_id: learner.id,
        topic_slug: topic.slug.clone(),
        title: candidate.story.title.clone(),
        body: candidate.story.body.clone(),
        level: target_level,
        metadata: serde_json::to_value(&metadata).context("serialize metadata")?,
        model: ctx.settings.openai_model.clone(),
        approved,
        rejection_reason: candidate.rejection.clone(),
        // rejected stories stay queryable for audit but never serve hits;
        // ad-hoc free-text stories are one-offs by definition
        reusable: approved && !topic.ad_hoc,
    };
    db::insert_story(pool, &new_story).await?;

    if let Some(reason) = candidate.rejection {
        // stored for audit, then surfaced as a QA rejection
        return Err(anyhow!(EngineError::QaRejected(reason)));
    }
    persist_questions(pool, story_id, &candidate.questions).await?;
    trace.mark_done(StageId::Persistence, format!("historia {story_id}"));
    save_trace(pool, trace).await?;

    // -- session ----------------------------------------------------------
    trace.mark_running(StageId::Session, "creando la sesión de lectura");
    save_trace(pool, trace).await?;
    let session_id = Uuid::new_v4();
    db::insert_session(
        pool,
        session_id,
        learner.id,
        story_id,
        &topic.slug,
        target_level,
        expected_reading_ms,
    )
    .await?;
    trace.mark_done(StageId::Session, format!("sesión {session_id}"));
    trace.finalize_ok(format!("historia {story_id} lista"));
    save_trace(pool, trace).await?;

    info!(learner_id = %learner.id, %story_id, topic = %topic.slug, "story generated");
    Ok(GenerationOutcome {
        story_id,
        session_id,
        trace_id: trace.id,
        topic_slug: topic.slug,
        title: candidate.story.title,
        level: target_level,
        from_cache: false,
        expected_reading_ms,
    })
}

/* ---------------- candidate generation with QA retries ---------------- */

struct Candidate {
    story: StoryPayload,
    questions: Vec<QuestionPayload>,
    usage: TokenUsage,
    /// `Some` when every attempt was rejected; carries the last reason.
    rejection: Option<String>,
}

/// Obtain a story+questions candidate, retrying generation when the QA
/// rubric rejects one. The invoker already retries malformed output
/// internally; this loop only re-rolls content rejections.
async fn generate_candidate(
    ctx: &EngineCtx,
    profile: &PedagogicalProfile,
    system: &str,
    user: &str,
) -> anyhow::Result<Candidate> {
    let attempts = ctx.settings.openai_retries + 1;
    let mut last: Option<Candidate> = None;

    for attempt in 1..=attempts {
        let answer = openai_client::invoke_structured(
            &ctx.http,
            &ctx.settings.openai_api_key,
            &ctx.settings.openai_model,
            system,
            user,
            &ctx.invoke_options(),
        )
        .await
        .map_err(|e| match e {
            openai_client::PromptError::NoApiKey => anyhow!(EngineError::NoApiKey),
            other => anyhow!(EngineError::GenerationFailed(other.to_string())),
        })?;

        let (story, questions) = match qa::parse_combined_payload(&answer.value) {
            Ok(parsed) => parsed,
            Err(shape_err) => {
                warn!(attempt, "combined payload failed structural checks: {shape_err}");
                if last.is_none() {
                    last = Some(Candidate {
                        story: StoryPayload {
                            title: String::new(),
                            body: String::new(),
                            new_vocabulary: vec![],
                        },
                        questions: vec![],
                        usage: answer.usage,
                        rejection: Some(shape_err),
                    });
                }
                continue;
            }
        };

        match qa::review_content(
            &story,
            Some(&questions),
            profile.target_level,
            &profile.recent_titles,
            &ctx.qa,
        ) {
            Ok(()) => {
                return Ok(Candidate {
                    story,
                    questions,
                    usage: answer.usage,
                    rejection: None,
                });
            }
            Err(reason) => {
                warn!(attempt, "candidate rejected by rubric: {reason}");
                last = Some(Candidate {
                    story,
                    questions,
                    usage: answer.usage,
                    rejection: Some(reason),
                });
            }
        }
    }

    last.ok_or_else(|| {
        anyhow!(EngineError::GenerationFailed(
            "no candidate survived structural validation".into()
        ))
    })
}

/* ---------------- topic routing ---------------- */

async fn route_topic(
    ctx: &EngineCtx,
    req: &GenerationRequest,
    learner: &LearnerRow,
) -> anyhow::Result<RoutedTopic> {
    if let Some(raw) = &req.topic {
        if let Some(t) = topics::resolve_slug(raw) {
            return Ok(catalogue_topic(t));
        }
        // ad-hoc free-text topic, taken verbatim
        let slug = crate::textnorm::slugify(raw);
        if slug.is_empty() {
            return Err(anyhow!(EngineError::GenerationFailed(
                "empty custom topic".into()
            )));
        }
        info!(%slug, "using ad-hoc custom topic");
        return Ok(RoutedTopic {
            slug,
            name: raw.trim().to_string(),
            description: raw.trim().to_string(),
            core_concept: raw.trim().to_string(),
            ad_hoc: true,
        });
    }

    let input = RouterInput {
        learner_id: learner.id,
        age_years: learner.age_years,
        interests: string_list(&learner.interests, MAX_INTEREST_TAGS),
        skill_progress: Default::default(),
        current_skill_slug: None,
        recent_topic_slugs: db::recent_topic_slugs(&ctx.pool, learner.id, 5).await?,
    };

    let suggestions = match ctx.router.next_topics(&input).await {
        Ok(s) => s,
        Err(e) => {
            warn!("topic router failed, falling back to catalogue: {e}");
            Vec::new()
        }
    };
    for suggestion in &suggestions {
        if let Some(t) = topics::resolve_slug(&suggestion.slug) {
            return Ok(catalogue_topic(t));
        }
        warn!(slug = %suggestion.slug, "router suggestion resolves to no topic");
    }

    // router yielded nothing usable: any age-appropriate topic works
    let fallback = topics::TOPIC_CATALOGUE
        .iter()
        .find(|t| learner.age_years >= t.min_age && learner.age_years <= t.max_age)
        .unwrap_or(&topics::TOPIC_CATALOGUE[0]);
    Ok(catalogue_topic(fallback))
}

fn catalogue_topic(t: &topics::Topic) -> RoutedTopic {
    RoutedTopic {
        slug: t.slug.to_string(),
        name: t.name.to_string(),
        description: t.description.to_string(),
        core_concept: t.core_concept.to_string(),
        ad_hoc: false,
    }
}

/* ---------------- profile & metadata ---------------- */

fn string_list(v: &Value, limit: usize) -> Vec<String> {
    v.as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|i| i.as_str())
                .map(str::to_string)
                .take(limit)
                .collect()
        })
        .unwrap_or_default()
}

fn build_profile(
    learner: &LearnerRow,
    topic: &RoutedTopic,
    target_level: f64,
    tone: Tone,
    recent_titles: Vec<String>,
) -> PedagogicalProfile {
    let personalization: String = learner
        .personalization
        .clone()
        .unwrap_or_default()
        .chars()
        .take(PERSONALIZATION_MAX_CHARS)
        .collect();
    PedagogicalProfile {
        age_years: learner.age_years,
        target_level,
        topic_slug: topic.slug.clone(),
        topic_name: topic.name.clone(),
        topic_description: topic.description.clone(),
        core_concept: topic.core_concept.clone(),
        tone,
        interests: string_list(&learner.interests, MAX_INTEREST_TAGS),
        favorite_characters: string_list(&learner.favorite_characters, MAX_INTEREST_TAGS),
        personalization,
        recent_titles,
    }
}

fn words_per_minute_for_age(age: i16) -> f64 {
    match age {
        ..=6 => 60.0,
        7..=8 => 90.0,
        9..=10 => 110.0,
        _ => 130.0,
    }
}

fn build_metadata(
    story: &StoryPayload,
    profile: &PedagogicalProfile,
    rewrite: Option<RewriteDirection>,
) -> StoryMetadata {
    let word_count = story.body.split_whitespace().count() as i64;
    let sentences = story
        .body
        .split(['.', '!', '?'])
        .filter(|s| !s.trim().is_empty())
        .count()
        .max(1);
    let avg_sentence_len = word_count as f64 / sentences as f64;
    let expected_reading_ms =
        ((word_count as f64 / words_per_minute_for_age(profile.age_years)) * 60_000.0) as i64;
    StoryMetadata {
        word_count,
        avg_sentence_len,
        new_vocabulary: story.new_vocabulary.clone(),
        expected_reading_ms,
        flags: StoryFlags {
            tone: profile.tone,
            fun_mode: profile.tone >= Tone::Creative,
            rewrite,
        },
    }
}

fn expected_reading_ms_of(metadata: &Value) -> i64 {
    metadata
        .get("expected_reading_ms")
        .and_then(Value::as_i64)
        .unwrap_or(120_000)
}

/* ---------------- background question batch ---------------- */

/// Generate the question batch for a story that was persisted without
/// one. Idempotent: existing questions win, including against a
/// concurrent writer — the loser re-reads and returns the first writer's
/// rows.
pub async fn generate_questions(
    ctx: &EngineCtx,
    story_id: Uuid,
    learner_id: Uuid,
) -> Result<Vec<QuestionRow>, EngineError> {
    let story = fetch_owned_story(ctx, story_id, learner_id).await?;

    let existing = db::questions_for_story(&ctx.pool, story_id)
        .await
        .map_err(internal)?;
    if !existing.is_empty() {
        return Ok(existing);
    }

    let (system, user) = prompt::build_questions_prompt(&story.title, &story.body, story.level);
    let answer = openai_client::invoke_structured(
        &ctx.http,
        &ctx.settings.openai_api_key,
        &ctx.settings.openai_model,
        &system,
        &user,
        &ctx.invoke_options(),
    )
    .await
    .map_err(|e| match e {
        openai_client::PromptError::NoApiKey => EngineError::NoApiKey,
        other => EngineError::GenerationFailed(other.to_string()),
    })?;

    let questions = qa::parse_questions_payload(&answer.value)
        .and_then(|qs| qa::review_questions(&qs).map(|()| qs))
        .map_err(EngineError::QaRejected)?;

    persist_questions(&ctx.pool, story_id, &questions)
        .await
        .map_err(internal)?;
    db::questions_for_story(&ctx.pool, story_id)
        .await
        .map_err(internal)
}

/// Insert a question batch unless someone else already did. Re-reading
/// immediately before inserting keeps the benign write race idempotent.
async fn persist_questions(
    pool: &PgPool,
    story_id: Uuid,
    questions: &[QuestionPayload],
) -> anyhow::Result<()> {
    let existing = db::questions_for_story(pool, story_id).await?;
    if !existing.is_empty() {
        info!(%story_id, "question batch already present, keeping first writer's rows");
        return Ok(());
    }
    for (position, q) in questions.iter().enumerate() {
        db::insert_question(
            pool,
            story_id,
            &q.kind.to_string(),
            &q.question,
            &serde_json::to_value(&q.options)?,
            q.correct_index as i32,
            &q.explanation,
            q.difficulty.unwrap_or(3),
            position as i32,
        )
        .await?;
    }
    Ok(())
}

/* ---------------- rewrite ---------------- */

/// Produce a one-level rewrite of an existing story as a new, never
/// reusable row. The original stays untouched and remains a valid cache
/// and history entry.
pub async fn rewrite_story(
    ctx: &EngineCtx,
    story_id: Uuid,
    learner_id: Uuid,
    direction: RewriteDirection,
) -> Result<StoryRow, EngineError> {
    let original = fetch_owned_story(ctx, story_id, learner_id).await?;
    let learner = db::fetch_learner(&ctx.pool, learner_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| EngineError::GenerationFailed("learner not found".into()))?;

    let (system, user, target_level) =
        prompt::build_rewrite_prompt(&original.title, &original.body, original.level, direction);
    let answer = openai_client::invoke_structured(
        &ctx.http,
        &ctx.settings.openai_api_key,
        &ctx.settings.openai_model,
        &system,
        &user,
        &ctx.invoke_options(),
    )
    .await
    .map_err(|e| match e {
        openai_client::PromptError::NoApiKey => EngineError::NoApiKey,
        other => EngineError::GenerationFailed(other.to_string()),
    })?;

    let story = qa::parse_story_payload(&answer.value).map_err(EngineError::QaRejected)?;
    let tone: Tone = learner.tone.parse().unwrap_or_default();
    let profile = PedagogicalProfile {
        age_years: learner.age_years,
        target_level: target_level as f64,
        topic_slug: original.topic_slug.clone(),
        topic_name: original.topic_slug.clone(),
        topic_description: String::new(),
        core_concept: String::new(),
        tone,
        interests: vec![],
        favorite_characters: vec![],
        personalization: String::new(),
        recent_titles: vec![],
    };
    let verdict = qa::review_content(&story, None, target_level as f64, &[], &ctx.qa);
    let approved = verdict.is_ok();
    let rejection_reason = verdict.err();

    let metadata = build_metadata(&story, &profile, Some(direction));
    let new_id = Uuid::new_v4();
    let row = NewStory {
        id: new_id,
        learner_id,
        topic_slug: original.topic_slug.clone(),
        title: story.title,
        body: story.body,
        level: target_level as f64,
        metadata: serde_json::to_value(&metadata).map_err(|e| internal(e.into()))?,
        model: ctx.settings.openai_model.clone(),
        approved,
        rejection_reason: rejection_reason.clone(),
        reusable: false,
    };
    db::insert_story(&ctx.pool, &row).await.map_err(internal)?;

    if let Some(reason) = rejection_reason {
        return Err(EngineError::QaRejected(reason));
    }
    db::fetch_story(&ctx.pool, new_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| EngineError::GenerationFailed("rewrite row vanished".into()))
}

async fn fetch_owned_story(
    ctx: &EngineCtx,
    story_id: Uuid,
    learner_id: Uuid,
) -> Result<StoryRow, EngineError> {
    let story = db::fetch_story(&ctx.pool, story_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| EngineError::GenerationFailed(format!("story {story_id} not found")))?;
    if story.learner_id != learner_id {
        return Err(EngineError::GenerationFailed(
            "story belongs to another learner".into(),
        ));
    }
    Ok(story)
}

fn internal(e: anyhow::Error) -> EngineError {
    EngineError::GenerationFailed(e.to_string())
}
