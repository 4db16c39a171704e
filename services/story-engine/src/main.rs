//! REST surface for the adaptive story engine: generation, trace polling,
//! background question batches, rewrites and session finalization.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};
use uuid::Uuid;

use shared::config::Settings;
use shared::db;
use shared::dto::{
    FinishSessionRequest, FinishSessionResponse, GenerationRequest, RewriteDirection,
};
use shared::error::EngineError;

mod cache;
mod orchestrator;
mod prompt;
mod qa;
mod rating;
mod session;
mod textnorm;
mod topics;
mod trace;

use orchestrator::EngineCtx;

/// Ensures the database connection string disables SSL for local setups.
fn ensure_sslmode_disable(url: &str) -> String {
    if url.to_ascii_lowercase().contains("sslmode=") {
        return url.to_string();
    }

    let disable_for_local = url::Url::parse(url)
        .ok()
        .and_then(|parsed| parsed.host_str().map(|host| host.to_ascii_lowercase()))
        .map(|host| matches!(host.as_str(), "localhost" | "127.0.0.1" | "::1"))
        .unwrap_or(false);

    if !disable_for_local {
        return url.to_string();
    }

    if url.contains('?') {
        format!("{url}&sslmode=disable")
    } else {
        format!("{url}?sslmode=disable")
    }
}

/// Simple liveness endpoint for orchestration.
async fn health() -> &'static str {
    "OK"
}

/* ---------------- DTOs ---------------- */

#[derive(Serialize, Debug)]
struct ErrorResponse {
    code: String,
    error: String,
}

#[derive(Serialize)]
struct GenerationAccepted {
    trace_id: Uuid,
    learner_id: Uuid,
}

#[derive(Deserialize)]
struct TraceParams {
    learner_id: Uuid,
}

#[derive(Deserialize)]
struct QuestionsInput {
    learner_id: Uuid,
}

#[derive(Deserialize)]
struct RewriteInput {
    learner_id: Uuid,
    direction: RewriteDirection,
}

#[derive(Serialize)]
struct QuestionData {
    id: Uuid,
    #[serde(rename = "type")]
    kind: String,
    question: String,
    options: Value,
    correct_index: i32,
    explanation: String,
    difficulty: i32,
    position: i32,
}

#[derive(Serialize)]
struct StoryData {
    id: Uuid,
    topic_slug: String,
    title: String,
    body: String,
    level: f64,
    approved: bool,
    reusable: bool,
    metadata: Value,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn engine_err(e: EngineError) -> ApiError {
    let status = match e {
        EngineError::NoApiKey => StatusCode::SERVICE_UNAVAILABLE,
        EngineError::RateLimit => StatusCode::TOO_MANY_REQUESTS,
        EngineError::QaRejected(_) | EngineError::GenerationFailed(_) => StatusCode::BAD_GATEWAY,
    };
    let body = ErrorResponse {
        code: e.code().to_string(),
        error: e.to_string(),
    };
    (status, Json(body))
}

fn int_err<E: std::fmt::Display>(e: E) -> ApiError {
    error!("internal error: {e}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            code: "INTERNAL".into(),
            error: "internal error".into(),
        }),
    )
}

fn not_found() -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            code: "NOT_FOUND".into(),
            error: "not found".into(),
        }),
    )
}

/* ---------------- handlers ---------------- */

/// Kick off a generation run and return the trace id immediately; the
/// caller observes progress and the terminal outcome through the trace.
async fn start_generation(
    State(ctx): State<Arc<EngineCtx>>,
    Json(mut input): Json<GenerationRequest>,
) -> Result<(StatusCode, Json<GenerationAccepted>), ApiError> {
    let trace_id = input.trace_id.unwrap_or_else(Uuid::new_v4);
    input.trace_id = Some(trace_id);
    let learner_id = input.learner_id;

    let ctx = ctx.clone();
    tokio::spawn(async move {
        // errors are already written into the trace by the orchestrator
        let _ = orchestrator::run_generation(&ctx, input).await;
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(GenerationAccepted {
            trace_id,
            learner_id,
        }),
    ))
}

async fn get_trace(
    Path(id): Path<Uuid>,
    Query(params): Query<TraceParams>,
    State(ctx): State<Arc<EngineCtx>>,
) -> Result<Json<trace::GenerationTrace>, ApiError> {
    let Some(found) = trace::load_trace(&ctx.pool, id, params.learner_id)
        .await
        .map_err(int_err)?
    else {
        return Err(not_found());
    };
    Ok(Json(found))
}

async fn generate_questions(
    Path(story_id): Path<Uuid>,
    State(ctx): State<Arc<EngineCtx>>,
    Json(input): Json<QuestionsInput>,
) -> Result<Json<Vec<QuestionData>>, ApiError> {
    let rows = orchestrator::generate_questions(&ctx, story_id, input.learner_id)
        .await
        .map_err(engine_err)?;
    Ok(Json(
        rows.into_iter()
            .map(|q| QuestionData {
                id: q.id,
                kind: q.kind,
                question: q.prompt,
                options: q.options,
                correct_index: q.correct_index,
                explanation: q.explanation,
                difficulty: q.difficulty,
                position: q.position,
            })
            .collect(),
    ))
}

async fn rewrite_story(
    Path(story_id): Path<Uuid>,
    State(ctx): State<Arc<EngineCtx>>,
    Json(input): Json<RewriteInput>,
) -> Result<Json<StoryData>, ApiError> {
    let row = orchestrator::rewrite_story(&ctx, story_id, input.learner_id, input.direction)
        .await
        .map_err(engine_err)?;
    Ok(Json(StoryData {
        id: row.id,
        topic_slug: row.topic_slug,
        title: row.title,
        body: row.body,
        level: row.level,
        approved: row.approved,
        reusable: row.reusable,
        metadata: row.metadata,
    }))
}

async fn finish_session(
    Path(session_id): Path<Uuid>,
    State(ctx): State<Arc<EngineCtx>>,
    Json(input): Json<FinishSessionRequest>,
) -> Result<Json<FinishSessionResponse>, ApiError> {
    let result = session::finalize_session(&ctx, session_id, input)
        .await
        .map_err(engine_err)?;
    Ok(Json(result))
}

/* ---------------- startup ---------------- */

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let settings = Settings::new()?;
    let db_url = ensure_sslmode_disable(&settings.database_url);

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&db_url)
        .await
        .map_err(|e| {
            error!(%e, "failed to connect to Postgres");
            e
        })?;

    db::init_schema(&pool).await?;

    let ctx = Arc::new(EngineCtx {
        pool,
        http: reqwest::Client::new(),
        settings: settings.clone(),
        router: Arc::new(topics::CatalogueRouter),
        qa: qa::DEFAULT_QA.clone(),
    });

    let app = Router::new()
        .route("/health", get(health))
        .route("/generations", post(start_generation))
        .route("/traces/:id", get(get_trace))
        .route("/stories/:id/questions", post(generate_questions))
        .route("/stories/:id/rewrite", post(rewrite_story))
        .route("/sessions/:id/finish", post(finish_session))
        .layer(CorsLayer::permissive())
        .with_state(ctx);

    let addr = settings.bind_addr.parse()?;
    info!("story-engine listening on {addr}");
    axum::Server::bind(&addr).serve(app.into_make_service()).await?;
    Ok(())
}
