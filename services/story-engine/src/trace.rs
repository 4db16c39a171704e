//! Progress-tracking state machine for one generation request. The trace
//! is persisted after every observable mutation and re-fetched by pollers;
//! it is the only progress signal a caller has while generation is in
//! flight.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use strum_macros::{Display, EnumString};
use uuid::Uuid;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum StageId {
    Validations,
    Route,
    Cache,
    Prompt,
    Llm,
    Persistence,
    Session,
}

/// Fixed stage ladder: id, human label, target progress. Targets are
/// strictly increasing; overall progress never moves backwards.
pub const STAGE_PLAN: [(StageId, &str, u8); 7] = [
    (StageId::Validations, "Comprobando límites", 10),
    (StageId::Route, "Eligiendo tema", 25),
    (StageId::Cache, "Buscando historias guardadas", 40),
    (StageId::Prompt, "Preparando instrucciones", 55),
    (StageId::Llm, "Escribiendo la historia", 82),
    (StageId::Persistence, "Guardando la historia", 92),
    (StageId::Session, "Creando la sesión", 98),
];

/// Stages retired without running when the cache already has a story.
pub const CONTENT_STAGES: [StageId; 3] = [StageId::Prompt, StageId::Llm, StageId::Persistence];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum StageStatus {
    Pending,
    Running,
    Done,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TraceStatus {
    Running,
    Done,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub id: StageId,
    pub label: String,
    pub target: u8,
    pub status: StageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationTrace {
    pub id: Uuid,
    pub learner_id: Uuid,
    pub status: TraceStatus,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<StageId>,
    pub stages: Vec<Stage>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_ms: Option<i64>,
}

impl GenerationTrace {
    pub fn new(id: Uuid, learner_id: Uuid) -> Self {
        let stages = STAGE_PLAN
            .iter()
            .map(|(id, label, target)| Stage {
                id: *id,
                label: (*label).to_string(),
                target: *target,
                status: StageStatus::Pending,
                detail: None,
                started_at: None,
                finished_at: None,
                duration_ms: None,
            })
            .collect();
        GenerationTrace {
            id,
            learner_id,
            status: TraceStatus::Running,
            progress: 0,
            current_stage: None,
            stages,
            started_at: Utc::now(),
            finished_at: None,
            total_ms: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self.status, TraceStatus::Running)
    }

    fn stage_mut(&mut self, id: StageId) -> &mut Stage {
        self.stages
            .iter_mut()
            .find(|s| s.id == id)
            .expect("stage id is always in the fixed plan")
    }

    fn bump_progress(&mut self, floor: u8) {
        if floor > self.progress {
            self.progress = floor;
        }
    }

    /// Mid-stage feedback for pollers: progress jumps to just under the
    /// stage target without claiming the stage finished.
    pub fn mark_running(&mut self, id: StageId, detail: impl Into<String>) {
        if self.is_terminal() {
            return;
        }
        let now = Utc::now();
        let stage = self.stage_mut(id);
        stage.status = StageStatus::Running;
        stage.detail = Some(detail.into());
        if stage.started_at.is_none() {
            stage.started_at = Some(now);
        }
        let floor = stage.target.saturating_sub(12).max(1);
        self.current_stage = Some(id);
        self.bump_progress(floor);
    }

    pub fn mark_done(&mut self, id: StageId, detail: impl Into<String>) {
        if self.is_terminal() {
            return;
        }
        let now = Utc::now();
        let stage = self.stage_mut(id);
        stage.status = StageStatus::Done;
        stage.detail = Some(detail.into());
        stage.finished_at = Some(now);
        stage.duration_ms = stage
            .started_at
            .map(|t| (now - t).num_milliseconds().max(0));
        let target = stage.target;
        self.bump_progress(target);
    }

    /// Terminal: the failing stage keeps its message and the whole trace
    /// freezes. A trace can only error once.
    pub fn mark_error(&mut self, id: StageId, message: impl Into<String>) {
        if self.is_terminal() {
            return;
        }
        let now = Utc::now();
        let stage = self.stage_mut(id);
        stage.status = StageStatus::Error;
        stage.detail = Some(message.into());
        stage.finished_at = Some(now);
        stage.duration_ms = stage
            .started_at
            .map(|t| (now - t).num_milliseconds().max(0));
        self.status = TraceStatus::Error;
        self.finished_at = Some(now);
        self.total_ms = Some((now - self.started_at).num_milliseconds().max(0));
    }

    pub fn finalize_ok(&mut self, detail: impl Into<String>) {
        if self.is_terminal() {
            return;
        }
        let detail = detail.into();
        let last = STAGE_PLAN[STAGE_PLAN.len() - 1].0;
        if self.stage_mut(last).status != StageStatus::Done {
            self.mark_done(last, detail.clone());
        }
        let now = Utc::now();
        self.status = TraceStatus::Done;
        self.progress = 100;
        self.current_stage = None;
        self.finished_at = Some(now);
        self.total_ms = Some((now - self.started_at).num_milliseconds().max(0));
    }

    /// Retire still-pending stages as done with an explanatory detail, so
    /// pollers can tell "skipped after a cache hit" from "never ran".
    pub fn skip_remaining(&mut self, ids: &[StageId], detail: &str) {
        if self.is_terminal() {
            return;
        }
        for id in ids {
            let stage = self.stage_mut(*id);
            if stage.status == StageStatus::Pending {
                stage.status = StageStatus::Done;
                stage.detail = Some(detail.to_string());
                let target = stage.target;
                self.bump_progress(target);
            }
        }
    }
}

/* ---------------- persistence ---------------- */

/// Durably persist the trace. Called after every mutation a poller might
/// observe; stage writes for one request are strictly ordered by the
/// single-threaded orchestrator run.
pub async fn save_trace(pool: &PgPool, trace: &GenerationTrace) -> Result<()> {
    let stages = serde_json::to_value(&trace.stages).context("serialize stages")?;
    sqlx::query(
        "INSERT INTO generation_traces (id, learner_id, status, progress,
                current_stage, stages, started_at, finished_at, total_ms)
         VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)
         ON CONFLICT (id) DO UPDATE
            SET status = EXCLUDED.status, progress = EXCLUDED.progress,
                current_stage = EXCLUDED.current_stage, stages = EXCLUDED.stages,
                finished_at = EXCLUDED.finished_at, total_ms = EXCLUDED.total_ms",
    )
    .bind(trace.id)
    .bind(trace.learner_id)
    .bind(trace.status.to_string())
    .bind(trace.progress as i32)
    .bind(trace.current_stage.map(|s| s.to_string()))
    .bind(stages)
    .bind(trace.started_at)
    .bind(trace.finished_at)
    .bind(trace.total_ms)
    .execute(pool)
    .await
    .context("save_trace")?;
    Ok(())
}

pub async fn load_trace(
    pool: &PgPool,
    id: Uuid,
    learner_id: Uuid,
) -> Result<Option<GenerationTrace>> {
    let Some(row) = sqlx::query(
        "SELECT id, learner_id, status, progress, current_stage, stages,
                started_at, finished_at, total_ms
           FROM generation_traces WHERE id = $1 AND learner_id = $2",
    )
    .bind(id)
    .bind(learner_id)
    .fetch_optional(pool)
    .await
    .context("load_trace")?
    else {
        return Ok(None);
    };

    let status: String = row.get("status");
    let current_stage: Option<String> = row.get("current_stage");
    let stages: serde_json::Value = row.get("stages");
    let progress: i32 = row.get("progress");

    Ok(Some(GenerationTrace {
        id: row.get("id"),
        learner_id: row.get("learner_id"),
        status: status.parse().unwrap_or(TraceStatus::Running),
        progress: progress.clamp(0, 100) as u8,
        current_stage: current_stage.and_then(|s| s.parse().ok()),
        stages: serde_json::from_value(stages).context("decode stages")?,
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
        total_ms: row.get("total_ms"),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trace() -> GenerationTrace {
        GenerationTrace::new(Uuid::new_v4(), Uuid::new_v4())
    }

    #[test]
    fn progress_is_monotonic_across_the_ladder() {
        let mut t = trace();
        let mut seen = vec![t.progress];
        for (id, _, _) in STAGE_PLAN {
            t.mark_running(id, "x");
            seen.push(t.progress);
            t.mark_done(id, "x");
            seen.push(t.progress);
        }
        assert!(seen.windows(2).all(|w| w[0] <= w[1]), "{seen:?}");
        assert_eq!(t.progress, 98);
    }

    #[test]
    fn running_floor_is_at_least_one() {
        let mut t = trace();
        t.mark_running(StageId::Validations, "x");
        // target 10 − 12 would be negative; the floor is 1
        assert_eq!(t.progress, 1);
        t.mark_running(StageId::Llm, "x");
        assert_eq!(t.progress, 70);
    }

    #[test]
    fn error_freezes_the_trace() {
        let mut t = trace();
        t.mark_running(StageId::Llm, "x");
        t.mark_error(StageId::Llm, "boom");
        assert_eq!(t.status, TraceStatus::Error);
        assert!(t.total_ms.is_some());
        let before = t.progress;
        t.mark_done(StageId::Persistence, "late write");
        t.finalize_ok("late finalize");
        assert_eq!(t.status, TraceStatus::Error);
        assert_eq!(t.progress, before);
    }

    #[test]
    fn skip_remaining_retires_pending_stages_as_done() {
        let mut t = trace();
        t.mark_done(StageId::Validations, "ok");
        t.mark_done(StageId::Route, "ok");
        t.mark_done(StageId::Cache, "hit");
        t.skip_remaining(&CONTENT_STAGES, "omitida: historia reutilizada");
        for id in CONTENT_STAGES {
            let s = t.stages.iter().find(|s| s.id == id).unwrap();
            assert_eq!(s.status, StageStatus::Done);
            assert_eq!(s.detail.as_deref(), Some("omitida: historia reutilizada"));
        }
        t.finalize_ok("listo");
        assert_eq!(t.status, TraceStatus::Done);
        assert_eq!(t.progress, 100);
    }

    #[test]
    fn finalize_marks_terminal_stage_done() {
        let mut t = trace();
        t.mark_running(StageId::Session, "x");
        t.finalize_ok("listo");
        let last = t.stages.last().unwrap();
        assert_eq!(last.status, StageStatus::Done);
        assert_eq!(t.progress, 100);
    }
}
