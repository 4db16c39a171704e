//! Difficulty adjustment after a completed session: the coarse reading
//! level (a half-step ladder driven by comprehension) and the fine-grained
//! Glicko ratings (global plus one per question kind, sharing one rating
//! deviation). All math is pure; persistence happens in the caller.

use serde_json::{json, Value};
use shared::dto::{Direction, QuestionKind};

pub const LEVEL_MIN: f64 = 1.0;
pub const LEVEL_MAX: f64 = 10.0;
pub const LEVEL_STEP: f64 = 0.5;

/// Comprehension thresholds driving the direction, independent of the
/// composite session score.
const UP_THRESHOLD: f64 = 0.80;
const HOLD_THRESHOLD: f64 = 0.60;

pub fn clamp_reading_level(x: f64) -> f64 {
    x.clamp(LEVEL_MIN, LEVEL_MAX)
}

/// Everything the coarse adjustment looks at for one session.
#[derive(Debug, Clone)]
pub struct SessionSignals {
    /// Correct-answer ratio in [0, 1].
    pub comprehension: f64,
    pub actual_ms: i64,
    pub expected_ms: i64,
    /// Comprehension ratios of prior completed sessions, newest first.
    pub recent_ratios: Vec<f64>,
}

#[derive(Debug, Clone)]
pub struct LevelDecision {
    pub direction: Direction,
    pub level_before: f64,
    pub level_after: f64,
    pub session_score: f64,
    pub rhythm_ratio: f64,
    pub rhythm_norm: f64,
    pub stability: f64,
    pub reason: String,
}

impl LevelDecision {
    /// Numeric evidence stored with the audit record.
    pub fn evidence(&self, comprehension: f64) -> Value {
        json!({
            "comprehension": comprehension,
            "rhythm_ratio": self.rhythm_ratio,
            "rhythm_norm": self.rhythm_norm,
            "stability": self.stability,
            "session_score": self.session_score,
        })
    }

    /// Safe fallback when the adjustment cannot be computed or persisted:
    /// hold the current level and say why.
    pub fn hold(level: f64, reason: impl Into<String>) -> Self {
        LevelDecision {
            direction: Direction::Hold,
            level_before: level,
            level_after: level,
            session_score: 0.0,
            rhythm_ratio: 1.0,
            rhythm_norm: 1.0,
            stability: 0.5,
            reason: reason.into(),
        }
    }
}

fn variance(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64
}

/// Coarse level evaluation. Direction comes from comprehension alone; the
/// composite score is evidence for the audit trail, not the decider.
pub fn evaluate_level(level_before: f64, signals: &SessionSignals) -> LevelDecision {
    let c = signals.comprehension.clamp(0.0, 1.0);

    let rhythm_ratio = if signals.expected_ms > 0 {
        signals.actual_ms.max(0) as f64 / signals.expected_ms as f64
    } else {
        1.0
    };
    let rhythm_norm = (1.0 - (1.0 - rhythm_ratio).abs() * 0.5).max(0.0);

    let stability = if signals.recent_ratios.len() >= 3 {
        (1.0 - variance(&signals.recent_ratios) * 4.0).max(0.0)
    } else {
        0.5
    };

    let session_score = 0.65 * c + 0.25 * rhythm_norm + 0.10 * stability;

    let (direction, level_after, reason) = if c >= UP_THRESHOLD {
        (
            Direction::Up,
            clamp_reading_level(level_before + LEVEL_STEP),
            format!(
                "Comprensión del {:.0}%: subimos medio nivel para mantener el reto.",
                c * 100.0
            ),
        )
    } else if c >= HOLD_THRESHOLD {
        (
            Direction::Hold,
            level_before,
            format!(
                "Comprensión del {:.0}%: mantenemos el nivel para consolidar.",
                c * 100.0
            ),
        )
    } else {
        (
            Direction::Down,
            clamp_reading_level(level_before - LEVEL_STEP),
            format!(
                "Comprensión del {:.0}%: bajamos medio nivel para reforzar la base.",
                c * 100.0
            ),
        )
    };

    LevelDecision {
        direction,
        level_before,
        level_after,
        session_score,
        rhythm_ratio,
        rhythm_norm,
        stability,
        reason,
    }
}

/// Session reward, co-located because it shares the comprehension ratio.
pub fn stars_for(ratio: f64) -> u8 {
    if ratio >= 1.0 {
        3
    } else if ratio >= 0.75 {
        2
    } else if ratio > 0.0 {
        1
    } else {
        0
    }
}

/* ---------------- Glicko-style skill ratings ---------------- */

pub const RATING_INITIAL: f64 = 1000.0;
pub const RD_MIN: f64 = 30.0;
pub const RD_MAX: f64 = 350.0;
/// Inactivity inflation constant: full uncertainty is regained after
/// roughly 100 idle days.
const RD_INFLATION_C: f64 = 34.6;
const Q: f64 = std::f64::consts::LN_10 / 400.0;

#[derive(Debug, Clone, PartialEq)]
pub struct Ratings {
    pub global: f64,
    pub literal: f64,
    pub inference: f64,
    pub vocabulary: f64,
    pub summary: f64,
    pub rd: f64,
}

impl Default for Ratings {
    fn default() -> Self {
        Ratings {
            global: RATING_INITIAL,
            literal: RATING_INITIAL,
            inference: RATING_INITIAL,
            vocabulary: RATING_INITIAL,
            summary: RATING_INITIAL,
            rd: RD_MAX,
        }
    }
}

impl Ratings {
    pub fn for_kind(&self, kind: QuestionKind) -> f64 {
        match kind {
            QuestionKind::Literal => self.literal,
            QuestionKind::Inference => self.inference,
            QuestionKind::Vocabulary => self.vocabulary,
            QuestionKind::Summary => self.summary,
        }
    }

    fn set_kind(&mut self, kind: QuestionKind, value: f64) {
        match kind {
            QuestionKind::Literal => self.literal = value,
            QuestionKind::Inference => self.inference = value,
            QuestionKind::Vocabulary => self.vocabulary = value,
            QuestionKind::Summary => self.summary = value,
        }
    }
}

/// One answered question as the rating update sees it.
#[derive(Debug, Clone)]
pub struct RatedAnswer {
    pub kind: QuestionKind,
    /// Authored difficulty 1..5; `None` falls back to 3.
    pub difficulty: Option<i32>,
    pub correct: bool,
}

/// Uncertainty grows while the learner is away, bounded above.
pub fn inflate_rd(rd: f64, idle_days: f64) -> f64 {
    (rd * rd + RD_INFLATION_C * RD_INFLATION_C * idle_days.max(0.0))
        .sqrt()
        .clamp(RD_MIN, RD_MAX)
}

fn g(rd: f64) -> f64 {
    1.0 / (1.0 + 3.0 * Q * Q * rd * rd / std::f64::consts::PI.powi(2)).sqrt()
}

fn expected_score(r: f64, opponent: f64, rd: f64) -> f64 {
    1.0 / (1.0 + 10f64.powf(-g(rd) * (r - opponent) / 400.0))
}

/// The comparison anchor is the question's text level, not the learner's
/// current level, offset by the authored difficulty.
pub fn question_opponent_rating(text_level: f64, difficulty: i32) -> f64 {
    800.0 + 100.0 * clamp_reading_level(text_level) + 50.0 * (difficulty.clamp(1, 5) - 3) as f64
}

fn glicko_step(r: f64, rd: f64, opponent: f64, score: f64) -> (f64, f64) {
    let g_rd = g(rd);
    let e = expected_score(r, opponent, rd);
    let d2 = 1.0 / (Q * Q * g_rd * g_rd * e * (1.0 - e));
    let denom = 1.0 / (rd * rd) + 1.0 / d2;
    let new_r = r + (Q / denom) * g_rd * (score - e);
    let new_rd = (1.0 / denom).sqrt().clamp(RD_MIN, RD_MAX);
    (new_r, new_rd)
}

/// Fold a session's answers into the ratings. Each answer updates its
/// kind rating and the global rating; the shared RD is inflated once up
/// front and shrinks as the global rating absorbs results.
pub fn apply_session(
    ratings: &mut Ratings,
    idle_days: f64,
    text_level: f64,
    answers: &[RatedAnswer],
) {
    ratings.rd = inflate_rd(ratings.rd, idle_days);
    for answer in answers {
        let opponent = question_opponent_rating(text_level, answer.difficulty.unwrap_or(3));
        let score = if answer.correct { 1.0 } else { 0.0 };
        let (kind_rating, _) = glicko_step(ratings.for_kind(answer.kind), ratings.rd, opponent, score);
        ratings.set_kind(answer.kind, kind_rating);
        let (global, rd) = glicko_step(ratings.global, ratings.rd, opponent, score);
        ratings.global = global;
        ratings.rd = rd;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_session_scores_0_8025_and_moves_up() {
        let signals = SessionSignals {
            comprehension: 0.85,
            actual_ms: 60_000,
            expected_ms: 60_000,
            recent_ratios: vec![0.8, 0.9], // fewer than 3 → stability 0.5
        };
        let d = evaluate_level(3.0, &signals);
        assert!((d.session_score - 0.8025).abs() < 1e-9, "{}", d.session_score);
        assert_eq!(d.direction, Direction::Up);
        assert!((d.level_after - 3.5).abs() < f64::EPSILON);
    }

    #[test]
    fn direction_comes_from_comprehension_not_the_composite() {
        // terrible rhythm drags the composite down, but c ≥ 0.80 still
        // moves the level up
        let signals = SessionSignals {
            comprehension: 0.8,
            actual_ms: 300_000,
            expected_ms: 60_000,
            recent_ratios: vec![],
        };
        let d = evaluate_level(2.0, &signals);
        assert_eq!(d.direction, Direction::Up);
    }

    #[test]
    fn hold_band_and_down_move() {
        let mut signals = SessionSignals {
            comprehension: 0.7,
            actual_ms: 60_000,
            expected_ms: 60_000,
            recent_ratios: vec![],
        };
        assert_eq!(evaluate_level(2.0, &signals).direction, Direction::Hold);
        signals.comprehension = 0.5;
        let d = evaluate_level(2.0, &signals);
        assert_eq!(d.direction, Direction::Down);
        assert!((d.level_after - 1.5).abs() < f64::EPSILON);
    }

    #[test]
    fn level_clamps_at_both_ends() {
        let down = SessionSignals {
            comprehension: 0.0,
            actual_ms: 0,
            expected_ms: 60_000,
            recent_ratios: vec![],
        };
        assert!((evaluate_level(1.0, &down).level_after - 1.0).abs() < f64::EPSILON);
        let up = SessionSignals {
            comprehension: 1.0,
            actual_ms: 60_000,
            expected_ms: 60_000,
            recent_ratios: vec![],
        };
        assert!((evaluate_level(10.0, &up).level_after - 10.0).abs() < f64::EPSILON);
        assert_eq!(clamp_reading_level(clamp_reading_level(12.0)), 10.0);
    }

    #[test]
    fn perfectly_stable_history_scores_one() {
        let signals = SessionSignals {
            comprehension: 0.7,
            actual_ms: 60_000,
            expected_ms: 60_000,
            recent_ratios: vec![0.75, 0.75, 0.75],
        };
        let d = evaluate_level(2.0, &signals);
        assert!((d.stability - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn stars_table() {
        assert_eq!(stars_for(1.0), 3);
        assert_eq!(stars_for(0.75), 2);
        assert_eq!(stars_for(0.5), 1);
        assert_eq!(stars_for(0.0), 0);
    }

    #[test]
    fn correct_answers_raise_rating_and_shrink_rd() {
        let mut r = Ratings::default();
        let answers = vec![
            RatedAnswer { kind: QuestionKind::Literal, difficulty: Some(3), correct: true },
            RatedAnswer { kind: QuestionKind::Summary, difficulty: None, correct: true },
        ];
        apply_session(&mut r, 0.0, 2.0, &answers);
        assert!(r.global > RATING_INITIAL);
        assert!(r.literal > RATING_INITIAL);
        assert!(r.summary > RATING_INITIAL);
        // untouched kinds keep their rating
        assert!((r.inference - RATING_INITIAL).abs() < f64::EPSILON);
        assert!(r.rd < RD_MAX);
        assert!(r.rd >= RD_MIN);
    }

    #[test]
    fn wrong_answers_lower_the_kind_rating() {
        let mut r = Ratings::default();
        apply_session(
            &mut r,
            0.0,
            5.0,
            &[RatedAnswer { kind: QuestionKind::Inference, difficulty: Some(4), correct: false }],
        );
        assert!(r.inference < RATING_INITIAL);
        assert!(r.global < RATING_INITIAL);
    }

    #[test]
    fn inactivity_inflates_rd_but_never_past_the_cap() {
        let inflated = inflate_rd(80.0, 30.0);
        assert!(inflated > 80.0);
        assert!(inflate_rd(340.0, 10_000.0) <= RD_MAX);
        assert!(inflate_rd(10.0, 0.0) >= RD_MIN);
    }

    #[test]
    fn opponent_rating_anchors_to_the_text_level() {
        assert!((question_opponent_rating(2.0, 3) - 1000.0).abs() < f64::EPSILON);
        assert!((question_opponent_rating(2.0, 5) - 1100.0).abs() < f64::EPSILON);
        assert!(question_opponent_rating(8.0, 3) > question_opponent_rating(2.0, 3));
        // difficulty outside 1..5 is clamped
        assert!((question_opponent_rating(2.0, 9) - 1100.0).abs() < f64::EPSILON);
    }
}
