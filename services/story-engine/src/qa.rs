//! Quality gate for generated content. Structural checks establish that a
//! payload has the right shape; the content rubric then applies ordered
//! checks and reports the first failure only — the orchestrator discards
//! and retries on any rejection, so aggregating reasons buys nothing.

use once_cell::sync::Lazy;
use serde_json::Value;
use shared::dto::{QuestionKind, QuestionPayload, StoryPayload};

use crate::prompt::spec_for_level;
use crate::textnorm;

/// Process-wide default policy; swap per deployment by constructing an
/// `EngineCtx` with a different `QaConfig`.
pub static DEFAULT_QA: Lazy<QaConfig> = Lazy::new(QaConfig::default);

/// Content-policy knobs. The word lists and the similarity threshold are
/// tuned for one language and one catalogue; they are data, not pipeline
/// structure.
#[derive(Debug, Clone)]
pub struct QaConfig {
    pub unsafe_terms: Vec<&'static str>,
    pub flat_openings: Vec<&'static str>,
    pub narrative_connectives: Vec<&'static str>,
    pub duplicate_title_threshold: f64,
    pub length_tolerance: f64,
}

impl Default for QaConfig {
    fn default() -> Self {
        QaConfig {
            unsafe_terms: vec![
                "matar", "asesin", "sangre", "pistola", "cuchillo", "droga", "alcohol",
                "cigarrillo", "suicid", "desnudo", "secuestro", "tortura", "apostar",
            ],
            flat_openings: vec![
                "en este texto",
                "en esta historia aprenderas",
                "hoy vamos a aprender",
                "hoy aprenderemos",
                "a continuacion",
                "este texto trata",
                "vamos a conocer",
                "en esta leccion",
            ],
            narrative_connectives: vec![
                "un dia", "de repente", "de pronto", "entonces", "pero", "cuando",
                "mientras", "finalmente", "despues", "asi que", "al final", "luego",
            ],
            duplicate_title_threshold: 0.9,
            length_tolerance: 0.30,
        }
    }
}

/* ---------------- structural pass ---------------- */

fn non_empty_str<'a>(v: &'a Value, key: &str) -> Option<&'a str> {
    v.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn string_array(v: &Value, key: &str) -> Option<Vec<String>> {
    match v.get(key) {
        None | Some(Value::Null) => Some(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|i| i.as_str().map(|s| s.trim().to_string()))
            .collect(),
        Some(_) => None,
    }
}

/// Story fields only: title and body present and non-empty, vocabulary an
/// array of strings when given.
pub fn parse_story_payload(v: &Value) -> Result<StoryPayload, String> {
    let title = non_empty_str(v, "title").ok_or("falta el campo title")?;
    let body = non_empty_str(v, "body").ok_or("falta el campo body")?;
    let new_vocabulary =
        string_array(v, "new_vocabulary").ok_or("new_vocabulary no es una lista de palabras")?;
    Ok(StoryPayload {
        title: title.to_string(),
        body: body.to_string(),
        new_vocabulary,
    })
}

fn parse_question(v: &Value, position: usize) -> Result<QuestionPayload, String> {
    let kind: QuestionKind = non_empty_str(v, "type")
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| format!("pregunta {}: tipo desconocido", position + 1))?;
    let question = non_empty_str(v, "question")
        .ok_or_else(|| format!("pregunta {}: enunciado vacío", position + 1))?;
    let options = string_array(v, "options")
        .filter(|o| o.len() == 4)
        .ok_or_else(|| format!("pregunta {}: se esperaban 4 opciones", position + 1))?;
    let correct_index = v
        .get("correct_index")
        .and_then(Value::as_u64)
        .filter(|i| *i <= 3)
        .ok_or_else(|| format!("pregunta {}: correct_index fuera de rango", position + 1))?
        as usize;
    let difficulty = match v.get("difficulty") {
        None | Some(Value::Null) => None,
        Some(d) => Some(
            d.as_i64()
                .filter(|n| (1..=5).contains(n))
                .ok_or_else(|| format!("pregunta {}: difficulty fuera de 1..5", position + 1))?
                as i32,
        ),
    };
    Ok(QuestionPayload {
        kind,
        question: question.to_string(),
        options,
        correct_index,
        explanation: non_empty_str(v, "explanation").unwrap_or("").to_string(),
        difficulty,
    })
}

/// Question list only (deferred question generation).
pub fn parse_questions_payload(v: &Value) -> Result<Vec<QuestionPayload>, String> {
    let items = v
        .get("questions")
        .and_then(Value::as_array)
        .ok_or("falta la lista questions")?;
    if items.is_empty() {
        return Err("la lista questions está vacía".into());
    }
    items
        .iter()
        .enumerate()
        .map(|(i, q)| parse_question(q, i))
        .collect()
}

/// Combined single-call generation: story plus exactly four questions.
pub fn parse_combined_payload(v: &Value) -> Result<(StoryPayload, Vec<QuestionPayload>), String> {
    let story = parse_story_payload(v)?;
    let questions = parse_questions_payload(v)?;
    if questions.len() != 4 {
        return Err(format!("se esperaban 4 preguntas, llegaron {}", questions.len()));
    }
    Ok((story, questions))
}

/// Rubric for a standalone question batch: exactly four questions, all
/// four kinds present, options sane. Mirrors checks 3–4 of the combined
/// rubric.
pub fn review_questions(questions: &[QuestionPayload]) -> Result<(), String> {
    if questions.len() != 4 {
        return Err(format!("se esperaban 4 preguntas, llegaron {}", questions.len()));
    }
    for kind in QuestionKind::ALL {
        if !questions.iter().any(|q| q.kind == kind) {
            return Err(format!("falta una pregunta de tipo {kind}"));
        }
    }
    for (i, q) in questions.iter().enumerate() {
        let mut seen = std::collections::HashSet::new();
        for opt in &q.options {
            if !seen.insert(textnorm::normalize(opt)) {
                return Err(format!("pregunta {}: opciones duplicadas", i + 1));
            }
        }
        if q.correct_index >= q.options.len() || q.options[q.correct_index].trim().is_empty() {
            return Err(format!("pregunta {}: la opción correcta no es válida", i + 1));
        }
    }
    Ok(())
}

/* ---------------- content rubric ---------------- */

/// Ordered content rubric; `Err` carries the first rejection reason found.
/// Pass `questions: None` for story-only validation (the required-kinds
/// check only applies to combined generation).
pub fn review_content(
    story: &StoryPayload,
    questions: Option<&[QuestionPayload]>,
    level: f64,
    recent_titles: &[String],
    cfg: &QaConfig,
) -> Result<(), String> {
    let normalized_all = textnorm::normalize(&format!("{} {}", story.title, story.body));

    // 1. denylist
    for term in &cfg.unsafe_terms {
        if normalized_all.contains(term) {
            return Err(format!("contenido no apto («{term}»)"));
        }
    }

    // 2. length band: level band widened by the tolerance on both ends
    let spec = spec_for_level(level);
    let words = story.body.split_whitespace().count();
    let min = (spec.words_min as f64 * (1.0 - cfg.length_tolerance)).floor() as usize;
    let max = (spec.words_max as f64 * (1.0 + cfg.length_tolerance)).ceil() as usize;
    if words < min {
        return Err(format!("texto demasiado corto: {words} palabras (mínimo {min})"));
    }
    if words > max {
        return Err(format!("texto demasiado largo: {words} palabras (máximo {max})"));
    }

    // 3. the four required kinds (combined form only)
    if let Some(questions) = questions {
        for kind in QuestionKind::ALL {
            if !questions.iter().any(|q| q.kind == kind) {
                return Err(format!("falta una pregunta de tipo {kind}"));
            }
        }
    }

    // 4. option sanity
    if let Some(questions) = questions {
        for (i, q) in questions.iter().enumerate() {
            let mut seen = std::collections::HashSet::new();
            for opt in &q.options {
                if !seen.insert(textnorm::normalize(opt)) {
                    return Err(format!("pregunta {}: opciones duplicadas", i + 1));
                }
            }
            if q.correct_index >= q.options.len() {
                return Err(format!("pregunta {}: correct_index fuera de rango", i + 1));
            }
            if q.options[q.correct_index].trim().is_empty() {
                return Err(format!("pregunta {}: la opción correcta está vacía", i + 1));
            }
        }
    }

    // 5. title quality
    if story.title.trim().chars().count() < 3 {
        return Err("título demasiado corto".into());
    }

    // 6. duplicate-title guard
    let candidate_norm = textnorm::normalize(&story.title);
    let candidate_tokens = textnorm::tokens(&story.title, 2);
    for recent in recent_titles {
        if textnorm::normalize(recent) == candidate_norm {
            return Err(format!("título repetido: «{recent}»"));
        }
        let similarity =
            textnorm::dice_similarity(&candidate_tokens, &textnorm::tokens(recent, 2));
        if similarity >= cfg.duplicate_title_threshold {
            return Err(format!("título casi idéntico a «{recent}»"));
        }
    }

    // 7. flat-opening guard over the first ~80 normalized chars
    let opening: String = textnorm::normalize(&story.body).chars().take(80).collect();
    for flat in &cfg.flat_openings {
        if opening.starts_with(flat) {
            return Err(format!("apertura de manual («{flat}…»)"));
        }
    }

    // 8. narrative-progression guard on word boundaries
    let body_words = format!(" {} ", textnorm::tokens(&story.body, 1).join(" "));
    let has_connective = cfg
        .narrative_connectives
        .iter()
        .any(|c| body_words.contains(&format!(" {c} ")));
    if !has_connective {
        return Err("sin progresión narrativa".into());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn story(title: &str, body: &str) -> StoryPayload {
        StoryPayload {
            title: title.into(),
            body: body.into(),
            new_vocabulary: vec![],
        }
    }

    fn good_body(words: usize) -> String {
        // level-2 friendly narrative filler with a connective
        let mut body = String::from("Un dia la pequena Vega miro el cielo. ");
        while body.split_whitespace().count() < words {
            body.push_str("Entonces conto una estrella mas y sonrio contenta. ");
        }
        body
    }

    fn questions() -> Vec<QuestionPayload> {
        ["literal", "inference", "vocabulary", "summary"]
            .iter()
            .map(|k| QuestionPayload {
                kind: k.parse().unwrap(),
                question: format!("¿Pregunta {k}?"),
                options: vec!["a".into(), "b".into(), "c".into(), "d".into()],
                correct_index: 1,
                explanation: "porque sí".into(),
                difficulty: Some(3),
            })
            .collect()
    }

    #[test]
    fn combined_payload_requires_four_questions() {
        let v = json!({
            "title": "La luna", "body": "texto",
            "questions": [{"type": "literal", "question": "q",
                "options": ["a","b","c","d"], "correct_index": 0}]
        });
        assert!(parse_combined_payload(&v).unwrap_err().contains("4 preguntas"));
    }

    #[test]
    fn structural_rejects_bad_difficulty_and_index() {
        let q = json!({"type": "literal", "question": "q",
            "options": ["a","b","c","d"], "correct_index": 4});
        assert!(parse_question(&q, 0).unwrap_err().contains("correct_index"));
        let q = json!({"type": "literal", "question": "q",
            "options": ["a","b","c","d"], "correct_index": 1, "difficulty": 9});
        assert!(parse_question(&q, 0).unwrap_err().contains("difficulty"));
    }

    #[test]
    fn first_failure_wins_over_later_checks() {
        // fails the length band AND has no narrative connective; the
        // rubric must always report the band, which runs first
        let s = story("Los planetas", "El sol brilla sobre todos los planetas grandes.");
        let err = review_content(&s, None, 2.0, &[], &QaConfig::default()).unwrap_err();
        assert!(err.contains("demasiado corto"), "{err}");
    }

    #[test]
    fn denylist_is_case_and_diacritic_insensitive() {
        let s = story("El bosque", &format!("{} Y un CUCHILLO aparecio.", good_body(120)));
        let err = review_content(&s, None, 2.0, &[], &QaConfig::default()).unwrap_err();
        assert!(err.contains("no apto"), "{err}");
    }

    #[test]
    fn missing_kind_is_rejected_in_combined_form() {
        let mut qs = questions();
        qs[3].kind = QuestionKind::Literal; // summary replaced
        let s = story("Vega y las estrellas", &good_body(120));
        let err = review_content(&s, Some(&qs), 2.0, &[], &QaConfig::default()).unwrap_err();
        assert!(err.contains("summary"), "{err}");
    }

    #[test]
    fn duplicate_options_are_rejected_after_normalization() {
        let mut qs = questions();
        qs[2].options = vec!["Águila".into(), "aguila".into(), "c".into(), "d".into()];
        let s = story("Vega y las estrellas", &good_body(120));
        let err = review_content(&s, Some(&qs), 2.0, &[], &QaConfig::default()).unwrap_err();
        assert!(err.contains("duplicadas"), "{err}");
    }

    #[test]
    fn near_identical_title_is_rejected() {
        let s = story("La luna brillante del verano", &good_body(120));
        let recent = vec!["La Luna brillante del verano.".to_string()];
        let err = review_content(&s, None, 2.0, &recent, &QaConfig::default()).unwrap_err();
        assert!(err.contains("título"), "{err}");
    }

    #[test]
    fn unrelated_title_passes_the_guard() {
        let s = story("Vega cuenta estrellas", &good_body(120));
        let recent = vec!["El volcán dormido".to_string()];
        assert!(review_content(&s, None, 2.0, &recent, &QaConfig::default()).is_ok());
    }

    #[test]
    fn flat_opening_is_rejected() {
        let body = format!("En este texto aprenderemos sobre volcanes. {}", good_body(110));
        let s = story("Volcanes", &body);
        let err = review_content(&s, None, 2.0, &[], &QaConfig::default()).unwrap_err();
        assert!(err.contains("apertura"), "{err}");
    }

    #[test]
    fn connective_inside_a_word_does_not_count() {
        // "espero" contains "pero" as a substring; boundaries must apply.
        let mut body = String::new();
        while body.split_whitespace().count() < 120 {
            body.push_str("Vega espero la noche estrellada junto al lago tranquilo. ");
        }
        let s = story("Vega y el lago", &body);
        let err = review_content(&s, None, 2.0, &[], &QaConfig::default()).unwrap_err();
        assert!(err.contains("progresión"), "{err}");
    }

    #[test]
    fn clean_combined_candidate_is_approved() {
        let s = story("Vega cuenta estrellas", &good_body(130));
        assert!(review_content(&s, Some(&questions()), 2.0, &[], &QaConfig::default()).is_ok());
    }
}
