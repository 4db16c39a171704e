//! Prompt construction: a static system prompt plus per-level user
//! templates interpolated from the pedagogical profile. Pure string work,
//! no I/O.

use shared::dto::{PedagogicalProfile, RewriteDirection, Tone};

/// Reading parameters for one discrete prompt level. The continuous
/// learner level is snapped to the nearest of these four.
#[derive(Debug, Clone, Copy)]
pub struct LevelSpec {
    pub level: u8,
    pub words_min: usize,
    pub words_max: usize,
    pub sentence_min: usize,
    pub sentence_max: usize,
    pub lexical: &'static str,
    pub density: &'static str,
}

pub const LEVEL_SPECS: [LevelSpec; 4] = [
    LevelSpec {
        level: 1,
        words_min: 60,
        words_max: 110,
        sentence_min: 4,
        sentence_max: 8,
        lexical: "Usa vocabulario muy frecuente y concreto, sin palabras abstractas.",
        density: "Presenta una sola idea por oración y repite los nombres de los personajes.",
    },
    LevelSpec {
        level: 2,
        words_min: 100,
        words_max: 180,
        sentence_min: 6,
        sentence_max: 10,
        lexical: "Usa vocabulario cotidiano e introduce dos o tres palabras nuevas explicadas por contexto.",
        density: "Una idea principal por párrafo, con conectores sencillos entre oraciones.",
    },
    LevelSpec {
        level: 3,
        words_min: 160,
        words_max: 260,
        sentence_min: 8,
        sentence_max: 14,
        lexical: "Mezcla vocabulario cotidiano con términos del tema, aclarados la primera vez que aparecen.",
        density: "Encadena causas y consecuencias; permite oraciones subordinadas simples.",
    },
    LevelSpec {
        level: 4,
        words_min: 240,
        words_max: 380,
        sentence_min: 10,
        sentence_max: 18,
        lexical: "Usa vocabulario rico y preciso, incluyendo términos técnicos del tema.",
        density: "Desarrolla ideas en varios pasos y admite tramas con giro o sorpresa.",
    },
];

/// Snap a continuous level onto the 1..4 template scale. Idempotent.
pub fn clamp_prompt_level(level: f64) -> u8 {
    level.round().clamp(1.0, 4.0) as u8
}

pub fn spec_for_level(level: f64) -> &'static LevelSpec {
    let snapped = clamp_prompt_level(level);
    &LEVEL_SPECS[(snapped - 1) as usize]
}

/// Rewrite target: one template level up or down from the original,
/// saturating at the scale edges.
pub fn rewrite_target_level(current: f64, direction: RewriteDirection) -> u8 {
    let cur = clamp_prompt_level(current) as i8;
    let moved = match direction {
        RewriteDirection::Simplify => cur - 1,
        RewriteDirection::Elevate => cur + 1,
    };
    moved.clamp(1, 4) as u8
}

const SYSTEM_PROMPT: &str = r#"Eres una autora de cuentos infantiles en español, cálida y precisa.

Reglas de seguridad: nada de violencia explícita, miedo intenso, contenido adulto, marcas comerciales ni moralejas condescendientes. El cuento debe ser apropiado para la edad indicada.

Cada cuento lleva exactamente 4 preguntas de comprensión, una de cada tipo:
- "literal": un dato que aparece tal cual en el texto.
- "inference": algo que se deduce pero no se dice.
- "vocabulary": el significado de una palabra del cuento en su contexto.
- "summary": la idea principal del cuento completo.

Responde siempre con exactamente un objeto JSON, sin texto fuera del objeto, con esta forma:
{
  "title": string,
  "body": string,
  "new_vocabulary": [string],
  "questions": [
    { "type": "literal|inference|vocabulary|summary", "question": string,
      "options": [string, string, string, string], "correct_index": 0-3,
      "explanation": string, "difficulty": 1-5 }
  ]
}

Las cuatro opciones de cada pregunta deben ser distintas y solo una correcta."#;

const REWRITE_SYSTEM_PROMPT: &str = r#"Eres una autora de cuentos infantiles en español.

Vas a reescribir un cuento existente a otro nivel de lectura conservando los personajes, el escenario y la trama. No agregues preguntas.

Responde siempre con exactamente un objeto JSON, sin texto fuera del objeto:
{ "title": string, "body": string, "new_vocabulary": [string] }"#;

const QUESTIONS_SYSTEM_PROMPT: &str = r#"Eres una maestra de primaria que redacta preguntas de comprensión lectora en español.

Para el cuento recibido escribe exactamente 4 preguntas, una de cada tipo:
- "literal": un dato que aparece tal cual en el texto.
- "inference": algo que se deduce pero no se dice.
- "vocabulary": el significado de una palabra del cuento en su contexto.
- "summary": la idea principal del cuento completo.

Responde siempre con exactamente un objeto JSON, sin texto fuera del objeto:
{ "questions": [
  { "type": "literal|inference|vocabulary|summary", "question": string,
    "options": [string, string, string, string], "correct_index": 0-3,
    "explanation": string, "difficulty": 1-5 }
] }

Las cuatro opciones de cada pregunta deben ser distintas y solo una correcta."#;

const QUESTIONS_TEMPLATE: &str = r#"Nivel de lectura del cuento: {level} (escala 1 a 4).
Ajusta la dificultad de las preguntas a ese nivel.

Cuento, titulado «{title}»:
{body}"#;

const STORY_TEMPLATE: &str = r#"Escribe un cuento sobre «{topic_name}»: {topic_description}.
Concepto que el cuento debe transmitir: {core_concept}.
Lector: {age} años.

Requisitos del texto:
- Entre {words_min} y {words_max} palabras.
- Oraciones de {sentence_min} a {sentence_max} palabras.
- {lexical}
- {density}
- Estilo: {tone_instruction}
- El cuento debe narrar una historia con personajes y progresión, nunca explicar el tema como un manual."#;

const REWRITE_TEMPLATE: &str = r#"Reescribe el siguiente cuento para un lector de nivel {target_level} (escala 1 a 4).
{direction_instruction}
- Entre {words_min} y {words_max} palabras.
- Oraciones de {sentence_min} a {sentence_max} palabras.
- {lexical}
- {density}
Conserva el título o ajústalo ligeramente si ya no encaja.

Cuento original, titulado «{title}»:
{body}"#;

fn tone_instruction(tone: Tone) -> &'static str {
    match tone {
        Tone::Educational => "informativo y sereno, centrado en el tema, con narración ligera",
        Tone::Balanced => "narrativo con toques de humor, equilibrando historia y contenido",
        Tone::Creative => "imaginativo y juguetón, con comparaciones inesperadas",
        Tone::Fantastical => "fantástico y exagerado, donde lo imposible ocurre con naturalidad",
    }
}

/// Build the (system, user) prompt pair for a fresh story.
pub fn build_story_prompt(profile: &PedagogicalProfile) -> (String, String) {
    let spec = spec_for_level(profile.target_level);

    let mut user = STORY_TEMPLATE
        .replace("{topic_name}", &profile.topic_name)
        .replace("{topic_description}", &profile.topic_description)
        .replace("{core_concept}", &profile.core_concept)
        .replace("{age}", &profile.age_years.to_string())
        .replace("{words_min}", &spec.words_min.to_string())
        .replace("{words_max}", &spec.words_max.to_string())
        .replace("{sentence_min}", &spec.sentence_min.to_string())
        .replace("{sentence_max}", &spec.sentence_max.to_string())
        .replace("{lexical}", spec.lexical)
        .replace("{density}", spec.density)
        .replace("{tone_instruction}", tone_instruction(profile.tone));

    if !profile.interests.is_empty() {
        user.push_str(&format!(
            "\n\nIntereses del lector que puedes tejer en la historia: {}.",
            profile.interests.join(", ")
        ));
    }
    if !profile.favorite_characters.is_empty() {
        user.push_str(&format!(
            "\nSi encaja, incluye alguno de sus personajes favoritos: {}.",
            profile.favorite_characters.join(", ")
        ));
    }
    if !profile.personalization.trim().is_empty() {
        user.push_str(&format!(
            "\nDatos del lector para personalizar detalles: {}.",
            profile.personalization.trim()
        ));
    }
    if !profile.recent_titles.is_empty() {
        user.push_str(&format!(
            "\n\nTítulos ya usados que NO debes repetir ni imitar: {}.",
            profile
                .recent_titles
                .iter()
                .map(|t| format!("«{t}»"))
                .collect::<Vec<_>>()
                .join(", ")
        ));
    }

    (SYSTEM_PROMPT.to_string(), user)
}

/// Build the (system, user) pair for the deferred question batch over an
/// already-persisted story.
pub fn build_questions_prompt(title: &str, body: &str, level: f64) -> (String, String) {
    let user = QUESTIONS_TEMPLATE
        .replace("{level}", &clamp_prompt_level(level).to_string())
        .replace("{title}", title)
        .replace("{body}", body);
    (QUESTIONS_SYSTEM_PROMPT.to_string(), user)
}

/// Build the (system, user) pair for a one-level rewrite of an existing
/// story. Returns the target template level alongside.
pub fn build_rewrite_prompt(
    title: &str,
    body: &str,
    current_level: f64,
    direction: RewriteDirection,
) -> (String, String, u8) {
    let target = rewrite_target_level(current_level, direction);
    let spec = &LEVEL_SPECS[(target - 1) as usize];
    let direction_instruction = match direction {
        RewriteDirection::Simplify => {
            "Simplifica: oraciones más cortas, vocabulario más frecuente, menos ideas por párrafo."
        }
        RewriteDirection::Elevate => {
            "Eleva: oraciones más elaboradas, vocabulario más rico, más matices en la trama."
        }
    };

    let user = REWRITE_TEMPLATE
        .replace("{target_level}", &target.to_string())
        .replace("{direction_instruction}", direction_instruction)
        .replace("{words_min}", &spec.words_min.to_string())
        .replace("{words_max}", &spec.words_max.to_string())
        .replace("{sentence_min}", &spec.sentence_min.to_string())
        .replace("{sentence_max}", &spec.sentence_max.to_string())
        .replace("{lexical}", spec.lexical)
        .replace("{density}", spec.density)
        .replace("{title}", title)
        .replace("{body}", body);

    (REWRITE_SYSTEM_PROMPT.to_string(), user, target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::dto::Tone;

    fn profile() -> PedagogicalProfile {
        PedagogicalProfile {
            age_years: 7,
            target_level: 2.2,
            topic_slug: "sistema-solar".into(),
            topic_name: "El sistema solar".into(),
            topic_description: "Planetas, lunas y el Sol".into(),
            core_concept: "los planetas giran alrededor del Sol".into(),
            tone: Tone::Creative,
            interests: vec!["fútbol".into()],
            favorite_characters: vec![],
            personalization: String::new(),
            recent_titles: vec!["La luna curiosa".into()],
        }
    }

    #[test]
    fn level_clamp_is_idempotent_and_bounded() {
        for x in [-3.0, 0.4, 1.0, 2.49, 2.51, 4.0, 7.8, 22.0] {
            let once = clamp_prompt_level(x);
            let twice = clamp_prompt_level(once as f64);
            assert_eq!(once, twice);
            assert!((1..=4).contains(&once));
        }
    }

    #[test]
    fn story_prompt_interpolates_the_level_band() {
        let (system, user) = build_story_prompt(&profile());
        // level 2.2 snaps to template 2
        assert!(user.contains("Entre 100 y 180 palabras"));
        assert!(user.contains("fútbol"));
        assert!(user.contains("«La luna curiosa»"));
        assert!(!user.contains("personajes favoritos"));
        assert!(system.contains("exactamente un objeto JSON"));
    }

    #[test]
    fn rewrite_saturates_at_the_scale_edges() {
        assert_eq!(rewrite_target_level(1.0, RewriteDirection::Simplify), 1);
        assert_eq!(rewrite_target_level(4.0, RewriteDirection::Elevate), 4);
        assert_eq!(rewrite_target_level(2.6, RewriteDirection::Elevate), 4);
        assert_eq!(rewrite_target_level(9.0, RewriteDirection::Simplify), 3);
    }

    #[test]
    fn rewrite_prompt_carries_the_original_body() {
        let (_, user, target) =
            build_rewrite_prompt("El volcán", "Había una vez un volcán.", 3.0, RewriteDirection::Simplify);
        assert_eq!(target, 2);
        assert!(user.contains("Había una vez un volcán."));
        assert!(user.contains("Simplifica"));
    }
}
