//! Static topic catalogue, the router seam toward the skill tree, and the
//! three-tier slug resolver that maps legacy or fuzzy topic identifiers
//! onto the current taxonomy.

use async_trait::async_trait;
use rand::seq::SliceRandom;
use shared::dto::{RouterInput, TopicSuggestion};
use tracing::{debug, info};

use crate::textnorm;

/// One catalogue entry. The catalogue is a static lookup — curating it is
/// a content task, not an engine concern.
#[derive(Debug, Clone, Copy)]
pub struct Topic {
    pub slug: &'static str,
    pub name: &'static str,
    pub emoji: &'static str,
    pub domain: &'static str,
    pub core_concept: &'static str,
    pub description: &'static str,
    pub min_age: i16,
    pub max_age: i16,
}

pub const TOPIC_CATALOGUE: &[Topic] = &[
    Topic {
        slug: "sistema-solar",
        name: "El sistema solar",
        emoji: "🪐",
        domain: "ciencia",
        core_concept: "los planetas giran alrededor del Sol",
        description: "Planetas, lunas y el Sol como centro del sistema",
        min_age: 6,
        max_age: 12,
    },
    Topic {
        slug: "animales-marinos",
        name: "Animales marinos",
        emoji: "🐋",
        domain: "naturaleza",
        core_concept: "el océano alberga formas de vida muy distintas",
        description: "Ballenas, pulpos y criaturas de las profundidades",
        min_age: 5,
        max_age: 11,
    },
    Topic {
        slug: "dinosaurios",
        name: "Dinosaurios",
        emoji: "🦕",
        domain: "naturaleza",
        core_concept: "hace millones de años vivieron reptiles gigantes",
        description: "Herbívoros, carnívoros y el mundo prehistórico",
        min_age: 5,
        max_age: 10,
    },
    Topic {
        slug: "cuerpo-humano",
        name: "El cuerpo humano",
        emoji: "🫀",
        domain: "ciencia",
        core_concept: "cada órgano cumple una función",
        description: "Corazón, pulmones, huesos y cómo trabajan juntos",
        min_age: 6,
        max_age: 12,
    },
    Topic {
        slug: "grandes-inventos",
        name: "Grandes inventos",
        emoji: "💡",
        domain: "historia",
        core_concept: "los inventos resuelven problemas de la vida diaria",
        description: "De la rueda a internet: ideas que cambiaron el mundo",
        min_age: 7,
        max_age: 12,
    },
    Topic {
        slug: "volcanes",
        name: "Volcanes",
        emoji: "🌋",
        domain: "ciencia",
        core_concept: "la Tierra libera calor interno por los volcanes",
        description: "Erupciones, lava y montañas que respiran fuego",
        min_age: 6,
        max_age: 12,
    },
    Topic {
        slug: "insectos",
        name: "El mundo de los insectos",
        emoji: "🐜",
        domain: "naturaleza",
        core_concept: "los insectos son pequeños pero esenciales",
        description: "Hormigas, abejas y mariposas de cerca",
        min_age: 5,
        max_age: 10,
    },
    Topic {
        slug: "robots",
        name: "Robots y máquinas",
        emoji: "🤖",
        domain: "tecnologia",
        core_concept: "las máquinas siguen instrucciones de las personas",
        description: "Robots que ayudan en casa, fábricas y el espacio",
        min_age: 6,
        max_age: 12,
    },
    Topic {
        slug: "bosques",
        name: "Los bosques",
        emoji: "🌳",
        domain: "naturaleza",
        core_concept: "el bosque es un ecosistema en equilibrio",
        description: "Árboles, animales y el ciclo de la vida",
        min_age: 5,
        max_age: 11,
    },
    Topic {
        slug: "mitos-y-leyendas",
        name: "Mitos y leyendas",
        emoji: "🐉",
        domain: "cultura",
        core_concept: "las historias antiguas explican el mundo a su manera",
        description: "Dragones, héroes y relatos de muchas culturas",
        min_age: 7,
        max_age: 12,
    },
];

/// Identifiers from the previous content taxonomy, mapped onto current
/// slugs. Checked after an exact match fails and before fuzzy search.
pub const LEGACY_ALIASES: &[(&str, &str)] = &[
    ("el-espacio", "sistema-solar"),
    ("planetas", "sistema-solar"),
    ("astros", "sistema-solar"),
    ("animales-del-mar", "animales-marinos"),
    ("vida-marina", "animales-marinos"),
    ("el-oceano", "animales-marinos"),
    ("dinos", "dinosaurios"),
    ("era-prehistorica", "dinosaurios"),
    ("inventos", "grandes-inventos"),
    ("inventores", "grandes-inventos"),
    ("el-bosque", "bosques"),
    ("bichos", "insectos"),
    ("leyendas", "mitos-y-leyendas"),
    ("maquinas", "robots"),
];

pub fn topic_by_slug(slug: &str) -> Option<&'static Topic> {
    TOPIC_CATALOGUE.iter().find(|t| t.slug == slug)
}

/// Resolve a possibly stale slug: exact match, then the legacy alias
/// table, then best-effort token overlap against the catalogue. Remaps are
/// logged; `None` means the identifier names nothing we know.
pub fn resolve_slug(raw: &str) -> Option<&'static Topic> {
    let slug = textnorm::slugify(raw);
    if let Some(t) = topic_by_slug(&slug) {
        return Some(t);
    }

    if let Some((_, target)) = LEGACY_ALIASES.iter().find(|(alias, _)| *alias == slug) {
        info!(from = %slug, to = %target, "legacy topic slug remapped");
        return topic_by_slug(target);
    }

    let raw_tokens = textnorm::tokens(&slug.replace('-', " "), 2);
    let mut best: Option<(&'static Topic, f64)> = None;
    for topic in TOPIC_CATALOGUE {
        let topic_tokens = textnorm::tokens(&format!("{} {}", topic.slug.replace('-', " "), topic.name), 2);
        let score = textnorm::dice_similarity(&raw_tokens, &topic_tokens);
        if score > 0.0 && best.map(|(_, s)| score > s).unwrap_or(true) {
            best = Some((topic, score));
        }
    }
    if let Some((topic, score)) = best {
        info!(from = %slug, to = %topic.slug, score, "fuzzy topic slug remapped");
        return Some(topic);
    }
    debug!(%slug, "topic slug resolved to nothing");
    None
}

/// External skill-tree router. The engine only depends on the output
/// shape; the catalogue-backed implementation below is the built-in
/// fallback ranking.
#[async_trait]
pub trait TopicRouter: Send + Sync {
    async fn next_topics(&self, input: &RouterInput) -> anyhow::Result<Vec<TopicSuggestion>>;
}

/// Default router: age-appropriate catalogue topics the learner has not
/// seen recently, interest-matching domains first, random within a band.
pub struct CatalogueRouter;

#[async_trait]
impl TopicRouter for CatalogueRouter {
    async fn next_topics(&self, input: &RouterInput) -> anyhow::Result<Vec<TopicSuggestion>> {
        let interests: Vec<String> = input
            .interests
            .iter()
            .map(|i| textnorm::normalize(i))
            .collect();

        let mut fresh: Vec<&Topic> = TOPIC_CATALOGUE
            .iter()
            .filter(|t| input.age_years >= t.min_age && input.age_years <= t.max_age)
            .filter(|t| !input.recent_topic_slugs.iter().any(|s| s == t.slug))
            .collect();
        if fresh.is_empty() {
            // everything was seen recently; recycle the full age band
            fresh = TOPIC_CATALOGUE
                .iter()
                .filter(|t| input.age_years >= t.min_age && input.age_years <= t.max_age)
                .collect();
        }

        let mut preferred: Vec<&Topic> = fresh
            .iter()
            .copied()
            .filter(|t| interests.iter().any(|i| i.contains(t.domain)))
            .collect();
        let pool = if preferred.is_empty() { &mut fresh } else { &mut preferred };
        pool.shuffle(&mut rand::thread_rng());

        Ok(pool
            .iter()
            .take(3)
            .map(|t| TopicSuggestion {
                slug: t.slug.to_string(),
                name: t.name.to_string(),
                emoji: t.emoji.to_string(),
                domain: t.domain.to_string(),
                reason_tag: if preferred_contains(&interests, t) {
                    "interes".to_string()
                } else {
                    "variedad".to_string()
                },
            })
            .collect())
    }
}

fn preferred_contains(interests: &[String], topic: &Topic) -> bool {
    interests.iter().any(|i| i.contains(topic.domain))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use uuid::Uuid;

    #[test]
    fn exact_slug_wins() {
        assert_eq!(resolve_slug("sistema-solar").unwrap().slug, "sistema-solar");
    }

    #[test]
    fn legacy_alias_is_remapped() {
        assert_eq!(resolve_slug("el-espacio").unwrap().slug, "sistema-solar");
        assert_eq!(resolve_slug("dinos").unwrap().slug, "dinosaurios");
    }

    #[test]
    fn fuzzy_lookup_falls_back_to_token_overlap() {
        // no exact slug, no alias, but shares the token "marinos"
        assert_eq!(
            resolve_slug("criaturas marinos").unwrap().slug,
            "animales-marinos"
        );
        assert!(resolve_slug("xyzzy").is_none());
    }

    #[tokio::test]
    async fn router_respects_age_and_recency() {
        let input = RouterInput {
            learner_id: Uuid::new_v4(),
            age_years: 6,
            interests: vec!["ciencia".into()],
            skill_progress: HashMap::new(),
            current_skill_slug: None,
            recent_topic_slugs: vec!["sistema-solar".into()],
        };
        let suggestions = CatalogueRouter.next_topics(&input).await.unwrap();
        assert!(!suggestions.is_empty());
        for s in &suggestions {
            assert_ne!(s.slug, "sistema-solar");
            let t = topic_by_slug(&s.slug).unwrap();
            assert!(t.min_age <= 6 && t.max_age >= 6);
        }
    }
}
