//! Text normalization helpers shared by the QA rubric and the topic slug
//! resolver. Spanish content: diacritics fold to their base letter before
//! any comparison.

/// Fold Spanish diacritics to base letters; everything else passes through.
pub fn strip_diacritics(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            'á' | 'à' | 'ä' | 'â' => 'a',
            'é' | 'è' | 'ë' | 'ê' => 'e',
            'í' | 'ì' | 'ï' | 'î' => 'i',
            'ó' | 'ò' | 'ö' | 'ô' => 'o',
            'ú' | 'ù' | 'ü' | 'û' => 'u',
            'ñ' => 'n',
            'Á' | 'À' | 'Ä' | 'Â' => 'a',
            'É' | 'È' | 'Ë' | 'Ê' => 'e',
            'Í' | 'Ì' | 'Ï' | 'Î' => 'i',
            'Ó' | 'Ò' | 'Ö' | 'Ô' => 'o',
            'Ú' | 'Ù' | 'Ü' | 'Û' => 'u',
            'Ñ' => 'n',
            _ => c,
        })
        .collect()
}

/// Lowercase, fold diacritics and collapse whitespace runs to one space.
pub fn normalize(s: &str) -> String {
    let folded = strip_diacritics(&s.to_lowercase());
    let mut out = String::with_capacity(folded.len());
    let mut last_was_space = false;
    for ch in folded.chars() {
        if ch.is_whitespace() {
            if !last_was_space && !out.is_empty() {
                out.push(' ');
                last_was_space = true;
            }
        } else {
            last_was_space = false;
            out.push(ch);
        }
    }
    out.trim_end().to_string()
}

/// Normalized alphanumeric tokens of at least `min_len` characters.
pub fn tokens(s: &str, min_len: usize) -> Vec<String> {
    normalize(s)
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= min_len)
        .map(|t| t.to_string())
        .collect()
}

/// Dice coefficient over two token sets; 1.0 when identical, 0.0 when
/// disjoint or either side is empty.
pub fn dice_similarity(a: &[String], b: &[String]) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let set_a: std::collections::HashSet<&str> = a.iter().map(String::as_str).collect();
    let set_b: std::collections::HashSet<&str> = b.iter().map(String::as_str).collect();
    let shared = set_a.intersection(&set_b).count();
    (2.0 * shared as f64) / (set_a.len() + set_b.len()) as f64
}

/// URL-safe slug for ad-hoc free-text topics.
pub fn slugify(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut last_dash = true;
    for ch in strip_diacritics(&s.to_lowercase()).chars() {
        if ch.is_alphanumeric() {
            out.push(ch);
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    out.trim_end_matches('-').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_folds_and_collapses() {
        assert_eq!(normalize("  El   Sistema  SOLAR  "), "el sistema solar");
        assert_eq!(normalize("¡Un día mágico!"), "¡un dia magico!");
    }

    #[test]
    fn dice_on_identical_and_disjoint_sets() {
        let a = tokens("la luna brillante", 2);
        let b = tokens("La Luna Brillante", 2);
        assert!((dice_similarity(&a, &b) - 1.0).abs() < f64::EPSILON);
        let c = tokens("robots del futuro", 2);
        assert_eq!(dice_similarity(&a, &c), 0.0);
    }

    #[test]
    fn slugify_free_text() {
        assert_eq!(slugify("Los Volcanes de Islandia"), "los-volcanes-de-islandia");
        assert_eq!(slugify("¿Qué es un agujero negro?"), "que-es-un-agujero-negro");
    }
}
