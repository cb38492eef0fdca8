//! Human-oriented diagnostics: closest-name suggestions and pointer hints.
//!
//! Unknown-operator and unknown-definition errors carry a "did you mean"
//! hint based on Levenshtein distance over the known names, plus the list of
//! known namespaces when nothing is close enough.

/// Classic two-row Levenshtein edit distance.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut cur = vec![0usize; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        cur[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = prev[j] + usize::from(ca != cb);
            cur[j + 1] = substitution.min(prev[j + 1] + 1).min(cur[j] + 1);
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[b.len()]
}

/// The candidate closest to `target`, when it is close enough to plausibly
/// be a typo (distance at most 2, or at most half the target's length).
pub fn closest_match<'a>(
    target: &str,
    candidates: impl IntoIterator<Item = &'a str>,
) -> Option<&'a str> {
    let threshold = 2usize.max(target.chars().count() / 2);
    candidates
        .into_iter()
        .map(|c| (levenshtein(target, c), c))
        .filter(|(d, _)| *d > 0 && *d <= threshold)
        .min_by_key(|(d, _)| *d)
        .map(|(_, c)| c)
}

/// `did you mean '...'?` text for a near-miss, or a listing of what exists.
pub fn suggest_name<'a>(
    target: &str,
    candidates: impl IntoIterator<Item = &'a str> + Clone,
) -> Option<String> {
    if let Some(close) = closest_match(target, candidates.clone()) {
        return Some(format!("did you mean '{close}'?"));
    }
    let known: Vec<&str> = candidates.into_iter().collect();
    if known.is_empty() {
        None
    } else {
        Some(format!("known: {}", known.join(", ")))
    }
}

/// Advice for common JSON-pointer mistakes.
pub fn pointer_hint(pointer: &str) -> Option<String> {
    if pointer.starts_with('/') {
        return Some("local references start with '#/'".into());
    }
    if pointer.starts_with("#/$defs/") || pointer.starts_with("#/defs/") {
        return Some(
            "SPIRAL documents store nodes under '#/nodes', not '$defs'".into(),
        );
    }
    None
}
