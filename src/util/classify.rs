//! Actionable-objective classifier (§4.8): a cheap pre-filter so the driver
//! can reject a greeting or empty-ish objective before spending a worker
//! round on it.

const KEYWORDS: &[&str] = &[
    "fix", "build", "implement", "debug", "test", "add", "create", "refactor", "update",
    "remove", "delete", "write", "migrate", "optimize", "investigate", "resolve", "upgrade",
    // translated counterparts covering the common non-English equivalents.
    "corrige", "implementa", "depanner", "reparer", "erstellen", "beheben", "implementieren",
];

const MIN_LEN: usize = 8;

/// Returns false for pure greetings or very short, non-path-like strings;
/// true when the objective contains a recognized action keyword or looks
/// like a file path reference.
pub fn is_actionable_objective(objective: &str) -> bool {
    let trimmed = objective.trim();
    if trimmed.is_empty() {
        return false;
    }

    let lower = trimmed.to_lowercase();
    if KEYWORDS.iter().any(|kw| lower.contains(kw)) {
        return true;
    }

    if trimmed.len() < MIN_LEN {
        return false;
    }

    looks_like_path_reference(trimmed)
}

fn looks_like_path_reference(s: &str) -> bool {
    s.contains('/') || s.contains('.') && s.split_whitespace().count() <= 3
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pure_greeting_is_not_actionable() {
        assert!(!is_actionable_objective("hi"));
        assert!(!is_actionable_objective("hello there"));
        assert!(!is_actionable_objective(""));
        assert!(!is_actionable_objective("   "));
    }

    #[test]
    fn keyword_bearing_objective_is_actionable() {
        assert!(is_actionable_objective("fix the login bug"));
        assert!(is_actionable_objective("implement rate limiting"));
        assert!(is_actionable_objective("Add retries to the HTTP client"));
    }

    #[test]
    fn path_like_reference_is_actionable() {
        assert!(is_actionable_objective("src/main.rs needs cleanup"));
    }

    #[test]
    fn short_non_actionable_string_is_rejected() {
        assert!(!is_actionable_objective("ok thanks"));
    }
}
