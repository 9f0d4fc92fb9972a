//! Wildcard permission evaluation.

use std::collections::HashSet;

/// Evaluates a required permission against an effective set.
///
/// True iff the set contains `*`, contains `required` exactly, or contains a
/// `prefix:*` entry where `required` starts with `prefix:`. Nothing else
/// grants; in particular `a:*` does not grant the bare permission `a`.
pub fn evaluate(permissions: &HashSet<String>, required: &str) -> bool {
    if permissions.contains("*") || permissions.contains(required) {
        return true;
    }
    permissions.iter().any(|p| {
        p.strip_suffix(":*")
            .map(|prefix| {
                required.len() > prefix.len() + 1 && required.starts_with(prefix)
                    && required.as_bytes()[prefix.len()] == b':'
            })
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(entries: &[&str]) -> HashSet<String> {
        entries.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn star_grants_everything() {
        let perms = set(&["*"]);
        for required in ["rcon:kick", "ui:bans:view", "anything:at:all"] {
            assert!(evaluate(&perms, required));
        }
    }

    #[test]
    fn exact_match_grants() {
        let perms = set(&["rcon:kick"]);
        assert!(evaluate(&perms, "rcon:kick"));
        assert!(!evaluate(&perms, "rcon:ban"));
    }

    #[test]
    fn category_wildcard_grants_iff_prefix_matches() {
        let perms = set(&["ui:bans:*"]);
        assert!(evaluate(&perms, "ui:bans:view"));
        assert!(evaluate(&perms, "ui:bans:create:bulk"));
        assert!(!evaluate(&perms, "ui:banners:view"));
        assert!(!evaluate(&perms, "ui:maps:view"));
        // The bare category itself is not granted by its wildcard.
        assert!(!evaluate(&perms, "ui:bans"));
    }

    #[test]
    fn empty_set_grants_nothing() {
        assert!(!evaluate(&HashSet::new(), "rcon:kick"));
    }
}
