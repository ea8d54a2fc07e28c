//! Subscription matching rules (§4.I): exact target, glob, hierarchical
//! dot-patterns with `**`, and the BROADCAST special patterns.

use crate::kv::glob::glob_match;
use crate::model::message::AddressingMode;
use crate::model::subscription::Subscription;

fn looks_hierarchical(pattern: &str) -> bool {
    pattern.contains('.')
}

fn is_glob(pattern: &str) -> bool {
    pattern.contains('*') || pattern.contains('?')
}

/// Matches a hierarchical dot-pattern against a dot-separated target per
/// the rules in §4.I:
/// - `**` at position k matches any suffix of ≥0 segments; the prefix
///   before it must match segment-wise.
/// - `*` as a terminal segment matches exactly one more segment.
/// - literal segments must be equal.
fn hierarchical_match(pattern: &str, target: &str) -> bool {
    let p: Vec<&str> = pattern.split('.').collect();
    let t: Vec<&str> = target.split('.').collect();
    match_segments(&p, &t)
}

fn match_segments(p: &[&str], t: &[&str]) -> bool {
    match p.first() {
        None => t.is_empty(),
        Some(&"**") => {
            // '**' must be the final pattern segment.
            p.len() == 1
        }
        Some(&"*") => {
            if p.len() == 1 {
                // terminal '*' matches exactly one more segment
                t.len() == 1
            } else {
                !t.is_empty() && match_segments(&p[1..], &t[1..])
            }
        }
        Some(seg) => t.first() == Some(seg) && match_segments(&p[1..], &t[1..]),
    }
}

/// True iff subscription `s` matches addressing target `t` under the
/// addressing mode carried by the message (§4.I).
pub fn subscription_matches(s: &Subscription, target: &str, mode: AddressingMode) -> bool {
    match &s.pattern {
        None => s.target == target,
        Some(pattern) => {
            if mode == AddressingMode::Broadcast && (pattern == "*" || pattern == "broadcast:*") {
                return true;
            }
            if looks_hierarchical(pattern) || looks_hierarchical(target) {
                hierarchical_match(pattern, target)
            } else if is_glob(pattern) {
                glob_match(pattern, target)
            } else {
                pattern == target
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_pattern_requires_exact_target() {
        assert!(hierarchical_match("a.b", "a.b"));
        assert!(!hierarchical_match("a.b", "a.c"));
    }

    #[test]
    fn double_star_matches_prefix_and_any_suffix() {
        assert!(hierarchical_match("a.**", "a"));
        assert!(hierarchical_match("a.**", "a.b"));
        assert!(hierarchical_match("a.**", "a.b.c"));
        assert!(!hierarchical_match("a.**", "b.a"));
    }

    #[test]
    fn terminal_star_matches_exactly_one_segment() {
        assert!(hierarchical_match("a.*", "a.b"));
        assert!(!hierarchical_match("a.*", "a.b.c"));
        assert!(!hierarchical_match("a.*", "a"));
    }

    #[test]
    fn broadcast_wildcard_patterns_match_only_under_broadcast_mode() {
        let s = Subscription::new("alice", "x", Some("*".into()), Default::default());
        assert!(subscription_matches(&s, "anything", AddressingMode::Broadcast));
        assert!(!subscription_matches(&s, "anything", AddressingMode::Direct));
    }

    #[test]
    fn exact_subscription_matches_only_its_target() {
        let s = Subscription::new("alice", "inbox-bravo", None, Default::default());
        assert!(subscription_matches(&s, "inbox-bravo", AddressingMode::Direct));
        assert!(!subscription_matches(&s, "inbox-charlie", AddressingMode::Direct));
    }
}
