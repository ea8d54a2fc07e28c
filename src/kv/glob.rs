//! Minimal glob matcher for pub/sub channel patterns (`*`, `?`), the same
//! subset Redis's `PSUBSCRIBE` supports.

pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    match_from(&p, 0, &t, 0)
}

fn match_from(p: &[char], pi: usize, t: &[char], ti: usize) -> bool {
    if pi == p.len() {
        return ti == t.len();
    }
    match p[pi] {
        '*' => {
            // Try consuming 0..=remaining chars of text for this '*'.
            for skip in 0..=(t.len() - ti) {
                if match_from(p, pi + 1, t, ti + skip) {
                    return true;
                }
            }
            false
        }
        '?' => ti < t.len() && match_from(p, pi + 1, t, ti + 1),
        c => ti < t.len() && t[ti] == c && match_from(p, pi + 1, t, ti + 1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn star_matches_any_suffix() {
        assert!(glob_match("mailbox:*", "mailbox:inbox-bravo"));
        assert!(!glob_match("mailbox:*", "topic:inbox-bravo"));
    }

    #[test]
    fn question_mark_matches_one_char() {
        assert!(glob_match("a?c", "abc"));
        assert!(!glob_match("a?c", "abbc"));
    }

    #[test]
    fn exact_match_with_no_wildcards() {
        assert!(glob_match("broadcast:all", "broadcast:all"));
        assert!(!glob_match("broadcast:all", "broadcast:allx"));
    }
}
