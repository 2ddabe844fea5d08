//! A glob pattern cache that bucket-classifies patterns at construction so
//! the common shapes (exact, prefix, suffix, contains) match in O(1) instead
//! of falling through to full glob matching on every lookup.

use std::collections::HashSet;

/// Compiled form of a list of glob patterns (`*`, `?`, literal).
///
/// Construction classifies each pattern once; `matches` dispatches
/// cheapest-first: universal, then exact-set membership, then the
/// prefix/suffix/contains scans, then the complex fallback.
#[derive(Debug, Clone)]
pub struct PatternCache {
    universal: bool,
    exact: HashSet<String>,
    prefixes: Vec<String>,
    suffixes: Vec<String>,
    contains: Vec<String>,
    complex: Vec<String>,
}

impl PatternCache {
    /// Compile a pattern cache from an ordered list of glob patterns. An
    /// empty list yields a cache that never matches, distinct from a cache
    /// built from `["*"]` which matches everything.
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut cache = PatternCache {
            universal: false,
            exact: HashSet::new(),
            prefixes: Vec::new(),
            suffixes: Vec::new(),
            contains: Vec::new(),
            complex: Vec::new(),
        };

        for raw in patterns {
            let pattern = raw.into();
            cache.classify(pattern);
        }

        cache
    }

    fn classify(&mut self, pattern: String) {
        if pattern == "*" {
            self.universal = true;
            return;
        }

        let stars = pattern.matches('*').count();
        let has_question = pattern.contains('?');

        if stars == 0 && !has_question {
            self.exact.insert(pattern);
            return;
        }

        if !has_question && stars == 1 {
            if let Some(prefix) = pattern.strip_suffix('*') {
                if !prefix.is_empty() {
                    self.prefixes.push(prefix.to_string());
                    return;
                }
            }
            if let Some(suffix) = pattern.strip_prefix('*') {
                if !suffix.is_empty() {
                    self.suffixes.push(suffix.to_string());
                    return;
                }
            }
        }

        if !has_question
            && stars == 2
            && pattern.starts_with('*')
            && pattern.ends_with('*')
            && pattern.len() > 2
        {
            let middle = &pattern[1..pattern.len() - 1];
            if !middle.is_empty() && !middle.contains('*') {
                self.contains.push(middle.to_string());
                return;
            }
        }

        self.complex.push(pattern);
    }

    /// Does any compiled pattern glob-match `s`?
    pub fn matches(&self, s: &str) -> bool {
        if self.universal {
            return true;
        }
        if self.exact.contains(s) {
            return true;
        }
        if self.prefixes.iter().any(|p| s.starts_with(p.as_str())) {
            return true;
        }
        if self.suffixes.iter().any(|suf| s.ends_with(suf.as_str())) {
            return true;
        }
        if self.contains.iter().any(|mid| s.contains(mid.as_str())) {
            return true;
        }
        self.complex.iter().any(|p| glob_match(p, s))
    }

    pub fn is_never_matching(&self) -> bool {
        !self.universal
            && self.exact.is_empty()
            && self.prefixes.is_empty()
            && self.suffixes.is_empty()
            && self.contains.is_empty()
            && self.complex.is_empty()
    }
}

/// Full glob matching for patterns with more than one wildcard or a `?`,
/// used only as a fallback for shapes the bucket classifier can't collapse
/// to O(1). Standard backtracking two-pointer algorithm.
fn glob_match(pattern: &str, s: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let s: Vec<char> = s.chars().collect();

    let (mut pi, mut si) = (0usize, 0usize);
    let (mut star_idx, mut match_idx) = (None, 0usize);

    while si < s.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == s[si]) {
            pi += 1;
            si += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star_idx = Some(pi);
            match_idx = si;
            pi += 1;
        } else if let Some(star) = star_idx {
            pi = star + 1;
            match_idx += 1;
            si = match_idx;
        } else {
            return false;
        }
    }

    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }

    pi == p.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn empty_pattern_list_never_matches() {
        let cache = PatternCache::new(Vec::<String>::new());
        assert!(cache.is_never_matching());
        assert!(!cache.matches("anything"));
    }

    #[test]
    fn universal_matches_everything() {
        let cache = PatternCache::new(["*"]);
        assert!(cache.matches(""));
        assert!(cache.matches("foo/bar"));
    }

    #[test]
    fn exact_matches_only_identical_strings() {
        let cache = PatternCache::new(["project-b/service-3"]);
        assert!(cache.matches("project-b/service-3"));
        assert!(!cache.matches("project-b/service-30"));
    }

    #[test]
    fn prefix_pattern_matches_start() {
        let cache = PatternCache::new(["project-a*"]);
        assert!(cache.matches("project-a/service-1"));
        assert!(!cache.matches("other/project-a"));
    }

    #[test]
    fn suffix_pattern_matches_end() {
        let cache = PatternCache::new(["*service-3"]);
        assert!(cache.matches("project-b/service-3"));
        assert!(!cache.matches("project-b/service-3x"));
    }

    #[test]
    fn contains_pattern_matches_substring() {
        let cache = PatternCache::new(["*service*"]);
        assert!(cache.matches("project-a/service-1"));
        assert!(!cache.matches("project-a/other-1"));
    }

    #[test]
    fn complex_pattern_falls_back_to_glob() {
        let cache = PatternCache::new(["v*.?"]);
        assert!(cache.matches("v1.0"));
        assert!(!cache.matches("v1.00"));
    }

    #[test]
    fn question_mark_matches_single_char() {
        let cache = PatternCache::new(["v1.?"]);
        assert!(cache.matches("v1.0"));
        assert!(cache.matches("v1.1"));
        assert!(!cache.matches("v1."));
    }

    proptest::proptest! {
        #[test]
        fn exact_pattern_roundtrips(s in "[a-z0-9/_-]{0,24}") {
            let cache = PatternCache::new([s.clone()]);
            prop_assert!(cache.matches(&s));
        }

        #[test]
        fn pattern_cache_agrees_with_naive_glob(s in "[a-z]{1,8}") {
            let patterns = vec![format!("{}*", &s[..1])];
            let cache = PatternCache::new(patterns.clone());
            let naive = glob_match(&patterns[0], &s);
            prop_assert_eq!(cache.matches(&s), naive);
        }
    }
}
