//! Pairwise similarity between findings from different agents.

use std::collections::HashSet;

use crate::core::finding::Finding;

/// Default score at or above which two findings are considered the same issue.
pub const DEFAULT_MATCH_THRESHOLD: f64 = 0.5;

const SAME_FILE: f64 = 0.4;
const SAME_LINE: f64 = 0.3;
const LINE_WITHIN_5: f64 = 0.2;
const LINE_WITHIN_10: f64 = 0.1;
const SAME_CATEGORY: f64 = 0.2;
const SAME_SEVERITY: f64 = 0.1;
const DESCRIPTION_WEIGHT: f64 = 0.3;

const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "is", "are", "in", "on", "at", "to", "for", "of", "and", "or",
];

/// Weighted similarity in `[0.0, 1.0]`.
///
/// Line proximity only counts for findings in the same file that both carry a line.
pub fn similarity(a: &Finding, b: &Finding) -> f64 {
    let mut score = 0.0;

    if let (Some(fa), Some(fb)) = (&a.file, &b.file)
        && fa == fb
    {
        score += SAME_FILE;
        if let (Some(la), Some(lb)) = (a.line, b.line) {
            score += match la.abs_diff(lb) {
                0 => SAME_LINE,
                1..=5 => LINE_WITHIN_5,
                6..=10 => LINE_WITHIN_10,
                _ => 0.0,
            };
        }
    }

    if a.category == b.category {
        score += SAME_CATEGORY;
    }
    if a.severity == b.severity {
        score += SAME_SEVERITY;
    }

    score += jaccard(&tokens(&a.description), &tokens(&b.description)) * DESCRIPTION_WEIGHT;

    score.min(1.0)
}

/// Case-folded words with surrounding punctuation and stop words removed.
pub fn tokens(text: &str) -> HashSet<String> {
    text.split_whitespace()
        .map(|word| {
            word.trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase()
        })
        .filter(|word| !word.is_empty() && !STOP_WORDS.contains(&word.as_str()))
        .collect()
}

/// Jaccard index of two token sets; `0.0` when both are empty.
pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::finding::{Category, Severity};
    use crate::test_support::finding;

    const EPS: f64 = 1e-9;

    #[test]
    fn tokens_drop_stop_words_and_punctuation() {
        let t = tokens("The query, in THE loop: is slow!");
        let mut words: Vec<_> = t.into_iter().collect();
        words.sort();
        assert_eq!(words, vec!["loop", "query", "slow"]);
    }

    #[test]
    fn jaccard_of_empty_sets_is_zero() {
        assert_eq!(jaccard(&HashSet::new(), &HashSet::new()), 0.0);
    }

    #[test]
    fn identical_findings_score_is_capped() {
        let a = finding("a", Some("src/x.ts"), Some(10), Category::Security, Severity::Major, "sql injection");
        let b = finding("b", Some("src/x.ts"), Some(10), Category::Security, Severity::Major, "sql injection");
        assert!((similarity(&a, &b) - 1.0).abs() < EPS);
    }

    #[test]
    fn line_proximity_bands() {
        let base = finding("a", Some("f.rs"), Some(100), Category::Quality, Severity::Minor, "alpha");
        let near = |line| finding("b", Some("f.rs"), Some(line), Category::Security, Severity::Major, "beta");
        // file 0.4 + line band, nothing else shared
        assert!((similarity(&base, &near(100)) - 0.7).abs() < EPS);
        assert!((similarity(&base, &near(105)) - 0.6).abs() < EPS);
        assert!((similarity(&base, &near(90)) - 0.5).abs() < EPS);
        assert!((similarity(&base, &near(111)) - 0.4).abs() < EPS);
    }

    #[test]
    fn nearby_lines_in_different_files_do_not_count() {
        let a = finding("a", Some("src/auth.rs"), Some(10), Category::Security, Severity::Major, "token logged");
        let b = finding("b", Some("web/view.tsx"), Some(12), Category::Security, Severity::Major, "xss in template");
        // category 0.2 + severity 0.1
        assert!((similarity(&a, &b) - 0.3).abs() < EPS);
        let c = finding("c", None, Some(10), Category::Security, Severity::Major, "xss in template");
        assert!((similarity(&a, &c) - 0.3).abs() < EPS);
    }

    #[test]
    fn missing_lines_do_not_count() {
        let a = finding("a", Some("f.rs"), None, Category::Quality, Severity::Minor, "alpha");
        let b = finding("b", Some("f.rs"), Some(3), Category::Security, Severity::Major, "beta");
        assert!((similarity(&a, &b) - 0.4).abs() < EPS);
    }

    #[test]
    fn description_overlap_is_weighted() {
        let a = finding("a", None, None, Category::Quality, Severity::Minor, "unused variable count");
        let b = finding("b", None, None, Category::Security, Severity::Major, "unused variable total");
        // jaccard = 2 / 4
        assert!((similarity(&a, &b) - 0.15).abs() < EPS);
    }
}
