//! Keyword and pattern heuristics for free-text review output.
//!
//! Everything here is deterministic: the same text always yields the same
//! severity, category, location and block segmentation.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::finding::{Category, Severity};

static CRITICAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(critical|high|severe|urgent)\b").expect("valid critical regex")
});
static MAJOR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(major|important|significant)\b").expect("valid major regex")
});
static MINOR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(minor|low|small)\b").expect("valid minor regex"));

static CATEGORY_RES: LazyLock<Vec<(Category, Regex)>> = LazyLock::new(|| {
    [
        (
            Category::Security,
            r"(?i)\b(security|vulnerability|injection|xss|auth|csrf|owasp)\b",
        ),
        (
            Category::Performance,
            r"(?i)\b(performance|slow|optimize|memory|cpu|n\+1|cache)\b",
        ),
        (
            Category::Architecture,
            r"(?i)\b(architecture|design|pattern|structure|coupling|cohesion)\b",
        ),
        (
            Category::Quality,
            r"(?i)\b(quality|readable|maintainable|clean|dry|duplicate)\b",
        ),
    ]
    .into_iter()
    .map(|(category, pattern)| (category, Regex::new(pattern).expect("valid category regex")))
    .collect()
});

/// Patterns that carry both a path and a line, tried in order.
static LOCATION_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        // C:\src\app.ts:12
        r"([a-zA-Z]:\\[\\a-zA-Z0-9_./-]+\.[a-zA-Z]+):(\d+)",
        // src/app.ts:12
        r"([a-zA-Z0-9_./-]+\.[a-zA-Z]+):(\d+)",
        // src\app.ts:12
        r"([\\a-zA-Z0-9_./-]+\.[a-zA-Z]+):(\d+)",
        // src/app.ts line 12, src/app.ts, line 12
        r"([\\a-zA-Z0-9_./-]+\.[a-zA-Z]+),?\s+(?i:on\s+|at\s+)?(?i:line)\s+(\d+)",
        // **File**: `src/app.ts:12`
        r"\*\*File\*\*:\s*`?([\\a-zA-Z0-9_./-]+\.[a-zA-Z]+)`?(?::(\d+))?",
        // `src/app.ts`:12
        r"`([\\a-zA-Z0-9_./-]+\.[a-zA-Z]+)`(?::(\d+))?",
    ]
    .into_iter()
    .map(|pattern| Regex::new(pattern).expect("valid location regex"))
    .collect()
});

/// Path-like token with a short extension, used when no line is present.
static PATH_ONLY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:[a-zA-Z]:\\)?[\\a-zA-Z0-9_./-]{2,}\.[a-zA-Z]{1,4}\b")
        .expect("valid path regex")
});

static SECTION_START_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(##\s+|\d+\.\s+|\*\s+\*\*)").expect("valid section regex"));
static BULLET_START_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[*\-\d]").expect("valid bullet regex"));
static BULLET_MARKER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([*-]|\d+\.)\s+").expect("valid marker regex"));

/// Severity implied by keywords, highest first. `None` when no keyword matches.
pub fn severity_from_text(text: &str) -> Option<Severity> {
    if CRITICAL_RE.is_match(text) {
        Some(Severity::Critical)
    } else if MAJOR_RE.is_match(text) {
        Some(Severity::Major)
    } else if MINOR_RE.is_match(text) {
        Some(Severity::Minor)
    } else {
        None
    }
}

/// Category implied by keywords, first match wins. `None` when nothing matches.
pub fn category_from_text(text: &str) -> Option<Category> {
    CATEGORY_RES
        .iter()
        .find(|(_, re)| re.is_match(text))
        .map(|(category, _)| *category)
}

/// Extract a file path and line number from free text.
///
/// The line is only reported when it directly follows a recognized path.
/// A line of `0` or one that does not fit in `u32` is treated as absent.
pub fn extract_location(text: &str) -> (Option<String>, Option<u32>) {
    for re in LOCATION_RES.iter() {
        if let Some(caps) = re.captures(text) {
            let file = caps.get(1).map(|m| m.as_str().to_string());
            let line = caps
                .get(2)
                .and_then(|m| m.as_str().parse::<u32>().ok())
                .filter(|line| *line > 0);
            return (file, line);
        }
    }
    let file = PATH_ONLY_RE.find(text).map(|m| m.as_str().to_string());
    (file, None)
}

/// How free text is cut into candidate finding blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStyle {
    /// New block at `## heading`, `1. item` or `* **bold**` lines.
    Sections,
    /// New block at any line starting with `*`, `-` or a digit.
    Bullets,
    /// One block per list item, marker stripped, continuation lines joined with spaces.
    /// Text before the first list item is ignored.
    JoinedBullets,
}

/// Split free text into trimmed, non-empty candidate blocks.
pub fn split_blocks(text: &str, style: BlockStyle) -> Vec<String> {
    match style {
        BlockStyle::Sections => split_at(text, |line| SECTION_START_RE.is_match(line)),
        BlockStyle::Bullets => split_at(text, |line| BULLET_START_RE.is_match(line)),
        BlockStyle::JoinedBullets => join_bullets(text),
    }
}

fn split_at<F>(text: &str, starts_block: F) -> Vec<String>
where
    F: Fn(&str) -> bool,
{
    let mut blocks = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    for line in text.lines() {
        if starts_block(line) && !current.is_empty() {
            push_block(&mut blocks, &current.join("\n"));
            current.clear();
        }
        current.push(line);
    }
    push_block(&mut blocks, &current.join("\n"));
    blocks
}

fn join_bullets(text: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut current: Option<String> = None;
    for line in text.lines() {
        let line = line.trim();
        if let Some(marker) = BULLET_MARKER_RE.find(line) {
            if let Some(done) = current.take() {
                push_block(&mut blocks, &done);
            }
            current = Some(line[marker.end()..].to_string());
        } else if let Some(block) = current.as_mut()
            && !line.is_empty()
        {
            block.push(' ');
            block.push_str(line);
        }
    }
    if let Some(done) = current {
        push_block(&mut blocks, &done);
    }
    blocks
}

fn push_block(blocks: &mut Vec<String>, block: &str) {
    let trimmed = block.trim();
    if !trimmed.is_empty() {
        blocks.push(trimmed.to_string());
    }
}

/// Truncate to at most `max_chars` characters without splitting a code point.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}
