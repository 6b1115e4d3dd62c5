//! Bibkeys, citation parsing and text utilities.
//!
//! Citations in generated text look like `[some_paper, other_paper]`.
//! Bibkeys are slugs derived from paper titles; rewriting maps them to
//! 1-based reference indices at the end of the pipeline.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Error, Result};

static CITE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[([^\[\]]+)\]").expect("valid citation regex"));

static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:markdown|md)?\s*\n(.*?)```").expect("valid fence regex")
});

static HEADING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(#+)\s*((?:\d+\.)*\d*\.?\s+)?(.*)$").expect("valid heading regex")
});

/// Derives a citation slug from a paper title.
///
/// Lowercases, maps every non-alphanumeric run to one underscore and trims
/// the ends, so `"Attention Is All You Need"` becomes
/// `attention_is_all_you_need`.
pub fn slugify_title(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut last_was_sep = true;
    for ch in title.chars() {
        if ch.is_alphanumeric() {
            slug.extend(ch.to_lowercase());
            last_was_sep = false;
        } else if !last_was_sep {
            slug.push('_');
            last_was_sep = true;
        }
    }
    while slug.ends_with('_') {
        slug.pop();
    }
    slug
}

/// Splits the interior of a citation group into trimmed bibkeys.
///
/// Hyphens are normalized to underscores because models occasionally
/// re-hyphenate slugs.
pub fn split_citation_group(group: &str) -> Vec<String> {
    group
        .split(',')
        .map(|key| key.trim().trim_matches(['[', ']']).replace('-', "_"))
        .filter(|key| !key.is_empty())
        .collect()
}

/// Collects every bibkey cited anywhere in `text`.
pub fn cited_bibkeys(text: &str) -> BTreeSet<String> {
    let mut cited = BTreeSet::new();
    for group in CITE_RE.captures_iter(text) {
        cited.extend(split_citation_group(&group[1]));
    }
    cited
}

/// Removes bibkeys not present in `legal` from every citation group,
/// dropping groups that become empty.
pub fn strip_illegal_citations(text: &str, legal: &BTreeSet<String>) -> String {
    CITE_RE
        .replace_all(text, |caps: &regex::Captures<'_>| {
            let keys: Vec<String> = split_citation_group(&caps[1])
                .into_iter()
                .filter(|key| legal.contains(key))
                .collect();
            if keys.is_empty() {
                String::new()
            } else {
                format!("[{}]", keys.join(", "))
            }
        })
        .into_owned()
}

/// Verifies that every citation in `text` is covered by `legal`.
pub fn check_citations(text: &str, legal: &BTreeSet<String>) -> Result<()> {
    let unknown: Vec<String> = cited_bibkeys(text)
        .into_iter()
        .filter(|key| !legal.contains(key))
        .collect();
    if unknown.is_empty() {
        Ok(())
    } else {
        Err(Error::BibkeyNotFound(unknown))
    }
}

/// Extracts the body of a fenced markdown block.
///
/// Model output usually wraps markdown in ``` fences; unfenced output is
/// returned unchanged so plain completions keep working.
pub fn extract_markdown(raw: &str) -> String {
    match FENCE_RE.captures(raw) {
        Some(caps) => caps[1].trim().to_string(),
        None => raw.trim().to_string(),
    }
}

/// Parses a markdown heading line into `(depth, title)`.
///
/// Depth is the number of leading `#`; an optional section number between
/// the hashes and the title is dropped. Non-heading lines yield depth 0.
pub fn parse_heading(line: &str) -> (usize, String) {
    match HEADING_RE.captures(line.trim_end()) {
        Some(caps) => (caps[1].len(), caps[3].trim().to_string()),
        None => (0, String::new()),
    }
}

/// Strips heading lines out of a generated section body.
pub fn strip_headings(text: &str) -> String {
    text.lines()
        .filter(|line| parse_heading(line).0 == 0)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Rewrites citation groups through `map`, which receives the bibkeys of
/// one group and returns the replacement indices (already 1-based).
/// Groups mapping to nothing are removed.
pub fn rewrite_citations<F>(text: &str, mut map: F) -> String
where
    F: FnMut(&[String]) -> Vec<usize>,
{
    CITE_RE
        .replace_all(text, |caps: &regex::Captures<'_>| {
            let keys = split_citation_group(&caps[1]);
            let mut indices = map(&keys);
            indices.sort_unstable();
            indices.dedup();
            if indices.is_empty() {
                String::new()
            } else {
                format!(
                    "[{}]",
                    indices
                        .iter()
                        .map(usize::to_string)
                        .collect::<Vec<_>>()
                        .join(",")
                )
            }
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugs_are_stable() {
        assert_eq!(
            slugify_title("Attention Is All You Need"),
            "attention_is_all_you_need"
        );
        assert_eq!(slugify_title("GPT-4: a Report!"), "gpt_4_a_report");
        assert_eq!(slugify_title("  spaced  "), "spaced");
    }

    #[test]
    fn illegal_citations_are_stripped() {
        let legal: BTreeSet<String> =
            ["alpha".to_string(), "beta".to_string()].into_iter().collect();
        let text = "Known [alpha, gamma] and unknown [delta].";
        assert_eq!(
            strip_illegal_citations(text, &legal),
            "Known [alpha] and unknown ."
        );
    }

    #[test]
    fn citation_check_reports_unknown_keys() {
        let legal: BTreeSet<String> = ["alpha".to_string()].into_iter().collect();
        let err = check_citations("see [alpha, beta]", &legal).unwrap_err();
        match err {
            Error::BibkeyNotFound(keys) => assert_eq!(keys, vec!["beta".to_string()]),
            other => panic!("unexpected error: {other}"),
        }
        assert!(check_citations("see [alpha]", &legal).is_ok());
    }

    #[test]
    fn fenced_markdown_is_extracted() {
        let raw = "noise\n```markdown\n## Section\nBody\n```\ntrailer";
        assert_eq!(extract_markdown(raw), "## Section\nBody");
        assert_eq!(extract_markdown("plain text"), "plain text");
    }

    #[test]
    fn headings_parse_with_numbering() {
        assert_eq!(parse_heading("## 2.1 Methods"), (2, "Methods".to_string()));
        assert_eq!(parse_heading("# Title"), (1, "Title".to_string()));
        assert_eq!(parse_heading("prose line").0, 0);
    }

    #[test]
    fn rewrite_sorts_and_dedupes_indices() {
        let text = "claim [b, a, b]";
        let out = rewrite_citations(text, |keys| {
            keys.iter()
                .map(|key| if key == "a" { 1 } else { 2 })
                .collect()
        });
        assert_eq!(out, "claim [1,2]");
    }
}
