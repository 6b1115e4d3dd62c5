//! The survey outline (skeleton) tree.
//!
//! Parsed from markdown produced by the outline stages: `#`-depth decides
//! nesting, prose lines under a heading become the section description,
//! and descriptions split into "digest construction" and "digest
//! analysis" guidance.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::citation::{self, extract_markdown, parse_heading, strip_illegal_citations};
use crate::error::{Error, Result};
use crate::tree::{Arena, NodeId};

static CONSTRUCTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)Digest Construction:\s*(.*?)\s*Digest Analysis:")
        .expect("valid construction regex")
});

static ANALYSIS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)Digest Analysis:\s*(.*)").expect("valid analysis regex"));

/// One outline section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Section {
    /// Section title without numbering.
    pub title: String,
    /// Raw description block under the heading.
    pub description: String,
    /// Guidance for building digests of this section.
    pub construction: String,
    /// Guidance for analyzing digests of this section.
    pub analysis: String,
}

impl Section {
    fn titled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    fn parse_description(&mut self) {
        self.description = self.description.trim().to_string();
        if let Some(caps) = CONSTRUCTION_RE.captures(&self.description) {
            self.construction = caps[1].trim().to_string();
        }
        if let Some(caps) = ANALYSIS_RE.captures(&self.description) {
            self.analysis = caps[1].trim().to_string();
        }
    }
}

/// Rendering flags for [`Skeleton::render`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RenderOptions {
    /// Include the digest construction guidance.
    pub construction: bool,
    /// Include the digest analysis guidance.
    pub analysis: bool,
    /// Append the digest placeholder instruction under each section.
    pub with_digest_placeholder: bool,
    /// Prefix titles with their 1-based section numbers.
    pub with_index: bool,
    /// Label the guidance blocks when both are rendered.
    pub with_label: bool,
}

impl RenderOptions {
    /// Title-only rendering.
    pub fn titles() -> Self {
        Self::default()
    }

    /// Rendering used when prompting for section content.
    pub fn guidance() -> Self {
        Self {
            construction: true,
            analysis: true,
            with_label: true,
            ..Self::default()
        }
    }
}

/// The hierarchical outline of a survey.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Skeleton {
    arena: Arena<Section>,
    /// Bibkeys the outline may legally cite.
    pub references: BTreeSet<String>,
    /// The outline markdown as last parsed.
    pub raw_outline: String,
    /// Reviewer suggestion from the refinement loop.
    pub suggestion: Option<String>,
    /// Score of the last refinement evaluation.
    pub eval_score: Option<f64>,
    /// Detail blob of the last refinement evaluation.
    pub eval_detail: Option<serde_json::Value>,
}

impl Skeleton {
    /// Creates an empty skeleton over a reference set.
    pub fn new(references: impl IntoIterator<Item = String>) -> Self {
        Self {
            arena: Arena::new(),
            references: references.into_iter().collect(),
            raw_outline: String::new(),
            suggestion: None,
            eval_score: None,
            eval_detail: None,
        }
    }

    /// Parses a raw markdown outline, replacing the current tree.
    ///
    /// The first line's title is discarded in favor of `survey_title`;
    /// bibkeys outside the reference set are stripped before parsing.
    pub fn parse_outline(&mut self, survey_title: &str, raw_outline: &str) -> Result<()> {
        let raw = extract_markdown(raw_outline);
        let raw = strip_illegal_citations(&raw, &self.references);

        let mut lines = raw.lines();
        let Some(_title_line) = lines.next() else {
            return Err(Error::EmptyOutline);
        };

        let mut arena = Arena::new();
        let root = arena.insert_root(Section::titled(survey_title));
        // (node, markdown depth) — the root sits below every heading.
        let mut stack: Vec<(NodeId, usize)> = vec![(root, 0)];

        for line in lines {
            let (depth, title) = parse_heading(line);
            if depth > 0 {
                while stack.len() > 1 && stack.last().is_some_and(|(_, d)| *d >= depth) {
                    stack.pop();
                }
                let parent = stack.last().map(|(id, _)| *id).unwrap_or(root);
                let id = arena.insert_child(parent, Section::titled(title));
                stack.push((id, depth));
            } else if !line.trim().is_empty()
                && let Some((id, _)) = stack.last()
            {
                let section = arena.get_mut(*id).expect("stack ids are valid");
                section.description.push_str(line);
                section.description.push('\n');
            }
        }

        if arena.children(root).is_empty() {
            return Err(Error::EmptyOutline);
        }
        for id in arena.ids() {
            arena.get_mut(id).expect("ids are valid").parse_description();
        }

        self.arena = arena;
        self.raw_outline = raw;
        Ok(())
    }

    /// Re-parses an updated outline, keeping title and references.
    pub fn update(&mut self, raw_outline: &str) -> Result<()> {
        let title = self.title().to_string();
        self.parse_outline(&title, raw_outline)
    }

    /// Survey title (root section title).
    pub fn title(&self) -> &str {
        self.arena
            .root()
            .and_then(|root| self.arena.get(root))
            .map(|section| section.title.as_str())
            .unwrap_or("")
    }

    /// The underlying tree.
    pub fn arena(&self) -> &Arena<Section> {
        &self.arena
    }

    /// Returns whether the outline has been parsed.
    pub fn is_parsed(&self) -> bool {
        !self.arena.is_empty()
    }

    /// Verifies that every bibkey cited in section descriptions exists.
    pub fn check_bibkeys(&self) -> Result<()> {
        for id in self.arena.ids() {
            if let Some(section) = self.arena.get(id) {
                citation::check_citations(&section.description, &self.references)?;
            }
        }
        Ok(())
    }

    /// Renders one section per the options.
    pub fn render_section(&self, id: NodeId, options: RenderOptions) -> String {
        let Some(section) = self.arena.get(id) else {
            return String::new();
        };
        let prefix = "#".repeat(self.arena.depth(id) + 1);
        let mut out = if options.with_index && self.arena.parent(id).is_some() {
            format!("{prefix} {} {}", self.arena.number_index(id), section.title)
        } else {
            format!("{prefix} {}", section.title)
        };

        let has_guidance = !section.description.is_empty();
        match (options.construction, options.analysis) {
            (true, false) if has_guidance => {
                out.push('\n');
                out.push_str(&section.construction);
            }
            (false, true) if has_guidance => {
                out.push('\n');
                out.push_str(&section.analysis);
            }
            (true, true) if has_guidance => {
                if options.with_label {
                    out.push_str(&format!(
                        "\nDigest Construction: \n{}\nDigest Analysis: \n{}",
                        section.construction, section.analysis
                    ));
                } else {
                    out.push_str(&format!("\n{}\n{}", section.construction, section.analysis));
                }
            }
            _ => {}
        }

        if options.with_digest_placeholder && self.arena.parent(id).is_some() {
            out.push_str(
                "\nExtract the relevant content from the given paper. If no related \
                 information is available for this section, keep the section title \
                 and leave <EMPTY> as its description.",
            );
        }
        out
    }

    /// Renders the whole outline per the options.
    pub fn render(&self, options: RenderOptions) -> String {
        self.arena
            .ids()
            .into_iter()
            .map(|id| self.render_section(id, options))
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string()
    }
}
