//! Digests and the multi-key digest registry.
//!
//! A digest is a structured extract of one or more reference papers,
//! aligned section-by-section to the outline tree. The registry maps
//! *sets* of bibkeys to a single digest: digests live in a slab and a
//! bibkey index points into it, so one bibkey belongs to exactly one
//! digest group and set membership is derived from the index.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::citation::{extract_markdown, parse_heading};
use crate::error::{Error, Result};
use crate::skeleton::Skeleton;
use crate::tree::{Arena, NodeId};

/// Maximum paper length carried into digest construction, in characters.
///
/// Papers beyond this are truncated so a single prompt stays within the
/// model window.
pub const MAX_PAPER_CHARS: usize = 600_000;

/// One reference paper inside a digest group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigestPaper {
    /// Original paper title.
    pub title: String,
    /// Citation slug of the title.
    pub bibkey: String,
    /// Paper abstract, or a leading excerpt when absent.
    #[serde(rename = "abstract")]
    pub abstract_text: String,
    /// Paper body, truncated to [`MAX_PAPER_CHARS`].
    pub content: String,
}

/// Digest content for one outline section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DigestSection {
    /// Section title mirroring the outline.
    pub title: String,
    /// Extracted content for this section.
    pub description: String,
}

/// A structured extract of one or more papers, aligned to the outline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Digest {
    /// Title of the survey this digest belongs to.
    pub survey_title: String,
    /// The papers summarized by this digest.
    pub papers: Vec<DigestPaper>,
    /// Per-section extracts mirroring the outline tree.
    pub sections: Arena<DigestSection>,
    /// Reviewer suggestions keyed by section title.
    pub suggestions: BTreeMap<String, String>,
    /// Parse failures observed while building this digest.
    pub failure_count: u32,
}

impl Digest {
    /// Creates a digest over a group of papers, truncating long bodies.
    pub fn new(survey_title: impl Into<String>, papers: Vec<DigestPaper>) -> Self {
        let papers = papers
            .into_iter()
            .map(|mut paper| {
                if paper.content.len() > MAX_PAPER_CHARS {
                    let mut cut = MAX_PAPER_CHARS;
                    while !paper.content.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    paper.content.truncate(cut);
                }
                paper
            })
            .collect();
        Self {
            survey_title: survey_title.into(),
            papers,
            sections: Arena::new(),
            suggestions: BTreeMap::new(),
            failure_count: 0,
        }
    }

    /// The set of bibkeys covered by this digest.
    pub fn bibkeys(&self) -> BTreeSet<String> {
        self.papers
            .iter()
            .map(|paper| paper.bibkey.clone())
            .collect()
    }

    /// Parses a markdown digest into sections aligned with the outline.
    ///
    /// The heading sequence must mirror the outline's pre-order section
    /// sequence; anything else is a structure mismatch, which is the
    /// retryable signal for the digest stage.
    pub fn parse_sections(&mut self, raw: &str, skeleton: &Skeleton) -> Result<()> {
        let raw = extract_markdown(raw);
        let outline = skeleton.arena();
        let expected: Vec<NodeId> = outline.ids();

        let mut arena = Arena::new();
        let mut cursor = 0usize;
        let mut current: Option<NodeId> = None;

        for line in raw.lines() {
            let (depth, title) = parse_heading(line);
            if depth > 0 {
                let Some(outline_id) = expected.get(cursor).copied() else {
                    return Err(Error::StructureMismatch(format!(
                        "digest has more sections than the outline ({title})"
                    )));
                };
                let node = if cursor == 0 {
                    arena.insert_root(DigestSection {
                        title,
                        description: String::new(),
                    })
                } else {
                    // Both arenas insert in pre-order, so outline ids are
                    // valid ids in the digest arena being built.
                    let parent = outline.parent(outline_id)
                        .expect("non-root outline section has a parent");
                    arena.insert_child(
                        parent,
                        DigestSection {
                            title,
                            description: String::new(),
                        },
                    )
                };
                current = Some(node);
                cursor += 1;
            } else if !line.trim().is_empty()
                && let Some(id) = current
                && let Some(section) = arena.get_mut(id)
            {
                section.description.push_str(line);
                section.description.push('\n');
            }
        }

        if cursor != expected.len() {
            return Err(Error::StructureMismatch(format!(
                "digest has {cursor} sections, outline has {}",
                expected.len()
            )));
        }
        for id in arena.ids() {
            if let Some(section) = arena.get_mut(id) {
                section.description = section.description.trim().to_string();
            }
        }

        self.sections = arena;
        Ok(())
    }

    /// Merges several digests into one group: papers concatenate,
    /// per-section descriptions join with separators.
    pub fn merge(mut digests: Vec<Digest>) -> Result<Digest> {
        let Some(mut merged) = (!digests.is_empty()).then(|| digests.remove(0)) else {
            return Err(Error::InvalidInput("no digests to merge".into()));
        };

        for digest in digests {
            merged.papers.extend(digest.papers);
            merged.suggestions.extend(digest.suggestions);
            let ids = merged.sections.ids();
            for (position, id) in ids.into_iter().enumerate() {
                let incoming = digest
                    .sections
                    .ids()
                    .get(position)
                    .and_then(|other| digest.sections.get(*other))
                    .map(|section| section.description.clone())
                    .unwrap_or_default();
                if incoming.is_empty() {
                    continue;
                }
                if let Some(section) = merged.sections.get_mut(id) {
                    if !section.description.is_empty() {
                        section.description.push_str("\n---------------------\n");
                    }
                    section.description.push_str(&incoming);
                }
            }
        }
        Ok(merged)
    }

    /// All per-section descriptions, flattened for prompting.
    pub fn description(&self) -> String {
        self.sections
            .ids()
            .into_iter()
            .filter_map(|id| self.sections.get(id))
            .filter(|section| !section.description.is_empty())
            .map(|section| format!("{}\n{}", section.title, section.description))
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Registry mapping sets of bibkeys to digests.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DigestRegistry {
    digests: Vec<Digest>,
    index: BTreeMap<String, usize>,
}

impl DigestRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a digest group; every bibkey must be unassigned.
    pub fn insert(&mut self, digest: Digest) -> Result<usize> {
        for bibkey in digest.bibkeys() {
            if self.index.contains_key(&bibkey) {
                return Err(Error::DuplicateBibkey(bibkey));
            }
        }
        let id = self.digests.len();
        for bibkey in digest.bibkeys() {
            self.index.insert(bibkey, id);
        }
        self.digests.push(digest);
        Ok(id)
    }

    /// Replaces the registry contents with a new set of groups.
    pub fn replace_all(&mut self, digests: Vec<Digest>) -> Result<()> {
        self.digests.clear();
        self.index.clear();
        for digest in digests {
            self.insert(digest)?;
        }
        Ok(())
    }

    /// Looks a digest up by any of its bibkeys.
    pub fn get(&self, bibkey: &str) -> Option<&Digest> {
        self.index.get(bibkey).map(|id| &self.digests[*id])
    }

    /// All digests, in insertion order.
    pub fn digests(&self) -> &[Digest] {
        &self.digests
    }

    /// The set of every registered bibkey.
    pub fn bibkeys(&self) -> BTreeSet<String> {
        self.index.keys().cloned().collect()
    }

    /// Number of digest groups.
    pub fn len(&self) -> usize {
        self.digests.len()
    }

    /// Returns whether no group is registered.
    pub fn is_empty(&self) -> bool {
        self.digests.is_empty()
    }

    /// Returns whether a bibkey belongs to any group.
    pub fn contains(&self, bibkey: &str) -> bool {
        self.index.contains_key(bibkey)
    }
}
