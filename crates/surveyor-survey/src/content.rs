//! The content tree and its readiness protocol.
//!
//! The content tree mirrors the outline tree node-for-node (same index
//! paths). Leaves become ready immediately; an inner section becomes
//! ready once every child is qualified, because its summary is composed
//! from the children. The root is never composed: once every top-level
//! child qualifies, the survey is finished.

use std::collections::BTreeSet;
use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::TRACING_TARGET;
use crate::citation::{strip_headings, strip_illegal_citations};
use crate::error::{Error, Result};
use crate::skeleton::{RenderOptions, Skeleton};
use crate::tree::{Arena, NodeId};

/// Generated prose for one outline section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContentSection {
    /// The section body, headings stripped.
    pub text: String,
    /// Set once the section's composition is accepted.
    pub qualified: bool,
    /// Compose failures observed for this section.
    pub failure_count: u32,
}

/// The tree of generated content, parallel to the outline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentTree {
    arena: Arena<ContentSection>,
    ready: VecDeque<NodeId>,
    finished: bool,
}

impl ContentTree {
    /// Builds an empty content tree mirroring the outline structure.
    ///
    /// Every leaf is immediately ready; an outline with a bare root
    /// produces a tree that is already finished.
    pub fn from_skeleton(skeleton: &Skeleton) -> Result<Self> {
        let outline = skeleton.arena();
        let root = outline.root().ok_or(Error::EmptyOutline)?;

        let mut arena = Arena::new();
        let content_root = arena.insert_root(ContentSection::default());
        let mut mapping = vec![usize::MAX; outline.len()];
        mapping[root] = content_root;
        for id in outline.ids() {
            if id == root {
                continue;
            }
            let parent = outline.parent(id).expect("non-root has a parent");
            mapping[id] = arena.insert_child(mapping[parent], ContentSection::default());
        }

        let ready: VecDeque<NodeId> = arena.leaves().into_iter().collect();
        let finished = arena.children(content_root).is_empty();
        Ok(Self {
            arena,
            ready,
            finished,
        })
    }

    /// The underlying tree. Index paths match the outline arena.
    pub fn arena(&self) -> &Arena<ContentSection> {
        &self.arena
    }

    /// Pops the next section whose composition may start.
    pub fn next_ready(&mut self) -> Option<NodeId> {
        if self.finished {
            return None;
        }
        self.ready.pop_front()
    }

    /// Returns whether every top-level section has qualified.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Borrow of one content section.
    pub fn section(&self, id: NodeId) -> Option<&ContentSection> {
        self.arena.get(id)
    }

    /// Stores the composed body for a section, stripping headings and
    /// citations outside `legal`.
    pub fn update_section(
        &mut self,
        id: NodeId,
        text: &str,
        legal: &BTreeSet<String>,
    ) -> Result<()> {
        let clean = strip_illegal_citations(&strip_headings(text), legal);
        let section = self
            .arena
            .get_mut(id)
            .ok_or_else(|| Error::StructureMismatch(format!("no content section {id}")))?;
        section.text = clean;
        Ok(())
    }

    /// Stores a section body verbatim. Used by the citation rewrite,
    /// which has already cleaned the text.
    pub fn update_raw_text(&mut self, id: NodeId, text: String) -> Result<()> {
        let section = self
            .arena
            .get_mut(id)
            .ok_or_else(|| Error::StructureMismatch(format!("no content section {id}")))?;
        section.text = text;
        Ok(())
    }

    /// Records a compose failure against a section.
    pub fn record_failure(&mut self, id: NodeId) {
        if let Some(section) = self.arena.get_mut(id) {
            section.failure_count += 1;
        }
    }

    /// Marks a section as qualified.
    ///
    /// When this completes its parent's children, the parent becomes
    /// ready; when the parent is the root, the survey finishes.
    pub fn mark_qualified(&mut self, id: NodeId) -> Result<()> {
        {
            let section = self
                .arena
                .get_mut(id)
                .ok_or_else(|| Error::StructureMismatch(format!("no content section {id}")))?;
            section.qualified = true;
        }

        let Some(parent) = self.arena.parent(id) else {
            // Qualifying the root directly is a protocol violation; the
            // root is assembled implicitly.
            return Err(Error::StructureMismatch("root is never composed".into()));
        };

        let all_qualified = self
            .arena
            .children(parent)
            .iter()
            .all(|child| {
                self.arena
                    .get(*child)
                    .is_some_and(|section| section.qualified)
            });
        if !all_qualified {
            return Ok(());
        }

        if self.arena.parent(parent).is_none() {
            self.finished = true;
            tracing::debug!(
                target: TRACING_TARGET,
                "Content tree finished"
            );
        } else {
            self.ready.push_back(parent);
        }
        Ok(())
    }

    /// Titles plus bodies of every section below `id`, excluding `id`.
    pub fn subcontents(&self, id: NodeId, skeleton: &Skeleton) -> String {
        let mut parts = Vec::new();
        for descendant in self.arena.descend(id) {
            if descendant == id {
                continue;
            }
            parts.push(self.titled_section(descendant, skeleton, false));
        }
        parts.join("\n\n").trim().to_string()
    }

    /// One section rendered with its outline title.
    pub fn titled_section(&self, id: NodeId, skeleton: &Skeleton, with_index: bool) -> String {
        let title = skeleton.render_section(
            id,
            RenderOptions {
                with_index,
                ..RenderOptions::titles()
            },
        );
        let body = self
            .arena
            .get(id)
            .map(|section| section.text.as_str())
            .unwrap_or("");
        format!("{}\n{}", title.trim(), body.trim())
    }

    /// The whole survey body, every section titled and numbered.
    pub fn render_all(&self, skeleton: &Skeleton) -> String {
        self.arena
            .ids()
            .into_iter()
            .map(|id| self.titled_section(id, skeleton, true))
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn skeleton() -> Skeleton {
        let mut skeleton = Skeleton::new(vec!["alpha".to_string(), "beta".to_string()]);
        skeleton
            .parse_outline(
                "Survey",
                "# T\n## Intro\n## Methods\n### Classical\n### Modern\n",
            )
            .unwrap();
        skeleton
    }

    #[test]
    fn leaves_are_ready_first() {
        let skeleton = skeleton();
        let mut content = ContentTree::from_skeleton(&skeleton).unwrap();
        // Outline: root(0) -> intro(1), methods(2) -> classical(3), modern(4).
        let mut ready = Vec::new();
        while let Some(id) = content.next_ready() {
            ready.push(id);
        }
        assert_eq!(ready, vec![1, 3, 4]);
    }

    #[test]
    fn parent_becomes_ready_when_children_qualify() {
        let skeleton = skeleton();
        let mut content = ContentTree::from_skeleton(&skeleton).unwrap();
        for _ in 0..3 {
            content.next_ready().unwrap();
        }

        content.mark_qualified(3).unwrap();
        assert!(content.next_ready().is_none());
        content.mark_qualified(4).unwrap();
        assert_eq!(content.next_ready(), Some(2));
        assert!(!content.is_finished());
    }

    #[test]
    fn root_children_qualifying_finishes_the_tree() {
        let skeleton = skeleton();
        let mut content = ContentTree::from_skeleton(&skeleton).unwrap();
        content.mark_qualified(3).unwrap();
        content.mark_qualified(4).unwrap();
        content.mark_qualified(1).unwrap();
        assert!(!content.is_finished());
        content.mark_qualified(2).unwrap();
        assert!(content.is_finished());
        assert!(content.next_ready().is_none());
    }

    #[test]
    fn update_section_strips_headings_and_rogue_citations() {
        let skeleton = skeleton();
        let mut content = ContentTree::from_skeleton(&skeleton).unwrap();
        let legal: BTreeSet<String> = skeleton.references.clone();
        content
            .update_section(1, "## Intro\nBody cites [alpha, rogue].", &legal)
            .unwrap();
        assert_eq!(content.section(1).unwrap().text, "Body cites [alpha].");
    }

    #[test]
    fn qualifying_the_root_is_rejected() {
        let skeleton = skeleton();
        let mut content = ContentTree::from_skeleton(&skeleton).unwrap();
        assert!(content.mark_qualified(0).is_err());
    }

    #[test]
    fn render_all_uses_numbered_titles() {
        let skeleton = skeleton();
        let mut content = ContentTree::from_skeleton(&skeleton).unwrap();
        let legal = skeleton.references.clone();
        content.update_section(1, "Opening.", &legal).unwrap();
        let rendered = content.render_all(&skeleton);
        assert!(rendered.contains("## 1 Intro\nOpening."));
        assert!(rendered.contains("### 2.1 Classical"));
    }

    #[test]
    fn serde_round_trip_is_fixed_point() {
        let skeleton = skeleton();
        let mut content = ContentTree::from_skeleton(&skeleton).unwrap();
        content.mark_qualified(3).unwrap();
        let json = serde_json::to_string(&content).unwrap();
        let back: ContentTree = serde_json::from_str(&json).unwrap();
        assert_eq!(content, back);
    }
}
