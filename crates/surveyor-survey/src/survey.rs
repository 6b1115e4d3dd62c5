//! The survey payload carried end-to-end through the pipeline.

use std::collections::{BTreeMap, BTreeSet};

use jiff::Timestamp;
use serde::{Deserialize, Serialize};

use crate::TRACING_TARGET;
use crate::citation::{rewrite_citations, slugify_title, strip_illegal_citations};
use crate::content::ContentTree;
use crate::digest::{Digest, DigestRegistry};
use crate::error::{Error, Result};
use crate::skeleton::{RenderOptions, Skeleton};

/// A reference paper, keyed by its bibkey.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Paper {
    /// Original paper title.
    pub title: String,
    /// Citation slug derived from the title.
    pub bibkey: String,
    /// Paper abstract; falls back to a leading excerpt of the body.
    #[serde(rename = "abstract")]
    pub abstract_text: String,
    /// Source URL, when crawled from the web.
    pub url: Option<String>,
    /// Full text of the paper.
    pub text: String,
    /// Token estimate of the full text.
    pub token_count: Option<u64>,
}

/// Submission payload for one survey job, as read from crawl results or
/// an input file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SurveyInput {
    /// Requested survey title or topic.
    pub title: String,
    /// Human-provided outline lines, when present.
    #[serde(default)]
    pub outline: Vec<String>,
    /// Existing survey text, when regenerating.
    #[serde(default, rename = "txt")]
    pub text: String,
    /// The reference papers.
    #[serde(default)]
    pub papers: Vec<PaperInput>,
}

/// One paper in a [`SurveyInput`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PaperInput {
    /// Paper title.
    pub title: String,
    /// Full text. Papers without text are dropped.
    #[serde(default, rename = "txt")]
    pub text: String,
    /// Abstract, when available.
    #[serde(default, rename = "abstract")]
    pub abstract_text: String,
    /// Source URL.
    #[serde(default)]
    pub url: Option<String>,
    /// Token estimate of `txt`.
    #[serde(default, rename = "txt_token")]
    pub token_count: Option<u64>,
}

/// Per-survey statistics describing the last refinement iteration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RefinementStats {
    /// Outline convolution iterations completed.
    pub block_cycle_count: u32,
    /// Average block score per iteration.
    pub block_avg_score: Vec<f64>,
    /// Convolution depth used.
    pub conv_layer: u32,
    /// Convolution receptive field used.
    pub receptive_field: u32,
    /// Candidates kept per convolution step.
    pub top_k: u32,
    /// Results requested per convolution step.
    pub result_num: u32,
    /// Scores of the self-refinement loop.
    pub self_refine_score: Vec<f64>,
    /// Best-of width of the self-refinement loop.
    pub best_of: u32,
    /// Self-refinement iterations completed.
    pub refine_count: u32,
    /// Papers per skeleton batch.
    pub skeleton_batch_size: u32,
    /// Papers per digest batch.
    pub digest_batch_size: u32,
}

/// The mutable survey job payload.
///
/// Serializes to a self-contained JSON blob; deep copy is plain `Clone`
/// because every tree is arena-indexed and owned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Survey {
    /// Task this survey belongs to, once submitted through the manager.
    pub task_id: Option<String>,
    /// Survey title.
    pub title: String,
    /// Outline provided with the submission, joined into one block.
    pub origin_outline: String,
    /// Survey text provided with the submission.
    pub origin_content: String,
    papers: Vec<Paper>,
    paper_index: BTreeMap<String, usize>,
    /// The outline tree.
    pub skeleton: Skeleton,
    /// The content tree, present once decoding has started.
    pub content: Option<ContentTree>,
    /// Digest groups keyed by bibkey sets.
    pub digests: DigestRegistry,
    /// Rendered reference section, built during citation rewrite.
    pub ref_str: String,
    /// Share of references actually cited, set during citation rewrite.
    pub cite_ratio: f64,
    /// Refinement statistics.
    pub stats: RefinementStats,
    /// Snapshot timestamp of the payload.
    pub snapshot_at: Timestamp,
    /// Seconds spent in the pipeline before the snapshot.
    pub cost_seconds: f64,
}

impl Survey {
    /// Builds a survey from submitted input data.
    ///
    /// Papers without text are dropped; bibkeys deduplicate by keeping
    /// the first paper with a given slug.
    pub fn from_input(input: SurveyInput, task_id: Option<String>) -> Result<Self> {
        if input.title.trim().is_empty() {
            return Err(Error::InvalidInput("survey title is empty".into()));
        }

        let mut papers = Vec::new();
        let mut paper_index = BTreeMap::new();
        for paper in input.papers {
            if paper.text.is_empty() {
                continue;
            }
            let bibkey = slugify_title(&paper.title);
            if bibkey.is_empty() || paper_index.contains_key(&bibkey) {
                tracing::debug!(
                    target: TRACING_TARGET,
                    title = %paper.title,
                    "Skipping paper with duplicate or empty bibkey"
                );
                continue;
            }
            let abstract_text = if paper.abstract_text.is_empty() {
                paper.text.chars().take(500).collect()
            } else {
                paper.abstract_text
            };
            paper_index.insert(bibkey.clone(), papers.len());
            papers.push(Paper {
                title: paper.title,
                bibkey,
                abstract_text,
                url: paper.url,
                text: paper.text,
                token_count: paper.token_count,
            });
        }

        if papers.is_empty() {
            return Err(Error::InvalidInput("no usable papers in input".into()));
        }

        let skeleton = Skeleton::new(paper_index.keys().cloned());
        Ok(Self {
            task_id,
            title: input.title,
            origin_outline: input.outline.join("\n"),
            origin_content: input.text,
            papers,
            paper_index,
            skeleton,
            content: None,
            digests: DigestRegistry::new(),
            ref_str: String::new(),
            cite_ratio: 0.0,
            stats: RefinementStats::default(),
            snapshot_at: Timestamp::now(),
            cost_seconds: 0.0,
        })
    }

    /// The reference papers in stable citation order.
    pub fn papers(&self) -> &[Paper] {
        &self.papers
    }

    /// Looks a paper up by bibkey.
    pub fn paper(&self, bibkey: &str) -> Option<&Paper> {
        self.paper_index.get(bibkey).map(|index| &self.papers[*index])
    }

    /// The set of all bibkeys.
    pub fn bibkeys(&self) -> BTreeSet<String> {
        self.paper_index.keys().cloned().collect()
    }

    /// Bibkey → (title, abstract), for prompting.
    pub fn abstracts(&self) -> BTreeMap<String, (String, String)> {
        self.papers
            .iter()
            .map(|paper| {
                (
                    paper.bibkey.clone(),
                    (paper.title.clone(), paper.abstract_text.clone()),
                )
            })
            .collect()
    }

    /// Label used in logs and the executing lists.
    pub fn label(&self) -> String {
        format!("{}(cycle {})", self.title, self.stats.block_cycle_count)
    }

    /// Re-parses the outline from refined markdown.
    pub fn update_outline(&mut self, raw_outline: &str) -> Result<()> {
        self.skeleton.update(raw_outline)
    }

    /// Replaces the digest groups.
    pub fn update_digests(&mut self, digests: Vec<Digest>) -> Result<()> {
        self.digests.replace_all(digests)
    }

    /// Initializes the content tree from the current outline.
    pub fn init_content(&mut self) -> Result<()> {
        self.content = Some(ContentTree::from_skeleton(&self.skeleton)?);
        Ok(())
    }

    /// Returns whether content generation has finished.
    pub fn is_content_finished(&self) -> bool {
        self.content
            .as_ref()
            .is_some_and(|content| content.is_finished())
    }

    /// Rewrites bibkey citations to 1-based reference indices, computes
    /// the citation ratio and renders the reference section.
    ///
    /// After this pass every surviving citation index `k` satisfies
    /// `1 <= k <= papers.len()`, and `cite_ratio` equals
    /// `1 - unreferenced / total`.
    pub fn rewrite_citations(&mut self) -> Result<()> {
        let content = self
            .content
            .as_mut()
            .ok_or_else(|| Error::StructureMismatch("content tree not initialized".into()))?;

        let bibkeys = self.paper_index.keys().cloned().collect::<BTreeSet<_>>();
        let mut usage: BTreeMap<String, usize> = self
            .paper_index
            .keys()
            .map(|key| (key.clone(), 0))
            .collect();

        let ids = content.arena().ids();
        for id in ids {
            let Some(section) = content.section(id) else {
                continue;
            };
            let cleaned = strip_illegal_citations(&section.text, &bibkeys);
            let rewritten = rewrite_citations(&cleaned, |keys| {
                let mut indices = Vec::new();
                for key in keys {
                    if let Some(index) = self.paper_index.get(key) {
                        *usage.get_mut(key).expect("usage covers all bibkeys") += 1;
                        indices.push(index + 1);
                    }
                }
                indices
            });
            content.update_raw_text(id, rewritten)?;
        }

        let total = self.papers.len();
        let uncited = usage.values().filter(|count| **count == 0).count();
        self.cite_ratio = if total == 0 {
            0.0
        } else {
            1.0 - uncited as f64 / total as f64
        };

        let mut references = String::from("## References\n");
        for (position, paper) in self.papers.iter().enumerate() {
            references.push_str(&format!(
                "[{}] {} {}\n\n",
                position + 1,
                paper.title,
                paper.url.as_deref().unwrap_or("")
            ));
        }
        self.ref_str = references;

        tracing::info!(
            target: TRACING_TARGET,
            survey = %self.title,
            cite_ratio = self.cite_ratio,
            references = total,
            "Citations rewritten"
        );
        Ok(())
    }

    /// The full rendered survey: content plus references.
    pub fn render(&self) -> String {
        let body = self
            .content
            .as_ref()
            .map(|content| content.render_all(&self.skeleton))
            .unwrap_or_default();
        if self.ref_str.is_empty() {
            body
        } else {
            format!("{body}\n\n{}", self.ref_str.trim_end())
        }
    }

    /// Serializes the payload to a self-contained JSON value.
    pub fn to_value(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Restores a payload from its JSON form.
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    /// Stamps the snapshot time and accumulated cost before persisting.
    pub fn snapshot(&mut self, started_at: Timestamp) {
        let now = Timestamp::now();
        self.cost_seconds = now.duration_since(started_at).as_secs_f64().max(0.0);
        self.snapshot_at = now;
    }

    /// Outline rendering shortcut used by the stages.
    pub fn outline_text(&self, options: RenderOptions) -> String {
        self.skeleton.render(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input() -> SurveyInput {
        SurveyInput {
            title: "Graph Learning".into(),
            outline: vec![],
            text: String::new(),
            papers: vec![
                PaperInput {
                    title: "Alpha Paper".into(),
                    text: "alpha body".into(),
                    abstract_text: "alpha abstract".into(),
                    url: Some("https://example.org/alpha".into()),
                    token_count: Some(10),
                },
                PaperInput {
                    title: "Beta Paper".into(),
                    text: "beta body".into(),
                    ..PaperInput::default()
                },
                PaperInput {
                    title: "Skipped".into(),
                    text: String::new(),
                    ..PaperInput::default()
                },
            ],
        }
    }

    fn decoded_survey() -> Survey {
        let mut survey = Survey::from_input(input(), Some("task-1".into())).unwrap();
        survey
            .skeleton
            .parse_outline("Graph Learning", "# T\n## Intro\n## Outlook\n")
            .unwrap();
        survey.init_content().unwrap();
        survey
    }

    #[test]
    fn papers_without_text_are_dropped() {
        let survey = Survey::from_input(input(), None).unwrap();
        assert_eq!(survey.papers().len(), 2);
        assert!(survey.paper("alpha_paper").is_some());
        assert!(survey.paper("skipped").is_none());
        assert!(survey.bibkeys().contains("beta_paper"));
    }

    #[test]
    fn empty_inputs_are_rejected() {
        let empty = SurveyInput {
            title: "T".into(),
            ..SurveyInput::default()
        };
        assert!(Survey::from_input(empty, None).is_err());
    }

    #[test]
    fn citation_rewrite_renumbers_and_scores() {
        let mut survey = decoded_survey();
        let legal = survey.bibkeys();
        let content = survey.content.as_mut().unwrap();
        content
            .update_section(1, "Uses [beta_paper] and [alpha_paper, beta_paper].", &legal)
            .unwrap();
        content.update_section(2, "No citations here.", &legal).unwrap();

        survey.rewrite_citations().unwrap();

        let text = survey.content.as_ref().unwrap().section(1).unwrap().text.clone();
        assert_eq!(text, "Uses [2] and [1,2].");
        // Both papers cited: ratio 1.0.
        assert!((survey.cite_ratio - 1.0).abs() < f64::EPSILON);
        assert!(survey.ref_str.starts_with("## References"));
        assert!(survey.ref_str.contains("[1] Alpha Paper"));
    }

    #[test]
    fn citation_ratio_counts_unreferenced_papers() {
        let mut survey = decoded_survey();
        let legal = survey.bibkeys();
        let content = survey.content.as_mut().unwrap();
        content.update_section(1, "Only [alpha_paper].", &legal).unwrap();
        content.update_section(2, "Nothing.", &legal).unwrap();

        survey.rewrite_citations().unwrap();
        assert!((survey.cite_ratio - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn unknown_citations_are_stripped_not_numbered() {
        let mut survey = decoded_survey();
        let content = survey.content.as_mut().unwrap();
        // Bypass update_section's stripping to simulate a rogue citation
        // arriving at the rewrite stage.
        content.update_raw_text(1, "Claim [rogue_key].".into()).unwrap();
        content.update_raw_text(2, "Fine.".into()).unwrap();

        survey.rewrite_citations().unwrap();
        let text = survey.content.as_ref().unwrap().section(1).unwrap().text.clone();
        assert_eq!(text, "Claim .");
    }

    #[test]
    fn serde_round_trip_is_fixed_point() {
        let mut survey = decoded_survey();
        survey
            .update_digests(vec![Digest::new(
                "Graph Learning",
                vec![crate::digest::DigestPaper {
                    title: "Alpha Paper".into(),
                    bibkey: "alpha_paper".into(),
                    abstract_text: "a".into(),
                    content: "body".into(),
                }],
            )])
            .unwrap();
        let value = survey.to_value().unwrap();
        let back = Survey::from_value(value).unwrap();
        assert_eq!(survey, back);
    }
}
