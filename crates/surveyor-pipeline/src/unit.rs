//! The unit of work flowing through the global pipeline.

use surveyor_flow::FlowItem;
use surveyor_survey::{NodeId, Survey};

/// One content section travelling through the decode composite.
///
/// Sections reference their survey through the decode registry key so
/// the heavyweight payload is not cloned per section.
#[derive(Debug, Clone, PartialEq)]
pub struct SectionUnit {
    /// Registry key of the in-flight survey.
    pub survey_key: String,
    /// Content/outline tree node this section corresponds to.
    pub section_id: NodeId,
    /// Composed section body, filled by the compose node.
    pub composed: Option<String>,
}

impl SectionUnit {
    /// Creates a not-yet-composed section unit.
    pub fn new(survey_key: impl Into<String>, section_id: NodeId) -> Self {
        Self {
            survey_key: survey_key.into(),
            section_id,
            composed: None,
        }
    }
}

/// The value carried by the global pipeline queues.
///
/// The head receives task handles; the encode stage resolves them into
/// survey payloads; the decode composite additionally moves per-section
/// units through its interior edges.
#[derive(Debug, Clone)]
pub enum Unit {
    /// A task handle. Stages that need the payload fetch it themselves.
    Task(String),
    /// A survey payload in flight between stages.
    Survey(Box<Survey>),
    /// One content section of a registered survey.
    Section(SectionUnit),
}

impl Unit {
    /// Wraps a survey payload.
    pub fn survey(survey: Survey) -> Self {
        Unit::Survey(Box::new(survey))
    }

    /// Returns the survey payload, if this unit carries one.
    pub fn as_survey(&self) -> Option<&Survey> {
        match self {
            Unit::Survey(survey) => Some(survey),
            _ => None,
        }
    }

    /// Returns the task id, if this unit is a task handle.
    pub fn as_task(&self) -> Option<&str> {
        match self {
            Unit::Task(task_id) => Some(task_id),
            _ => None,
        }
    }
}

impl FlowItem for Unit {
    fn label(&self) -> String {
        match self {
            Unit::Task(task_id) => format!("task:{task_id}"),
            Unit::Survey(survey) => survey.label(),
            Unit::Section(section) => {
                format!("{}#{}", section.survey_key, section.section_id)
            }
        }
    }
}
