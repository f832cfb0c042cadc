//! Job step records and the template catalog they are parsed against.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::pool::{ResourceClass, ResourceId, SizeClass};

/// What a step does when dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Compile a workflow document, substitute variables, run it.
    RunWorkflow,
    /// Send the work item's model prompt to a language model.
    CallModel,
    /// Upload an image so a later workflow can reference it.
    UploadAsset,
    /// Apply variable operations only.
    Command,
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::RunWorkflow => "run-workflow",
            Self::CallModel => "call-model",
            Self::UploadAsset => "upload-asset",
            Self::Command => "command",
        };
        write!(f, "{s}")
    }
}

/// Resource a step needs before it can be dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Requirement {
    /// Runs immediately, no pool interaction.
    None,
    ComputeBackend,
    ModelInstance(SizeClass),
    /// Decided at dispatch from the work item's `requirements` variable.
    FromWorkItem,
}

impl Requirement {
    /// Resolve `FromWorkItem` against a requirements tag.
    ///
    /// `"resource"` needs a compute backend, an empty tag or `"none"` needs
    /// nothing, `"model"` needs a large model instance. Unknown tags are
    /// treated as `"resource"`.
    pub fn resolve(self, tag: &str) -> Requirement {
        match self {
            Self::FromWorkItem => match tag.trim() {
                "" | "none" => Self::None,
                "resource" => Self::ComputeBackend,
                "model" => Self::ModelInstance(SizeClass::Large),
                other => {
                    tracing::warn!(tag = other, "Unknown requirements tag, assuming compute backend");
                    Self::ComputeBackend
                }
            },
            resolved => resolved,
        }
    }

    /// Pool class and size for a resolved requirement.
    pub fn class(self) -> Option<(ResourceClass, Option<SizeClass>)> {
        match self {
            Self::ComputeBackend => Some((ResourceClass::ComputeBackend, None)),
            Self::ModelInstance(size) => Some((ResourceClass::ModelInstance, Some(size))),
            Self::None | Self::FromWorkItem => None,
        }
    }
}

/// An inline variable operation carried by a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "op")]
pub enum VarOp {
    Copy { src: String, dst: String },
    Append { src: String, dst: String },
    Resize {
        width: u32,
        height: u32,
        aspect_correct: bool,
        only_if_larger: bool,
    },
    NoUndo,
    FillMaskIfBlank,
    ModelPromptReset,
    ModelPromptSetBasePrompt { source: String },
    ModelPromptAddFromAssistant { source: String },
    ModelPromptAddFromUser { source: String },
}

/// An asset upload declared inline with `upload|<source>|input<N>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSpec {
    /// Image slot or variable naming the image to upload.
    pub source: String,
    /// Target input index, 1..=4.
    pub input: u8,
}

impl UploadSpec {
    /// Variable that receives the uploaded asset's name.
    pub fn target_variable(&self) -> String {
        format!("input{}", self.input)
    }
}

/// Unique id of one step instance.
pub type StepId = Uuid;

/// One unit of dispatchable work.
///
/// Parsed steps are never mutated in place by the scheduler: dispatch takes
/// the step out of the queue and works on that owned value, and a retry
/// goes through [`JobStep::instantiate`] to get a fresh copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStep {
    pub id: StepId,
    /// Workflow name as written in the script.
    pub workflow: String,
    pub kind: StepKind,
    pub requirement: Requirement,
    /// Source document id for `RunWorkflow` steps.
    pub template: Option<String>,
    pub ops: Vec<VarOp>,
    /// Uploads still to be materialized as synthetic steps.
    pub uploads: Vec<UploadSpec>,
    /// Set on synthetic upload steps: the upload this step performs.
    pub upload: Option<UploadSpec>,
    /// Bound at dispatch.
    pub resource: Option<ResourceId>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// 1-based source line, 0 for steps not parsed from a script.
    pub line: usize,
}

impl JobStep {
    /// Create a step from a template with no operations.
    pub fn from_template(template: &StepTemplate, line: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow: template.name.clone(),
            kind: template.kind,
            requirement: template.requirement,
            template: template.source.clone(),
            ops: Vec::new(),
            uploads: Vec::new(),
            upload: None,
            resource: None,
            started_at: None,
            ended_at: None,
            line,
        }
    }

    /// A step that only applies variable operations.
    pub fn command(ops: Vec<VarOp>) -> Self {
        let mut step = Self::from_template(&StepTemplate::command(""), 0);
        step.ops = ops;
        step
    }

    /// Synthetic step uploading one asset ahead of `parent`.
    pub fn synthetic_upload(parent: &JobStep, spec: UploadSpec) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow: format!("{}:upload", parent.workflow),
            kind: StepKind::UploadAsset,
            requirement: parent.requirement,
            template: None,
            ops: Vec::new(),
            uploads: Vec::new(),
            upload: Some(spec),
            resource: None,
            started_at: None,
            ended_at: None,
            line: parent.line,
        }
    }

    /// Fresh copy for re-execution: new id, no resource, no timestamps.
    pub fn instantiate(&self) -> Self {
        Self {
            id: Uuid::new_v4(),
            resource: None,
            started_at: None,
            ended_at: None,
            ..self.clone()
        }
    }

    pub fn is_synthetic(&self) -> bool {
        self.upload.is_some()
    }

    /// Whether the step asked not to record an undo point.
    pub fn no_undo(&self) -> bool {
        self.ops.iter().any(|op| matches!(op, VarOp::NoUndo))
    }
}

/// How a workflow name in a script maps to a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepTemplate {
    pub name: String,
    pub kind: StepKind,
    pub requirement: Requirement,
    pub source: Option<String>,
}

impl StepTemplate {
    /// A workflow run whose resource comes from the work item's requirements tag.
    pub fn workflow(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: StepKind::RunWorkflow,
            requirement: Requirement::FromWorkItem,
            source: Some(source.into()),
        }
    }

    /// A language-model call of the given size class.
    pub fn model_call(name: impl Into<String>, size: SizeClass) -> Self {
        Self {
            name: name.into(),
            kind: StepKind::CallModel,
            requirement: Requirement::ModelInstance(size),
            source: None,
        }
    }

    /// A step that only applies its variable operations.
    pub fn command(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: StepKind::Command,
            requirement: Requirement::None,
            source: None,
        }
    }
}

/// Registry of workflow names a script may use.
#[derive(Debug, Clone, Default)]
pub struct StepCatalog {
    templates: HashMap<String, StepTemplate>,
}

impl StepCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, template: StepTemplate) {
        tracing::debug!(workflow = %template.name, kind = %template.kind, "Registered step template");
        self.templates.insert(template.name.clone(), template);
    }

    pub fn with(mut self, template: StepTemplate) -> Self {
        self.register(template);
        self
    }

    pub fn get(&self, name: &str) -> Option<&StepTemplate> {
        self.templates.get(name)
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}
