//! Step model: job steps, the script parser and per-item step queues.

pub mod parser;
pub mod queue;
pub mod step;

pub use parser::{ParsedScript, parse_lines, parse_script};
pub use queue::StepQueue;
pub use step::{
    JobStep, Requirement, StepCatalog, StepId, StepKind, StepTemplate, UploadSpec, VarOp,
};
