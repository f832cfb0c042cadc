//! Step-script parser.
//!
//! One step per line: `workflow-name@op1|parm1|parm2@op2|...`.
//! - A trailing `-` on the workflow name disables the whole line.
//! - A trailing `-` on an operator name disables that operator.
//! - Blank lines and lines starting with `#` or `//` are ignored.
//! - An empty workflow name (`@copy|a|b`) gives a command step.
//!
//! Malformed or unknown operators are logged and skipped; the rest of the
//! line still becomes a step.

use tracing::{debug, warn};

use super::step::{JobStep, StepCatalog, StepTemplate, UploadSpec, VarOp};
use crate::error::StepError;
use crate::vars::MAX_DIMENSION;

/// Result of parsing a script: the steps in declaration order plus every
/// recoverable problem encountered.
#[derive(Debug, Default)]
pub struct ParsedScript {
    pub steps: Vec<JobStep>,
    pub errors: Vec<StepError>,
}

/// Parse a multi-line script against a catalog.
pub fn parse_script(script: &str, catalog: &StepCatalog) -> ParsedScript {
    let mut parsed = ParsedScript::default();
    for (index, line) in script.lines().enumerate() {
        if let Some(step) = parse_line(index + 1, line, catalog, &mut parsed.errors) {
            parsed.steps.push(step);
        }
    }
    parsed
}

/// Parse a list of lines (as handed over by a host or a callback).
pub fn parse_lines<S: AsRef<str>>(lines: &[S], catalog: &StepCatalog) -> ParsedScript {
    let mut parsed = ParsedScript::default();
    for (index, line) in lines.iter().enumerate() {
        if let Some(step) = parse_line(index + 1, line.as_ref(), catalog, &mut parsed.errors) {
            parsed.steps.push(step);
        }
    }
    parsed
}

/// Parse one line. Returns `None` for ignored, disabled or unusable lines.
pub fn parse_line(
    line_no: usize,
    line: &str,
    catalog: &StepCatalog,
    errors: &mut Vec<StepError>,
) -> Option<JobStep> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') || line.starts_with("//") {
        return None;
    }

    let mut segments = line.split('@');
    let name = segments.next().unwrap_or_default().trim();

    if name.ends_with('-') {
        debug!(line = line_no, workflow = name, "Skipping disabled line");
        return None;
    }

    let mut step = if name.is_empty() {
        JobStep::from_template(&StepTemplate::command(""), line_no)
    } else {
        match catalog.get(name) {
            Some(template) => JobStep::from_template(template, line_no),
            None => {
                let err = StepError::UnknownWorkflow {
                    line: line_no,
                    name: name.to_string(),
                };
                warn!("{}", err);
                errors.push(err);
                return None;
            }
        }
    };

    for segment in segments {
        match parse_op(line_no, segment) {
            Ok(Some(ParsedOp::Var(op))) => step.ops.push(op),
            Ok(Some(ParsedOp::Upload(spec))) => step.uploads.push(spec),
            Ok(None) => {}
            Err(err) => {
                warn!("{}", err);
                errors.push(err);
            }
        }
    }

    Some(step)
}

enum ParsedOp {
    Var(VarOp),
    Upload(UploadSpec),
}

fn parse_op(line: usize, segment: &str) -> Result<Option<ParsedOp>, StepError> {
    let parts: Vec<&str> = segment.split('|').map(str::trim).collect();
    let op = parts.first().copied().unwrap_or_default();
    let params = &parts[1.min(parts.len())..];

    if op.is_empty() {
        return Ok(None);
    }
    if op.ends_with('-') {
        debug!(line, op, "Skipping disabled operator");
        return Ok(None);
    }

    let malformed = |reason: &str| StepError::MalformedOperator {
        line,
        op: op.to_string(),
        reason: reason.to_string(),
    };

    let parsed = match op {
        "copy" | "add" => {
            let [src, dst] = two_params(params).ok_or_else(|| malformed("expected <source>|<dest>"))?;
            if dst.is_empty() {
                return Err(malformed("destination is empty"));
            }
            let (src, dst) = (src.to_string(), dst.to_string());
            if op == "copy" {
                ParsedOp::Var(VarOp::Copy { src, dst })
            } else {
                ParsedOp::Var(VarOp::Append { src, dst })
            }
        }
        "upload" => {
            let [source, target] =
                two_params(params).ok_or_else(|| malformed("expected <source>|input<N>"))?;
            let input = target
                .strip_prefix("input")
                .and_then(|n| n.parse::<u8>().ok())
                .filter(|n| (1..=4).contains(n))
                .ok_or_else(|| malformed("target must be input1..input4"))?;
            ParsedOp::Upload(UploadSpec {
                source: source.to_string(),
                input,
            })
        }
        "resize" | "resize_if_larger" => {
            let (width, height, aspect_correct) = parse_resize(params).map_err(|r| malformed(&r))?;
            ParsedOp::Var(VarOp::Resize {
                width,
                height,
                aspect_correct,
                only_if_larger: op == "resize_if_larger",
            })
        }
        "no_undo" => ParsedOp::Var(VarOp::NoUndo),
        "fill_mask_if_blank" => ParsedOp::Var(VarOp::FillMaskIfBlank),
        "model_prompt_reset" => ParsedOp::Var(VarOp::ModelPromptReset),
        "model_prompt_set_base_prompt" => ParsedOp::Var(VarOp::ModelPromptSetBasePrompt {
            source: one_param(params).ok_or_else(|| malformed("expected <source>"))?,
        }),
        "model_prompt_add_from_assistant" => ParsedOp::Var(VarOp::ModelPromptAddFromAssistant {
            source: one_param(params).ok_or_else(|| malformed("expected <source>"))?,
        }),
        "model_prompt_add_from_user" => ParsedOp::Var(VarOp::ModelPromptAddFromUser {
            source: one_param(params).ok_or_else(|| malformed("expected <source>"))?,
        }),
        _ => {
            return Err(StepError::UnknownOperator {
                line,
                op: op.to_string(),
            });
        }
    };

    Ok(Some(parsed))
}

fn one_param(params: &[&str]) -> Option<String> {
    params.first().map(|p| p.to_string())
}

fn two_params<'a>(params: &[&'a str]) -> Option<[&'a str; 2]> {
    match params {
        [a, b, ..] => Some([*a, *b]),
        _ => None,
    }
}

/// `x|<w>|y|<h>|aspect_correct|<0|1>`, keys in any order.
fn parse_resize(params: &[&str]) -> Result<(u32, u32, bool), String> {
    let mut width = None;
    let mut height = None;
    let mut aspect_correct = false;

    for pair in params.chunks(2) {
        let [key, value] = pair else {
            return Err(format!("dangling parameter '{}'", pair[0]));
        };
        match *key {
            "x" => width = Some(parse_dimension(value)?),
            "y" => height = Some(parse_dimension(value)?),
            "aspect_correct" => {
                aspect_correct = match *value {
                    "1" | "true" => true,
                    "0" | "false" => false,
                    other => return Err(format!("aspect_correct must be 0 or 1, got '{other}'")),
                }
            }
            other => return Err(format!("unknown resize key '{other}'")),
        }
    }

    match (width, height) {
        (Some(w), Some(h)) => Ok((w, h, aspect_correct)),
        _ => Err("both x and y are required".to_string()),
    }
}

fn parse_dimension(value: &str) -> Result<u32, String> {
    let size = value
        .parse::<u32>()
        .ok()
        .filter(|v| *v > 0)
        .ok_or_else(|| format!("'{value}' is not a positive size"))?;
    if size > MAX_DIMENSION {
        return Err(format!("{size} exceeds the {MAX_DIMENSION}px limit"));
    }
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::SizeClass;
    use crate::steps::step::{Requirement, StepKind};

    fn catalog() -> StepCatalog {
        StepCatalog::new()
            .with(StepTemplate::workflow("wf_a", "wf_a.json"))
            .with(StepTemplate::workflow("wf_b", "wf_b.json"))
            .with(StepTemplate::model_call("llm", SizeClass::Large))
    }

    #[test]
    fn parses_workflow_with_copy() {
        let parsed = parse_script("wf_a@copy|prompt|negative_prompt\nwf_b", &catalog());
        assert!(parsed.errors.is_empty());
        assert_eq!(parsed.steps.len(), 2);

        let first = &parsed.steps[0];
        assert_eq!(first.workflow, "wf_a");
        assert_eq!(first.kind, StepKind::RunWorkflow);
        assert_eq!(first.requirement, Requirement::FromWorkItem);
        assert_eq!(first.template.as_deref(), Some("wf_a.json"));
        assert_eq!(
            first.ops,
            vec![VarOp::Copy {
                src: "prompt".into(),
                dst: "negative_prompt".into()
            }]
        );
        assert_eq!(parsed.steps[1].line, 2);
    }

    #[test]
    fn disabled_line_and_operator() {
        let parsed = parse_script("wf_a-@copy|a|b\nwf_b@copy-|a|b@add|x|prompt", &catalog());
        assert_eq!(parsed.steps.len(), 1);
        assert_eq!(
            parsed.steps[0].ops,
            vec![VarOp::Append {
                src: "x".into(),
                dst: "prompt".into()
            }]
        );
    }

    #[test]
    fn comments_and_blank_lines_are_ignored() {
        let parsed = parse_script("# header\n\n   \n// note\nwf_a", &catalog());
        assert_eq!(parsed.steps.len(), 1);
        assert!(parsed.errors.is_empty());
    }

    #[test]
    fn empty_workflow_name_is_command() {
        let parsed = parse_script("@copy|cat|prompt", &catalog());
        assert_eq!(parsed.steps[0].kind, StepKind::Command);
        assert_eq!(parsed.steps[0].requirement, Requirement::None);
    }

    #[test]
    fn unknown_workflow_skips_line_only() {
        let parsed = parse_script("nope@copy|a|b\nwf_b", &catalog());
        assert_eq!(parsed.steps.len(), 1);
        assert_eq!(parsed.steps[0].workflow, "wf_b");
        assert_eq!(
            parsed.errors,
            vec![StepError::UnknownWorkflow {
                line: 1,
                name: "nope".into()
            }]
        );
    }

    #[test]
    fn malformed_and_unknown_operators_are_skipped() {
        let parsed = parse_script("wf_a@copy|only_one@frobnicate|1@no_undo", &catalog());
        assert_eq!(parsed.steps.len(), 1);
        assert_eq!(parsed.steps[0].ops, vec![VarOp::NoUndo]);
        assert_eq!(parsed.errors.len(), 2);
        assert!(matches!(parsed.errors[0], StepError::MalformedOperator { .. }));
        assert!(matches!(parsed.errors[1], StepError::UnknownOperator { .. }));
    }

    #[test]
    fn uploads_keep_declaration_order() {
        let parsed = parse_script("wf_a@upload|image|input2@upload|mask|input1", &catalog());
        let uploads = &parsed.steps[0].uploads;
        assert_eq!(uploads.len(), 2);
        assert_eq!(uploads[0].source, "image");
        assert_eq!(uploads[0].input, 2);
        assert_eq!(uploads[1].input, 1);
        assert!(parsed.steps[0].ops.is_empty());
    }

    #[test]
    fn upload_target_must_be_an_input() {
        let parsed = parse_script("wf_a@upload|image|input9", &catalog());
        assert!(parsed.steps[0].uploads.is_empty());
        assert_eq!(parsed.errors.len(), 1);
    }

    #[test]
    fn resize_variants() {
        let parsed = parse_script(
            "wf_a@resize|x|512|y|768|aspect_correct|1@resize_if_larger|x|1024|y|1024|aspect_correct|0",
            &catalog(),
        );
        assert_eq!(
            parsed.steps[0].ops,
            vec![
                VarOp::Resize {
                    width: 512,
                    height: 768,
                    aspect_correct: true,
                    only_if_larger: false
                },
                VarOp::Resize {
                    width: 1024,
                    height: 1024,
                    aspect_correct: false,
                    only_if_larger: true
                },
            ]
        );
    }

    #[test]
    fn resize_rejects_bad_sizes() {
        let parsed = parse_script("wf_a@resize|x|0|y|10@resize|x|10", &catalog());
        assert!(parsed.steps[0].ops.is_empty());
        assert_eq!(parsed.errors.len(), 2);
    }

    #[test]
    fn resize_rejects_oversized_dimensions() {
        let script = format!(
            "wf_a@resize|x|100000|y|100000@resize|x|{max}|y|{max}",
            max = MAX_DIMENSION
        );
        let parsed = parse_script(&script, &catalog());
        assert_eq!(parsed.steps.len(), 1);
        assert_eq!(
            parsed.steps[0].ops,
            vec![VarOp::Resize {
                width: MAX_DIMENSION,
                height: MAX_DIMENSION,
                aspect_correct: false,
                only_if_larger: false,
            }]
        );
        assert_eq!(parsed.errors.len(), 1);
        assert!(matches!(
            &parsed.errors[0],
            StepError::MalformedOperator { op, reason, .. } if op == "resize" && reason.contains("limit")
        ));
    }

    #[test]
    fn model_prompt_operators() {
        let parsed = parse_script(
            "llm@model_prompt_reset@model_prompt_set_base_prompt|system_text@model_prompt_add_from_user|prompt@model_prompt_add_from_assistant|model_reply",
            &catalog(),
        );
        let step = &parsed.steps[0];
        assert_eq!(step.kind, StepKind::CallModel);
        assert_eq!(step.requirement, Requirement::ModelInstance(SizeClass::Large));
        assert_eq!(step.ops.len(), 4);
        assert_eq!(step.ops[0], VarOp::ModelPromptReset);
        assert_eq!(
            step.ops[2],
            VarOp::ModelPromptAddFromUser {
                source: "prompt".into()
            }
        );
    }

    #[test]
    fn parse_lines_numbers_from_one() {
        let parsed = parse_lines(&["wf_a", "", "wf_b"], &catalog());
        assert_eq!(parsed.steps[1].line, 3);
    }
}
