//! Payload placeholder substitution.
//!
//! Compiled documents carry insertion points like `<NS_PROMPT>`. Each is
//! replaced with the JSON-escaped value of the matching variable right
//! before dispatch. Unknown `<NS_*>` tokens are left untouched.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::{Captures, Regex};

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<NS_([A-Z0-9_]+)>").expect("placeholder pattern is valid"));

/// Variable bound to a placeholder name (the part after `NS_`).
fn variable_for(name: &str) -> Option<&'static str> {
    Some(match name {
        "PROMPT" => "prompt",
        "NEGATIVE_PROMPT" => "negative_prompt",
        "AUDIO_PROMPT" => "audio_prompt",
        "MODEL_REPLY" => "model_reply",
        "INPUT_1" => "input1",
        "INPUT_2" => "input2",
        "INPUT_3" => "input3",
        "INPUT_4" => "input4",
        _ => return None,
    })
}

/// Escape a value for insertion inside a JSON string literal.
pub fn escape(value: &str) -> String {
    let quoted = serde_json::Value::String(value.to_string()).to_string();
    quoted[1..quoted.len() - 1].to_string()
}

/// Replace every known placeholder in `document`.
pub fn substitute(document: &str, bindings: &HashMap<String, String>, seed: u32) -> String {
    PLACEHOLDER
        .replace_all(document, |caps: &Captures<'_>| {
            let name = &caps[1];
            if name == "SEED" {
                return seed.to_string();
            }
            match variable_for(name) {
                Some(var) => escape(bindings.get(var).map(String::as_str).unwrap_or_default()),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Placeholder tokens present in a document, in order of first appearance.
pub fn placeholders(document: &str) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();
    for caps in PLACEHOLDER.captures_iter(document) {
        let token = caps[0].to_string();
        if !found.contains(&token) {
            found.push(token);
        }
    }
    found
}
