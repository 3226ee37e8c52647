// src/script.rs
//! Script data model plus the strict-then-lenient parser for model output.
//!
//! Text models wrap JSON in prose, leave trailing commas, and emit raw
//! newlines inside string values. Parsing first attempts a strict
//! `serde_json` parse, then applies a fixed sequence of normalization
//! passes, re-parsing after each one. Every pass is a named function so it
//! can be tested on its own.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

pub const MIN_SEGMENTS: usize = 3;
pub const MAX_SEGMENTS: usize = 6;

/// One beat of the plan-séquence, played between two keyframes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Segment {
    pub script: String,
}

/// The generated shooting script for a project.
///
/// `keyframes[i]` and `keyframes[i + 1]` bound `segments[i]`, so a valid
/// script always has exactly one more keyframe than segments.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Script {
    pub main_character_description: String,
    pub keyframes: Vec<String>,
    pub segments: Vec<Segment>,
}

impl Script {
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Shape checks on a freshly parsed script. A failing script is never
    /// persisted; the caller surfaces a "re-run step 2" error instead.
    pub fn validate(&self) -> Result<()> {
        if self.main_character_description.trim().is_empty() {
            return Err(AppError::Validation(
                "generated script is missing mainCharacterDescription; re-run step 2".to_string(),
            ));
        }
        if self.segments.len() < MIN_SEGMENTS || self.segments.len() > MAX_SEGMENTS {
            return Err(AppError::Validation(format!(
                "generated script has {} segments, expected between {} and {}; re-run step 2",
                self.segments.len(),
                MIN_SEGMENTS,
                MAX_SEGMENTS
            )));
        }
        if self.keyframes.len() != self.segments.len() + 1 {
            return Err(AppError::Validation(format!(
                "generated script has {} keyframes for {} segments, expected {}; re-run step 2",
                self.keyframes.len(),
                self.segments.len(),
                self.segments.len() + 1
            )));
        }
        Ok(())
    }
}

/// Substring between the first `{` and the last `}`, tolerating prose or
/// markdown fences around the JSON object.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&text[start..=end])
}

/// Remove commas that directly precede a closing bracket or brace.
pub fn strip_trailing_commas(text: &str) -> String {
    // Unwrap is fine: the pattern is a compile-time constant.
    let re = Regex::new(r",\s*([}\]])").unwrap();
    re.replace_all(text, "$1").into_owned()
}

/// Escape raw control characters that appear inside quoted string values.
/// Characters outside strings are left alone so structural whitespace
/// (newlines between fields) survives.
pub fn escape_control_chars_in_strings(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;
    for c in text.chars() {
        if escaped {
            out.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => {
                out.push(c);
                escaped = true;
            }
            '"' => {
                out.push(c);
                in_string = !in_string;
            }
            '\n' if in_string => out.push_str("\\n"),
            '\r' if in_string => out.push_str("\\r"),
            '\t' if in_string => out.push_str("\\t"),
            c if in_string && c.is_control() => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out
}

/// Last-resort pass: drop every control character.
pub fn strip_control_chars(text: &str) -> String {
    text.chars().filter(|c| !c.is_control()).collect()
}

/// Parse a text-generation response into a validated [`Script`].
///
/// Strict parse first, then bracket extraction, trailing-comma removal,
/// in-string control-character escaping, and finally control-character
/// stripping, re-parsing after each pass.
pub fn parse_script_response(response: &str) -> Result<Script> {
    if let Ok(script) = serde_json::from_str::<Script>(response) {
        script.validate()?;
        return Ok(script);
    }

    let extracted = extract_json_object(response).ok_or_else(|| {
        AppError::Validation(
            "text generation response contains no JSON object; re-run step 2".to_string(),
        )
    })?;

    let mut candidate = strip_trailing_commas(extracted);
    if let Ok(script) = serde_json::from_str::<Script>(&candidate) {
        script.validate()?;
        return Ok(script);
    }

    candidate = escape_control_chars_in_strings(&candidate);
    if let Ok(script) = serde_json::from_str::<Script>(&candidate) {
        script.validate()?;
        return Ok(script);
    }

    candidate = strip_control_chars(&candidate);
    match serde_json::from_str::<Script>(&candidate) {
        Ok(script) => {
            script.validate()?;
            Ok(script)
        }
        Err(e) => Err(AppError::Validation(format!(
            "could not parse generated script as JSON ({}); re-run step 2",
            e
        ))),
    }
}
