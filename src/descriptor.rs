//! Prompt descriptor grammar
//!
//! Text prompts look like `TEXT[:WEIGHT[:STOP]]`. Image prompts use the same
//! fields but the label may be a URL, so the colon of an `http://` or
//! `https://` scheme is not treated as a field separator.

use crate::error::{PromptError, Result};
use std::fmt;

/// Weight used when the descriptor has no weight field
pub const DEFAULT_WEIGHT: f32 = 1.0;

/// Stop used when the descriptor has no stop field (no floor)
pub const DEFAULT_STOP: f32 = f32::NEG_INFINITY;

/// Descriptors carry at most this many colon-separated fields
const MAX_FIELDS: usize = 3;

/// How a descriptor string is cut into fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitRule {
    /// Every colon separates (up to the field limit)
    Text,
    /// Colons belonging to a URL scheme (`http://`, `https://`) are kept
    UrlSafe,
}

/// A parsed prompt descriptor
#[derive(Debug, Clone, PartialEq)]
pub struct PromptSpec {
    /// The descriptor exactly as given
    pub descriptor: String,
    /// Trimmed text (or image label / URL) field
    pub text: String,
    /// Overall strength; negative weights push away from the target
    pub weight: f32,
    /// Floor applied to the signed distance
    pub stop: f32,
}

impl PromptSpec {
    /// Parse a descriptor without validating weight/stop signs.
    pub fn parse(descriptor: &str, rule: SplitRule) -> Result<Self> {
        let fields = split_fields(descriptor, rule);

        let text = fields.first().copied().unwrap_or_default().trim();
        let weight = match fields.get(1) {
            Some(field) => parse_number(descriptor, "weight", field)?,
            None => DEFAULT_WEIGHT,
        };
        let stop = match fields.get(2) {
            Some(field) => parse_number(descriptor, "stop", field)?,
            None => DEFAULT_STOP,
        };

        tracing::debug!(descriptor, text, weight, stop, "parsed prompt descriptor");

        Ok(Self {
            descriptor: descriptor.to_string(),
            text: text.to_string(),
            weight,
            stop,
        })
    }

    /// Parse a descriptor and reject weight/stop combinations that cannot
    /// mean anything useful.
    pub fn parse_strict(descriptor: &str, rule: SplitRule) -> Result<Self> {
        let spec = Self::parse(descriptor, rule)?;
        spec.validate()?;
        Ok(spec)
    }

    /// Check that the weight is a nonzero finite number and that the stop
    /// lies in `[-1, 1]` with the same sign as the weight. The default stop
    /// (negative infinity) is always accepted.
    pub fn validate(&self) -> Result<()> {
        if !self.weight.is_finite() || self.weight == 0.0 {
            return Err(PromptError::parse(
                &self.descriptor,
                format!("weight must be a nonzero finite number, got {}", self.weight),
            ));
        }

        if self.stop == f32::NEG_INFINITY {
            return Ok(());
        }

        if !(-1.0..=1.0).contains(&self.stop) {
            return Err(PromptError::parse(
                &self.descriptor,
                format!("stop must be within [-1, 1], got {}", self.stop),
            ));
        }

        let matches = if self.weight > 0.0 {
            self.stop >= 0.0
        } else {
            self.stop < 0.0
        };
        if !matches {
            return Err(PromptError::parse(
                &self.descriptor,
                format!(
                    "stop {} must have the same sign as weight {}",
                    self.stop, self.weight
                ),
            ));
        }

        Ok(())
    }

    /// True when the stop floor can never be reached
    pub fn is_unbounded(&self) -> bool {
        self.stop == f32::NEG_INFINITY
    }
}

impl fmt::Display for PromptSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.descriptor)
    }
}

/// Cut a descriptor into at most three fields. Only the first two
/// separators split; anything after them stays in the last field.
pub fn split_fields(descriptor: &str, rule: SplitRule) -> Vec<&str> {
    match rule {
        SplitRule::Text => descriptor.splitn(MAX_FIELDS, ':').collect(),
        SplitRule::UrlSafe => {
            let mut fields = Vec::with_capacity(MAX_FIELDS);
            let mut start = 0;

            for (idx, ch) in descriptor.char_indices() {
                if fields.len() == MAX_FIELDS - 1 {
                    break;
                }
                if ch == ':' && !is_scheme_colon(descriptor, idx) {
                    fields.push(&descriptor[start..idx]);
                    start = idx + 1;
                }
            }

            fields.push(&descriptor[start..]);
            fields
        }
    }
}

/// A colon followed by `//` is part of a scheme when it is preceded by
/// `http` at the very start, or by an `s` (`https://`).
fn is_scheme_colon(descriptor: &str, idx: usize) -> bool {
    let before = &descriptor[..idx];
    let after = &descriptor[idx + 1..];
    after.starts_with("//") && (before == "http" || before.ends_with('s'))
}

fn parse_number(descriptor: &str, name: &str, field: &str) -> Result<f32> {
    let field = field.trim();
    field.parse::<f32>().map_err(|_| {
        PromptError::parse(descriptor, format!("{} {:?} is not a number", name, field))
    })
}
