//! Field-substitution templates.
//!
//! Templates drive three things in the grouping pipeline: rendering the
//! correlation key from a record, rendering the sort key when a window is
//! closed, and filling in synthetic message values. The syntax is literal
//! text with `${field}` references; `$$` escapes a literal dollar sign.
//!
//! Syntax errors are configuration errors caught at parse time. Rendering is
//! total: a reference to a missing field produces empty text.

use super::error::{CorrelationError, CorrelationResult};
use super::types::{Record, SharedRecord};
use std::fmt;

/// Pseudo-field exposing the member count when rendering against a window.
pub const FIELD_CONTEXT_LENGTH: &str = "_context_length";

#[derive(Debug, Clone, PartialEq)]
enum Part {
    Literal(String),
    Field(String),
}

/// A parsed `${field}` substitution template.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    source: String,
    parts: Vec<Part>,
}

impl Template {
    /// Parse template text.
    ///
    /// Returns a [`CorrelationError::TemplateError`] for an unterminated or
    /// empty `${}` reference, or for a stray `$` that is neither `${` nor
    /// `$$`.
    pub fn parse(text: &str) -> CorrelationResult<Template> {
        let mut parts = Vec::new();
        let mut literal = String::new();
        let mut chars = text.chars().peekable();

        while let Some(ch) = chars.next() {
            if ch != '$' {
                literal.push(ch);
                continue;
            }
            match chars.peek() {
                Some('$') => {
                    chars.next();
                    literal.push('$');
                }
                Some('{') => {
                    chars.next();
                    let mut name = String::new();
                    let mut closed = false;
                    for ch in chars.by_ref() {
                        if ch == '}' {
                            closed = true;
                            break;
                        }
                        name.push(ch);
                    }
                    if !closed {
                        return Err(CorrelationError::template("unterminated '${'", text));
                    }
                    if name.is_empty() {
                        return Err(CorrelationError::template("empty field reference", text));
                    }
                    if !literal.is_empty() {
                        parts.push(Part::Literal(std::mem::take(&mut literal)));
                    }
                    parts.push(Part::Field(name));
                }
                _ => {
                    return Err(CorrelationError::template(
                        "stray '$' (use '$$' for a literal dollar sign)",
                        text,
                    ));
                }
            }
        }
        if !literal.is_empty() {
            parts.push(Part::Literal(literal));
        }

        Ok(Template {
            source: text.to_string(),
            parts,
        })
    }

    /// The original template text.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// True when the template contains no field references.
    pub fn is_literal(&self) -> bool {
        self.parts.iter().all(|p| matches!(p, Part::Literal(_)))
    }

    /// Render against a single record. Missing fields render empty.
    pub fn render_record(&self, record: &Record) -> String {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                Part::Literal(text) => out.push_str(text),
                Part::Field(name) => {
                    if let Some(value) = record.get_field(name) {
                        out.push_str(&value.render());
                    }
                }
            }
        }
        out
    }

    /// Render against an accumulated window.
    ///
    /// Field references resolve on the newest member, which already carries
    /// the cached `_context_id`; [`FIELD_CONTEXT_LENGTH`] resolves to the
    /// member count. An empty member slice renders field references empty.
    pub fn render_context(&self, members: &[SharedRecord]) -> String {
        let newest = members.last();
        let mut out = String::new();
        for part in &self.parts {
            match part {
                Part::Literal(text) => out.push_str(text),
                Part::Field(name) if name == FIELD_CONTEXT_LENGTH => {
                    out.push_str(&members.len().to_string());
                }
                Part::Field(name) => {
                    if let Some(value) = newest.and_then(|r| r.as_record().get_field(name)) {
                        out.push_str(&value.render());
                    }
                }
            }
        }
        out
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source)
    }
}
