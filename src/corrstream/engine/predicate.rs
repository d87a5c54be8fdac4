//! Predicate evaluation over records and accumulated windows.
//!
//! The grouping processor does not interpret conditions itself; it is handed
//! a [`Predicate`] capability and calls it at three points: the `where` guard
//! (one raw record), and the `trigger` / `having` conditions (the full member
//! slice of a window). [`FilterExpr`] is the expression tree shipped with the
//! crate: field comparisons, regex matches, tag checks, member-count
//! thresholds, and boolean combinators.
//!
//! Expression trees are immutable after construction; sharing one between
//! cloned processors through an `Arc` has value semantics.

use super::error::{CorrelationError, CorrelationResult};
use super::types::{FieldValue, Record, SharedRecord};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A condition the grouping processor can evaluate.
///
/// `evaluate_record` sees exactly one raw record (the `where` guard);
/// `evaluate_context` sees the ordered member slice of a window (`trigger`
/// and `having`). Implementations must be pure: no side effects, no
/// dependence on anything but the inputs.
pub trait Predicate: Send + Sync + fmt::Debug {
    /// Evaluate against one record that is not (yet) part of any window.
    fn evaluate_record(&self, record: &Record) -> CorrelationResult<bool>;

    /// Evaluate against the accumulated members of a window, oldest first.
    fn evaluate_context(&self, members: &[SharedRecord]) -> CorrelationResult<bool>;
}

/// Comparison operators for [`FilterExpr::Compare`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        };
        write!(f, "{}", symbol)
    }
}

impl CompareOp {
    fn holds(self, ordering: Ordering) -> bool {
        match self {
            CompareOp::Eq => ordering == Ordering::Equal,
            CompareOp::Ne => ordering != Ordering::Equal,
            CompareOp::Lt => ordering == Ordering::Less,
            CompareOp::Le => ordering != Ordering::Greater,
            CompareOp::Gt => ordering == Ordering::Greater,
            CompareOp::Ge => ordering != Ordering::Less,
        }
    }
}

/// The expression tree shipped with the crate.
///
/// Field references resolve against the newest record in scope: for the
/// `where` guard that is the record itself, for `trigger`/`having` it is the
/// most recently appended member. A reference to a missing field makes the
/// node evaluate to false rather than erroring, matching how unset values
/// behave in templates.
#[derive(Debug, Clone)]
pub enum FilterExpr {
    /// Compare a field against a literal value.
    Compare {
        field: String,
        op: CompareOp,
        value: FieldValue,
    },
    /// Match a field's rendered text against a regular expression.
    Matches { field: String, pattern: Regex },
    /// True when the newest record carries the tag.
    HasTag(String),
    /// True when the window holds at least `n` members (a lone record counts
    /// as one).
    CountAtLeast(usize),
    /// All sub-expressions true. Empty is true.
    And(Vec<FilterExpr>),
    /// Any sub-expression true. Empty is false.
    Or(Vec<FilterExpr>),
    /// Negation.
    Not(Box<FilterExpr>),
}

impl FilterExpr {
    /// Build a regex-match expression, validating the pattern up front.
    pub fn matches(field: impl Into<String>, pattern: &str) -> CorrelationResult<FilterExpr> {
        let compiled = Regex::new(pattern).map_err(|e| {
            CorrelationError::configuration(
                format!("invalid regex '{}': {}", pattern, e),
                Some("matches"),
            )
        })?;
        Ok(FilterExpr::Matches {
            field: field.into(),
            pattern: compiled,
        })
    }

    /// Build a field comparison.
    pub fn compare(field: impl Into<String>, op: CompareOp, value: FieldValue) -> FilterExpr {
        FilterExpr::Compare {
            field: field.into(),
            op,
            value,
        }
    }

    fn eval(&self, newest: &Record, count: usize) -> CorrelationResult<bool> {
        match self {
            FilterExpr::Compare { field, op, value } => {
                let Some(actual) = newest.get_field(field) else {
                    return Ok(false);
                };
                let ordering = compare_values(actual, value).ok_or_else(|| {
                    CorrelationError::evaluation(
                        format!(
                            "cannot compare {} to {}",
                            actual.type_name(),
                            value.type_name()
                        ),
                        Some(format!("{} {} {}", field, op, value)),
                    )
                })?;
                Ok(op.holds(ordering))
            }
            FilterExpr::Matches { field, pattern } => match newest.get_field(field) {
                Some(value) => Ok(pattern.is_match(&value.render())),
                None => Ok(false),
            },
            FilterExpr::HasTag(tag) => Ok(newest.has_tag(tag)),
            FilterExpr::CountAtLeast(n) => Ok(count >= *n),
            FilterExpr::And(exprs) => {
                for expr in exprs {
                    if !expr.eval(newest, count)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            FilterExpr::Or(exprs) => {
                for expr in exprs {
                    if expr.eval(newest, count)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            FilterExpr::Not(expr) => Ok(!expr.eval(newest, count)?),
        }
    }
}

impl Predicate for FilterExpr {
    fn evaluate_record(&self, record: &Record) -> CorrelationResult<bool> {
        self.eval(record, 1)
    }

    fn evaluate_context(&self, members: &[SharedRecord]) -> CorrelationResult<bool> {
        match members.last() {
            Some(newest) => self.eval(newest.as_record(), members.len()),
            None => Err(CorrelationError::evaluation(
                "cannot evaluate against an empty window",
                None,
            )),
        }
    }
}

/// Ordering between two field values, with Integer/Float cross-coercion.
/// `None` means the types are incomparable.
fn compare_values(left: &FieldValue, right: &FieldValue) -> Option<Ordering> {
    match (left, right) {
        (FieldValue::Integer(a), FieldValue::Integer(b)) => Some(a.cmp(b)),
        (FieldValue::Float(a), FieldValue::Float(b)) => a.partial_cmp(b),
        (FieldValue::Integer(a), FieldValue::Float(b)) => (*a as f64).partial_cmp(b),
        (FieldValue::Float(a), FieldValue::Integer(b)) => a.partial_cmp(&(*b as f64)),
        (FieldValue::String(a), FieldValue::String(b)) => Some(a.cmp(b)),
        (FieldValue::Boolean(a), FieldValue::Boolean(b)) => Some(a.cmp(b)),
        (FieldValue::Timestamp(a), FieldValue::Timestamp(b)) => Some(a.cmp(b)),
        (FieldValue::Null, FieldValue::Null) => Some(Ordering::Equal),
        _ => None,
    }
}
