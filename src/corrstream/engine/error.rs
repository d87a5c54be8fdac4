//! Error handling for the correlation engine.
//!
//! All engine operations return well-structured errors with enough context to
//! tell a configuration mistake apart from a runtime evaluation failure:
//!
//! - **Configuration errors**: invalid processor options, detected at build
//!   time; the processor refuses to start.
//! - **Template errors**: malformed template syntax, also a build-time
//!   failure (rendering itself is total and cannot fail at runtime).
//! - **Evaluation errors**: predicate failures while processing a record;
//!   recovered locally by the processor, which treats the predicate as false
//!   for that record and keeps going.
//! - **Invariant violations**: double removal, duplicate keys, a clock moving
//!   backwards. Programming errors, surfaced as typed failures where a return
//!   path exists and handled as defensive no-ops elsewhere.

use std::fmt;

/// Result alias used throughout the correlation engine.
pub type CorrelationResult<T> = Result<T, CorrelationError>;

/// Errors produced by the correlation engine.
///
/// Each variant carries the context relevant to its failure class; see the
/// module docs for how the processor reacts to each class.
#[derive(Debug, Clone, PartialEq)]
pub enum CorrelationError {
    /// Invalid processor configuration, rejected at build time.
    ConfigurationError {
        /// Human-readable description of the problem
        message: String,
        /// Name of the offending option, if one can be singled out
        option: Option<String>,
    },

    /// Malformed template syntax, rejected at parse time.
    TemplateError {
        /// Description of the syntax problem
        message: String,
        /// The template text that failed to parse
        template: String,
    },

    /// A predicate could not be evaluated against a record slice.
    EvaluationError {
        /// Description of the evaluation failure
        message: String,
        /// The expression being evaluated, if available
        expression: Option<String>,
    },

    /// An internal invariant was broken by the caller or by a bug.
    InvariantViolation {
        /// Description of the violated invariant
        message: String,
    },
}

impl fmt::Display for CorrelationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CorrelationError::ConfigurationError { message, option } => {
                if let Some(opt) = option {
                    write!(f, "Configuration error for option '{}': {}", opt, message)
                } else {
                    write!(f, "Configuration error: {}", message)
                }
            }
            CorrelationError::TemplateError { message, template } => {
                write!(f, "Template error in '{}': {}", template, message)
            }
            CorrelationError::EvaluationError {
                message,
                expression,
            } => {
                if let Some(expr) = expression {
                    write!(f, "Evaluation error in '{}': {}", expr, message)
                } else {
                    write!(f, "Evaluation error: {}", message)
                }
            }
            CorrelationError::InvariantViolation { message } => {
                write!(f, "Invariant violation: {}", message)
            }
        }
    }
}

impl std::error::Error for CorrelationError {}

impl CorrelationError {
    /// Create a configuration error tied to a named option.
    pub fn configuration(message: impl Into<String>, option: Option<&str>) -> Self {
        CorrelationError::ConfigurationError {
            message: message.into(),
            option: option.map(|o| o.to_string()),
        }
    }

    /// Create a template syntax error.
    pub fn template(message: impl Into<String>, template: impl Into<String>) -> Self {
        CorrelationError::TemplateError {
            message: message.into(),
            template: template.into(),
        }
    }

    /// Create an evaluation error for a predicate expression.
    pub fn evaluation(message: impl Into<String>, expression: Option<String>) -> Self {
        CorrelationError::EvaluationError {
            message: message.into(),
            expression,
        }
    }

    /// Create an invariant violation error.
    pub fn invariant(message: impl Into<String>) -> Self {
        CorrelationError::InvariantViolation {
            message: message.into(),
        }
    }
}
