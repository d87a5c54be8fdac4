// Stateful log correlation: group related records into keyed windows and
// aggregate each window into one synthetic summary record.

pub mod config;
pub mod engine;

// Re-export main API
pub use config::{load_processor, ConfigLoadError, ProcessorConfig};
pub use engine::{
    CorrelationError, CorrelationResult, CorrelationStateStore, FieldValue, GroupByConfig,
    GroupingProcessor, Record, SharedRecord,
};

// Version and feature info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const FEATURES: &[&str] = &[
    "keyed_windows",      // correlation keys with global/host/program/process scope
    "sliding_timeout",    // record-time driven expiry, replay-safe
    "trigger_conditions", // close a window early when a condition holds
    "having_filter",      // gate summary emission on the closed window
    "synthetic_records",  // empty / last-message / context inheritance
    "inject_modes",       // pass-through or aggregate-only output
    "yaml_config",        // declarative processor configuration
];
