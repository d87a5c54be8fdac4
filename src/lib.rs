//! # corrstream
//!
//! Stateful correlation over streams of log records: group related events
//! into keyed windows, close windows on a timeout or a matching trigger, and
//! emit one synthetic summary record per closed window.
//!
//! ## Features
//!
//! - **Keyed Windows**: correlation keys built from a template plus a
//!   configurable host/program/process scope
//! - **Record-Time Clock**: timers driven by record timestamps, so replaying
//!   history behaves exactly like the live stream
//! - **Early Close**: `trigger` conditions end a window before its timeout,
//!   `having` conditions gate what actually gets emitted
//! - **Synthetic Summaries**: summary records inherit nothing, the last
//!   member, or the whole window, then apply template-rendered values
//! - **Declarative Config**: processors described in YAML or JSON
//!
//! ## Quick Start
//!
//! ```rust
//! use corrstream::{
//!     FieldValue, FilterExpr, GroupByConfig, GroupingProcessor, InheritMode, Record,
//!     SyntheticMessageSpec, Template,
//! };
//! use std::collections::HashMap;
//! use std::sync::Arc;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let summary = SyntheticMessageSpec::new()
//!         .with_inherit_mode(InheritMode::Empty)
//!         .add_value("count", Template::parse("${_context_length}")?);
//!     let mut processor = GroupingProcessor::new(GroupByConfig::new("${host}", 60), summary)?
//!         .with_trigger(Arc::new(FilterExpr::CountAtLeast(2)));
//!
//!     let mut fields = HashMap::new();
//!     fields.insert("host".to_string(), FieldValue::String("web1".into()));
//!     let record = Record::with_timestamp(fields, 1_000);
//!
//!     processor.process(record.clone())?;
//!     let outcome = processor.process(record)?;
//!     for summary in outcome.synthetic {
//!         println!("{}", summary.as_record().to_json());
//!     }
//!     Ok(())
//! }
//! ```

pub mod corrstream;

// Re-export main API at crate root for easy access
pub use corrstream::config::{
    load_processor,
    AggregateSpec,
    ConfigLoadError,
    PredicateSpec,
    ProcessorConfig,
};
pub use corrstream::engine::{
    CompareOp,
    ContextId,
    // Window state
    CorrelationContext,
    // Errors
    CorrelationError,
    CorrelationKey,
    CorrelationResult,
    CorrelationStateStore,
    EntryHandle,
    // Core types
    FieldValue,
    // Conditions
    FilterExpr,
    GroupByConfig,
    // Processor
    GroupingProcessor,
    InheritMode,
    InjectMode,
    KeyScope,
    Predicate,
    ProcessOutcome,
    Record,
    SharedRecord,
    ShutdownPolicy,
    StateTx,
    StoreStats,
    // Summaries
    SyntheticMessageSpec,
    Template,
    // Scheduling
    TimerWheel,
};
