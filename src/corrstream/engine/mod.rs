// Correlation engine internals: record model, timer wheel, window store and
// the grouping processor that drives them.

pub mod context;
pub mod error;
pub mod grouping;
pub mod predicate;
pub mod state;
pub mod synthetic;
pub mod template;
pub mod timer_wheel;
pub mod types;

// Re-export main API
pub use context::{CorrelationContext, CorrelationKey, KeyScope};
pub use error::{CorrelationError, CorrelationResult};
pub use grouping::{
    GroupByConfig, GroupingProcessor, InjectMode, ProcessOutcome, ShutdownPolicy,
};
pub use predicate::{CompareOp, FilterExpr, Predicate};
pub use state::{ContextId, CorrelationStateStore, StateTx, StoreStats};
pub use synthetic::{InheritMode, SyntheticMessageSpec};
pub use template::Template;
pub use timer_wheel::{EntryHandle, TimerWheel};
pub use types::{FieldValue, Record, SharedRecord};
