//! The grouping processor: correlates records into keyed windows and emits
//! one synthetic summary per closed window.
//!
//! Every incoming record drives the logical clock forward before anything
//! else happens, so windows whose timeout passed "during the gap" close and
//! emit before the record itself is considered. The record is then filtered
//! by the optional `where` guard, correlated into the window for its key
//! (opening one when necessary), and finally the optional `trigger`
//! condition may close the window early. Closing a window always runs the
//! same path: optional member sort, the `having` gate, then synthetic record
//! generation.
//!
//! Processors are single-owner; cloned pipelines get their own window state
//! through [`GroupingProcessor::clone_instance`].

use super::context::{CorrelationContext, CorrelationKey, KeyScope};
use super::error::{CorrelationError, CorrelationResult};
use super::predicate::Predicate;
use super::state::{CorrelationStateStore, StoreStats};
use super::synthetic::SyntheticMessageSpec;
use super::template::Template;
use super::types::{FieldValue, Record, SharedRecord};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// What happens to the original input records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InjectMode {
    /// Originals are forwarded alongside the synthetic summaries.
    #[default]
    PassThrough,
    /// Only synthetic summaries leave the processor.
    AggregateOnly,
}

/// What happens to still-open windows when the processor shuts down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ShutdownPolicy {
    /// Drop open windows without emitting summaries.
    #[default]
    Discard,
    /// Close every open window and emit its summary.
    Aggregate,
}

/// Static configuration of a grouping processor.
#[derive(Debug, Clone)]
pub struct GroupByConfig {
    /// Template whose rendered value identifies the window a record joins.
    pub key_template: String,
    /// Optional per-record template used to sort members before aggregation.
    pub sort_key_template: Option<String>,
    /// Sliding timeout in seconds; each appended record pushes expiry out to
    /// `current + timeout`.
    pub timeout_secs: u64,
    pub scope: KeyScope,
    pub inject_mode: InjectMode,
    pub shutdown_policy: ShutdownPolicy,
}

impl GroupByConfig {
    pub fn new(key_template: impl Into<String>, timeout_secs: u64) -> GroupByConfig {
        GroupByConfig {
            key_template: key_template.into(),
            sort_key_template: None,
            timeout_secs,
            scope: KeyScope::default(),
            inject_mode: InjectMode::default(),
            shutdown_policy: ShutdownPolicy::default(),
        }
    }
}

/// Records leaving one [`GroupingProcessor::process`] call.
///
/// Summaries of windows that closed during the call come first; the original
/// record, when the inject mode forwards it, always trails them.
#[derive(Debug, Default)]
pub struct ProcessOutcome {
    pub synthetic: Vec<SharedRecord>,
    pub original: Option<SharedRecord>,
}

impl ProcessOutcome {
    pub fn is_empty(&self) -> bool {
        self.synthetic.is_empty() && self.original.is_none()
    }

    /// All outgoing records in emission order.
    pub fn into_records(self) -> Vec<SharedRecord> {
        let mut records = self.synthetic;
        records.extend(self.original);
        records
    }
}

/// Closes windows: sorts members, applies `having`, renders the summary.
///
/// Split out of the processor so window expiry callbacks can run while the
/// store transaction is borrowed elsewhere.
#[derive(Debug, Clone)]
struct Aggregator {
    sort_key: Option<Template>,
    having: Option<Arc<dyn Predicate>>,
    synthetic: SyntheticMessageSpec,
}

impl Aggregator {
    /// Turn a closed window into its summary record. `None` when `having`
    /// rejects the window (or fails to evaluate).
    fn aggregate(&self, mut context: CorrelationContext, close_tick: i64) -> Option<SharedRecord> {
        if let Some(sort_key) = &self.sort_key {
            context.sort_by_template(sort_key);
        }
        if let Some(having) = &self.having {
            match having.evaluate_context(context.records()) {
                Ok(true) => {}
                Ok(false) => {
                    debug!(
                        "dropping window, having() evaluated to false; {}",
                        context.key()
                    );
                    return None;
                }
                Err(e) => {
                    warn!(
                        "having() evaluation failed, dropping window; {}: {}",
                        context.key(),
                        e
                    );
                    return None;
                }
            }
        }
        let summary = self.synthetic.generate(context.records(), close_tick);
        Some(SharedRecord::new(summary))
    }
}

/// Stateful correlation processor over a stream of records.
#[derive(Debug)]
pub struct GroupingProcessor {
    config: GroupByConfig,
    key_template: Template,
    where_condition: Option<Arc<dyn Predicate>>,
    trigger_condition: Option<Arc<dyn Predicate>>,
    aggregator: Aggregator,
    store: CorrelationStateStore,
    clone_id: usize,
}

impl GroupingProcessor {
    /// Build a processor from its configuration and the summary recipe.
    pub fn new(
        config: GroupByConfig,
        synthetic: SyntheticMessageSpec,
    ) -> CorrelationResult<GroupingProcessor> {
        if config.key_template.trim().is_empty() {
            return Err(CorrelationError::configuration(
                "the key() option is mandatory for grouping",
                Some("key"),
            ));
        }
        if config.timeout_secs == 0 {
            return Err(CorrelationError::configuration(
                "the timeout() option must be at least 1 second",
                Some("timeout"),
            ));
        }
        let key_template = Template::parse(&config.key_template)?;
        let sort_key = match &config.sort_key_template {
            Some(text) => Some(Template::parse(text)?),
            None => None,
        };
        let store = CorrelationStateStore::new(config.timeout_secs);
        Ok(GroupingProcessor {
            config,
            key_template,
            where_condition: None,
            trigger_condition: None,
            aggregator: Aggregator {
                sort_key,
                having: None,
                synthetic,
            },
            store,
            clone_id: 0,
        })
    }

    /// Only records matching this condition are correlated; the rest flow
    /// through untouched.
    pub fn with_where(mut self, condition: Arc<dyn Predicate>) -> GroupingProcessor {
        self.where_condition = Some(condition);
        self
    }

    /// Close the window as soon as this condition holds over its members.
    pub fn with_trigger(mut self, condition: Arc<dyn Predicate>) -> GroupingProcessor {
        self.trigger_condition = Some(condition);
        self
    }

    /// Gate summary emission on this condition over the closed window.
    pub fn with_having(mut self, condition: Arc<dyn Predicate>) -> GroupingProcessor {
        self.aggregator.having = Some(condition);
        self
    }

    /// Identity of this processor instance, unique per clone.
    pub fn instance_name(&self) -> String {
        format!(
            "grouping-by({},scope={},clone={})",
            self.config.key_template, self.config.scope, self.clone_id
        )
    }

    pub fn config(&self) -> &GroupByConfig {
        &self.config
    }

    /// Feed one record through the processor.
    pub fn process(&mut self, mut record: Record) -> CorrelationResult<ProcessOutcome> {
        let tick = record.tick();
        let aggregator = &self.aggregator;
        let mut synthetic: Vec<SharedRecord> = Vec::new();
        let mut tx = self.store.begin();

        let expired = tx.set_time(tick, |fire_tick, context| {
            if let Some(summary) = aggregator.aggregate(context, fire_tick) {
                synthetic.push(summary);
            }
        })?;
        if expired > 0 {
            debug!("{} window(s) timed out advancing clock to {}", expired, tick);
        }

        let correlate = match &self.where_condition {
            Some(condition) => match condition.evaluate_record(&record) {
                Ok(matched) => matched,
                Err(e) => {
                    warn!("where() evaluation failed, not correlating record: {}", e);
                    false
                }
            },
            None => true,
        };

        let shared = if correlate {
            let session_id = self.key_template.render_record(&record);
            let key = CorrelationKey::new(self.config.scope, &record, session_id.clone());
            record.set_field(Record::FIELD_CONTEXT_ID, FieldValue::String(session_id));
            let shared = SharedRecord::new(record);

            let id = match tx.lookup(&key) {
                Some(id) => {
                    debug!("record joins open window; {}", key);
                    tx.append(id, shared.clone())?;
                    tx.update(id)?;
                    id
                }
                None => {
                    debug!(
                        "no open window, starting one; {}, timeout={}",
                        key, self.config.timeout_secs
                    );
                    tx.store(CorrelationContext::new(key, shared.clone()))?
                }
            };

            if let Some(trigger) = &self.trigger_condition {
                let fire = match tx.context(id) {
                    Some(context) => match trigger.evaluate_context(context.records()) {
                        Ok(fire) => fire,
                        Err(e) => {
                            warn!("trigger() evaluation failed, leaving window open: {}", e);
                            false
                        }
                    },
                    None => false,
                };
                if fire {
                    if let Some(context) = tx.remove(id) {
                        debug!("trigger() matched, closing window; {}", context.key());
                        if let Some(summary) = aggregator.aggregate(context, tx.current_tick()) {
                            synthetic.push(summary);
                        }
                    }
                }
            }
            shared
        } else {
            SharedRecord::new(record)
        };
        drop(tx);

        let original = match self.config.inject_mode {
            InjectMode::PassThrough => Some(shared),
            InjectMode::AggregateOnly => None,
        };
        Ok(ProcessOutcome {
            synthetic,
            original,
        })
    }

    /// Advance the logical clock without a record, e.g. from a periodic
    /// keep-alive, emitting summaries for every window that times out.
    pub fn advance_time(&mut self, tick: i64) -> CorrelationResult<Vec<SharedRecord>> {
        let aggregator = &self.aggregator;
        let mut synthetic = Vec::new();
        let mut tx = self.store.begin();
        tx.set_time(tick, |fire_tick, context| {
            if let Some(summary) = aggregator.aggregate(context, fire_tick) {
                synthetic.push(summary);
            }
        })?;
        Ok(synthetic)
    }

    /// Close every open window at the current clock and emit its summary,
    /// regardless of the shutdown policy.
    pub fn flush(&mut self) -> Vec<SharedRecord> {
        let aggregator = &self.aggregator;
        let mut synthetic = Vec::new();
        let mut tx = self.store.begin();
        let close_tick = tx.current_tick();
        let closed = tx.drain(|context| {
            if let Some(summary) = aggregator.aggregate(context, close_tick) {
                synthetic.push(summary);
            }
        });
        if closed > 0 {
            debug!("flush closed {} open window(s)", closed);
        }
        synthetic
    }

    /// Apply the configured shutdown policy to the remaining open windows.
    pub fn shutdown(&mut self) -> Vec<SharedRecord> {
        match self.config.shutdown_policy {
            ShutdownPolicy::Aggregate => {
                let summaries = self.flush();
                if !summaries.is_empty() {
                    info!(
                        "shutdown aggregated {} open window(s) from {}",
                        summaries.len(),
                        self.instance_name()
                    );
                }
                summaries
            }
            ShutdownPolicy::Discard => {
                let mut tx = self.store.begin();
                let dropped = tx.drain(|_| {});
                drop(tx);
                if dropped > 0 {
                    info!(
                        "shutdown discarded {} open window(s) from {}",
                        dropped,
                        self.instance_name()
                    );
                }
                Vec::new()
            }
        }
    }

    /// A processor with identical configuration but fresh window state.
    /// Conditions and the summary recipe are shared, the store is not.
    pub fn clone_instance(&self) -> GroupingProcessor {
        GroupingProcessor {
            config: self.config.clone(),
            key_template: self.key_template.clone(),
            where_condition: self.where_condition.clone(),
            trigger_condition: self.trigger_condition.clone(),
            aggregator: self.aggregator.clone(),
            store: CorrelationStateStore::new(self.config.timeout_secs),
            clone_id: self.clone_id + 1,
        }
    }

    /// Snapshot of the window store.
    pub fn stats(&self) -> StoreStats {
        self.store.begin().stats()
    }
}
