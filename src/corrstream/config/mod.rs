//! Declarative processor configuration.
//!
//! A [`ProcessorConfig`] is the serde-facing description of one grouping
//! processor: the key and timeout, the optional `where`/`trigger`/`having`
//! condition trees, and the `aggregate` recipe for summary records. Configs
//! load from YAML or JSON (chosen by file extension, YAML being the
//! default) and validate when [`ProcessorConfig::build`] turns them into a
//! live [`GroupingProcessor`].

use crate::corrstream::engine::context::KeyScope;
use crate::corrstream::engine::error::CorrelationError;
use crate::corrstream::engine::grouping::{
    GroupByConfig, GroupingProcessor, InjectMode, ShutdownPolicy,
};
use crate::corrstream::engine::predicate::{CompareOp, FilterExpr};
use crate::corrstream::engine::synthetic::{InheritMode, SyntheticMessageSpec};
use crate::corrstream::engine::template::Template;
use crate::corrstream::engine::types::FieldValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Errors loading a processor configuration from disk.
#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse YAML config '{path}': {source}")]
    Yaml {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("failed to parse JSON config '{path}': {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid processor configuration: {0}")]
    Invalid(#[from] CorrelationError),
}

/// Serializable condition tree, compiled to a
/// [`FilterExpr`](crate::corrstream::engine::predicate::FilterExpr) at build
/// time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PredicateSpec {
    /// `compare: { field: severity, op: ge, value: 4 }`
    Compare {
        field: String,
        op: CompareOp,
        value: serde_json::Value,
    },
    /// `matches: { field: message, pattern: "^fail" }`
    Matches { field: String, pattern: String },
    /// `has-tag: security`
    HasTag(String),
    /// `count-at-least: 3`
    CountAtLeast(usize),
    /// `all-of: [...]`
    AllOf(Vec<PredicateSpec>),
    /// `any-of: [...]`
    AnyOf(Vec<PredicateSpec>),
    /// `not: ...`
    Not(Box<PredicateSpec>),
}

impl PredicateSpec {
    /// Compile the tree, validating regex patterns as it goes.
    pub fn compile(&self) -> Result<FilterExpr, CorrelationError> {
        match self {
            PredicateSpec::Compare { field, op, value } => Ok(FilterExpr::compare(
                field.clone(),
                *op,
                FieldValue::from_json(value),
            )),
            PredicateSpec::Matches { field, pattern } => FilterExpr::matches(field.clone(), pattern),
            PredicateSpec::HasTag(tag) => Ok(FilterExpr::HasTag(tag.clone())),
            PredicateSpec::CountAtLeast(n) => Ok(FilterExpr::CountAtLeast(*n)),
            PredicateSpec::AllOf(specs) => Ok(FilterExpr::And(
                specs
                    .iter()
                    .map(PredicateSpec::compile)
                    .collect::<Result<Vec<_>, _>>()?,
            )),
            PredicateSpec::AnyOf(specs) => Ok(FilterExpr::Or(
                specs
                    .iter()
                    .map(PredicateSpec::compile)
                    .collect::<Result<Vec<_>, _>>()?,
            )),
            PredicateSpec::Not(inner) => Ok(FilterExpr::Not(Box::new(inner.compile()?))),
        }
    }
}

/// The `aggregate` block: what the summary record looks like.
///
/// Values are kept in a sorted map so they apply in a stable order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AggregateSpec {
    #[serde(default)]
    pub inherit_mode: InheritMode,
    #[serde(default)]
    pub values: BTreeMap<String, String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// One grouping processor, as written in a config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProcessorConfig {
    /// Correlation key template, e.g. `"${host}:${session}"`.
    pub key: String,
    /// Sliding timeout in seconds.
    pub timeout: u64,
    #[serde(default)]
    pub sort_key: Option<String>,
    #[serde(default)]
    pub scope: KeyScope,
    #[serde(default)]
    pub inject_mode: InjectMode,
    #[serde(default)]
    pub shutdown_policy: ShutdownPolicy,
    /// Prefix for the names of aggregate values.
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default, rename = "where")]
    pub where_condition: Option<PredicateSpec>,
    #[serde(default)]
    pub trigger: Option<PredicateSpec>,
    #[serde(default)]
    pub having: Option<PredicateSpec>,
    pub aggregate: Option<AggregateSpec>,
}

impl ProcessorConfig {
    /// Parse a YAML document.
    pub fn from_yaml_str(text: &str) -> Result<ProcessorConfig, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }

    /// Parse a JSON document.
    pub fn from_json_str(text: &str) -> Result<ProcessorConfig, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Load a config file, picking the format by extension (`.json` parses
    /// as JSON, everything else as YAML).
    pub fn from_file(path: impl AsRef<Path>) -> Result<ProcessorConfig, ConfigLoadError> {
        let path = path.as_ref();
        let display = path.display().to_string();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigLoadError::Io {
            path: display.clone(),
            source,
        })?;
        let is_json = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        if is_json {
            Self::from_json_str(&text).map_err(|source| ConfigLoadError::Json {
                path: display,
                source,
            })
        } else {
            Self::from_yaml_str(&text).map_err(|source| ConfigLoadError::Yaml {
                path: display,
                source,
            })
        }
    }

    /// Validate the config and build a live processor from it.
    pub fn build(&self) -> Result<GroupingProcessor, CorrelationError> {
        let aggregate = self.aggregate.as_ref().ok_or_else(|| {
            CorrelationError::configuration(
                "the aggregate() option is mandatory for grouping",
                Some("aggregate"),
            )
        })?;

        let mut synthetic = SyntheticMessageSpec::new().with_inherit_mode(aggregate.inherit_mode);
        if let Some(prefix) = &self.prefix {
            synthetic = synthetic.with_prefix(prefix.clone());
        }
        for (name, text) in &aggregate.values {
            synthetic = synthetic.add_value(name.clone(), Template::parse(text)?);
        }
        for tag in &aggregate.tags {
            synthetic = synthetic.add_tag(tag.clone());
        }

        let mut config = GroupByConfig::new(self.key.clone(), self.timeout);
        config.sort_key_template = self.sort_key.clone();
        config.scope = self.scope;
        config.inject_mode = self.inject_mode;
        config.shutdown_policy = self.shutdown_policy;

        let mut processor = GroupingProcessor::new(config, synthetic)?;
        if let Some(spec) = &self.where_condition {
            processor = processor.with_where(Arc::new(spec.compile()?));
        }
        if let Some(spec) = &self.trigger {
            processor = processor.with_trigger(Arc::new(spec.compile()?));
        }
        if let Some(spec) = &self.having {
            processor = processor.with_having(Arc::new(spec.compile()?));
        }
        Ok(processor)
    }
}

/// Load a config file and build the processor it describes in one step.
pub fn load_processor(path: impl AsRef<Path>) -> Result<GroupingProcessor, ConfigLoadError> {
    let config = ProcessorConfig::from_file(path)?;
    Ok(config.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corrstream::engine::types::Record;
    use std::collections::HashMap;

    const FULL_YAML: &str = r#"
key: "${host}:${session}"
timeout: 30
scope: host
inject-mode: aggregate-only
shutdown-policy: aggregate
sort-key: "${seq}"
prefix: "agg."
where:
  compare: { field: facility, op: eq, value: auth }
trigger:
  any-of:
    - compare: { field: kind, op: eq, value: logout }
    - count-at-least: 100
having:
  count-at-least: 2
aggregate:
  inherit-mode: context
  values:
    count: "${_context_length}"
    user: "${user}"
  tags:
    - correlated
"#;

    fn record(pairs: &[(&str, &str)], secs: i64) -> Record {
        let mut fields = HashMap::new();
        for (name, value) in pairs {
            fields.insert(name.to_string(), FieldValue::String(value.to_string()));
        }
        Record::with_timestamp(fields, secs * 1000)
    }

    #[test]
    fn test_full_yaml_parses() {
        let config = ProcessorConfig::from_yaml_str(FULL_YAML).unwrap();
        assert_eq!(config.key, "${host}:${session}");
        assert_eq!(config.timeout, 30);
        assert_eq!(config.scope, KeyScope::Host);
        assert_eq!(config.inject_mode, InjectMode::AggregateOnly);
        assert_eq!(config.shutdown_policy, ShutdownPolicy::Aggregate);
        assert_eq!(config.prefix.as_deref(), Some("agg."));
        assert!(matches!(
            config.trigger,
            Some(PredicateSpec::AnyOf(ref specs)) if specs.len() == 2
        ));
        let aggregate = config.aggregate.as_ref().unwrap();
        assert_eq!(aggregate.inherit_mode, InheritMode::Context);
        assert_eq!(aggregate.values.len(), 2);
        assert_eq!(aggregate.tags, vec!["correlated".to_string()]);
    }

    #[test]
    fn test_defaults_applied() {
        let config = ProcessorConfig::from_yaml_str(
            "key: \"${host}\"\ntimeout: 5\naggregate: { values: { n: \"${_context_length}\" } }",
        )
        .unwrap();
        assert_eq!(config.scope, KeyScope::Global);
        assert_eq!(config.inject_mode, InjectMode::PassThrough);
        assert_eq!(config.shutdown_policy, ShutdownPolicy::Discard);
        assert!(config.where_condition.is_none());
        config.build().unwrap();
    }

    #[test]
    fn test_json_config_parses() {
        let config = ProcessorConfig::from_json_str(
            r#"{
                "key": "${host}",
                "timeout": 10,
                "trigger": { "count-at-least": 2 },
                "aggregate": { "values": { "count": "${_context_length}" } }
            }"#,
        )
        .unwrap();
        let mut processor = config.build().unwrap();
        processor.process(record(&[("host", "a")], 0)).unwrap();
        let outcome = processor.process(record(&[("host", "a")], 1)).unwrap();
        assert_eq!(outcome.synthetic.len(), 1);
    }

    #[test]
    fn test_aggregate_is_mandatory() {
        let config = ProcessorConfig::from_yaml_str("key: \"${host}\"\ntimeout: 5").unwrap();
        let err = config.build().unwrap_err();
        assert!(matches!(err, CorrelationError::ConfigurationError { .. }));
        assert!(err.to_string().contains("aggregate"));
    }

    #[test]
    fn test_unknown_scope_rejected() {
        assert!(ProcessorConfig::from_yaml_str(
            "key: \"${host}\"\ntimeout: 5\nscope: continent\naggregate: { values: {} }"
        )
        .is_err());
    }

    #[test]
    fn test_bad_value_template_rejected() {
        let config = ProcessorConfig::from_yaml_str(
            "key: \"${host}\"\ntimeout: 5\naggregate: { values: { broken: \"${unterminated\" } }",
        )
        .unwrap();
        assert!(matches!(
            config.build(),
            Err(CorrelationError::TemplateError { .. })
        ));
    }

    #[test]
    fn test_bad_regex_rejected_at_build() {
        let config = ProcessorConfig::from_yaml_str(
            "key: \"${host}\"\ntimeout: 5\nwhere:\n  matches: { field: m, pattern: \"(\" }\naggregate: { values: {} }",
        )
        .unwrap();
        assert!(matches!(
            config.build(),
            Err(CorrelationError::ConfigurationError { .. })
        ));
    }

    #[test]
    fn test_nested_predicate_compiles() {
        let spec = PredicateSpec::Not(Box::new(PredicateSpec::AllOf(vec![
            PredicateSpec::HasTag("noise".into()),
            PredicateSpec::Compare {
                field: "severity".into(),
                op: CompareOp::Lt,
                value: serde_json::json!(3),
            },
        ])));
        let expr = spec.compile().unwrap();
        assert!(matches!(expr, FilterExpr::Not(_)));
    }

    #[test]
    fn test_yaml_where_guard_end_to_end() {
        let mut processor = ProcessorConfig::from_yaml_str(FULL_YAML)
            .unwrap()
            .build()
            .unwrap();
        // facility != auth fails the where guard; aggregate-only drops the
        // original, so nothing at all comes out.
        let outcome = processor
            .process(record(&[("host", "a"), ("facility", "cron")], 0))
            .unwrap();
        assert!(outcome.is_empty());
        assert_eq!(processor.stats().open_windows, 0);
    }
}
