//! Synthetic summary records for closed windows.
//!
//! When a window closes, the processor does not forward the member records
//! again; it emits one new record described by a [`SyntheticMessageSpec`]:
//! a base record chosen by [`InheritMode`], plus a set of template-rendered
//! values and tags layered on top.

use super::template::Template;
use super::types::{FieldValue, Record, SharedRecord};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// What the summary record starts from before values are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InheritMode {
    /// Start from a blank record stamped with the close tick.
    Empty,
    /// Clone the newest member record.
    #[default]
    LastMessage,
    /// Union of every member's fields, oldest first, so newer members win
    /// conflicting names. Timestamps come from the newest member and tags
    /// are merged across the window.
    Context,
}

impl InheritMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            InheritMode::Empty => "empty",
            InheritMode::LastMessage => "last-message",
            InheritMode::Context => "context",
        }
    }
}

/// Recipe for the summary record emitted when a window closes.
#[derive(Debug, Clone, Default)]
pub struct SyntheticMessageSpec {
    inherit_mode: InheritMode,
    prefix: Option<String>,
    values: Vec<(String, Template)>,
    tags: Vec<String>,
}

impl SyntheticMessageSpec {
    pub fn new() -> SyntheticMessageSpec {
        SyntheticMessageSpec::default()
    }

    pub fn with_inherit_mode(mut self, mode: InheritMode) -> SyntheticMessageSpec {
        self.inherit_mode = mode;
        self
    }

    /// Prefix prepended to every value name at generation time.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> SyntheticMessageSpec {
        self.prefix = Some(prefix.into());
        self
    }

    /// Add a value rendered against the closed window. Values are applied
    /// in the order they were added.
    pub fn add_value(mut self, name: impl Into<String>, template: Template) -> SyntheticMessageSpec {
        self.values.push((name.into(), template));
        self
    }

    pub fn add_tag(mut self, tag: impl Into<String>) -> SyntheticMessageSpec {
        self.tags.push(tag.into());
        self
    }

    pub fn inherit_mode(&self) -> InheritMode {
        self.inherit_mode
    }

    /// Build the summary record for a window closed at `close_tick` with
    /// the given members, oldest first.
    pub fn generate(&self, members: &[SharedRecord], close_tick: i64) -> Record {
        let mut record = match self.inherit_mode {
            InheritMode::Empty => Record::with_timestamp(HashMap::new(), close_tick * 1000),
            InheritMode::LastMessage => match members.last() {
                Some(newest) => newest.as_record().clone(),
                None => Record::with_timestamp(HashMap::new(), close_tick * 1000),
            },
            InheritMode::Context => match members.last() {
                Some(newest) => {
                    let mut merged =
                        Record::with_timestamp(HashMap::new(), newest.as_record().timestamp);
                    merged.event_time = newest.as_record().event_time;
                    for member in members {
                        let record = member.as_record();
                        for (name, value) in &record.fields {
                            merged.set_field(name, value.clone());
                        }
                        for tag in &record.tags {
                            merged.add_tag(tag);
                        }
                    }
                    merged
                }
                None => Record::with_timestamp(HashMap::new(), close_tick * 1000),
            },
        };

        for (name, template) in &self.values {
            let rendered = template.render_context(members);
            let name = match &self.prefix {
                Some(prefix) => format!("{}{}", prefix, name),
                None => name.clone(),
            };
            record.set_field(name, FieldValue::String(rendered));
        }
        for tag in &self.tags {
            record.add_tag(tag);
        }
        record
    }
}
