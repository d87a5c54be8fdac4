//! Correlation keys and the per-key window of accumulated records.
//!
//! A [`CorrelationKey`] is what makes two records "the same conversation":
//! the rendered key template plus whichever of host, program and pid the
//! configured [`KeyScope`] pulls in. Keys are hashed once at construction
//! and carry the hash with them, so the hot lookup path never re-hashes the
//! string parts.

use super::template::Template;
use super::timer_wheel::EntryHandle;
use super::types::{Record, SharedRecord};
use rustc_hash::FxHasher;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Well-known record fields consulted by scoped keys.
pub const FIELD_HOST: &str = "host";
pub const FIELD_PROGRAM: &str = "program";
pub const FIELD_PID: &str = "pid";

/// How much of the record's origin participates in the correlation key.
///
/// Each level includes everything the previous one does, so `process` is the
/// narrowest grouping and `global` the widest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyScope {
    /// Key template only.
    #[default]
    Global,
    /// Key template plus the host field.
    Host,
    /// Key template plus host and program.
    Program,
    /// Key template plus host, program and pid.
    Process,
}

impl KeyScope {
    /// Parse a scope name as it appears in configuration. Case-insensitive.
    pub fn parse(text: &str) -> Option<KeyScope> {
        match text.to_ascii_lowercase().as_str() {
            "global" => Some(KeyScope::Global),
            "host" => Some(KeyScope::Host),
            "program" => Some(KeyScope::Program),
            "process" => Some(KeyScope::Process),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            KeyScope::Global => "global",
            KeyScope::Host => "host",
            KeyScope::Program => "program",
            KeyScope::Process => "process",
        }
    }
}

impl fmt::Display for KeyScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of one correlation window.
///
/// Equality compares the cached hash first and falls back to the field
/// tuple, and the `Hash` impl writes only the cached hash. Scope fields that
/// the configured scope excludes stay `None` and never influence equality.
#[derive(Debug, Clone)]
pub struct CorrelationKey {
    scope: KeyScope,
    host: Option<String>,
    program: Option<String>,
    pid: Option<String>,
    session_id: String,
    hash: u64,
}

impl CorrelationKey {
    /// Build the key for `record` under `scope`, with `session_id` the
    /// already-rendered key template. Scope fields missing from the record
    /// contribute an empty string rather than widening the grouping.
    pub fn new(scope: KeyScope, record: &Record, session_id: String) -> CorrelationKey {
        let capture = |name: &str| {
            record
                .get_field(name)
                .map(|value| value.render())
                .unwrap_or_default()
        };
        let host = match scope {
            KeyScope::Global => None,
            _ => Some(capture(FIELD_HOST)),
        };
        let program = match scope {
            KeyScope::Program | KeyScope::Process => Some(capture(FIELD_PROGRAM)),
            _ => None,
        };
        let pid = match scope {
            KeyScope::Process => Some(capture(FIELD_PID)),
            _ => None,
        };

        let mut hasher = FxHasher::default();
        (scope as u8).hash(&mut hasher);
        host.hash(&mut hasher);
        program.hash(&mut hasher);
        pid.hash(&mut hasher);
        session_id.hash(&mut hasher);
        let hash = hasher.finish();

        CorrelationKey {
            scope,
            host,
            program,
            pid,
            session_id,
            hash,
        }
    }

    pub fn scope(&self) -> KeyScope {
        self.scope
    }

    /// The rendered key template this window was opened with.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

impl PartialEq for CorrelationKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
            && self.scope == other.scope
            && self.host == other.host
            && self.program == other.program
            && self.pid == other.pid
            && self.session_id == other.session_id
    }
}

impl Eq for CorrelationKey {}

impl Hash for CorrelationKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scope={}", self.scope)?;
        if let Some(host) = &self.host {
            write!(f, ", host={}", host)?;
        }
        if let Some(program) = &self.program {
            write!(f, ", program={}", program)?;
        }
        if let Some(pid) = &self.pid {
            write!(f, ", pid={}", pid)?;
        }
        write!(f, ", key={}", self.session_id)
    }
}

/// One open window: the key, the member records in arrival order, and the
/// handle of the pending expiry timer while the window is scheduled.
#[derive(Debug)]
pub struct CorrelationContext {
    key: CorrelationKey,
    records: Vec<SharedRecord>,
    timer: Option<EntryHandle>,
}

impl CorrelationContext {
    pub fn new(key: CorrelationKey, first: SharedRecord) -> CorrelationContext {
        CorrelationContext {
            key,
            records: vec![first],
            timer: None,
        }
    }

    pub fn key(&self) -> &CorrelationKey {
        &self.key
    }

    /// Member records, oldest first (or template order after
    /// [`sort_by_template`](Self::sort_by_template)).
    pub fn records(&self) -> &[SharedRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn newest(&self) -> Option<&SharedRecord> {
        self.records.last()
    }

    pub fn push(&mut self, record: SharedRecord) {
        self.records.push(record);
    }

    /// Stable sort of the members by a rendered per-record key. Records that
    /// render the same key keep their arrival order.
    pub fn sort_by_template(&mut self, template: &Template) {
        self.records
            .sort_by_cached_key(|record| template.render_record(record.as_record()));
    }

    pub(crate) fn timer(&self) -> Option<EntryHandle> {
        self.timer
    }

    pub(crate) fn set_timer(&mut self, timer: Option<EntryHandle>) {
        self.timer = timer;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corrstream::engine::types::FieldValue;
    use std::collections::HashMap;

    fn record(host: &str, program: &str, pid: i64) -> Record {
        let mut fields = HashMap::new();
        fields.insert(FIELD_HOST.to_string(), FieldValue::String(host.into()));
        fields.insert(
            FIELD_PROGRAM.to_string(),
            FieldValue::String(program.into()),
        );
        fields.insert(FIELD_PID.to_string(), FieldValue::Integer(pid));
        Record::new(fields)
    }

    #[test]
    fn test_scope_parse_round_trip() {
        for scope in [
            KeyScope::Global,
            KeyScope::Host,
            KeyScope::Program,
            KeyScope::Process,
        ] {
            assert_eq!(KeyScope::parse(scope.as_str()), Some(scope));
        }
        assert_eq!(KeyScope::parse("HOST"), Some(KeyScope::Host));
        assert_eq!(KeyScope::parse("cluster"), None);
    }

    #[test]
    fn test_global_scope_ignores_origin() {
        let a = CorrelationKey::new(KeyScope::Global, &record("web1", "sshd", 1), "k".into());
        let b = CorrelationKey::new(KeyScope::Global, &record("web2", "cron", 2), "k".into());
        assert_eq!(a, b);
        assert_eq!(a.session_id(), "k");
    }

    #[test]
    fn test_host_scope_separates_hosts() {
        let a = CorrelationKey::new(KeyScope::Host, &record("web1", "sshd", 1), "k".into());
        let b = CorrelationKey::new(KeyScope::Host, &record("web2", "sshd", 1), "k".into());
        let c = CorrelationKey::new(KeyScope::Host, &record("web1", "cron", 9), "k".into());
        assert_ne!(a, b);
        assert_eq!(a, c);
    }

    #[test]
    fn test_process_scope_uses_pid() {
        let a = CorrelationKey::new(KeyScope::Process, &record("web1", "sshd", 100), "k".into());
        let b = CorrelationKey::new(KeyScope::Process, &record("web1", "sshd", 101), "k".into());
        assert_ne!(a, b);
    }

    #[test]
    fn test_different_session_ids_differ() {
        let rec = record("web1", "sshd", 1);
        let a = CorrelationKey::new(KeyScope::Global, &rec, "alpha".into());
        let b = CorrelationKey::new(KeyScope::Global, &rec, "beta".into());
        assert_ne!(a, b);
    }

    #[test]
    fn test_missing_scope_field_is_empty_not_wildcard() {
        let bare = Record::new(HashMap::new());
        let a = CorrelationKey::new(KeyScope::Host, &bare, "k".into());
        let b = CorrelationKey::new(KeyScope::Host, &record("web1", "x", 1), "k".into());
        assert_ne!(a, b);
    }

    #[test]
    fn test_context_push_and_newest() {
        let key = CorrelationKey::new(KeyScope::Global, &Record::new(HashMap::new()), "k".into());
        let mut ctx = CorrelationContext::new(key, SharedRecord::new(record("a", "p", 1)));
        ctx.push(SharedRecord::new(record("b", "p", 2)));
        assert_eq!(ctx.len(), 2);
        let newest = ctx.newest().unwrap();
        assert_eq!(
            newest.as_record().get_field(FIELD_HOST),
            Some(&FieldValue::String("b".into()))
        );
    }

    #[test]
    fn test_sort_by_template_is_stable() {
        let key = CorrelationKey::new(KeyScope::Global, &Record::new(HashMap::new()), "k".into());
        let mk = |host: &str, pid: i64| SharedRecord::new(record(host, "p", pid));
        let mut ctx = CorrelationContext::new(key, mk("b", 1));
        ctx.push(mk("a", 2));
        ctx.push(mk("b", 3));
        ctx.push(mk("a", 4));
        ctx.sort_by_template(&Template::parse("${host}").unwrap());
        let pids: Vec<i64> = ctx
            .records()
            .iter()
            .map(|r| match r.as_record().get_field(FIELD_PID) {
                Some(FieldValue::Integer(pid)) => *pid,
                _ => panic!("pid missing"),
            })
            .collect();
        assert_eq!(pids, vec![2, 4, 1, 3]);
    }
}
