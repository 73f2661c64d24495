//! Record model seen by the gates: identities, values, dirty tracking and the store seam.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};

use anyhow::anyhow;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId {
    pub cluster: i32,
    pub position: i64,
}

impl RecordId {
    pub const NEW: RecordId = RecordId { cluster: -1, position: -1 };

    pub fn new(cluster: i32, position: i64) -> Self { Self { cluster, position } }

    /// Not yet persisted.
    pub fn is_new(&self) -> bool { self.position < 0 }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "#{}:{}", self.cluster, self.position) }
}

impl FromStr for RecordId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let body = s.trim().strip_prefix('#').unwrap_or(s.trim());
        let (c, p) = body.split_once(':').ok_or_else(|| anyhow!("record id must look like #cluster:position"))?;
        Ok(RecordId { cluster: c.parse()?, position: p.parse()? })
    }
}

/// Lazily materialized collection of references; may hold duplicates.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LinkBag {
    entries: Vec<RecordId>,
}

impl LinkBag {
    pub fn new() -> Self { Self::default() }
    pub fn add(&mut self, id: RecordId) { self.entries.push(id); }
    pub fn len(&self) -> usize { self.entries.len() }
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    /// Plain ordered set: first occurrence wins.
    pub fn materialize(&self) -> Vec<RecordId> {
        let mut out: Vec<RecordId> = Vec::with_capacity(self.entries.len());
        for id in &self.entries {
            if !out.contains(id) { out.push(*id); }
        }
        out
    }
}

impl FromIterator<RecordId> for LinkBag {
    fn from_iter<T: IntoIterator<Item = RecordId>>(iter: T) -> Self { LinkBag { entries: iter.into_iter().collect() } }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Link(RecordId),
    List(Vec<Value>),
    LinkSet(Vec<RecordId>),
    LinkBag(LinkBag),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn is_null(&self) -> bool { matches!(self, Value::Null) }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Link collections as a flat id list; bags are materialized.
    pub fn links(&self) -> Option<Vec<RecordId>> {
        match self {
            Value::Link(id) => Some(vec![*id]),
            Value::LinkSet(ids) => Some(ids.clone()),
            Value::LinkBag(bag) => Some(bag.materialize()),
            Value::List(items) => items.iter().map(|v| if let Value::Link(id) = v { Some(*id) } else { None }).collect(),
            _ => None,
        }
    }

    /// Replaces a lazy bag with a plain ordered set; other values are returned as-is.
    pub fn unboxed(&self) -> Value {
        match self {
            Value::LinkBag(bag) => Value::LinkSet(bag.materialize()),
            other => other.clone(),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self { Value::String(s.to_string()) }
}
impl From<String> for Value {
    fn from(s: String) -> Self { Value::String(s) }
}
impl From<i64> for Value {
    fn from(v: i64) -> Self { Value::Integer(v) }
}
impl From<bool> for Value {
    fn from(v: bool) -> Self { Value::Bool(v) }
}
impl From<f64> for Value {
    fn from(v: f64) -> Self { Value::Float(v) }
}
impl From<RecordId> for Value {
    fn from(v: RecordId) -> Self { Value::Link(v) }
}

/// Anything a predicate can be evaluated against.
pub trait Document {
    fn identity(&self) -> Option<RecordId>;
    fn class_name(&self) -> Option<&str>;
    /// Field value; `@rid`, `@class` and `@version` expose metadata.
    fn property(&self, name: &str) -> Option<Value>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    id: RecordId,
    class_name: Option<String>,
    version: i32,
    fields: BTreeMap<String, Value>,
    // field -> value before the first change since the last save; Null when it did not exist
    originals: BTreeMap<String, Value>,
}

impl Record {
    pub fn new<S: Into<String>>(class_name: S) -> Self {
        Self { id: RecordId::NEW, class_name: Some(class_name.into()), version: 0, fields: BTreeMap::new(), originals: BTreeMap::new() }
    }

    /// A record without a schema class.
    pub fn untyped() -> Self {
        Self { id: RecordId::NEW, class_name: None, version: 0, fields: BTreeMap::new(), originals: BTreeMap::new() }
    }

    pub fn with_id(mut self, id: RecordId) -> Self {
        self.id = id;
        self
    }

    pub fn with_field<S: Into<String>, V: Into<Value>>(mut self, name: S, value: V) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn id(&self) -> RecordId { self.id }
    pub fn set_id(&mut self, id: RecordId) { self.id = id; }
    pub fn is_new(&self) -> bool { self.id.is_new() }
    pub fn version(&self) -> i32 { self.version }
    pub fn set_version(&mut self, version: i32) { self.version = version; }
    pub fn class(&self) -> Option<&str> { self.class_name.as_deref() }

    pub fn field(&self, name: &str) -> Option<&Value> { self.fields.get(name) }
    pub fn fields(&self) -> impl Iterator<Item = (&str, &Value)> { self.fields.iter().map(|(k, v)| (k.as_str(), v)) }
    pub fn field_names(&self) -> impl Iterator<Item = &str> { self.fields.keys().map(|k| k.as_str()) }

    /// Sets a field and remembers the pre-change value the first time it is dirtied.
    pub fn set<S: Into<String>, V: Into<Value>>(&mut self, name: S, value: V) {
        let name = name.into();
        let old = self.fields.insert(name.clone(), value.into());
        self.originals.entry(name).or_insert_with(|| old.unwrap_or(Value::Null));
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        let old = self.fields.remove(name);
        if let Some(v) = &old {
            self.originals.entry(name.to_string()).or_insert_with(|| v.clone());
        }
        old
    }

    pub fn is_dirty(&self) -> bool { !self.originals.is_empty() }
    pub fn dirty_fields(&self) -> impl Iterator<Item = &str> { self.originals.keys().map(|k| k.as_str()) }
    pub fn original(&self, name: &str) -> Option<&Value> { self.originals.get(name) }

    /// Forget dirty state, as after a successful save.
    pub fn clear_dirty(&mut self) { self.originals.clear(); }
}

impl Document for Record {
    fn identity(&self) -> Option<RecordId> { Some(self.id) }
    fn class_name(&self) -> Option<&str> { self.class_name.as_deref() }

    fn property(&self, name: &str) -> Option<Value> {
        match name {
            "@rid" => Some(Value::Link(self.id)),
            "@class" => self.class_name.clone().map(Value::String),
            "@version" => Some(Value::Integer(self.version as i64)),
            _ => self.fields.get(name).cloned(),
        }
    }
}

/// Flat property snapshot used for BEFORE_UPDATE checks.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Projection {
    values: BTreeMap<String, Value>,
}

impl Projection {
    /// Current values with bags unboxed, metadata, then every dirty field rolled back to its original value.
    pub fn before_update(record: &Record) -> Self {
        let mut values: BTreeMap<String, Value> = record.fields.iter().map(|(k, v)| (k.clone(), v.unboxed())).collect();
        values.insert("@rid".into(), Value::Link(record.id));
        if let Some(c) = &record.class_name { values.insert("@class".into(), Value::String(c.clone())); }
        values.insert("@version".into(), Value::Integer(record.version as i64));
        for (name, original) in &record.originals {
            values.insert(name.clone(), original.unboxed());
        }
        Self { values }
    }

    pub fn get(&self, name: &str) -> Option<&Value> { self.values.get(name) }
}

impl Document for Projection {
    fn identity(&self) -> Option<RecordId> {
        match self.values.get("@rid") {
            Some(Value::Link(id)) => Some(*id),
            _ => None,
        }
    }

    fn class_name(&self) -> Option<&str> { self.values.get("@class").and_then(|v| v.as_str()) }

    fn property(&self, name: &str) -> Option<Value> { self.values.get(name).cloned() }
}

/// Storage seam: record load by id.
pub trait RecordStore: Send + Sync {
    fn load(&self, id: &RecordId) -> anyhow::Result<Option<Record>>;
}

/// In-process record store for embedding and tests.
#[derive(Default)]
pub struct MemoryRecordStore {
    records: RwLock<HashMap<RecordId, Record>>,
    next_position: AtomicI64,
}

impl MemoryRecordStore {
    pub fn new() -> Self { Self::default() }

    /// Assigns a position to new records, bumps the version and clears dirty state.
    pub fn save(&self, record: &mut Record, cluster: i32) -> RecordId {
        if record.is_new() {
            let pos = self.next_position.fetch_add(1, Ordering::Relaxed);
            record.set_id(RecordId::new(cluster, pos));
        }
        record.set_version(record.version() + 1);
        record.clear_dirty();
        self.records.write().insert(record.id(), record.clone());
        record.id()
    }

    pub fn delete(&self, id: &RecordId) -> bool { self.records.write().remove(id).is_some() }
    pub fn len(&self) -> usize { self.records.read().len() }
    pub fn is_empty(&self) -> bool { self.records.read().is_empty() }
}

impl RecordStore for MemoryRecordStore {
    fn load(&self, id: &RecordId) -> anyhow::Result<Option<Record>> { Ok(self.records.read().get(id).cloned()) }
}
