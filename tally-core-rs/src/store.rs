//! Durable keyed store abstraction
//!
//! Records are JSON objects addressed by string keys. Every mutation is
//! guarded by a [`Condition`] evaluated atomically against the current
//! record; a failed guard is reported as [`StoreError::ConditionFailed`],
//! distinct from infrastructure faults.

use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Precondition checked against the current record before a write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Condition {
    Always,
    /// Record does not exist
    Absent,
    /// Record exists
    Present,
    /// Record exists and `field` holds one of `values`
    FieldIn { field: String, values: Vec<Value> },
    /// Record is absent, or `field` is missing or null
    FieldMissing { field: String },
    All(Vec<Condition>),
}

impl Condition {
    pub fn field_in(field: &str, values: impl IntoIterator<Item = Value>) -> Self {
        Condition::FieldIn {
            field: field.to_string(),
            values: values.into_iter().collect(),
        }
    }

    pub fn field_missing(field: &str) -> Self {
        Condition::FieldMissing {
            field: field.to_string(),
        }
    }

    /// Evaluate against the current record
    pub fn holds(&self, current: Option<&Value>) -> bool {
        match self {
            Condition::Always => true,
            Condition::Absent => current.is_none(),
            Condition::Present => current.is_some(),
            Condition::FieldIn { field, values } => current
                .and_then(|record| record.get(field))
                .map(|v| values.contains(v))
                .unwrap_or(false),
            Condition::FieldMissing { field } => current
                .and_then(|record| record.get(field))
                .map(Value::is_null)
                .unwrap_or(true),
            Condition::All(conditions) => conditions.iter().all(|c| c.holds(current)),
        }
    }
}

/// A single applied write, also the unit of the write-ahead log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum Mutation {
    #[serde(rename = "PUT")]
    Put { key: String, value: Value },

    /// Merge fields into the record, creating it if needed
    #[serde(rename = "UPDATE")]
    Update {
        key: String,
        fields: Map<String, Value>,
    },

    /// Add `delta` to a numeric field and set `set` alongside
    #[serde(rename = "INCREMENT")]
    Increment {
        key: String,
        field: String,
        delta: i64,
        set: Map<String, Value>,
    },

    /// Insert `member` into an array field if not already present
    #[serde(rename = "ADD_TO_SET")]
    AddToSet {
        key: String,
        field: String,
        member: Value,
    },

    #[serde(rename = "DELETE")]
    Delete { key: String },
}

impl Mutation {
    pub fn key(&self) -> &str {
        match self {
            Mutation::Put { key, .. }
            | Mutation::Update { key, .. }
            | Mutation::Increment { key, .. }
            | Mutation::AddToSet { key, .. }
            | Mutation::Delete { key } => key,
        }
    }
}

/// Ordered in-memory table with conditional mutation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Table {
    records: BTreeMap<String, Value>,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.records.get(key)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn scan_prefix(&self, prefix: &str) -> Vec<(String, Value)> {
        self.records
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Check `condition` then apply `mutation`, returning the resulting record
    pub fn apply_if(&mut self, condition: &Condition, mutation: &Mutation) -> StoreResult<Option<Value>> {
        if !condition.holds(self.records.get(mutation.key())) {
            return Err(StoreError::ConditionFailed);
        }
        self.apply(mutation)
    }

    /// Apply a mutation unconditionally (used for WAL replay)
    pub fn apply(&mut self, mutation: &Mutation) -> StoreResult<Option<Value>> {
        match mutation {
            Mutation::Put { key, value } => {
                self.records.insert(key.clone(), value.clone());
                Ok(Some(value.clone()))
            }
            Mutation::Update { key, fields } => {
                let record = self.object_mut(key)?;
                for (name, value) in fields {
                    record.insert(name.clone(), value.clone());
                }
                Ok(self.records.get(key).cloned())
            }
            Mutation::Increment {
                key,
                field,
                delta,
                set,
            } => {
                let record = self.object_mut(key)?;
                let current = match record.get(field) {
                    None | Some(Value::Null) => 0,
                    Some(v) => v.as_i64().ok_or_else(|| {
                        StoreError::Internal(format!("field {} of {} is not numeric", field, key))
                    })?,
                };
                record.insert(field.clone(), Value::from(current + delta));
                for (name, value) in set {
                    record.insert(name.clone(), value.clone());
                }
                Ok(self.records.get(key).cloned())
            }
            Mutation::AddToSet { key, field, member } => {
                let record = self.object_mut(key)?;
                let entry = record
                    .entry(field.clone())
                    .or_insert_with(|| Value::Array(Vec::new()));
                let members = entry.as_array_mut().ok_or_else(|| {
                    StoreError::Internal(format!("field {} of {} is not a set", field, key))
                })?;
                if !members.contains(member) {
                    members.push(member.clone());
                }
                Ok(self.records.get(key).cloned())
            }
            Mutation::Delete { key } => Ok(self.records.remove(key)),
        }
    }

    fn object_mut(&mut self, key: &str) -> StoreResult<&mut Map<String, Value>> {
        self.records
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Map::new()))
            .as_object_mut()
            .ok_or_else(|| StoreError::Internal(format!("record {} is not an object", key)))
    }
}

/// Networked key-value store with conditional and atomic primitives
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<Value>>;

    async fn put(&self, key: &str, value: Value, condition: Condition) -> StoreResult<()>;

    /// Merge `fields` into the record; returns the updated record
    async fn update(
        &self,
        key: &str,
        fields: Map<String, Value>,
        condition: Condition,
    ) -> StoreResult<Value>;

    /// Atomically add `delta` to `field`; returns the new value
    async fn increment(
        &self,
        key: &str,
        field: &str,
        delta: i64,
        set: Map<String, Value>,
        condition: Condition,
    ) -> StoreResult<i64>;

    /// Idempotent set insert into an array field
    async fn add_to_set(&self, key: &str, field: &str, member: Value) -> StoreResult<()>;

    async fn delete(&self, key: &str, condition: Condition) -> StoreResult<()>;

    /// All records whose key starts with `prefix`, in key order
    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<(String, Value)>>;
}

/// Read the numeric field out of an increment result
pub(crate) fn numeric_field(record: Option<Value>, field: &str) -> StoreResult<i64> {
    record
        .as_ref()
        .and_then(|r| r.get(field))
        .and_then(Value::as_i64)
        .ok_or_else(|| StoreError::Internal(format!("missing numeric field {}", field)))
}

/// Shared helper: run one conditional mutation against a locked table
pub(crate) fn mutate(table: &Mutex<Table>, condition: &Condition, mutation: &Mutation) -> StoreResult<Option<Value>> {
    let mut table = table.lock();
    let result = table.apply_if(condition, mutation);
    if let Err(StoreError::ConditionFailed) = result {
        debug!("Store: condition {:?} failed on {}", condition, mutation.key());
    }
    result
}

/// In-memory store, linearizable per key
#[derive(Default)]
pub struct MemoryStore {
    table: Mutex<Table>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.lock().is_empty()
    }

    /// Copy of the current contents
    pub fn snapshot(&self) -> Table {
        self.table.lock().clone()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Value>> {
        Ok(self.table.lock().get(key).cloned())
    }

    async fn put(&self, key: &str, value: Value, condition: Condition) -> StoreResult<()> {
        let mutation = Mutation::Put {
            key: key.to_string(),
            value,
        };
        mutate(&self.table, &condition, &mutation).map(|_| ())
    }

    async fn update(
        &self,
        key: &str,
        fields: Map<String, Value>,
        condition: Condition,
    ) -> StoreResult<Value> {
        let mutation = Mutation::Update {
            key: key.to_string(),
            fields,
        };
        mutate(&self.table, &condition, &mutation)?
            .ok_or_else(|| StoreError::Internal(format!("update of {} produced no record", key)))
    }

    async fn increment(
        &self,
        key: &str,
        field: &str,
        delta: i64,
        set: Map<String, Value>,
        condition: Condition,
    ) -> StoreResult<i64> {
        let mutation = Mutation::Increment {
            key: key.to_string(),
            field: field.to_string(),
            delta,
            set,
        };
        numeric_field(mutate(&self.table, &condition, &mutation)?, field)
    }

    async fn add_to_set(&self, key: &str, field: &str, member: Value) -> StoreResult<()> {
        let mutation = Mutation::AddToSet {
            key: key.to_string(),
            field: field.to_string(),
            member,
        };
        mutate(&self.table, &Condition::Always, &mutation).map(|_| ())
    }

    async fn delete(&self, key: &str, condition: Condition) -> StoreResult<()> {
        let mutation = Mutation::Delete {
            key: key.to_string(),
        };
        mutate(&self.table, &condition, &mutation).map(|_| ())
    }

    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<(String, Value)>> {
        Ok(self.table.lock().scan_prefix(prefix))
    }
}

#[async_trait]
impl<S: KeyValueStore + ?Sized> KeyValueStore for Arc<S> {
    async fn get(&self, key: &str) -> StoreResult<Option<Value>> {
        (**self).get(key).await
    }

    async fn put(&self, key: &str, value: Value, condition: Condition) -> StoreResult<()> {
        (**self).put(key, value, condition).await
    }

    async fn update(
        &self,
        key: &str,
        fields: Map<String, Value>,
        condition: Condition,
    ) -> StoreResult<Value> {
        (**self).update(key, fields, condition).await
    }

    async fn increment(
        &self,
        key: &str,
        field: &str,
        delta: i64,
        set: Map<String, Value>,
        condition: Condition,
    ) -> StoreResult<i64> {
        (**self).increment(key, field, delta, set, condition).await
    }

    async fn add_to_set(&self, key: &str, field: &str, member: Value) -> StoreResult<()> {
        (**self).add_to_set(key, field, member).await
    }

    async fn delete(&self, key: &str, condition: Condition) -> StoreResult<()> {
        (**self).delete(key, condition).await
    }

    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<(String, Value)>> {
        (**self).scan_prefix(prefix).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_put_absent_guards_duplicates() {
        let store = MemoryStore::new();
        store.put("a", json!({"v": 1}), Condition::Absent).await.unwrap();

        let second = store.put("a", json!({"v": 2}), Condition::Absent).await;
        assert!(matches!(second, Err(StoreError::ConditionFailed)));
        assert_eq!(store.get("a").await.unwrap(), Some(json!({"v": 1})));
    }

    #[tokio::test]
    async fn test_increment_requires_present_row() {
        let store = MemoryStore::new();
        let missing = store
            .increment("agg", "count", 1, Map::new(), Condition::Present)
            .await;
        assert!(matches!(missing, Err(StoreError::ConditionFailed)));

        store.put("agg", json!({"count": 1}), Condition::Absent).await.unwrap();
        let mut set = Map::new();
        set.insert("updatedAt".into(), json!("now"));
        let count = store
            .increment("agg", "count", 1, set, Condition::Present)
            .await
            .unwrap();
        assert_eq!(count, 2);
        assert_eq!(store.get("agg").await.unwrap().unwrap()["updatedAt"], "now");
    }

    #[tokio::test]
    async fn test_field_conditions() {
        let store = MemoryStore::new();
        store
            .put("room", json!({"status": "ACTIVE"}), Condition::Always)
            .await
            .unwrap();

        let guard = Condition::All(vec![
            Condition::field_in("status", [json!("ACTIVE"), json!("WAITING")]),
            Condition::field_missing("resultItemId"),
        ]);

        let mut fields = Map::new();
        fields.insert("status".into(), json!("MATCHED"));
        fields.insert("resultItemId".into(), json!("x"));
        store.update("room", fields.clone(), guard.clone()).await.unwrap();

        let again = store.update("room", fields, guard).await;
        assert!(matches!(again, Err(StoreError::ConditionFailed)));
    }

    #[tokio::test]
    async fn test_add_to_set_is_idempotent() {
        let store = MemoryStore::new();
        store.add_to_set("shown", "items", json!("x")).await.unwrap();
        store.add_to_set("shown", "items", json!("x")).await.unwrap();
        store.add_to_set("shown", "items", json!("y")).await.unwrap();

        let record = store.get("shown").await.unwrap().unwrap();
        assert_eq!(record["items"], json!(["x", "y"]));
    }

    #[tokio::test]
    async fn test_scan_prefix_is_ordered_and_bounded() {
        let store = MemoryStore::new();
        for key in ["vote#r1#b", "vote#r1#a", "vote#r2#a", "agg#r1#x"] {
            store.put(key, json!({}), Condition::Always).await.unwrap();
        }

        let keys: Vec<String> = store
            .scan_prefix("vote#r1#")
            .await
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["vote#r1#a", "vote#r1#b"]);
    }
}
