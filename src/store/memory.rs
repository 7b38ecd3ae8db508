//! In-memory key-value store for development and testing

use super::KvStore;
use crate::{Error, Result};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone)]
enum Value {
    Hash(HashMap<String, String>),
    Set(HashSet<String>),
    Counter(i64),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Value::Hash(_) => "hash",
            Value::Set(_) => "set",
            Value::Counter(_) => "counter",
        }
    }
}

fn wrong_type(key: &str, expected: &str, found: &Value) -> Error {
    Error::Store(format!(
        "WRONGTYPE {} holds a {}, expected {}",
        key,
        found.type_name(),
        expected
    ))
}

/// In-memory store
///
/// Empty hashes and sets are removed, so a key exists only while it holds
/// data. Clones share the same underlying map.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    data: std::sync::Arc<DashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Keys currently present, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.data.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        match self.data.get(key).as_deref() {
            None => Ok(None),
            Some(Value::Hash(hash)) => Ok(hash.get(field).cloned()),
            Some(other) => Err(wrong_type(key, "hash", other)),
        }
    }

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>> {
        match self.data.get(key).as_deref() {
            None => Ok(Vec::new()),
            Some(Value::Hash(hash)) => {
                let mut fields: Vec<(String, String)> = hash
                    .iter()
                    .map(|(field, value)| (field.clone(), value.clone()))
                    .collect();
                fields.sort();
                Ok(fields)
            }
            Some(other) => Err(wrong_type(key, "hash", other)),
        }
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<bool> {
        let mut entry = self
            .data
            .entry(key.to_string())
            .or_insert_with(|| Value::Hash(HashMap::new()));
        match entry.value_mut() {
            Value::Hash(hash) => Ok(hash.insert(field.to_string(), value.to_string()).is_none()),
            other => Err(wrong_type(key, "hash", other)),
        }
    }

    async fn hdel(&self, key: &str, fields: &[String]) -> Result<usize> {
        match self.data.entry(key.to_string()) {
            Entry::Vacant(_) => Ok(0),
            Entry::Occupied(mut occupied) => {
                let removed = match occupied.get_mut() {
                    Value::Hash(hash) => fields
                        .iter()
                        .filter(|field| hash.remove(field.as_str()).is_some())
                        .count(),
                    other => return Err(wrong_type(key, "hash", other)),
                };
                if matches!(occupied.get(), Value::Hash(hash) if hash.is_empty()) {
                    occupied.remove();
                }
                Ok(removed)
            }
        }
    }

    async fn del(&self, key: &str) -> Result<bool> {
        Ok(self.data.remove(key).is_some())
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64> {
        let mut entry = self
            .data
            .entry(key.to_string())
            .or_insert(Value::Counter(0));
        match entry.value_mut() {
            Value::Counter(count) => {
                *count += delta;
                Ok(*count)
            }
            other => Err(wrong_type(key, "counter", other)),
        }
    }

    async fn get_counter(&self, key: &str) -> Result<Option<i64>> {
        match self.data.get(key).as_deref() {
            None => Ok(None),
            Some(Value::Counter(count)) => Ok(Some(*count)),
            Some(other) => Err(wrong_type(key, "counter", other)),
        }
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        let mut entry = self
            .data
            .entry(key.to_string())
            .or_insert_with(|| Value::Set(HashSet::new()));
        match entry.value_mut() {
            Value::Set(set) => Ok(set.insert(member.to_string())),
            other => Err(wrong_type(key, "set", other)),
        }
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool> {
        match self.data.entry(key.to_string()) {
            Entry::Vacant(_) => Ok(false),
            Entry::Occupied(mut occupied) => {
                let removed = match occupied.get_mut() {
                    Value::Set(set) => set.remove(member),
                    other => return Err(wrong_type(key, "set", other)),
                };
                if matches!(occupied.get(), Value::Set(set) if set.is_empty()) {
                    occupied.remove();
                }
                Ok(removed)
            }
        }
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        match self.data.get(key).as_deref() {
            None => Ok(Vec::new()),
            Some(Value::Set(set)) => {
                let mut members: Vec<String> = set.iter().cloned().collect();
                members.sort();
                Ok(members)
            }
            Some(other) => Err(wrong_type(key, "set", other)),
        }
    }
}
