//! In-process `KvStore` with the same reply semantics as the REST service.
//!
//! Every batch is recorded so callers can inspect what would have gone over
//! the wire.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;

use super::{KvCommand, KvReply, KvStore};

#[derive(Debug, Clone)]
enum Entry {
    Str(String),
    List(Vec<String>),
    Hash(BTreeMap<String, String>),
}

#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, Entry>>,
    batches: Mutex<Vec<Vec<KvCommand>>>,
    offline: AtomicBool,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a transport outage: every batch fails until cleared.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn recorded_batches(&self) -> Vec<Vec<KvCommand>> {
        self.batches
            .lock()
            .map(|batches| batches.clone())
            .unwrap_or_default()
    }

    pub fn clear_recorded(&self) {
        if let Ok(mut batches) = self.batches.lock() {
            batches.clear();
        }
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys = self
            .entries
            .lock()
            .map(|entries| entries.keys().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    pub fn raw_string(&self, key: &str) -> Option<String> {
        let entries = self.entries.lock().ok()?;
        match entries.get(key) {
            Some(Entry::Str(value)) => Some(value.clone()),
            _ => None,
        }
    }

    fn apply(entries: &mut HashMap<String, Entry>, command: KvCommand) -> Result<KvReply> {
        match command {
            KvCommand::Get(key) => match entries.get(&key) {
                None => Ok(KvReply::Nil),
                Some(Entry::Str(value)) => Ok(KvReply::Text(value.clone())),
                Some(_) => Err(wrong_type(&key)),
            },
            KvCommand::Set(key, value) => {
                entries.insert(key, Entry::Str(value));
                Ok(KvReply::Text("OK".to_string()))
            }
            KvCommand::Del(key) => Ok(KvReply::Integer(entries.remove(&key).is_some() as i64)),
            KvCommand::Exists(key) => Ok(KvReply::Integer(entries.contains_key(&key) as i64)),
            KvCommand::RPush(key, values) => {
                let list = list_mut(entries, &key)?;
                list.extend(values);
                Ok(KvReply::Integer(list.len() as i64))
            }
            KvCommand::LPush(key, values) => {
                let list = list_mut(entries, &key)?;
                for value in values {
                    list.insert(0, value);
                }
                Ok(KvReply::Integer(list.len() as i64))
            }
            KvCommand::LRange(key, start, stop) => match entries.get(&key) {
                None => Ok(KvReply::List(Vec::new())),
                Some(Entry::List(list)) => Ok(KvReply::List(
                    match normalize_range(list.len(), start, stop) {
                        Some((from, to)) => list[from..=to].to_vec(),
                        None => Vec::new(),
                    },
                )),
                Some(_) => Err(wrong_type(&key)),
            },
            KvCommand::LTrim(key, start, stop) => {
                let remove = match entries.get_mut(&key) {
                    None => false,
                    Some(Entry::List(list)) => {
                        match normalize_range(list.len(), start, stop) {
                            Some((from, to)) => {
                                *list = list[from..=to].to_vec();
                                false
                            }
                            None => true,
                        }
                    }
                    Some(_) => return Err(wrong_type(&key)),
                };
                if remove {
                    entries.remove(&key);
                }
                Ok(KvReply::Text("OK".to_string()))
            }
            KvCommand::HSet(key, pairs) => {
                let hash = match entries
                    .entry(key.clone())
                    .or_insert_with(|| Entry::Hash(BTreeMap::new()))
                {
                    Entry::Hash(hash) => hash,
                    _ => return Err(wrong_type(&key)),
                };
                let mut added = 0;
                for (field, value) in pairs {
                    if hash.insert(field, value).is_none() {
                        added += 1;
                    }
                }
                Ok(KvReply::Integer(added))
            }
            KvCommand::HGetAll(key) => match entries.get(&key) {
                None => Ok(KvReply::List(Vec::new())),
                Some(Entry::Hash(hash)) => Ok(KvReply::List(
                    hash.iter()
                        .flat_map(|(field, value)| [field.clone(), value.clone()])
                        .collect(),
                )),
                Some(_) => Err(wrong_type(&key)),
            },
            KvCommand::HDel(key, fields) => {
                let (removed, now_empty) = match entries.get_mut(&key) {
                    None => (0, false),
                    Some(Entry::Hash(hash)) => {
                        let removed = fields
                            .iter()
                            .filter(|field| hash.remove(*field).is_some())
                            .count();
                        (removed as i64, hash.is_empty())
                    }
                    Some(_) => return Err(wrong_type(&key)),
                };
                if now_empty {
                    entries.remove(&key);
                }
                Ok(KvReply::Integer(removed))
            }
        }
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn pipeline(&self, commands: Vec<KvCommand>) -> Result<Vec<KvReply>> {
        if self.offline.load(Ordering::SeqCst) {
            bail!("key-value service unreachable (simulated outage)");
        }
        if let Ok(mut batches) = self.batches.lock() {
            batches.push(commands.clone());
        }

        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow!("memory store lock poisoned"))?;
        commands
            .into_iter()
            .map(|command| Self::apply(&mut entries, command))
            .collect()
    }
}

fn list_mut<'a>(entries: &'a mut HashMap<String, Entry>, key: &str) -> Result<&'a mut Vec<String>> {
    match entries
        .entry(key.to_string())
        .or_insert_with(|| Entry::List(Vec::new()))
    {
        Entry::List(list) => Ok(list),
        _ => Err(wrong_type(key)),
    }
}

fn wrong_type(key: &str) -> anyhow::Error {
    anyhow!("WRONGTYPE operation against key '{}' holding the wrong kind of value", key)
}

/// Redis-style inclusive range with negative indices counted from the end.
fn normalize_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    if len == 0 {
        return None;
    }
    let len = len as i64;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if start > stop || start >= len || stop < 0 {
        return None;
    }
    Some((start as usize, stop as usize))
}
