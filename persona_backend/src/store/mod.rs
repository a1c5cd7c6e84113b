//! Remote key-value persistence.
//!
//! - `KvStore` is the transport seam (REST service in production,
//!   `MemoryKv` in tests).
//! - `StateStore` maps `AgentState` onto granular keys.
//! - `migration` owns the legacy-blob migration and cold-boot protocol.
//! - `BackupManager` keeps timestamped snapshots under a capped index.

pub mod adapter;
pub mod backup;
pub mod debounce;
pub mod memory;
pub mod migration;
pub mod rest;

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use async_trait::async_trait;

pub use adapter::StateStore;
pub use backup::BackupManager;
pub use memory::MemoryKv;
pub use rest::RestKv;

/// One command against the key-value service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvCommand {
    Get(String),
    Set(String, String),
    Del(String),
    Exists(String),
    RPush(String, Vec<String>),
    LPush(String, Vec<String>),
    LRange(String, i64, i64),
    LTrim(String, i64, i64),
    HSet(String, Vec<(String, String)>),
    HGetAll(String),
    HDel(String, Vec<String>),
}

impl KvCommand {
    pub fn name(&self) -> &'static str {
        match self {
            KvCommand::Get(_) => "GET",
            KvCommand::Set(..) => "SET",
            KvCommand::Del(_) => "DEL",
            KvCommand::Exists(_) => "EXISTS",
            KvCommand::RPush(..) => "RPUSH",
            KvCommand::LPush(..) => "LPUSH",
            KvCommand::LRange(..) => "LRANGE",
            KvCommand::LTrim(..) => "LTRIM",
            KvCommand::HSet(..) => "HSET",
            KvCommand::HGetAll(_) => "HGETALL",
            KvCommand::HDel(..) => "HDEL",
        }
    }

    pub fn key(&self) -> &str {
        match self {
            KvCommand::Get(key)
            | KvCommand::Set(key, _)
            | KvCommand::Del(key)
            | KvCommand::Exists(key)
            | KvCommand::RPush(key, _)
            | KvCommand::LPush(key, _)
            | KvCommand::LRange(key, ..)
            | KvCommand::LTrim(key, ..)
            | KvCommand::HSet(key, _)
            | KvCommand::HGetAll(key)
            | KvCommand::HDel(key, _) => key,
        }
    }

    /// Wire form: command name followed by its arguments.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![self.name().to_string(), self.key().to_string()];
        match self {
            KvCommand::Get(_) | KvCommand::Del(_) | KvCommand::Exists(_) | KvCommand::HGetAll(_) => {}
            KvCommand::Set(_, value) => args.push(value.clone()),
            KvCommand::RPush(_, values) | KvCommand::LPush(_, values) => {
                args.extend(values.iter().cloned())
            }
            KvCommand::LRange(_, start, stop) | KvCommand::LTrim(_, start, stop) => {
                args.push(start.to_string());
                args.push(stop.to_string());
            }
            KvCommand::HSet(_, pairs) => {
                for (field, value) in pairs {
                    args.push(field.clone());
                    args.push(value.clone());
                }
            }
            KvCommand::HDel(_, fields) => args.extend(fields.iter().cloned()),
        }
        args
    }

    /// Bytes this command puts on the wire; used to reason about write cost.
    pub fn payload_len(&self) -> usize {
        self.to_args().iter().map(String::len).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvReply {
    Nil,
    Integer(i64),
    Text(String),
    List(Vec<String>),
}

impl KvReply {
    pub fn into_text(self) -> Option<String> {
        match self {
            KvReply::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn into_list(self) -> Result<Vec<String>> {
        match self {
            KvReply::List(items) => Ok(items),
            KvReply::Nil => Ok(Vec::new()),
            other => bail!("expected a list reply, got {:?}", other),
        }
    }

    /// HGETALL replies are flat `[field, value, field, value, ...]` lists.
    pub fn into_hash(self) -> Result<BTreeMap<String, String>> {
        let items = self.into_list()?;
        if items.len() % 2 != 0 {
            bail!("hash reply has an odd number of elements ({})", items.len());
        }
        let mut map = BTreeMap::new();
        let mut iter = items.into_iter();
        while let (Some(field), Some(value)) = (iter.next(), iter.next()) {
            map.insert(field, value);
        }
        Ok(map)
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            KvReply::Integer(value) => Some(*value),
            _ => None,
        }
    }
}

/// Transport to the key-value service.
///
/// `pipeline` executes commands in order and returns one reply per command.
/// There is no cross-command rollback: a failed batch may be partially
/// applied.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn pipeline(&self, commands: Vec<KvCommand>) -> Result<Vec<KvReply>>;

    async fn exec(&self, command: KvCommand) -> Result<KvReply> {
        let name = command.name();
        let mut replies = self.pipeline(vec![command]).await?;
        match replies.pop() {
            Some(reply) => Ok(reply),
            None => bail!("{} returned no reply", name),
        }
    }
}
