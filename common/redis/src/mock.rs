use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::testing::glob_match;
use crate::{Client, CustomRedisError, HashFields};

const WRONGTYPE: &str = "WRONGTYPE Operation against a key holding the wrong kind of value";

#[derive(Debug, Clone)]
enum MockEntry {
    String(String),
    Set(BTreeSet<String>),
    Hash(BTreeMap<String, String>),
}

/// In-memory [`Client`] with call recording and per-operation error injection.
///
/// Clones share the same keyspace, call log and queued failures.
#[derive(Clone, Default)]
pub struct MockRedisClient {
    keyspace: Arc<Mutex<HashMap<String, MockEntry>>>,
    failures: Arc<Mutex<HashMap<String, VecDeque<CustomRedisError>>>>,
    calls: Arc<Mutex<Vec<MockRedisCall>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl MockRedisClient {
    pub fn new() -> Self {
        Self::default()
    }

    // Helper method to safely lock the calls mutex
    fn lock_calls(&self) -> MutexGuard<'_, Vec<MockRedisCall>> {
        lock(&self.calls)
    }

    fn lock_keyspace(&self) -> MutexGuard<'_, HashMap<String, MockEntry>> {
        lock(&self.keyspace)
    }

    /// Make the next call of `op` (e.g. `"sadd"`, `"batch_sadd_hset"`) fail with `err`.
    /// Queued failures for the same op are returned in order.
    pub fn fail_next(&mut self, op: &str, err: CustomRedisError) -> Self {
        lock(&self.failures)
            .entry(op.to_owned())
            .or_default()
            .push_back(err);
        self.clone()
    }

    pub fn with_string(&mut self, key: &str, value: &str) -> Self {
        self.lock_keyspace()
            .insert(key.to_owned(), MockEntry::String(value.to_owned()));
        self.clone()
    }

    pub fn with_set(&mut self, key: &str, members: &[&str]) -> Self {
        let members = members.iter().map(|m| m.to_string()).collect();
        self.lock_keyspace()
            .insert(key.to_owned(), MockEntry::Set(members));
        self.clone()
    }

    pub fn with_hash(&mut self, key: &str, fields: &[(&str, &str)]) -> Self {
        let fields = fields
            .iter()
            .map(|(f, v)| (f.to_string(), v.to_string()))
            .collect();
        self.lock_keyspace()
            .insert(key.to_owned(), MockEntry::Hash(fields));
        self.clone()
    }

    pub fn get_calls(&self) -> Vec<MockRedisCall> {
        self.lock_calls().clone()
    }

    /// Operation names of every recorded call, in order.
    pub fn get_ops(&self) -> Vec<String> {
        self.lock_calls().iter().map(|c| c.op.clone()).collect()
    }

    pub fn clear_calls(&self) {
        self.lock_calls().clear();
    }

    /// Whether `key` currently exists in the mock keyspace.
    pub fn contains_key(&self, key: &str) -> bool {
        self.lock_keyspace().contains_key(key)
    }

    fn record(&self, op: &str, key: &str, value: MockRedisValue) -> Result<(), CustomRedisError> {
        self.lock_calls().push(MockRedisCall {
            op: op.to_string(),
            key: key.to_string(),
            value,
        });
        match lock(&self.failures).get_mut(op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn with_set_entry<T>(
        &self,
        k: &str,
        f: impl FnOnce(&BTreeSet<String>) -> T,
    ) -> Result<T, CustomRedisError> {
        match self.lock_keyspace().get(k) {
            None => Ok(f(&BTreeSet::new())),
            Some(MockEntry::Set(members)) => Ok(f(members)),
            Some(_) => Err(CustomRedisError::Server(WRONGTYPE.to_string())),
        }
    }

    fn add_members(&self, k: &str, members: Vec<String>) -> Result<u64, CustomRedisError> {
        let mut keyspace = self.lock_keyspace();
        let entry = keyspace
            .entry(k.to_owned())
            .or_insert_with(|| MockEntry::Set(BTreeSet::new()));
        match entry {
            MockEntry::Set(set) => Ok(members.into_iter().filter(|m| set.insert(m.clone())).count() as u64),
            _ => Err(CustomRedisError::Server(WRONGTYPE.to_string())),
        }
    }

    fn write_hash(&self, k: &str, fields: HashFields) -> Result<u64, CustomRedisError> {
        let mut keyspace = self.lock_keyspace();
        let entry = keyspace
            .entry(k.to_owned())
            .or_insert_with(|| MockEntry::Hash(BTreeMap::new()));
        match entry {
            MockEntry::Hash(hash) => Ok(fields
                .into_iter()
                .filter(|(f, v)| hash.insert(f.clone(), v.clone()).is_none())
                .count() as u64),
            _ => Err(CustomRedisError::Server(WRONGTYPE.to_string())),
        }
    }

    fn read_hash(&self, k: &str) -> Result<HashMap<String, String>, CustomRedisError> {
        match self.lock_keyspace().get(k) {
            None => Ok(HashMap::new()),
            Some(MockEntry::Hash(hash)) => Ok(hash.clone().into_iter().collect()),
            Some(_) => Err(CustomRedisError::Server(WRONGTYPE.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub enum MockRedisValue {
    None,
    String(String),
    VecString(Vec<String>),
    I64(i64),
    Fields(HashFields),
}

#[derive(Debug, Clone)]
pub struct MockRedisCall {
    pub op: String,
    pub key: String,
    pub value: MockRedisValue,
}

#[async_trait]
impl Client for MockRedisClient {
    async fn ping(&self) -> Result<(), CustomRedisError> {
        self.record("ping", "", MockRedisValue::None)
    }

    async fn get(&self, k: String) -> Result<Option<String>, CustomRedisError> {
        self.record("get", &k, MockRedisValue::None)?;
        match self.lock_keyspace().get(&k) {
            None => Ok(None),
            Some(MockEntry::String(value)) => Ok(Some(value.clone())),
            Some(_) => Err(CustomRedisError::Server(WRONGTYPE.to_string())),
        }
    }

    async fn set(&self, k: String, v: String) -> Result<(), CustomRedisError> {
        self.record("set", &k, MockRedisValue::String(v.clone()))?;
        self.lock_keyspace().insert(k, MockEntry::String(v));
        Ok(())
    }

    async fn del(&self, keys: Vec<String>) -> Result<u64, CustomRedisError> {
        self.record("del", &keys.join(" "), MockRedisValue::VecString(keys.clone()))?;
        let mut keyspace = self.lock_keyspace();
        Ok(keys.iter().filter(|k| keyspace.remove(*k).is_some()).count() as u64)
    }

    async fn sadd(&self, k: String, members: Vec<String>) -> Result<u64, CustomRedisError> {
        self.record("sadd", &k, MockRedisValue::VecString(members.clone()))?;
        self.add_members(&k, members)
    }

    async fn sismember(&self, k: String, member: String) -> Result<bool, CustomRedisError> {
        self.record("sismember", &k, MockRedisValue::String(member.clone()))?;
        self.with_set_entry(&k, |set| set.contains(&member))
    }

    async fn smismember(
        &self,
        k: String,
        members: Vec<String>,
    ) -> Result<Vec<bool>, CustomRedisError> {
        self.record("smismember", &k, MockRedisValue::VecString(members.clone()))?;
        self.with_set_entry(&k, |set| members.iter().map(|m| set.contains(m)).collect())
    }

    async fn smembers(&self, k: String) -> Result<Vec<String>, CustomRedisError> {
        self.record("smembers", &k, MockRedisValue::None)?;
        self.with_set_entry(&k, |set| set.iter().cloned().collect())
    }

    async fn scard(&self, k: String) -> Result<u64, CustomRedisError> {
        self.record("scard", &k, MockRedisValue::None)?;
        self.with_set_entry(&k, |set| set.len() as u64)
    }

    async fn srandmember(&self, k: String, count: i64) -> Result<Vec<String>, CustomRedisError> {
        self.record("srandmember", &k, MockRedisValue::I64(count))?;
        let take = usize::try_from(count).unwrap_or(0);
        self.with_set_entry(&k, |set| set.iter().take(take).cloned().collect())
    }

    async fn hset(&self, k: String, fields: HashFields) -> Result<u64, CustomRedisError> {
        self.record("hset", &k, MockRedisValue::Fields(fields.clone()))?;
        self.write_hash(&k, fields)
    }

    async fn hgetall(&self, k: String) -> Result<HashMap<String, String>, CustomRedisError> {
        self.record("hgetall", &k, MockRedisValue::None)?;
        self.read_hash(&k)
    }

    async fn keys(&self, pattern: String) -> Result<Vec<String>, CustomRedisError> {
        self.record("keys", &pattern, MockRedisValue::None)?;
        let mut keys: Vec<String> = self
            .lock_keyspace()
            .keys()
            .filter(|k| glob_match(pattern.as_bytes(), k.as_bytes()))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn key_type(&self, k: String) -> Result<String, CustomRedisError> {
        self.record("key_type", &k, MockRedisValue::None)?;
        let name = match self.lock_keyspace().get(&k) {
            None => "none",
            Some(MockEntry::String(_)) => "string",
            Some(MockEntry::Set(_)) => "set",
            Some(MockEntry::Hash(_)) => "hash",
        };
        Ok(name.to_string())
    }

    async fn dbsize(&self) -> Result<u64, CustomRedisError> {
        self.record("dbsize", "", MockRedisValue::None)?;
        Ok(self.lock_keyspace().len() as u64)
    }

    async fn flushdb(&self) -> Result<(), CustomRedisError> {
        self.record("flushdb", "", MockRedisValue::None)?;
        self.lock_keyspace().clear();
        Ok(())
    }

    async fn batch_sadd_hset(
        &self,
        set_key: String,
        members: Vec<String>,
        hashes: Vec<(String, HashFields)>,
    ) -> Result<(), CustomRedisError> {
        self.record(
            "batch_sadd_hset",
            &set_key,
            MockRedisValue::VecString(members.clone()),
        )?;
        if !members.is_empty() {
            self.add_members(&set_key, members)?;
        }
        for (key, fields) in hashes {
            self.write_hash(&key, fields)?;
        }
        Ok(())
    }

    async fn batch_hgetall(
        &self,
        keys: Vec<String>,
    ) -> Result<Vec<HashMap<String, String>>, CustomRedisError> {
        self.record(
            "batch_hgetall",
            &keys.join(" "),
            MockRedisValue::VecString(keys.clone()),
        )?;
        keys.iter().map(|k| self.read_hash(k)).collect()
    }

    async fn close(&self) -> Result<(), CustomRedisError> {
        self.record("close", "", MockRedisValue::None)
    }
}
