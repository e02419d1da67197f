//! In-memory RESP server for exercising the real client stack without a live Redis.
//!
//! [`FakeRedisServer`] speaks the wire protocol over [`tokio::io::duplex`] pipes and implements
//! the handful of commands this crate issues. It can split and delay its replies, drop
//! connections on demand, require a password and pretend to predate SMISMEMBER.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use crate::codec::{decode_one, Reply};
use crate::connection::{BoxedTransport, Connector};
use crate::CustomRedisError;

const DUPLEX_CAPACITY: usize = 1 << 20;

#[derive(Debug, Clone)]
enum Value {
    String(String),
    Set(BTreeSet<String>),
    Hash(BTreeMap<String, String>),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Value::String(_) => "string",
            Value::Set(_) => "set",
            Value::Hash(_) => "hash",
        }
    }
}

type Keyspace = HashMap<String, Value>;

#[derive(Default)]
struct ServerState {
    dbs: HashMap<i64, Keyspace>,
    password: Option<String>,
    without_smismember: bool,
    reply_chunk_size: Option<usize>,
    reply_delay: Option<Duration>,
    stalled: bool,
    /// Each entry drops one connection after that many more commands have been answered.
    drop_plans: VecDeque<usize>,
    commands: Vec<Vec<String>>,
    connections: u32,
}

/// Per-connection state: selected database and whether AUTH succeeded.
struct ClientSession {
    db: i64,
    authenticated: bool,
}

enum Action {
    Reply(Reply),
    Drop,
    Stall,
}

#[derive(Clone, Default)]
pub struct FakeRedisServer {
    state: Arc<Mutex<ServerState>>,
}

impl FakeRedisServer {
    pub fn new() -> Self {
        Self::default()
    }

    // Helper method to safely lock the state mutex
    fn lock_state(&self) -> MutexGuard<'_, ServerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Require `AUTH <password>` before any other command.
    pub fn with_password(self, password: &str) -> Self {
        self.lock_state().password = Some(password.to_string());
        self
    }

    /// Answer SMISMEMBER with "unknown command", like servers older than 6.2.
    pub fn without_smismember(self) -> Self {
        self.lock_state().without_smismember = true;
        self
    }

    /// Write each reply in pieces of at most `size` bytes, yielding between pieces.
    pub fn with_reply_chunk_size(self, size: usize) -> Self {
        self.lock_state().reply_chunk_size = Some(size.max(1));
        self
    }

    /// Sleep before writing each reply.
    pub fn with_reply_delay(self, delay: Duration) -> Self {
        self.lock_state().reply_delay = Some(delay);
        self
    }

    /// Read commands but never answer them while set.
    pub fn stall_replies(&self, stalled: bool) {
        self.lock_state().stalled = stalled;
    }

    /// Close the connection that receives the command arriving after `commands` more have been
    /// answered, without replying to it. Calls queue up: each one drops one connection.
    pub fn drop_connection_after(&self, commands: usize) {
        self.lock_state().drop_plans.push_back(commands);
    }

    /// Every command received so far, handshake included, as upper-cased name plus arguments.
    pub fn commands(&self) -> Vec<Vec<String>> {
        self.lock_state().commands.clone()
    }

    pub fn command_names(&self) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter_map(|args| args.into_iter().next())
            .collect()
    }

    pub fn clear_commands(&self) {
        self.lock_state().commands.clear();
    }

    pub fn connections(&self) -> u32 {
        self.lock_state().connections
    }

    /// Members of the set at `key` in database 0.
    pub fn set_members(&self, key: &str) -> BTreeSet<String> {
        match self.lock_state().dbs.get(&0).and_then(|db| db.get(key)) {
            Some(Value::Set(members)) => members.clone(),
            _ => BTreeSet::new(),
        }
    }

    /// Fields of the hash at `key` in database 0.
    pub fn hash(&self, key: &str) -> BTreeMap<String, String> {
        match self.lock_state().dbs.get(&0).and_then(|db| db.get(key)) {
            Some(Value::Hash(fields)) => fields.clone(),
            _ => BTreeMap::new(),
        }
    }

    /// Keys present in database `db`, sorted.
    pub fn keys_in(&self, db: i64) -> Vec<String> {
        let state = self.lock_state();
        let mut keys: Vec<String> = state
            .dbs
            .get(&db)
            .map(|keyspace| keyspace.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    /// Remove `key` from database 0 behind the client's back.
    pub fn remove_key(&self, key: &str) {
        if let Some(db) = self.lock_state().dbs.get_mut(&0) {
            db.remove(key);
        }
    }

    /// Open a new client connection to this server.
    pub fn connect(&self) -> DuplexStream {
        let (client, server_side) = tokio::io::duplex(DUPLEX_CAPACITY);
        self.lock_state().connections += 1;
        let server = self.clone();
        tokio::spawn(async move { server.serve(server_side).await });
        client
    }

    async fn serve(self, mut stream: DuplexStream) {
        let mut buf = BytesMut::new();
        let mut session = ClientSession {
            db: 0,
            authenticated: self.lock_state().password.is_none(),
        };

        loop {
            let args = match decode_one(&buf) {
                Ok(Some((frame, consumed))) => {
                    buf.advance(consumed);
                    match frame.into_string_vec() {
                        Ok(args) if !args.is_empty() => args,
                        _ => {
                            let reply = Reply::Error("ERR Protocol error".to_string());
                            stream.write_all(&reply.to_bytes()).await.ok();
                            return;
                        }
                    }
                }
                Ok(None) => match stream.read_buf(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(_) => continue,
                },
                Err(_) => return,
            };

            match self.handle(args, &mut session) {
                Action::Reply(reply) => {
                    if self.write_reply(&mut stream, &reply).await.is_err() {
                        return;
                    }
                }
                Action::Stall => continue,
                Action::Drop => return,
            }
        }
    }

    async fn write_reply(
        &self,
        stream: &mut DuplexStream,
        reply: &Reply,
    ) -> std::io::Result<()> {
        let (chunk_size, delay) = {
            let state = self.lock_state();
            (state.reply_chunk_size, state.reply_delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let bytes = reply.to_bytes();
        match chunk_size {
            Some(size) => {
                for piece in bytes.chunks(size) {
                    stream.write_all(piece).await?;
                    stream.flush().await?;
                    tokio::task::yield_now().await;
                }
            }
            None => stream.write_all(&bytes).await?,
        }
        stream.flush().await
    }

    fn handle(&self, mut args: Vec<String>, session: &mut ClientSession) -> Action {
        args[0] = args[0].to_ascii_uppercase();
        let mut state = self.lock_state();
        state.commands.push(args.clone());

        match state.drop_plans.front().copied() {
            Some(0) => {
                state.drop_plans.pop_front();
                return Action::Drop;
            }
            Some(remaining) => state.drop_plans[0] = remaining - 1,
            None => {}
        }
        if state.stalled {
            return Action::Stall;
        }

        let name = args[0].as_str();
        if name == "AUTH" {
            return Action::Reply(auth(&state, &args, session));
        }
        if !session.authenticated {
            return Action::Reply(error("NOAUTH Authentication required."));
        }
        if name == "SMISMEMBER" && state.without_smismember {
            return Action::Reply(unknown_command(&args));
        }

        let db = state.dbs.entry(session.db).or_default();
        let reply = match name {
            "PING" => Reply::SimpleString("PONG".to_string()),
            "SELECT" => match args.get(1).and_then(|n| n.parse::<i64>().ok()) {
                Some(index) if (0..16).contains(&index) => {
                    session.db = index;
                    Reply::ok()
                }
                _ => error("ERR DB index is out of range"),
            },
            _ => run_data_command(db, &args),
        };
        Action::Reply(reply)
    }
}

fn auth(state: &ServerState, args: &[String], session: &mut ClientSession) -> Reply {
    match (&state.password, args.get(1)) {
        (None, _) => error(
            "ERR AUTH <password> called without any password configured for the default user. \
             Are you sure your configuration is correct?",
        ),
        (Some(expected), Some(given)) if expected == given => {
            session.authenticated = true;
            Reply::ok()
        }
        _ => error("WRONGPASS invalid username-password pair or user is disabled."),
    }
}

fn error(message: &str) -> Reply {
    Reply::Error(message.to_string())
}

fn wrong_type() -> Reply {
    error("WRONGTYPE Operation against a key holding the wrong kind of value")
}

fn wrong_arity(name: &str) -> Reply {
    Reply::Error(format!(
        "ERR wrong number of arguments for '{}' command",
        name.to_ascii_lowercase()
    ))
}

fn unknown_command(args: &[String]) -> Reply {
    Reply::Error(format!(
        "ERR unknown command '{}', with args beginning with: ",
        args[0]
    ))
}

fn bulk_array(items: impl IntoIterator<Item = String>) -> Reply {
    Reply::Array(Some(items.into_iter().map(Reply::bulk).collect()))
}

fn count(n: usize) -> Reply {
    Reply::Integer(n as i64)
}

fn run_data_command(db: &mut Keyspace, args: &[String]) -> Reply {
    let name = args[0].as_str();
    let min_args = match name {
        "DBSIZE" | "FLUSHDB" => 1,
        "GET" | "DEL" | "SMEMBERS" | "SCARD" | "HGETALL" | "KEYS" | "TYPE" => 2,
        "SET" | "SADD" | "SISMEMBER" | "SMISMEMBER" | "SRANDMEMBER" => 3,
        "HSET" => 4,
        _ => return unknown_command(args),
    };
    if args.len() < min_args || (name == "HSET" && args.len() % 2 != 0) {
        return wrong_arity(name);
    }

    let key = args.get(1).map(String::as_str).unwrap_or_default();
    match name {
        "GET" => match db.get(key) {
            None => Reply::BulkString(None),
            Some(Value::String(value)) => Reply::bulk(value.clone()),
            Some(_) => wrong_type(),
        },
        "SET" => {
            db.insert(key.to_string(), Value::String(args[2].clone()));
            Reply::ok()
        }
        "DEL" => count(args[1..].iter().filter(|k| db.remove(*k).is_some()).count()),
        "SADD" => {
            let entry = db
                .entry(key.to_string())
                .or_insert_with(|| Value::Set(BTreeSet::new()));
            match entry {
                Value::Set(members) => {
                    count(args[2..].iter().filter(|m| members.insert((*m).clone())).count())
                }
                _ => wrong_type(),
            }
        }
        "SISMEMBER" | "SMISMEMBER" | "SMEMBERS" | "SCARD" | "SRANDMEMBER" => {
            let empty = BTreeSet::new();
            let members = match db.get(key) {
                None => &empty,
                Some(Value::Set(members)) => members,
                Some(_) => return wrong_type(),
            };
            match name {
                "SISMEMBER" => Reply::Integer(i64::from(members.contains(&args[2]))),
                "SMISMEMBER" => Reply::Array(Some(
                    args[2..]
                        .iter()
                        .map(|m| Reply::Integer(i64::from(members.contains(m))))
                        .collect(),
                )),
                "SMEMBERS" => bulk_array(members.iter().cloned()),
                "SCARD" => count(members.len()),
                _ => match args[2].parse::<usize>() {
                    Ok(n) => bulk_array(members.iter().take(n).cloned()),
                    Err(_) => error("ERR value is not an integer or out of range"),
                },
            }
        }
        "HSET" => {
            let entry = db
                .entry(key.to_string())
                .or_insert_with(|| Value::Hash(BTreeMap::new()));
            match entry {
                Value::Hash(fields) => count(
                    args[2..]
                        .chunks(2)
                        .filter(|pair| fields.insert(pair[0].clone(), pair[1].clone()).is_none())
                        .count(),
                ),
                _ => wrong_type(),
            }
        }
        "HGETALL" => match db.get(key) {
            None => Reply::Array(Some(Vec::new())),
            Some(Value::Hash(fields)) => bulk_array(
                fields
                    .iter()
                    .flat_map(|(field, value)| [field.clone(), value.clone()]),
            ),
            Some(_) => wrong_type(),
        },
        "KEYS" => {
            let mut matching: Vec<String> = db
                .keys()
                .filter(|candidate| glob_match(key.as_bytes(), candidate.as_bytes()))
                .cloned()
                .collect();
            matching.sort();
            bulk_array(matching)
        }
        "TYPE" => Reply::SimpleString(
            db.get(key)
                .map(Value::type_name)
                .unwrap_or("none")
                .to_string(),
        ),
        "DBSIZE" => count(db.len()),
        "FLUSHDB" => {
            db.clear();
            Reply::ok()
        }
        _ => unknown_command(args),
    }
}

/// Redis KEYS glob: `*`, `?`, `[...]` classes (with `^` and ranges) and `\` escapes.
pub(crate) fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    match (pattern.first(), text.first()) {
        (None, None) => true,
        (Some(b'*'), _) => {
            glob_match(&pattern[1..], text) || (!text.is_empty() && glob_match(pattern, &text[1..]))
        }
        (Some(b'?'), Some(_)) => glob_match(&pattern[1..], &text[1..]),
        (Some(b'['), Some(t)) => match match_class(&pattern[1..], *t) {
            Some((true, rest)) => glob_match(rest, &text[1..]),
            _ => false,
        },
        (Some(b'\\'), Some(t)) if pattern.len() > 1 => {
            pattern[1] == *t && glob_match(&pattern[2..], &text[1..])
        }
        (Some(p), Some(t)) if p == t => glob_match(&pattern[1..], &text[1..]),
        _ => false,
    }
}

/// Match `byte` against the class body after `[`. Returns the verdict and the pattern after
/// the closing `]`, or `None` for an unterminated class.
fn match_class(class: &[u8], byte: u8) -> Option<(bool, &[u8])> {
    let (negated, mut rest) = match class.first() {
        Some(b'^') => (true, &class[1..]),
        _ => (false, class),
    };
    let mut matched = false;
    loop {
        match rest {
            [] => return None,
            [b']', tail @ ..] => return Some((matched != negated, tail)),
            [b'\\', escaped, tail @ ..] => {
                matched |= *escaped == byte;
                rest = tail;
            }
            [low, b'-', high, tail @ ..] if *high != b']' => {
                let (low, high) = if low <= high { (*low, *high) } else { (*high, *low) };
                matched |= (low..=high).contains(&byte);
                rest = tail;
            }
            [single, tail @ ..] => {
                matched |= *single == byte;
                rest = tail;
            }
        }
    }
}

/// [`Connector`] handing out connections to a [`FakeRedisServer`], with injectable refusals.
pub struct FakeConnector {
    server: FakeRedisServer,
    attempts: AtomicU32,
    refusals: AtomicU32,
}

impl FakeConnector {
    pub fn new(server: FakeRedisServer) -> Self {
        Self {
            server,
            attempts: AtomicU32::new(0),
            refusals: AtomicU32::new(0),
        }
    }

    /// Refuse the next `n` connect attempts. `u32::MAX` effectively refuses forever.
    pub fn refuse_next(&self, n: u32) {
        self.refusals.store(n, Ordering::SeqCst);
    }

    /// Connect attempts made so far, refused ones included.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn server(&self) -> &FakeRedisServer {
        &self.server
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self) -> Result<BoxedTransport, CustomRedisError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "connection refused",
            )
            .into());
        }
        Ok(Box::new(self.server.connect()))
    }

    fn describe(&self) -> String {
        "fake-redis".to_string()
    }
}
