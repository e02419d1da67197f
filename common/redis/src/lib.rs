//! Hand-built async client for the Redis serialization protocol (RESP).
//!
//! The crate is layered leaf to root:
//!
//! - [`codec`]: encodes [`Cmd`]s and incrementally decodes [`Reply`]s.
//! - [`connection`]: owns the transport, runs the AUTH/SELECT handshake and the
//!   bounded reconnect loop.
//! - [`pipeline`]: serializes request/response cycles on the connection and matches
//!   replies to commands by arrival order.
//! - [`RedisClient`]: the typed [`Client`] implementation used by services.
//!
//! [`MockRedisClient`] and [`testing::FakeRedisServer`] stand in for a live server in tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Coarse classification of [`CustomRedisError`], stable across variants' payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ProtocolViolation,
    Transport,
    Server,
    ReconnectExhausted,
    Timeout,
    InvalidConfiguration,
    UnexpectedReply,
    NotConnected,
}

/// How the pipeline layer reacts to a failed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryMethod {
    /// Surface the error to the caller as-is.
    NoRetry,
    /// The connection is broken: reconnect, then retry the request once.
    Reconnect,
}

#[derive(Error, Debug, Clone)]
pub enum CustomRedisError {
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),
    #[error(transparent)]
    Transport(#[from] Arc<std::io::Error>),
    #[error("Server error: {0}")]
    Server(String),
    #[error("Reconnect exhausted after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },
    #[error("Timeout error")]
    Timeout,
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),
    #[error("Connection closed")]
    NotConnected,
}

impl From<std::io::Error> for CustomRedisError {
    fn from(err: std::io::Error) -> Self {
        CustomRedisError::Transport(Arc::new(err))
    }
}

impl CustomRedisError {
    /// Transport failure that did not originate from an io call, e.g. EOF mid-reply.
    pub fn connection_lost(reason: &str) -> Self {
        CustomRedisError::Transport(Arc::new(std::io::Error::new(
            std::io::ErrorKind::ConnectionAborted,
            reason.to_string(),
        )))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            CustomRedisError::ProtocolViolation(_) => ErrorKind::ProtocolViolation,
            CustomRedisError::Transport(_) => ErrorKind::Transport,
            CustomRedisError::Server(_) => ErrorKind::Server,
            CustomRedisError::ReconnectExhausted { .. } => ErrorKind::ReconnectExhausted,
            CustomRedisError::Timeout => ErrorKind::Timeout,
            CustomRedisError::InvalidConfiguration(_) => ErrorKind::InvalidConfiguration,
            CustomRedisError::UnexpectedReply(_) => ErrorKind::UnexpectedReply,
            CustomRedisError::NotConnected => ErrorKind::NotConnected,
        }
    }

    /// Determine if this error is unrecoverable and should not be retried
    ///
    /// Returns `true` for protocol violations, server-side rejections and permanent failures.
    /// Returns `false` for transient network issues that may resolve after reconnecting.
    pub fn is_unrecoverable_error(&self) -> bool {
        match self {
            // Transport failures and timeouts are transient
            CustomRedisError::Transport(_) | CustomRedisError::Timeout => false,

            // The byte stream can no longer be trusted
            CustomRedisError::ProtocolViolation(_) => true,

            // Command-level rejections, e.g. WRONGPASS or WRONGTYPE
            CustomRedisError::Server(_) => true,

            CustomRedisError::ReconnectExhausted { .. } => true,
            CustomRedisError::InvalidConfiguration(_) => true,
            CustomRedisError::UnexpectedReply(_) => true,
            CustomRedisError::NotConnected => true,
        }
    }

    /// Determine the appropriate retry strategy for this error
    ///
    /// Only transport failures are retried, and only by reconnecting first. Timeouts tear the
    /// connection down but are not retried: the caller decides whether to wait again.
    pub fn retry_method(&self) -> RetryMethod {
        match self {
            CustomRedisError::Transport(_) => RetryMethod::Reconnect,
            _ => RetryMethod::NoRetry,
        }
    }

    /// Whether the connection must be discarded after this error.
    pub(crate) fn tears_down_connection(&self) -> bool {
        matches!(
            self,
            CustomRedisError::Transport(_)
                | CustomRedisError::ProtocolViolation(_)
                | CustomRedisError::Timeout
        )
    }
}

/// Field/value pairs of a hash, in write order.
pub type HashFields = Vec<(String, String)>;

#[async_trait]
pub trait Client {
    async fn ping(&self) -> Result<(), CustomRedisError>;

    async fn get(&self, k: String) -> Result<Option<String>, CustomRedisError>;
    async fn set(&self, k: String, v: String) -> Result<(), CustomRedisError>;
    /// Returns the number of keys that existed and were removed.
    async fn del(&self, keys: Vec<String>) -> Result<u64, CustomRedisError>;

    /// Returns the number of members that were not already present.
    async fn sadd(&self, k: String, members: Vec<String>) -> Result<u64, CustomRedisError>;
    async fn sismember(&self, k: String, member: String) -> Result<bool, CustomRedisError>;
    /// Membership of every member in one round trip, in input order.
    async fn smismember(
        &self,
        k: String,
        members: Vec<String>,
    ) -> Result<Vec<bool>, CustomRedisError>;
    async fn smembers(&self, k: String) -> Result<Vec<String>, CustomRedisError>;
    async fn scard(&self, k: String) -> Result<u64, CustomRedisError>;
    async fn srandmember(&self, k: String, count: i64) -> Result<Vec<String>, CustomRedisError>;

    /// Returns the number of fields that were newly created.
    async fn hset(&self, k: String, fields: HashFields) -> Result<u64, CustomRedisError>;
    /// Missing keys come back as an empty map.
    async fn hgetall(&self, k: String) -> Result<HashMap<String, String>, CustomRedisError>;

    async fn keys(&self, pattern: String) -> Result<Vec<String>, CustomRedisError>;
    async fn key_type(&self, k: String) -> Result<String, CustomRedisError>;
    async fn dbsize(&self) -> Result<u64, CustomRedisError>;
    async fn flushdb(&self) -> Result<(), CustomRedisError>;

    /// Adds `members` to the set at `set_key` and writes every hash in a single pipeline.
    async fn batch_sadd_hset(
        &self,
        set_key: String,
        members: Vec<String>,
        hashes: Vec<(String, HashFields)>,
    ) -> Result<(), CustomRedisError>;
    /// HGETALL for every key in a single pipeline, in input order.
    async fn batch_hgetall(
        &self,
        keys: Vec<String>,
    ) -> Result<Vec<HashMap<String, String>>, CustomRedisError>;

    async fn close(&self) -> Result<(), CustomRedisError>;
}

// Module declarations
mod client;
pub mod cmd;
pub mod codec;
pub mod connection;
pub mod metrics_consts;
mod mock;
pub mod pipeline;
pub mod testing;

// Re-export public APIs
pub use client::RedisClient;
pub use cmd::{cmd, pipe, Cmd, Pipeline, ToRedisArg};
pub use codec::{decode_one, encode, Reply, RespCodec};
pub use connection::{
    ConnectionConfig, ConnectionManager, ConnectionState, Connector, TcpConnector, Transport,
};
pub use mock::{MockRedisCall, MockRedisClient, MockRedisValue};
pub use pipeline::PipelineEngine;
