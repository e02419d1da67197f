use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

use crate::cmd::{cmd, Cmd, Pipeline};
use crate::codec::Reply;
use crate::connection::{
    ConnectionConfig, ConnectionManager, ConnectionState, Connector, TcpConnector,
};
use crate::pipeline::PipelineEngine;
use crate::{Client, CustomRedisError, HashFields};

pub struct RedisClient {
    engine: PipelineEngine,
    /// Cleared the first time the server rejects SMISMEMBER as unknown (servers before 6.2).
    native_smismember: AtomicBool,
}

impl RedisClient {
    /// Create a new RedisClient and connect it
    ///
    /// Connects over TCP, or TLS when `config.tls` is set, then runs the handshake
    /// (AUTH when a password is configured, SELECT when `db` is non-zero).
    ///
    /// # Errors
    /// Returns `CustomRedisError::InvalidConfiguration` if the configuration does not validate,
    /// or the connect/handshake error if the first connect fails. The first connect is not
    /// retried; automatic reconnection only applies to connections that were once `Ready`.
    ///
    /// # Examples
    /// ```no_run
    /// use common_redis::{Client, ConnectionConfig, RedisClient};
    /// use std::time::Duration;
    ///
    /// # async fn example() {
    /// let config = ConnectionConfig::new("localhost", 6379)
    ///     .with_password("secret")
    ///     .with_db(2)
    ///     .with_response_timeout(Some(Duration::from_secs(5)));
    /// let client = RedisClient::new(config).await.unwrap();
    /// client.ping().await.unwrap();
    /// # }
    /// ```
    pub async fn new(config: ConnectionConfig) -> Result<RedisClient, CustomRedisError> {
        config.validate()?;
        let connector = TcpConnector::from_config(&config)?;
        Self::with_connector(config, Arc::new(connector)).await
    }

    /// Create a client over a custom [`Connector`], e.g. an in-memory server in tests.
    pub async fn with_connector(
        config: ConnectionConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<RedisClient, CustomRedisError> {
        let manager = Arc::new(ConnectionManager::new(config, connector)?);
        manager.connect().await?;
        Ok(RedisClient {
            engine: PipelineEngine::new(manager),
            native_smismember: AtomicBool::new(true),
        })
    }

    pub fn engine(&self) -> &PipelineEngine {
        &self.engine
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.engine.connection().state()
    }

    /// Reconnect explicitly, e.g. after `ReconnectExhausted` or `close()`.
    pub async fn connect(&self) -> Result<(), CustomRedisError> {
        self.engine.connection().connect().await
    }

    async fn run(&self, command: Cmd) -> Result<Reply, CustomRedisError> {
        self.engine.execute(&command).await
    }

    /// Execute a pipeline and fail on the first per-command error reply.
    async fn run_all(&self, pipeline: &Pipeline) -> Result<Vec<Reply>, CustomRedisError> {
        self.engine
            .query(pipeline)
            .await?
            .into_iter()
            .map(Reply::into_result)
            .collect()
    }

    async fn sismember_pipelined(
        &self,
        k: &str,
        members: &[String],
    ) -> Result<Vec<bool>, CustomRedisError> {
        let mut pipeline = Pipeline::default();
        for member in members {
            pipeline.add(cmd("SISMEMBER").arg(k).arg(member));
        }
        self.run_all(&pipeline)
            .await?
            .into_iter()
            .map(Reply::into_bool)
            .collect()
    }
}

fn is_unknown_command(err: &CustomRedisError) -> bool {
    matches!(err, CustomRedisError::Server(msg) if msg.to_ascii_lowercase().contains("unknown command"))
}

#[async_trait]
impl Client for RedisClient {
    async fn ping(&self) -> Result<(), CustomRedisError> {
        self.run(cmd("PING")).await?.into_status()?;
        Ok(())
    }

    async fn get(&self, k: String) -> Result<Option<String>, CustomRedisError> {
        self.run(cmd("GET").arg(k)).await?.into_optional_string()
    }

    async fn set(&self, k: String, v: String) -> Result<(), CustomRedisError> {
        self.run(cmd("SET").arg(k).arg(v)).await?.into_status()?;
        Ok(())
    }

    async fn del(&self, keys: Vec<String>) -> Result<u64, CustomRedisError> {
        if keys.is_empty() {
            return Ok(0);
        }
        self.run(cmd("DEL").args(keys)).await?.into_count()
    }

    async fn sadd(&self, k: String, members: Vec<String>) -> Result<u64, CustomRedisError> {
        if members.is_empty() {
            return Ok(0);
        }
        self.run(cmd("SADD").arg(k).args(members))
            .await?
            .into_count()
    }

    async fn sismember(&self, k: String, member: String) -> Result<bool, CustomRedisError> {
        self.run(cmd("SISMEMBER").arg(k).arg(member))
            .await?
            .into_bool()
    }

    async fn smismember(
        &self,
        k: String,
        members: Vec<String>,
    ) -> Result<Vec<bool>, CustomRedisError> {
        if members.is_empty() {
            return Ok(vec![]);
        }
        if self.native_smismember.load(Ordering::Relaxed) {
            match self.run(cmd("SMISMEMBER").arg(&k).args(&members)).await {
                Ok(reply) => return reply.into_bool_vec(),
                Err(e) if is_unknown_command(&e) => {
                    info!("Server does not support SMISMEMBER, falling back to pipelined SISMEMBER");
                    self.native_smismember.store(false, Ordering::Relaxed);
                }
                Err(e) => return Err(e),
            }
        }
        self.sismember_pipelined(&k, &members).await
    }

    async fn smembers(&self, k: String) -> Result<Vec<String>, CustomRedisError> {
        self.run(cmd("SMEMBERS").arg(k)).await?.into_string_vec()
    }

    async fn scard(&self, k: String) -> Result<u64, CustomRedisError> {
        self.run(cmd("SCARD").arg(k)).await?.into_count()
    }

    async fn srandmember(&self, k: String, count: i64) -> Result<Vec<String>, CustomRedisError> {
        self.run(cmd("SRANDMEMBER").arg(k).arg(count))
            .await?
            .into_string_vec()
    }

    async fn hset(&self, k: String, fields: HashFields) -> Result<u64, CustomRedisError> {
        if fields.is_empty() {
            return Ok(0);
        }
        let command = fields
            .into_iter()
            .fold(cmd("HSET").arg(k), |command, (field, value)| {
                command.arg(field).arg(value)
            });
        self.run(command).await?.into_count()
    }

    async fn hgetall(&self, k: String) -> Result<HashMap<String, String>, CustomRedisError> {
        self.run(cmd("HGETALL").arg(k)).await?.into_string_map()
    }

    async fn keys(&self, pattern: String) -> Result<Vec<String>, CustomRedisError> {
        self.run(cmd("KEYS").arg(pattern)).await?.into_string_vec()
    }

    async fn key_type(&self, k: String) -> Result<String, CustomRedisError> {
        self.run(cmd("TYPE").arg(k)).await?.into_status()
    }

    async fn dbsize(&self) -> Result<u64, CustomRedisError> {
        self.run(cmd("DBSIZE")).await?.into_count()
    }

    async fn flushdb(&self) -> Result<(), CustomRedisError> {
        self.run(cmd("FLUSHDB")).await?.into_status()?;
        Ok(())
    }

    async fn batch_sadd_hset(
        &self,
        set_key: String,
        members: Vec<String>,
        hashes: Vec<(String, HashFields)>,
    ) -> Result<(), CustomRedisError> {
        let mut pipeline = Pipeline::default();
        if !members.is_empty() {
            pipeline.add(cmd("SADD").arg(set_key).args(members));
        }
        for (key, fields) in hashes {
            if fields.is_empty() {
                continue;
            }
            let command = fields
                .into_iter()
                .fold(cmd("HSET").arg(key), |command, (field, value)| {
                    command.arg(field).arg(value)
                });
            pipeline.add(command);
        }
        if pipeline.is_empty() {
            return Ok(());
        }

        self.run_all(&pipeline).await?;
        Ok(())
    }

    async fn batch_hgetall(
        &self,
        keys: Vec<String>,
    ) -> Result<Vec<HashMap<String, String>>, CustomRedisError> {
        if keys.is_empty() {
            return Ok(vec![]);
        }
        let mut pipeline = Pipeline::default();
        for key in keys {
            pipeline.add(cmd("HGETALL").arg(key));
        }
        self.run_all(&pipeline)
            .await?
            .into_iter()
            .map(Reply::into_string_map)
            .collect()
    }

    async fn close(&self) -> Result<(), CustomRedisError> {
        self.engine.connection().close().await
    }
}
