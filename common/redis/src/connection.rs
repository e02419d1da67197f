//! Connection ownership, handshake and reconnection.
//!
//! A [`ConnectionManager`] owns exactly one transport. Every request/response cycle and every
//! connect attempt runs while holding the manager's session lock, so the lock is also what makes
//! a caller arriving mid-connect wait for that connect instead of opening a second socket.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use metrics::counter;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex, MutexGuard};
use tokio_rustls::TlsConnector;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, error, info, warn};

use crate::cmd::{cmd, Cmd};
use crate::codec::{Reply, RespCodec};
use crate::metrics_consts::{
    CONNECTION_ERRORS_COUNTER, RECONNECT_ATTEMPTS_COUNTER, RESPONSE_TIMEOUTS_COUNTER,
};
use crate::CustomRedisError;

/// Byte stream a connection runs over: plain TCP, TLS, or an in-memory pipe in tests.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

pub type BoxedTransport = Box<dyn Transport>;

/// Opens new transports for a [`ConnectionManager`].
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<BoxedTransport, CustomRedisError>;

    /// Human readable target, used in logs.
    fn describe(&self) -> String;
}

/// Connects over TCP, optionally wrapped in TLS verified against the webpki root set.
#[derive(Clone)]
pub struct TcpConnector {
    host: String,
    port: u16,
    tls: Option<TlsConnector>,
}

impl TcpConnector {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            tls: None,
        }
    }

    pub fn with_tls(mut self) -> Result<Self, CustomRedisError> {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let config = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| CustomRedisError::InvalidConfiguration(format!("TLS setup failed: {e}")))?
        .with_root_certificates(roots)
        .with_no_client_auth();

        self.tls = Some(TlsConnector::from(Arc::new(config)));
        Ok(self)
    }

    pub fn from_config(config: &ConnectionConfig) -> Result<Self, CustomRedisError> {
        let connector = Self::new(config.host.clone(), config.port);
        if config.tls {
            connector.with_tls()
        } else {
            Ok(connector)
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<BoxedTransport, CustomRedisError> {
        let stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
        stream.set_nodelay(true)?;

        match &self.tls {
            Some(tls) => {
                let server_name = ServerName::try_from(self.host.clone()).map_err(|e| {
                    CustomRedisError::InvalidConfiguration(format!(
                        "invalid TLS server name {}: {e}",
                        self.host
                    ))
                })?;
                let stream = tls.connect(server_name, stream).await?;
                Ok(Box::new(stream))
            }
            None => Ok(Box::new(stream)),
        }
    }

    fn describe(&self) -> String {
        let scheme = if self.tls.is_some() { "rediss" } else { "redis" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    /// Sent with AUTH during the handshake when set.
    pub password: Option<String>,
    /// Sent with SELECT during the handshake when non-zero.
    pub db: i64,
    pub tls: bool,
    pub max_reconnect_attempts: u32,
    /// Attempt `n` of a reconnect sleeps `reconnect_base_delay * n` first.
    pub reconnect_base_delay: Duration,
    /// `None` means a connect attempt may block indefinitely.
    pub connection_timeout: Option<Duration>,
    /// `None` means a request may wait for its replies indefinitely.
    pub response_timeout: Option<Duration>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            password: None,
            db: 0,
            tls: false,
            max_reconnect_attempts: 5,
            reconnect_base_delay: Duration::from_secs(1),
            connection_timeout: None,
            response_timeout: None,
        }
    }
}

// Keeps the password out of logs
impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("db", &self.db)
            .field("tls", &self.tls)
            .field("max_reconnect_attempts", &self.max_reconnect_attempts)
            .field("reconnect_base_delay", &self.reconnect_base_delay)
            .field("connection_timeout", &self.connection_timeout)
            .field("response_timeout", &self.response_timeout)
            .finish()
    }
}

impl ConnectionConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// An empty password is treated as no password.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        let password = password.into();
        self.password = (!password.is_empty()).then_some(password);
        self
    }

    pub fn with_db(mut self, db: i64) -> Self {
        self.db = db;
        self
    }

    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    pub fn with_reconnect(mut self, max_attempts: u32, base_delay: Duration) -> Self {
        self.max_reconnect_attempts = max_attempts;
        self.reconnect_base_delay = base_delay;
        self
    }

    pub fn with_connection_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn with_response_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// # Errors
    /// Returns `CustomRedisError::InvalidConfiguration` for an empty host, a negative database
    /// index, or a timeout of `Some(Duration::ZERO)` - use `None` for no timeout instead.
    pub fn validate(&self) -> Result<(), CustomRedisError> {
        if self.host.is_empty() {
            return Err(CustomRedisError::InvalidConfiguration(
                "Redis host cannot be empty".to_string(),
            ));
        }
        if self.db < 0 {
            return Err(CustomRedisError::InvalidConfiguration(format!(
                "Redis database index cannot be negative, got {}",
                self.db
            )));
        }
        if self.connection_timeout.is_some_and(|t| t.is_zero()) {
            return Err(CustomRedisError::InvalidConfiguration(
                "Redis connection timeout cannot be Duration::ZERO - use None for no timeout"
                    .to_string(),
            ));
        }
        if self.response_timeout.is_some_and(|t| t.is_zero()) {
            return Err(CustomRedisError::InvalidConfiguration(
                "Redis response timeout cannot be Duration::ZERO - use None for no timeout"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Ready,
}

struct Session {
    transport: Option<BoxedTransport>,
    /// Bytes read but not yet decoded; survives between reads of one cycle.
    read_buf: BytesMut,
    codec: RespCodec,
    /// Set while a request's replies are still owed. A caller that gives up mid-cycle leaves
    /// it set, and the connection is then out of step with its replies.
    in_flight: bool,
    /// Consecutive failed reconnect attempts. Reset only when a connect reaches `Ready`.
    failed_attempts: u32,
    /// Set once the reconnect loop gives up; cleared by an explicit `connect()`.
    exhausted: bool,
    closed: bool,
}

pub struct ConnectionManager {
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    state: watch::Sender<ConnectionState>,
    session: Mutex<Session>,
}

impl ConnectionManager {
    /// Create a manager without connecting. Call [`ConnectionManager::connect`] before use.
    pub fn new(
        config: ConnectionConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, CustomRedisError> {
        config.validate()?;
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Ok(Self {
            config,
            connector,
            state,
            session: Mutex::new(Session {
                transport: None,
                read_buf: BytesMut::with_capacity(16 * 1024),
                codec: RespCodec::default(),
                in_flight: false,
                failed_attempts: 0,
                exhausted: false,
                closed: false,
            }),
        })
    }

    /// Create a manager that connects over TCP (and TLS if configured).
    pub fn from_config(config: ConnectionConfig) -> Result<Self, CustomRedisError> {
        let connector = TcpConnector::from_config(&config)?;
        Self::new(config, Arc::new(connector))
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch state transitions, e.g. to wait for `Ready` after a reconnect.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Open the connection and run the handshake once.
    ///
    /// This is the only way out of the exhausted state: it clears the reconnect counter and
    /// re-enables automatic reconnection. A no-op when already connected.
    pub async fn connect(&self) -> Result<(), CustomRedisError> {
        let mut guard = self.lock().await;
        guard.session.closed = false;
        guard.session.exhausted = false;
        guard.session.failed_attempts = 0;
        if guard.session.transport.is_some() && !guard.session.in_flight {
            return Ok(());
        }
        guard.connect_once().await
    }

    /// Take exclusive use of the connection for one request/response cycle.
    ///
    /// Waiters are served in FIFO order.
    pub async fn lock(&self) -> ConnectionGuard<'_> {
        ConnectionGuard {
            manager: self,
            session: self.session.lock().await,
        }
    }

    /// Shut the transport down. Further requests fail with `NotConnected` until `connect()`.
    pub async fn close(&self) -> Result<(), CustomRedisError> {
        let mut guard = self.lock().await;
        guard.session.closed = true;
        if let Some(mut transport) = guard.session.transport.take() {
            if let Err(e) = transport.shutdown().await {
                debug!(error = %e, "Error shutting down redis transport");
            }
        }
        guard.session.read_buf.clear();
        guard.session.codec.reset();
        guard.session.in_flight = false;
        self.set_state(ConnectionState::Disconnected);
        info!(target_addr = %self.connector.describe(), "Redis connection closed");
        Ok(())
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(from = ?previous, to = ?next, "Redis connection state changed");
        }
    }
}

/// Exclusive access to the connection, held for a full write+read cycle.
pub struct ConnectionGuard<'a> {
    manager: &'a ConnectionManager,
    session: MutexGuard<'a, Session>,
}

impl ConnectionGuard<'_> {
    /// Make sure the connection is usable, reconnecting if it was lost.
    pub async fn ensure_ready(&mut self) -> Result<(), CustomRedisError> {
        if self.session.closed {
            return Err(CustomRedisError::NotConnected);
        }
        if self.session.in_flight {
            warn!("Discarding redis connection with unread replies from an abandoned request");
            self.teardown();
        }
        if self.session.transport.is_some() {
            return Ok(());
        }
        if self.session.exhausted {
            return Err(CustomRedisError::ReconnectExhausted {
                attempts: self.manager.config.max_reconnect_attempts,
            });
        }
        self.reconnect().await
    }

    /// Bounded reconnect: attempt `n` sleeps `base_delay * n`, then connects.
    async fn reconnect(&mut self) -> Result<(), CustomRedisError> {
        let max_attempts = self.manager.config.max_reconnect_attempts;
        let base_delay = self.manager.config.reconnect_base_delay;

        while self.session.failed_attempts < max_attempts {
            let attempt = self.session.failed_attempts + 1;
            let delay = base_delay * attempt;
            warn!(attempt, max_attempts, ?delay, "Reconnecting to redis");
            counter!(RECONNECT_ATTEMPTS_COUNTER).increment(1);
            tokio::time::sleep(delay).await;

            match self.connect_once().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    self.session.failed_attempts = attempt;
                    // The server answered and said no; trying again will not change that
                    if matches!(e, CustomRedisError::Server(_)) {
                        return Err(e);
                    }
                }
            }
        }

        self.session.exhausted = true;
        error!(
            max_attempts,
            target_addr = %self.manager.connector.describe(),
            "Giving up on redis after exhausting reconnect attempts"
        );
        Err(CustomRedisError::ReconnectExhausted {
            attempts: max_attempts,
        })
    }

    async fn connect_once(&mut self) -> Result<(), CustomRedisError> {
        self.teardown();
        self.manager.set_state(ConnectionState::Connecting);

        match self.open_and_handshake().await {
            Ok(()) => {
                self.session.failed_attempts = 0;
                self.manager.set_state(ConnectionState::Ready);
                info!(target_addr = %self.manager.connector.describe(), "Connected to redis");
                Ok(())
            }
            Err(e) => {
                counter!(CONNECTION_ERRORS_COUNTER).increment(1);
                self.teardown();
                warn!(
                    error = %e,
                    target_addr = %self.manager.connector.describe(),
                    "Failed to connect to redis"
                );
                Err(e)
            }
        }
    }

    async fn open_and_handshake(&mut self) -> Result<(), CustomRedisError> {
        let manager = self.manager;
        let transport = match manager.config.connection_timeout {
            Some(limit) => tokio::time::timeout(limit, manager.connector.connect())
                .await
                .map_err(|_| {
                    std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        format!("connect timed out after {limit:?}"),
                    )
                })??,
            None => manager.connector.connect().await?,
        };
        self.session.transport = Some(transport);
        self.session.read_buf.clear();
        manager.set_state(ConnectionState::Authenticating);

        if let Some(password) = &manager.config.password {
            self.handshake_command(cmd("AUTH").arg(password)).await?;
        }
        if manager.config.db != 0 {
            self.handshake_command(cmd("SELECT").arg(manager.config.db))
                .await?;
        }
        Ok(())
    }

    async fn handshake_command(&mut self, command: Cmd) -> Result<(), CustomRedisError> {
        let name = command.name();
        let mut replies = self.round_trip(std::slice::from_ref(&command)).await?;
        let reply = replies
            .pop()
            .ok_or_else(|| CustomRedisError::connection_lost("no reply to handshake"))?;
        let status = reply.into_status()?;
        debug!(command = %name, %status, "Handshake step completed");
        Ok(())
    }

    /// Write every command in one go, then read exactly one reply per command.
    ///
    /// Errors that leave the stream in an unknown state discard the connection.
    pub async fn round_trip(&mut self, commands: &[Cmd]) -> Result<Vec<Reply>, CustomRedisError> {
        let result = match self.manager.config.response_timeout {
            Some(limit) => match tokio::time::timeout(limit, self.write_and_read(commands)).await
            {
                Ok(result) => result,
                Err(_) => {
                    counter!(RESPONSE_TIMEOUTS_COUNTER).increment(1);
                    Err(CustomRedisError::Timeout)
                }
            },
            None => self.write_and_read(commands).await,
        };

        if let Err(e) = &result {
            if e.tears_down_connection() {
                debug!(error = %e, "Discarding redis connection");
                self.teardown();
            }
        }
        result
    }

    async fn write_and_read(&mut self, commands: &[Cmd]) -> Result<Vec<Reply>, CustomRedisError> {
        let Session {
            transport,
            read_buf,
            codec,
            in_flight,
            ..
        } = &mut *self.session;
        let transport = transport
            .as_mut()
            .ok_or_else(|| CustomRedisError::connection_lost("no open connection"))?;

        let mut out = BytesMut::with_capacity(commands.iter().map(Cmd::encoded_len).sum());
        for command in commands {
            codec.encode(command, &mut out)?;
        }
        *in_flight = true;
        transport.write_all(&out).await?;
        transport.flush().await?;

        let mut replies = Vec::with_capacity(commands.len());
        while replies.len() < commands.len() {
            if let Some(reply) = codec.decode(read_buf)? {
                replies.push(reply);
                continue;
            }
            if transport.read_buf(read_buf).await? == 0 {
                return Err(CustomRedisError::connection_lost(
                    "connection closed by server mid-reply",
                ));
            }
        }
        *in_flight = false;
        Ok(replies)
    }

    fn teardown(&mut self) {
        self.session.transport = None;
        self.session.read_buf.clear();
        self.session.codec.reset();
        self.session.in_flight = false;
        self.manager.set_state(ConnectionState::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeConnector, FakeRedisServer};

    fn fast_config() -> ConnectionConfig {
        ConnectionConfig::default().with_reconnect(3, Duration::from_millis(1))
    }

    mod config {
        use super::*;

        #[test]
        fn test_defaults() {
            let config = ConnectionConfig::default();
            assert_eq!(config.host, "localhost");
            assert_eq!(config.port, 6379);
            assert_eq!(config.max_reconnect_attempts, 5);
            assert_eq!(config.reconnect_base_delay, Duration::from_secs(1));
            assert!(config.validate().is_ok());
        }

        #[test]
        fn test_empty_password_is_none() {
            let config = ConnectionConfig::default().with_password("");
            assert_eq!(config.password, None);
        }

        #[test]
        fn test_zero_timeouts_are_rejected() {
            let config =
                ConnectionConfig::default().with_response_timeout(Some(Duration::ZERO));
            assert!(matches!(
                config.validate(),
                Err(CustomRedisError::InvalidConfiguration(_))
            ));

            let config =
                ConnectionConfig::default().with_connection_timeout(Some(Duration::ZERO));
            assert!(config.validate().is_err());
        }

        #[test]
        fn test_negative_db_is_rejected() {
            assert!(ConnectionConfig::default().with_db(-1).validate().is_err());
        }

        #[test]
        fn test_debug_redacts_password() {
            let config = ConnectionConfig::default().with_password("hunter2");
            let rendered = format!("{config:?}");
            assert!(!rendered.contains("hunter2"));
            assert!(rendered.contains("<redacted>"));
        }

        #[test]
        fn test_tcp_connector_describes_scheme() {
            let plain = TcpConnector::new("cache.internal", 6380);
            assert_eq!(plain.describe(), "redis://cache.internal:6380");
        }
    }

    mod lifecycle {
        use super::*;

        #[tokio::test]
        async fn test_connect_reaches_ready() {
            let server = FakeRedisServer::new();
            let manager =
                ConnectionManager::new(fast_config(), Arc::new(FakeConnector::new(server)))
                    .unwrap();
            assert_eq!(manager.state(), ConnectionState::Disconnected);

            manager.connect().await.unwrap();
            assert_eq!(manager.state(), ConnectionState::Ready);
        }

        #[tokio::test]
        async fn test_handshake_sends_auth_and_select() {
            let server = FakeRedisServer::new().with_password("secret");
            let config = fast_config().with_password("secret").with_db(3);
            let manager =
                ConnectionManager::new(config, Arc::new(FakeConnector::new(server.clone())))
                    .unwrap();

            manager.connect().await.unwrap();

            let names: Vec<String> = server
                .commands()
                .into_iter()
                .map(|args| args[0].clone())
                .collect();
            assert_eq!(names, vec!["AUTH", "SELECT"]);
        }

        #[tokio::test]
        async fn test_wrong_password_leaves_disconnected() {
            let server = FakeRedisServer::new().with_password("secret");
            let config = fast_config().with_password("nope");
            let manager =
                ConnectionManager::new(config, Arc::new(FakeConnector::new(server))).unwrap();

            let err = manager.connect().await.unwrap_err();
            assert!(matches!(err, CustomRedisError::Server(msg) if msg.starts_with("WRONGPASS")));
            assert_eq!(manager.state(), ConnectionState::Disconnected);
        }

        #[tokio::test]
        async fn test_skip_select_for_db_zero() {
            let server = FakeRedisServer::new();
            let manager = ConnectionManager::new(
                fast_config(),
                Arc::new(FakeConnector::new(server.clone())),
            )
            .unwrap();

            manager.connect().await.unwrap();
            assert!(server.commands().is_empty());
        }

        #[tokio::test]
        async fn test_close_then_requests_fail() {
            let server = FakeRedisServer::new();
            let manager =
                ConnectionManager::new(fast_config(), Arc::new(FakeConnector::new(server)))
                    .unwrap();
            manager.connect().await.unwrap();
            manager.close().await.unwrap();

            let mut guard = manager.lock().await;
            assert!(matches!(
                guard.ensure_ready().await,
                Err(CustomRedisError::NotConnected)
            ));
        }
    }

    mod reconnect {
        use super::*;

        #[tokio::test]
        async fn test_gives_up_after_max_attempts() {
            let server = FakeRedisServer::new();
            let connector = Arc::new(FakeConnector::new(server));
            let manager = ConnectionManager::new(fast_config(), connector.clone()).unwrap();
            connector.refuse_next(u32::MAX);

            let mut guard = manager.lock().await;
            let err = guard.ensure_ready().await.unwrap_err();
            assert!(matches!(err, CustomRedisError::ReconnectExhausted { attempts: 3 }));
            assert_eq!(connector.attempts(), 3);

            // Exhausted: no further attempts until an explicit connect
            let err = guard.ensure_ready().await.unwrap_err();
            assert_eq!(err.kind(), crate::ErrorKind::ReconnectExhausted);
            assert_eq!(connector.attempts(), 3);
        }

        #[tokio::test]
        async fn test_explicit_connect_clears_exhaustion() {
            let server = FakeRedisServer::new();
            let connector = Arc::new(FakeConnector::new(server));
            let manager = ConnectionManager::new(fast_config(), connector.clone()).unwrap();
            connector.refuse_next(3);

            {
                let mut guard = manager.lock().await;
                assert!(guard.ensure_ready().await.is_err());
            }

            manager.connect().await.unwrap();
            assert_eq!(manager.state(), ConnectionState::Ready);
            assert_eq!(connector.attempts(), 4);
        }

        #[tokio::test]
        async fn test_recovers_within_bound() {
            let server = FakeRedisServer::new();
            let connector = Arc::new(FakeConnector::new(server));
            let manager = ConnectionManager::new(fast_config(), connector.clone()).unwrap();
            connector.refuse_next(2);

            let mut guard = manager.lock().await;
            guard.ensure_ready().await.unwrap();
            assert_eq!(connector.attempts(), 3);
            drop(guard);
            assert_eq!(manager.state(), ConnectionState::Ready);
        }

        #[tokio::test]
        async fn test_handshake_rejection_is_not_retried() {
            let server = FakeRedisServer::new().with_password("secret");
            let connector = Arc::new(FakeConnector::new(server));
            let config = fast_config().with_password("wrong");
            let manager = ConnectionManager::new(config, connector.clone()).unwrap();

            let mut guard = manager.lock().await;
            let err = guard.ensure_ready().await.unwrap_err();
            assert_eq!(err.kind(), crate::ErrorKind::Server);
            assert_eq!(connector.attempts(), 1);
        }
    }
}
