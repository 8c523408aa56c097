use std::collections::HashSet;
use std::time::Duration;

use crate::core::server::ServerType;
use crate::core::Multiplexer;
use crate::proto::error::{Error, Result};

const DEFAULT_PORT: u16 = 6379;

/// Capabilities of the servers the multiplexer talks to.
///
/// These are configured rather than detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerFeatures {
    /// The server discards a transaction by itself when a queued command
    /// is rejected (EXECABORT, Redis 2.6.5+). Without it the client waits
    /// for every `QUEUED` acknowledgement before sending `EXEC`.
    pub exec_abort: bool,
    /// Scripts cannot change the connection's selected database.
    pub scripting_database_safe: bool,
}

impl Default for ServerFeatures {
    fn default() -> Self {
        Self {
            exec_abort: true,
            scripting_database_safe: false,
        }
    }
}

/// Validated multiplexer configuration.
#[derive(Debug, Clone)]
pub struct Options {
    /// Seed endpoints as `host:port`.
    pub endpoints: Vec<String>,
    /// AUTH password.
    pub password: Option<String>,
    /// ACL username, sent with the password.
    pub username: Option<String>,
    /// `CLIENT SETNAME` value for interactive connections.
    pub client_name: Option<String>,
    /// Database used by commands that do not name one.
    pub default_database: i64,
    /// Number of databases the servers expose; `None` disables the check.
    pub databases: Option<i64>,
    /// How long a connection attempt (including handshake) may take.
    pub connect_timeout: Duration,
    /// How long blocking callers wait, and how long a transaction waits for
    /// its condition replies.
    pub sync_timeout: Duration,
    /// Idle time after which a connection with outstanding replies is
    /// checked with a keep-alive.
    pub keep_alive: Duration,
    /// How long a connection may owe replies without answering any before
    /// it is considered dead.
    pub response_timeout: Duration,
    /// Interval of the maintenance tick.
    pub heartbeat_interval: Duration,
    /// Messages written per pass before the writer yields.
    pub write_batch_size: usize,
    /// Deliver async completions in reply order.
    pub preserve_async_order: bool,
    /// Deployment shape.
    pub server_type: ServerType,
    /// Server capabilities.
    pub features: ServerFeatures,
    /// Let master-only commands run on slaves.
    pub allow_slave_writes: bool,
    /// Upper-case verbs rejected before dispatch.
    pub disabled_commands: HashSet<String>,
    /// Idle result slots kept for blocking callers.
    pub result_box_pool_size: usize,
    /// Connect with TLS (requires the `tls` feature).
    pub tls: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            password: None,
            username: None,
            client_name: None,
            default_database: 0,
            databases: Some(16),
            connect_timeout: Duration::from_secs(5),
            sync_timeout: Duration::from_secs(5),
            keep_alive: Duration::from_secs(60),
            response_timeout: Duration::from_secs(120),
            heartbeat_interval: Duration::from_secs(1),
            write_batch_size: 256,
            preserve_async_order: true,
            server_type: ServerType::Standalone,
            features: ServerFeatures::default(),
            allow_slave_writes: false,
            disabled_commands: HashSet::new(),
            result_box_pool_size: 16,
            tls: false,
        }
    }
}

/// Builder for [`Options`] and [`Multiplexer`].
///
/// # Example
///
/// ```no_run
/// use muxplex::MultiplexerBuilder;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let mux = MultiplexerBuilder::new()
///     .endpoint("redis://localhost:6379")
///     .password("secret")
///     .database(0)
///     .connect()
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct MultiplexerBuilder {
    endpoints: Vec<String>,
    options: Options,
}

impl MultiplexerBuilder {
    /// Creates a builder with default options.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a seed endpoint.
    ///
    /// # Arguments
    ///
    /// * `address` - `host:port`, `redis://host:port` or `rediss://host:port`
    #[inline]
    pub fn endpoint(mut self, address: impl Into<String>) -> Self {
        self.endpoints.push(address.into());
        self
    }

    /// Sets the password for authentication.
    #[inline]
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.options.password = Some(password.into());
        self
    }

    /// Sets the username for ACL authentication.
    #[inline]
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.options.username = Some(username.into());
        self
    }

    /// Sets the client connection name.
    ///
    /// # Arguments
    ///
    /// * `name` - Client name displayed in `CLIENT LIST`
    #[inline]
    pub fn client_name(mut self, name: impl Into<String>) -> Self {
        self.options.client_name = Some(name.into());
        self
    }

    /// Sets the database used by commands.
    #[inline]
    pub fn database(mut self, database: i64) -> Self {
        self.options.default_database = database;
        self
    }

    /// Sets how many databases the servers expose; `None` skips the range
    /// check.
    #[inline]
    pub fn databases(mut self, count: Option<i64>) -> Self {
        self.options.databases = count;
        self
    }

    /// Sets the connection timeout.
    #[inline]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.options.connect_timeout = timeout;
        self
    }

    /// Sets how long blocking calls wait for their reply.
    #[inline]
    pub fn sync_timeout(mut self, timeout: Duration) -> Self {
        self.options.sync_timeout = timeout;
        self
    }

    /// Sets the idle time after which a connection sends a keep-alive.
    #[inline]
    pub fn keep_alive(mut self, interval: Duration) -> Self {
        self.options.keep_alive = interval;
        self
    }

    /// Sets how long outstanding replies may go unanswered before the
    /// connection is torn down.
    #[inline]
    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.options.response_timeout = timeout;
        self
    }

    /// Sets the maintenance tick interval.
    #[inline]
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.options.heartbeat_interval = interval;
        self
    }

    /// Sets how many messages one write pass may send.
    #[inline]
    pub fn write_batch_size(mut self, size: usize) -> Self {
        self.options.write_batch_size = size;
        self
    }

    /// Chooses ordered or unordered async completion delivery.
    #[inline]
    pub fn preserve_async_order(mut self, enabled: bool) -> Self {
        self.options.preserve_async_order = enabled;
        self
    }

    /// Routes by hash slot.
    #[inline]
    pub fn cluster(mut self, enabled: bool) -> Self {
        self.options.server_type = if enabled {
            ServerType::Cluster
        } else {
            ServerType::Standalone
        };
        self
    }

    /// Declares server capabilities.
    #[inline]
    pub fn features(mut self, features: ServerFeatures) -> Self {
        self.options.features = features;
        self
    }

    /// Lets master-only commands run on slaves.
    #[inline]
    pub fn allow_slave_writes(mut self, enabled: bool) -> Self {
        self.options.allow_slave_writes = enabled;
        self
    }

    /// Rejects `command` before dispatch.
    #[inline]
    pub fn disable_command(mut self, command: &str) -> Self {
        self.options
            .disabled_commands
            .insert(command.to_ascii_uppercase());
        self
    }

    /// Sets how many idle result slots are kept for blocking callers.
    #[inline]
    pub fn result_box_pool_size(mut self, size: usize) -> Self {
        self.options.result_box_pool_size = size;
        self
    }

    /// Enables or disables TLS encryption.
    #[inline]
    pub fn tls(mut self, enabled: bool) -> Self {
        self.options.tls = enabled;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if no endpoint was given, an
    /// endpoint cannot be parsed, or a non-zero database is requested in
    /// cluster mode.
    pub fn build_options(self) -> Result<Options> {
        let mut options = self.options;
        if self.endpoints.is_empty() {
            return Err(Error::InvalidArgument {
                message: "at least one endpoint is required".to_string(),
            });
        }
        for address in &self.endpoints {
            let (endpoint, tls) = parse_endpoint(address)?;
            options.tls |= tls;
            if !options.endpoints.contains(&endpoint) {
                options.endpoints.push(endpoint);
            }
        }
        if options.server_type == ServerType::Cluster && options.default_database != 0 {
            return Err(Error::InvalidArgument {
                message: "cluster mode only supports database 0".to_string(),
            });
        }
        if options.default_database < 0 {
            return Err(Error::InvalidArgument {
                message: "database must not be negative".to_string(),
            });
        }
        Ok(options)
    }

    /// Builds the multiplexer and waits for the first connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for a bad configuration, or a
    /// connectivity error if no server answers within the connect timeout.
    pub async fn connect(self) -> Result<Multiplexer> {
        Multiplexer::connect(self.build_options()?).await
    }
}

/// Normalises an address to `host:port`.
///
/// # Returns
///
/// The endpoint and whether the `rediss` scheme asked for TLS.
pub(crate) fn parse_endpoint(address: &str) -> Result<(String, bool)> {
    let with_scheme = if address.contains("://") {
        address.to_string()
    } else {
        format!("redis://{}", address)
    };
    let parsed = url::Url::parse(&with_scheme).map_err(|_| Error::InvalidArgument {
        message: format!("invalid address format: {}", address),
    })?;

    let tls = match parsed.scheme() {
        "redis" => false,
        "rediss" => true,
        _ => {
            return Err(Error::InvalidArgument {
                message: "invalid scheme, expected redis:// or rediss://".to_string(),
            })
        }
    };
    let host = parsed.host_str().ok_or_else(|| Error::InvalidArgument {
        message: "missing host in address".to_string(),
    })?;
    let port = parsed.port().unwrap_or(DEFAULT_PORT);
    Ok((format!("{}:{}", host, port), tls))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_endpoint_forms() {
        assert_eq!(
            parse_endpoint("redis://localhost:6380").unwrap(),
            ("localhost:6380".to_string(), false)
        );
        assert_eq!(
            parse_endpoint("127.0.0.1:7000").unwrap(),
            ("127.0.0.1:7000".to_string(), false)
        );
        assert_eq!(
            parse_endpoint("rediss://cache.example.com").unwrap(),
            ("cache.example.com:6379".to_string(), true)
        );
        assert!(parse_endpoint("http://localhost:6379").is_err());
    }

    #[test]
    fn test_builder_chaining() {
        let options = MultiplexerBuilder::new()
            .endpoint("redis://localhost:6379")
            .endpoint("localhost:6379")
            .password("secret")
            .client_name("test")
            .database(3)
            .sync_timeout(Duration::from_millis(250))
            .disable_command("flushall")
            .build_options()
            .unwrap();

        assert_eq!(options.endpoints, vec!["localhost:6379".to_string()]);
        assert_eq!(options.password.as_deref(), Some("secret"));
        assert_eq!(options.client_name.as_deref(), Some("test"));
        assert_eq!(options.default_database, 3);
        assert_eq!(options.sync_timeout, Duration::from_millis(250));
        assert!(options.disabled_commands.contains("FLUSHALL"));
        assert!(!options.tls);
    }

    #[test]
    fn test_build_without_endpoint() {
        match MultiplexerBuilder::new().build_options() {
            Err(Error::InvalidArgument { message }) => {
                assert_eq!(message, "at least one endpoint is required");
            }
            other => panic!("Expected InvalidArgument error, got {:?}", other),
        }
    }

    #[test]
    fn test_cluster_rejects_database() {
        let result = MultiplexerBuilder::new()
            .endpoint("127.0.0.1:7000")
            .cluster(true)
            .database(1)
            .build_options();
        assert!(matches!(result, Err(Error::InvalidArgument { .. })));
    }

    #[test]
    fn test_default_features() {
        let features = ServerFeatures::default();
        assert!(features.exec_abort);
        assert!(!features.scripting_database_safe);
    }
}
