use std::time::Duration;

use crate::error::Error;

pub(crate) const DEFAULT_USER_AGENT: &str = "outcall";
pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_MAX_CONNECTIONS: usize = 64;
const DEFAULT_MAX_CONNECTIONS_PER_ROUTE: usize = 8;
const DEFAULT_CONNECTION_TTL: Duration = Duration::from_secs(60);
const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(30);
pub(crate) const DEFAULT_MAX_RESPONSE_BODY_BYTES: usize = 8 * 1024 * 1024;

/// Configuration for one [`HttpAgent`](crate::HttpAgent) and the
/// connection pool it owns. Constructed once per process (or per
/// distinct configuration) and reused across many requests.
#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub user_agent: String,
    pub connect_timeout: Duration,
    /// Per-read stall budget; also applied as the socket read timeout on
    /// every pooled connection.
    pub read_timeout: Duration,
    /// Global cap on concurrently leased connections. Must be > 0.
    pub max_connections: usize,
    /// Per-route cap on concurrently leased connections. Must be > 0.
    /// Keeping this at or below `max_connections` is recommended but
    /// not enforced.
    pub max_connections_per_route: usize,
    /// Maximum lifetime of a pooled connection counted from creation.
    /// Zero disables reuse: every call gets a fresh connection.
    pub connection_ttl: Duration,
    /// Idle allowance when the server sends no keep-alive hint. Zero
    /// disables connection reuse entirely and forces `Connection: close`.
    pub keep_alive: Duration,
    /// Retries after the first attempt for idempotent-safe transport
    /// failures. Zero means a single attempt.
    pub retries: usize,
    /// Upper bound on buffered response bodies.
    pub max_response_body_bytes: usize,
    /// Optional `host:port` forward proxy, applied to plain-HTTP routes.
    pub proxy: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            connect_timeout: DEFAULT_TIMEOUT,
            read_timeout: DEFAULT_TIMEOUT,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_connections_per_route: DEFAULT_MAX_CONNECTIONS_PER_ROUTE,
            connection_ttl: DEFAULT_CONNECTION_TTL,
            keep_alive: DEFAULT_KEEP_ALIVE,
            retries: 0,
            max_response_body_bytes: DEFAULT_MAX_RESPONSE_BODY_BYTES,
            proxy: None,
        }
    }
}

impl AgentConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout.max(Duration::from_millis(1));
        self
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout.max(Duration::from_millis(1));
        self
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_max_connections_per_route(mut self, max_connections_per_route: usize) -> Self {
        self.max_connections_per_route = max_connections_per_route;
        self
    }

    pub fn with_connection_ttl(mut self, connection_ttl: Duration) -> Self {
        self.connection_ttl = connection_ttl;
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_retries(mut self, retries: usize) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_max_response_body_bytes(mut self, max_response_body_bytes: usize) -> Self {
        self.max_response_body_bytes = max_response_body_bytes.max(1);
        self
    }

    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.max_connections == 0 {
            return Err(Error::Config {
                message: "max_connections must be greater than zero".to_owned(),
            });
        }
        if self.max_connections_per_route == 0 {
            return Err(Error::Config {
                message: "max_connections_per_route must be greater than zero".to_owned(),
            });
        }
        if self.user_agent.is_empty() {
            return Err(Error::Config {
                message: "user_agent must not be empty".to_owned(),
            });
        }
        self.parsed_proxy().map(|_| ())
    }

    pub(crate) fn parsed_proxy(&self) -> Result<Option<(String, u16)>, Error> {
        let Some(proxy) = &self.proxy else {
            return Ok(None);
        };
        let invalid = || Error::Config {
            message: format!("proxy must be host:port, got {proxy:?}"),
        };
        let (host, port) = proxy.rsplit_once(':').ok_or_else(invalid)?;
        if host.is_empty() {
            return Err(invalid());
        }
        let port = port.parse::<u16>().map_err(|_| invalid())?;
        Ok(Some((host.to_owned(), port)))
    }

    /// Connection reuse is off when either the pool TTL or the
    /// keep-alive allowance is zero.
    pub(crate) fn reuse_enabled(&self) -> bool {
        !self.connection_ttl.is_zero() && !self.keep_alive.is_zero()
    }
}
