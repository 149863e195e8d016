use std::{fmt, str::FromStr, time::Duration};

use percent_encoding::percent_decode_str;

use crate::error::{Error, Result};

pub const DEFAULT_PORT: u16 = 27017;
const DEFAULT_POOL_SIZE: usize = 10;
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);
const URI_SCHEME: &str = "mongodb://";

/// A candidate server address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Node {
    pub host: String,
    pub port: u16,
}

impl Node {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Parses `"host"`, `"host:port"`, `"[v6]"` or `"[v6]:port"`.
impl FromStr for Node {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (host, port) = match s.strip_prefix('[') {
            Some(bracketed) => {
                let (host, rest) = bracketed.split_once(']').ok_or_else(|| {
                    Error::Configuration(format!("unterminated address in {s:?}"))
                })?;
                match rest {
                    "" => (host, None),
                    _ => match rest.strip_prefix(':') {
                        Some(port) => (host, Some(port)),
                        None => {
                            return Err(Error::Configuration(format!("invalid address {s:?}")));
                        }
                    },
                }
            }
            None => match s.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (s, None),
            },
        };
        let port = match port {
            Some(port) => port
                .parse::<u16>()
                .map_err(|_| Error::Configuration(format!("invalid port in {s:?}")))?,
            None => DEFAULT_PORT,
        };
        if host.is_empty() {
            return Err(Error::Configuration(format!("missing host in {s:?}")));
        }
        Ok(Node::new(host, port))
    }
}

impl From<(&str, u16)> for Node {
    fn from((host, port): (&str, u16)) -> Self {
        Node::new(host, port)
    }
}

impl From<(String, u16)> for Node {
    fn from((host, port): (String, u16)) -> Self {
        Node::new(host, port)
    }
}

/// Database, user and password taken from a connection URI.
#[derive(Clone, PartialEq, Eq)]
pub struct UriCredentials {
    pub database: String,
    pub user: String,
    pub password: String,
}

impl fmt::Debug for UriCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UriCredentials")
            .field("database", &self.database)
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

/// Settings for a [`Connection`](super::Connection).
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Candidate nodes, tried in order during discovery.
    pub nodes: Vec<Node>,
    /// Number of socket slots.
    pub pool_size: usize,
    /// How long to wait for a busy slot; `None` waits forever.
    pub acquire_timeout: Option<Duration>,
    /// Read/write timeout applied to every socket.
    pub network_timeout: Option<Duration>,
    pub connect_timeout: Duration,
    /// Report socket failures as retryable and rediscover on reconnect failure.
    pub auto_reconnect: bool,
    /// Accept a secondary when no master is available.
    pub slave_okay: bool,
    /// Skip discovery at construction; it then runs on first use.
    pub defer_discovery: bool,
    /// `None` kills cursors immediately; `Some(n)` batches kills until `n` are pending.
    pub cursor_close_batch: Option<usize>,
    pub credentials: Option<UriCredentials>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            nodes: vec![Node::new("localhost", DEFAULT_PORT)],
            pool_size: DEFAULT_POOL_SIZE,
            acquire_timeout: None,
            network_timeout: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            auto_reconnect: true,
            slave_okay: false,
            defer_discovery: false,
            cursor_close_batch: None,
            credentials: None,
        }
    }
}

impl ConnectionOptions {
    pub fn new<N: Into<Node>>(nodes: impl IntoIterator<Item = N>) -> Self {
        Self {
            nodes: nodes.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Parses `mongodb://[user:pass@]host[:port][,host[:port]...][/database]`. A bare
    /// `host` or `host:port` is accepted as well.
    pub fn parse_uri(uri: &str) -> Result<Self> {
        let Some(rest) = uri.strip_prefix(URI_SCHEME) else {
            return Ok(Self::new([uri.parse::<Node>()?]));
        };

        let (userinfo, rest) = match rest.rsplit_once('@') {
            Some((userinfo, rest)) => (Some(userinfo), rest),
            None => (None, rest),
        };
        let (hosts, database) = match rest.split_once('/') {
            Some((hosts, db)) => (hosts, Some(db).filter(|db| !db.is_empty())),
            None => (rest, None),
        };

        let nodes = hosts
            .split(',')
            .map(str::parse::<Node>)
            .collect::<Result<Vec<_>>>()?;

        let credentials = match userinfo {
            Some(userinfo) => {
                let (user, password) = userinfo.split_once(':').ok_or_else(|| {
                    Error::Configuration("credentials must be given as user:password".into())
                })?;
                let user = decode_component(user)?;
                if user.is_empty() {
                    return Err(Error::Configuration("empty user name in uri".into()));
                }
                Some(UriCredentials {
                    database: database.unwrap_or("admin").to_string(),
                    user,
                    password: decode_component(password)?,
                })
            }
            None => None,
        };

        Ok(Self {
            credentials,
            ..Self::new(nodes)
        })
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = Some(timeout);
        self
    }

    pub fn with_network_timeout(mut self, timeout: Duration) -> Self {
        self.network_timeout = Some(timeout);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    pub fn with_slave_okay(mut self, enabled: bool) -> Self {
        self.slave_okay = enabled;
        self
    }

    pub fn with_deferred_discovery(mut self, enabled: bool) -> Self {
        self.defer_discovery = enabled;
        self
    }

    pub fn with_cursor_close_batch(mut self, threshold: usize) -> Self {
        self.cursor_close_batch = Some(threshold);
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(Error::Configuration("at least one node is required".into()));
        }
        if self.pool_size == 0 {
            return Err(Error::Configuration("pool size must be at least 1".into()));
        }
        if self.cursor_close_batch == Some(0) {
            return Err(Error::Configuration("cursor close batch must be at least 1".into()));
        }
        Ok(())
    }
}

/// Undoes `%XX` escapes in a URI credential.
fn decode_component(component: &str) -> Result<String> {
    percent_decode_str(component)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|_| Error::Configuration("credentials in uri are not valid utf-8".into()))
}
