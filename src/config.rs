//! Client options and connection target parsing

use crate::{
    constants::{
        DEFAULT_ACTION_ID_PREFIX, DEFAULT_AMI_PORT, DEFAULT_TIMEOUT_MS, MAX_EVENT_QUEUE_SIZE,
    },
    error::{AmiError, AmiResult},
};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Default statsd UDP port, used when a statsd target omits one.
pub const DEFAULT_STATSD_PORT: u16 = 8125;

/// Transport security for the AMI connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsMode {
    /// Plain TCP.
    #[default]
    Disabled,
    /// TLS over TCP. `verify: false` accepts any server certificate.
    Enabled { verify: bool },
}

/// Options for AMI connection configuration.
///
/// Use [`Default::default()`] for standard settings.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Bound on TCP connect and the TLS handshake. Default: 2s.
    pub connect_timeout: Duration,
    pub tls: TlsMode,
    /// Capacity of the event subscription channel. Default: 1000.
    pub event_queue_size: usize,
    /// Bound on [`AmiClient::submit`](crate::AmiClient::submit). Default: none.
    pub action_timeout: Option<Duration>,
    /// Prefix of generated ActionIDs. Default: `ami_statsd`.
    pub action_id_prefix: String,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            tls: TlsMode::Disabled,
            event_queue_size: MAX_EVENT_QUEUE_SIZE,
            action_timeout: None,
            action_id_prefix: DEFAULT_ACTION_ID_PREFIX.to_string(),
        }
    }
}

/// Split `host[:port]`, falling back to `default_port`.
fn split_host_port(s: &str, default_port: u16) -> AmiResult<(String, u16)> {
    let (host, port) = match s.rsplit_once(':') {
        Some((host, "")) => (host, default_port),
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| AmiError::config(format!("invalid port in {:?}", s)))?;
            (host, port)
        }
        None => (s, default_port),
    };
    if host.is_empty() {
        return Err(AmiError::config(format!("missing host in {:?}", s)));
    }
    Ok((host.to_string(), port))
}

/// AMI server address and credentials, parsed from `user:password@host[:port]`.
///
/// ```
/// use ami_statsd::AmiTarget;
///
/// let target: AmiTarget = "admin:secret@pbx.local:5038".parse().unwrap();
/// assert_eq!(target.username, "admin");
/// assert_eq!(target.host, "pbx.local");
/// assert_eq!(target.port, 5038);
/// ```
#[derive(Clone, PartialEq, Eq)]
pub struct AmiTarget {
    pub username: String,
    pub secret: String,
    pub host: String,
    pub port: u16,
}

impl AmiTarget {
    /// `host:port`, for logging and socket connect.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Debug for AmiTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AmiTarget")
            .field("username", &self.username)
            .field("secret", &"[REDACTED]")
            .field("host", &self.host)
            .field("port", &self.port)
            .finish()
    }
}

impl FromStr for AmiTarget {
    type Err = AmiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (credentials, address) = s
            .rsplit_once('@')
            .ok_or_else(|| {
                AmiError::config("asterisk target must look like user:password@host:port")
            })?;
        let (username, secret) = credentials
            .split_once(':')
            .ok_or_else(|| AmiError::config("asterisk target is missing ':password'"))?;
        if username.is_empty() {
            return Err(AmiError::config("asterisk target has an empty username"));
        }
        let (host, port) = split_host_port(address, DEFAULT_AMI_PORT)?;

        Ok(Self {
            username: username.to_string(),
            secret: secret.to_string(),
            host,
            port,
        })
    }
}

/// statsd endpoint, parsed from `host[:port][/prefix]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsdTarget {
    pub host: String,
    pub port: u16,
    /// Prepended verbatim to every metric name; may be empty.
    pub prefix: String,
}

impl StatsdTarget {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl FromStr for StatsdTarget {
    type Err = AmiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (address, prefix) = s
            .split_once('/')
            .unwrap_or((s, ""));
        let (host, port) = split_host_port(address, DEFAULT_STATSD_PORT)?;

        Ok(Self {
            host,
            port,
            prefix: prefix.to_string(),
        })
    }
}
