//! Protocol constants and configuration values

/// Default Asterisk Manager Interface port
pub const DEFAULT_AMI_PORT: u16 = 5038;

/// Substring every AMI greeting line carries (`Asterisk Call Manager/5.0.1`)
pub const AMI_BANNER: &str = "Asterisk Call Manager";

/// Socket buffer size for reading from the transport
pub const SOCKET_BUF_SIZE: usize = 16 * 1024;

/// Maximum size of a single header block (1MB)
/// AMI frames are a few hundred bytes; anything this large means framing is lost.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Outgoing line terminator
pub const LINE_TERMINATOR: &str = "\r\n";

/// Default prefix of generated ActionIDs (`ami_statsd:<uuid>`)
pub const DEFAULT_ACTION_ID_PREFIX: &str = "ami_statsd";

/// Action names used by the client itself
pub const ACTION_LOGIN: &str = "Login";
pub const ACTION_LOGOFF: &str = "Logoff";
pub const ACTION_PING: &str = "Ping";

/// Response status values
pub const STATUS_SUCCESS: &str = "Success";
pub const STATUS_ERROR: &str = "Error";

/// Connection timeout in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 2000;

/// Keepalive interval in milliseconds
pub const DEFAULT_KEEPALIVE_MS: u64 = 1000;

/// Pause between reconnect attempts in milliseconds
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 100;

/// Event subscription filter sent with `Login`
pub const DEFAULT_LOGIN_EVENTS: &str = "call,command";

/// Maximum number of queued events before dropping
pub const MAX_EVENT_QUEUE_SIZE: usize = 1000;

/// Capacity of the protocol error channel
pub const ERROR_QUEUE_SIZE: usize = 16;
