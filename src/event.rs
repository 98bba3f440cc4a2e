//! AMI event types and structures

use crate::headers::AmiHeader;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

/// Error returned when parsing an unknown event name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEventTypeError(pub String);

impl fmt::Display for ParseEventTypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown event type: {}", self.0)
    }
}

impl std::error::Error for ParseEventTypeError {}

define_wire_enum! {
    error_type: ParseEventTypeError,
    /// Event names this crate knows by type.
    ///
    /// Handlers are keyed by the raw event name, so events outside this list
    /// still dispatch; the enum only gives the common ones a typed spelling.
    pub enum AmiEventType {
        Newchannel => "Newchannel",
        Newstate => "Newstate",
        NewAccountCode => "NewAccountCode",
        NewCallerid => "NewCallerid",
        Newexten => "Newexten",
        SoftHangupRequest => "SoftHangupRequest",
        HangupRequest => "HangupRequest",
        Hangup => "Hangup",
        DialBegin => "DialBegin",
        DialEnd => "DialEnd",
        BridgeEnter => "BridgeEnter",
        BridgeLeave => "BridgeLeave",
        VarSet => "VarSet",
        FullyBooted => "FullyBooted",
        Shutdown => "Shutdown",
        Reload => "Reload",
    }
}

/// Error returned when parsing an unknown `ChannelStateDesc` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseChannelStateError(pub String);

impl fmt::Display for ParseChannelStateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown channel state: {}", self.0)
    }
}

impl std::error::Error for ParseChannelStateError {}

define_wire_enum! {
    error_type: ParseChannelStateError,
    /// Channel state as reported in `ChannelStateDesc`.
    pub enum ChannelState {
        Down => "Down",
        Rsrvd => "Rsrvd",
        OffHook => "OffHook",
        Dialing => "Dialing",
        Ring => "Ring",
        Ringing => "Ringing",
        Up => "Up",
        Busy => "Busy",
        DialingOffhook => "Dialing Offhook",
        PreRing => "Pre-ring",
        Unknown => "Unknown",
    }
}

/// An unsolicited AMI notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AmiEvent {
    name: String,
    privilege: Vec<String>,
    params: HashMap<String, String>,
}

impl AmiEvent {
    /// Event with no privilege scopes or parameters.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            privilege: Vec::new(),
            params: HashMap::new(),
        }
    }

    pub(crate) fn from_parts(
        name: String,
        privilege: Vec<String>,
        params: HashMap<String, String>,
    ) -> Self {
        Self {
            name,
            privilege,
            params,
        }
    }

    /// Builder-style parameter setter, mostly for tests.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params
            .insert(key.into(), value.into());
        self
    }

    /// Raw `Event` header value.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parsed event type, if the name is one [`AmiEventType`] knows.
    pub fn event_type(&self) -> Option<AmiEventType> {
        AmiEventType::from_wire(&self.name)
    }

    /// `Privilege` scopes in wire order.
    pub fn privilege(&self) -> &[String] {
        &self.privilege
    }

    /// Look up a parameter. Exact match first, then case-insensitive.
    pub fn param(&self, name: impl AsRef<str>) -> Option<&str> {
        let name = name.as_ref();
        self.params
            .get(name)
            .or_else(|| {
                self.params
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(name))
                    .map(|(_, v)| v)
            })
            .map(|s| s.as_str())
    }

    /// Parameter value, or `default` when the header is absent. A header
    /// sent with an empty value yields `""`.
    pub fn param_or<'a>(&'a self, name: impl AsRef<str>, default: &'a str) -> &'a str {
        self.param(name)
            .unwrap_or(default)
    }

    pub fn params(&self) -> &HashMap<String, String> {
        &self.params
    }

    pub fn unique_id(&self) -> Option<&str> {
        self.param(AmiHeader::Uniqueid)
    }

    pub fn channel(&self) -> Option<&str> {
        self.param(AmiHeader::Channel)
    }

    /// Parse `ChannelStateDesc` into a [`ChannelState`].
    pub fn channel_state(&self) -> Option<ChannelState> {
        ChannelState::from_wire(self.param(AmiHeader::ChannelStateDesc)?)
    }

    pub fn caller_id_num(&self) -> Option<&str> {
        self.param(AmiHeader::CallerIdNum)
    }

    pub fn account_code(&self) -> Option<&str> {
        self.param(AmiHeader::AccountCode)
    }

    /// `Cause` header (numeric Q.850 code as text).
    pub fn hangup_cause(&self) -> Option<&str> {
        self.param(AmiHeader::Cause)
    }

    /// `Cause-txt` header.
    pub fn hangup_cause_txt(&self) -> Option<&str> {
        self.param(AmiHeader::CauseTxt)
    }
}

impl fmt::Display for AmiEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.unique_id() {
            Some(id) => write!(f, "{} ({})", self.name, id),
            None => f.write_str(&self.name),
        }
    }
}
