//! Typed header names used on AMI frames.

/// Error returned when parsing an unrecognized header name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseAmiHeaderError(pub String);

impl std::fmt::Display for ParseAmiHeaderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown AMI header: {}", self.0)
    }
}

impl std::error::Error for ParseAmiHeaderError {}

define_wire_enum! {
    error_type: ParseAmiHeaderError,
    /// Header names the client reads or writes.
    ///
    /// AMI header names are matched case-insensitively on the wire side; the
    /// strings here are the canonical spelling Asterisk emits. Use with
    /// [`AmiEvent::param()`](crate::AmiEvent::param) for typed lookups.
    pub enum AmiHeader {
        Action => "Action",
        ActionId => "ActionID",
        Response => "Response",
        Message => "Message",
        Event => "Event",
        Privilege => "Privilege",
        Username => "Username",
        Secret => "Secret",
        Events => "Events",
        Uniqueid => "Uniqueid",
        Channel => "Channel",
        ChannelStateDesc => "ChannelStateDesc",
        CallerIdNum => "CallerIDNum",
        CallerIdName => "CallerIDName",
        Exten => "Exten",
        Context => "Context",
        AccountCode => "AccountCode",
        Cause => "Cause",
        CauseTxt => "Cause-txt",
    }
}
