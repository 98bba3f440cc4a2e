//! Outgoing actions and their responses

use crate::{
    constants::{
        ACTION_LOGIN, ACTION_LOGOFF, ACTION_PING, LINE_TERMINATOR, STATUS_ERROR, STATUS_SUCCESS,
    },
    error::{AmiError, AmiResult},
    headers::AmiHeader,
};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Reject strings that would let a caller inject extra header lines.
fn validate_no_newlines(s: &str, context: &str) -> AmiResult<()> {
    if s.contains('\n') || s.contains('\r') {
        return Err(AmiError::protocol_error(format!(
            "{} must not contain newlines",
            context
        )));
    }
    Ok(())
}

/// An AMI action: a name plus its parameters.
///
/// Parameters are kept sorted by key so the encoded form is stable.
///
/// ```
/// use ami_statsd::AmiAction;
///
/// let action = AmiAction::new("Status")
///     .param("Channel", "SIP/trunk-00000001")
///     .param("ActionID", "42");
/// assert_eq!(
///     action.to_wire_format().unwrap(),
///     "Action: Status\r\nActionID: 42\r\nChannel: SIP/trunk-00000001\r\n\r\n"
/// );
/// ```
#[derive(Clone, PartialEq, Eq)]
pub struct AmiAction {
    name: String,
    params: BTreeMap<String, String>,
}

impl AmiAction {
    /// Action with no parameters.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: BTreeMap::new(),
        }
    }

    /// Builder-style parameter setter.
    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_param(key, value);
        self
    }

    /// Add every pair from `params`, replacing existing keys.
    pub fn with_params<K, V>(mut self, params: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in params {
            self.set_param(k, v);
        }
        self
    }

    pub fn set_param(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.params
            .insert(key.into(), value.into());
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }

    /// The `ActionID` parameter, matched case-insensitively.
    pub fn action_id(&self) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(AmiHeader::ActionId.as_str()))
            .map(|(_, v)| v.as_str())
    }

    /// Return the existing `ActionID`, or assign `<prefix>:<uuid v4>`.
    pub fn ensure_action_id(&mut self, prefix: &str) -> String {
        if let Some(id) = self.action_id() {
            return id.to_string();
        }
        let id = format!("{}:{}", prefix, uuid::Uuid::new_v4());
        self.set_param(AmiHeader::ActionId.as_str(), id.clone());
        id
    }

    /// `Login` with credentials.
    pub fn login(username: &str, secret: &str) -> Self {
        Self::new(ACTION_LOGIN)
            .param(AmiHeader::Username.as_str(), username)
            .param(AmiHeader::Secret.as_str(), secret)
    }

    pub fn ping() -> Self {
        Self::new(ACTION_PING)
    }

    pub fn logoff() -> Self {
        Self::new(ACTION_LOGOFF)
    }

    /// Validate all fields, then encode as a CRLF header block.
    pub fn to_wire_format(&self) -> AmiResult<String> {
        use std::fmt::Write;

        let name = self
            .name
            .trim();
        validate_no_newlines(name, "action name")?;
        if name.is_empty() {
            return Err(AmiError::protocol_error("action name must not be empty"));
        }

        let mut out = String::with_capacity(64);
        let _ = write!(
            out,
            "{}: {}{}",
            AmiHeader::Action,
            name,
            LINE_TERMINATOR
        );
        for (key, value) in &self.params {
            validate_no_newlines(key, "parameter name")?;
            validate_no_newlines(value, "parameter value")?;
            let _ = write!(
                out,
                "{}: {}{}",
                key.trim(),
                value.trim(),
                LINE_TERMINATOR
            );
        }
        out.push_str(LINE_TERMINATOR);
        Ok(out)
    }
}

impl fmt::Debug for AmiAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params: BTreeMap<&str, &str> = self
            .params
            .iter()
            .map(|(k, v)| {
                if k.eq_ignore_ascii_case(AmiHeader::Secret.as_str()) {
                    (k.as_str(), "[REDACTED]")
                } else {
                    (k.as_str(), v.as_str())
                }
            })
            .collect();
        f.debug_struct("AmiAction")
            .field("name", &self.name)
            .field("params", &params)
            .finish()
    }
}

/// Classification of the `Response` header value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ResponseStatus {
    Success,
    Error,
    /// Reply to `Logoff`.
    Goodbye,
    /// Command output follows in the block.
    Follows,
    /// Anything else the server sends.
    Other,
}

impl ResponseStatus {
    fn classify(status: &str) -> Self {
        if status.eq_ignore_ascii_case(STATUS_SUCCESS) {
            ResponseStatus::Success
        } else if status.eq_ignore_ascii_case(STATUS_ERROR) {
            ResponseStatus::Error
        } else if status.eq_ignore_ascii_case("Goodbye") {
            ResponseStatus::Goodbye
        } else if status.eq_ignore_ascii_case("Follows") {
            ResponseStatus::Follows
        } else {
            ResponseStatus::Other
        }
    }
}

/// Reply to exactly one [`AmiAction`], matched by `ActionID`.
#[derive(Debug, Clone, PartialEq)]
pub struct AmiResponse {
    action_id: String,
    status: String,
    params: HashMap<String, String>,
}

impl AmiResponse {
    pub fn new(
        action_id: impl Into<String>,
        status: impl Into<String>,
        params: HashMap<String, String>,
    ) -> Self {
        Self {
            action_id: action_id.into(),
            status: status.into(),
            params,
        }
    }

    /// Correlation id; empty when the server sent none.
    pub fn action_id(&self) -> &str {
        &self.action_id
    }

    /// Raw `Response` header value.
    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn response_status(&self) -> ResponseStatus {
        ResponseStatus::classify(&self.status)
    }

    pub fn is_error(&self) -> bool {
        self.response_status() == ResponseStatus::Error
    }

    /// Look up a parameter, case-insensitively.
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

    pub fn params(&self) -> &HashMap<String, String> {
        &self.params
    }

    /// `Message` header, if present.
    pub fn message(&self) -> Option<&str> {
        self.param(AmiHeader::Message)
    }

    /// `Err(ActionFailed)` for `Response: Error`, otherwise `Ok(self)`.
    pub fn into_result(self) -> AmiResult<Self> {
        if self.is_error() {
            let message = self
                .message()
                .unwrap_or(STATUS_ERROR)
                .to_string();
            return Err(AmiError::ActionFailed { message });
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(status: &str, params: &[(&str, &str)]) -> AmiResponse {
        let params = params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AmiResponse::new("id", status, params)
    }

    #[test]
    fn test_wire_format_sorted_and_crlf() {
        let wire = AmiAction::new("Originate")
            .param("Exten", "100")
            .param("Context", "default")
            .param("Channel", "SIP/100")
            .to_wire_format()
            .unwrap();
        assert_eq!(
            wire,
            "Action: Originate\r\nChannel: SIP/100\r\nContext: default\r\nExten: 100\r\n\r\n"
        );
    }

    #[test]
    fn test_wire_format_trims() {
        let wire = AmiAction::new("  Ping ")
            .param(" ActionID ", " 1 ")
            .to_wire_format()
            .unwrap();
        assert_eq!(wire, "Action: Ping\r\nActionID: 1\r\n\r\n");
    }

    #[test]
    fn test_newline_injection_rejected() {
        assert!(AmiAction::new("Ping\r\nAction: Logoff")
            .to_wire_format()
            .is_err());
        assert!(AmiAction::new("Ping")
            .param("Key\n", "v")
            .to_wire_format()
            .is_err());
        assert!(AmiAction::new("Ping")
            .param("Key", "v\r\nAction: Logoff")
            .to_wire_format()
            .is_err());
    }

    #[test]
    fn test_empty_name_rejected() {
        assert!(AmiAction::new("   ")
            .to_wire_format()
            .is_err());
    }

    #[test]
    fn test_ensure_action_id_generates_prefixed_uuid() {
        let mut action = AmiAction::ping();
        let id = action.ensure_action_id("ami_statsd");
        let uuid_part = id
            .strip_prefix("ami_statsd:")
            .unwrap();
        assert!(uuid::Uuid::parse_str(uuid_part).is_ok());
        assert_eq!(action.action_id(), Some(id.as_str()));
        assert_eq!(action.ensure_action_id("other"), id);
    }

    #[test]
    fn test_ensure_action_id_keeps_caller_value() {
        let mut action = AmiAction::ping().param("actionid", "mine");
        assert_eq!(action.ensure_action_id("ami_statsd"), "mine");
        assert_eq!(action.params().len(), 1);
    }

    #[test]
    fn test_generated_ids_are_distinct() {
        let a = AmiAction::ping().ensure_action_id("p");
        let b = AmiAction::ping().ensure_action_id("p");
        assert_ne!(a, b);
    }

    #[test]
    fn test_login_wire_format() {
        let wire = AmiAction::login("admin", "s3cret")
            .param("Events", "call,command")
            .to_wire_format()
            .unwrap();
        assert!(wire.starts_with("Action: Login\r\n"));
        assert!(wire.contains("Username: admin\r\n"));
        assert!(wire.contains("Secret: s3cret\r\n"));
        assert!(wire.contains("Events: call,command\r\n"));
    }

    #[test]
    fn test_debug_redacts_secret() {
        let debug_str = format!("{:?}", AmiAction::login("admin", "s3cret"));
        assert!(!debug_str.contains("s3cret"));
        assert!(debug_str.contains("REDACTED"));
        assert!(debug_str.contains("admin"));
    }

    #[test]
    fn test_response_status_classification() {
        assert_eq!(
            response("Success", &[]).response_status(),
            ResponseStatus::Success
        );
        assert_eq!(
            response("error", &[]).response_status(),
            ResponseStatus::Error
        );
        assert_eq!(
            response("Goodbye", &[]).response_status(),
            ResponseStatus::Goodbye
        );
        assert_eq!(
            response("Follows", &[]).response_status(),
            ResponseStatus::Follows
        );
        assert_eq!(
            response("Pong", &[]).response_status(),
            ResponseStatus::Other
        );
    }

    #[test]
    fn test_into_result_error_carries_message() {
        let err = response("Error", &[("Message", "Authentication failed")])
            .into_result()
            .unwrap_err();
        assert!(
            matches!(err, AmiError::ActionFailed { ref message } if message == "Authentication failed")
        );
    }

    #[test]
    fn test_into_result_success() {
        let resp = response("Success", &[("Ping", "Pong")])
            .into_result()
            .unwrap();
        assert_eq!(resp.param("ping"), Some("Pong"));
    }
}
