//! Per-call lifecycle state derived from the event stream

use serde::Serialize;
use std::fmt;
use tokio::time::Instant;

/// Error returned when parsing an unknown disposition string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseDispositionError(pub String);

impl fmt::Display for ParseDispositionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown disposition: {}", self.0)
    }
}

impl std::error::Error for ParseDispositionError {}

define_wire_enum! {
    error_type: ParseDispositionError,
    /// Final classification of a call, CDR style.
    pub enum Disposition {
        Answered => "ANSWERED",
        NoAnswer => "NOANSWER",
        Busy => "BUSY",
        Failed => "FAILED",
    }
}

/// Q.850 cause codes that drive [`Call::disposition`].
const CAUSE_NORMAL_CLEARING: &str = "16";
const CAUSE_USER_BUSY: &str = "17";
const CAUSE_NO_ANSWER: &str = "19";

/// Strip the per-instance suffix from a channel name:
/// `SIP/Trunk-channel-1234deadbeef` becomes `Trunk-channel`.
///
/// Names without a `<tech>/` prefix or without a lowercase-hex `-suffix`
/// are returned unchanged.
pub fn trunk_name(channel: &str) -> &str {
    let Some((_tech, rest)) = channel.split_once('/') else {
        return channel;
    };
    match rest.rsplit_once('-') {
        Some((trunk, suffix))
            if !suffix.is_empty()
                && suffix
                    .bytes()
                    .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) =>
        {
            trunk
        }
        _ => channel,
    }
}

/// One tracked call.
///
/// Timestamps are set at most once; the first write wins. The hangup cause
/// also keeps its first non-empty value, so a cause from
/// `SoftHangupRequest` survives the final `Hangup`.
#[derive(Debug, Clone)]
pub struct Call {
    source: String,
    destination: String,
    unique_id: String,
    channel: String,
    context: String,
    account_code: String,

    created_at: Instant,
    ringing_at: Option<Instant>,
    answered_at: Option<Instant>,
    hangup_requested_at: Option<Instant>,
    hangup_at: Option<Instant>,

    active_duration_ms: u64,
    total_duration_ms: u64,

    hangup_cause: String,
    hangup_cause_txt: String,
}

impl Call {
    pub fn new(
        source: impl Into<String>,
        destination: impl Into<String>,
        unique_id: impl Into<String>,
        channel: impl Into<String>,
        context: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            unique_id: unique_id.into(),
            channel: channel.into(),
            context: context.into(),
            account_code: String::new(),
            created_at: Instant::now(),
            ringing_at: None,
            answered_at: None,
            hangup_requested_at: None,
            hangup_at: None,
            active_duration_ms: 0,
            total_duration_ms: 0,
            hangup_cause: String::new(),
            hangup_cause_txt: String::new(),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    pub fn account_code(&self) -> &str {
        &self.account_code
    }

    pub fn set_account_code(&mut self, account_code: impl Into<String>) {
        self.account_code = account_code.into();
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn ringing_at(&self) -> Option<Instant> {
        self.ringing_at
    }

    pub fn answered_at(&self) -> Option<Instant> {
        self.answered_at
    }

    pub fn hangup_requested_at(&self) -> Option<Instant> {
        self.hangup_requested_at
    }

    pub fn hangup_at(&self) -> Option<Instant> {
        self.hangup_at
    }

    /// Milliseconds between answer and hangup request; 0 if never answered.
    pub fn active_duration_ms(&self) -> u64 {
        self.active_duration_ms
    }

    /// Milliseconds between creation and the last `hangup()`.
    pub fn total_duration_ms(&self) -> u64 {
        self.total_duration_ms
    }

    /// Q.850 cause code as text; empty until known.
    pub fn hangup_cause(&self) -> &str {
        &self.hangup_cause
    }

    pub fn hangup_cause_txt(&self) -> &str {
        &self.hangup_cause_txt
    }

    pub fn ringing(&mut self) {
        self.ringing_at
            .get_or_insert_with(Instant::now);
    }

    pub fn answered(&mut self) {
        self.answered_at
            .get_or_insert_with(Instant::now);
    }

    fn set_cause_once(&mut self, cause: &str) {
        if self
            .hangup_cause
            .is_empty()
        {
            self.hangup_cause = cause.to_string();
        }
    }

    /// A hangup was requested (`SoftHangupRequest`).
    pub fn hanging_up(&mut self, cause: &str) {
        let requested_at = *self
            .hangup_requested_at
            .get_or_insert_with(Instant::now);
        self.set_cause_once(cause);

        self.active_duration_ms = match self.answered_at {
            Some(answered_at) => millis_between(answered_at, requested_at),
            None => 0,
        };
    }

    /// The channel is gone (`Hangup`). The cause text always takes the latest
    /// value and the total duration is recomputed on every call.
    pub fn hangup(&mut self, cause: &str, cause_txt: &str) {
        let now = Instant::now();
        self.hangup_at
            .get_or_insert(now);
        self.set_cause_once(cause);
        self.hangup_cause_txt = cause_txt.to_string();
        self.total_duration_ms = millis_between(self.created_at, now);
    }

    pub fn disposition(&self) -> Disposition {
        match self
            .hangup_cause
            .as_str()
        {
            CAUSE_NORMAL_CLEARING if self.active_duration_ms > 0 => Disposition::Answered,
            CAUSE_NORMAL_CLEARING => Disposition::NoAnswer,
            CAUSE_USER_BUSY => Disposition::Busy,
            CAUSE_NO_ANSWER if self
                .ringing_at
                .is_some() =>
            {
                Disposition::NoAnswer
            }
            _ => Disposition::Failed,
        }
    }

    pub fn trunk_name(&self) -> &str {
        trunk_name(&self.channel)
    }

    /// Serializable view for state dumps.
    pub fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            unique_id: self
                .unique_id
                .clone(),
            source: self
                .source
                .clone(),
            destination: self
                .destination
                .clone(),
            channel: self
                .channel
                .clone(),
            trunk: self
                .trunk_name()
                .to_string(),
            context: self
                .context
                .clone(),
            account_code: self
                .account_code
                .clone(),
            age_ms: millis_between(self.created_at, Instant::now()),
            ringing: self
                .ringing_at
                .is_some(),
            answered: self
                .answered_at
                .is_some(),
            hangup_requested: self
                .hangup_requested_at
                .is_some(),
            active_duration_ms: self.active_duration_ms,
            total_duration_ms: self.total_duration_ms,
            hangup_cause: self
                .hangup_cause
                .clone(),
            hangup_cause_txt: self
                .hangup_cause_txt
                .clone(),
        }
    }
}

fn millis_between(earlier: Instant, later: Instant) -> u64 {
    later
        .saturating_duration_since(earlier)
        .as_millis() as u64
}

/// Point-in-time copy of a [`Call`], serializable with serde.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallSnapshot {
    pub unique_id: String,
    pub source: String,
    pub destination: String,
    pub channel: String,
    pub trunk: String,
    pub context: String,
    pub account_code: String,
    pub age_ms: u64,
    pub ringing: bool,
    pub answered: bool,
    pub hangup_requested: bool,
    pub active_duration_ms: u64,
    pub total_duration_ms: u64,
    pub hangup_cause: String,
    pub hangup_cause_txt: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::advance;

    fn call() -> Call {
        Call::new(
            "source",
            "destination",
            "uniqueId",
            "SIP/Trunk-channel-1234deadbeef",
            "context",
        )
    }

    #[test]
    fn test_trunk_name() {
        assert_eq!(trunk_name("SIP/Trunk-channel-1234deadbeef"), "Trunk-channel");
        assert_eq!(trunk_name("PJSIP/provider-0000002a"), "provider");
        assert_eq!(trunk_name("SIP/channel"), "SIP/channel");
        assert_eq!(trunk_name("SIP/trunk-XYZ"), "SIP/trunk-XYZ");
        assert_eq!(trunk_name("SIP/trunk-00AB"), "SIP/trunk-00AB");
        assert_eq!(trunk_name("Local/100@ctx-0001;1"), "Local/100@ctx-0001;1");
        assert_eq!(trunk_name("not_set"), "not_set");
        assert_eq!(trunk_name("SIP/trunk-"), "SIP/trunk-");
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_call() {
        let call = call();
        assert_eq!(call.source(), "source");
        assert_eq!(call.destination(), "destination");
        assert_eq!(call.unique_id(), "uniqueId");
        assert_eq!(call.channel(), "SIP/Trunk-channel-1234deadbeef");
        assert_eq!(call.context(), "context");
        assert_eq!(call.trunk_name(), "Trunk-channel");
        assert!(call
            .ringing_at()
            .is_none());
        assert!(call
            .answered_at()
            .is_none());
        assert!(call
            .hangup_at()
            .is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ringing_and_answered_first_write_wins() {
        let mut call = call();
        call.ringing();
        call.answered();
        let ringing_at = call.ringing_at();
        let answered_at = call.answered_at();

        advance(Duration::from_millis(20)).await;
        call.ringing();
        call.answered();
        assert_eq!(call.ringing_at(), ringing_at);
        assert_eq!(call.answered_at(), answered_at);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_up() {
        let mut call = call();
        call.hanging_up("");
        let requested_at = call.hangup_requested_at();
        assert!(requested_at.is_some());
        assert_eq!(call.hangup_cause(), "");

        advance(Duration::from_millis(5)).await;
        call.hanging_up("16");
        assert_eq!(call.hangup_cause(), "16");
        assert_eq!(call.hangup_requested_at(), requested_at);

        call.hanging_up("-1");
        assert_eq!(call.hangup_cause(), "16");
        assert_eq!(call.hangup_requested_at(), requested_at);

        assert_eq!(call.active_duration_ms(), 0);
        assert_eq!(call.total_duration_ms(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hangup_alone() {
        let mut call = call();
        advance(Duration::from_millis(10)).await;
        call.hangup("", "unknown");

        let hangup_at = call.hangup_at();
        assert!(hangup_at.is_some());
        assert_eq!(call.hangup_cause(), "");
        assert_eq!(call.hangup_cause_txt(), "unknown");

        call.hangup("16", "Normal");
        assert_eq!(call.hangup_cause(), "16");
        assert_eq!(call.hangup_cause_txt(), "Normal");
        assert_eq!(call.hangup_at(), hangup_at);

        advance(Duration::from_millis(5)).await;
        call.hangup("-1", "XXX");
        assert_eq!(call.hangup_cause(), "16");
        assert_eq!(call.hangup_cause_txt(), "XXX");
        assert_eq!(call.hangup_at(), hangup_at);

        assert_eq!(call.active_duration_ms(), 0);
        assert_eq!(call.total_duration_ms(), 15);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hangup_durations() {
        let mut call = call();
        call.ringing();
        advance(Duration::from_millis(10)).await;
        call.answered();
        advance(Duration::from_millis(50)).await;
        call.hanging_up("16");
        advance(Duration::from_millis(40)).await;
        call.hangup("-1", "Normal");

        assert_eq!(call.hangup_cause(), "16");
        assert_eq!(call.hangup_cause_txt(), "Normal");
        assert_eq!(call.active_duration_ms(), 50);
        assert_eq!(call.total_duration_ms(), 100);
        assert_eq!(call.disposition(), Disposition::Answered);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disposition_ringing() {
        let mut call = call();
        call.ringing();
        advance(Duration::from_millis(50)).await;
        call.hangup("16", "Normal");
        assert_eq!(call.disposition(), Disposition::NoAnswer);

        let mut call = self::call();
        call.ringing();
        advance(Duration::from_millis(50)).await;
        call.hangup("19", "Normal");
        assert_eq!(call.disposition(), Disposition::NoAnswer);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disposition_busy() {
        let mut call = call();
        call.ringing();
        advance(Duration::from_millis(50)).await;
        call.hangup("17", "Normal");
        assert_eq!(call.disposition(), Disposition::Busy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disposition_failed() {
        let mut call = call();
        call.hangup("19", "Normal");
        assert_eq!(call.disposition(), Disposition::Failed);

        let mut call = self::call();
        call.hangup("-1", "Normal");
        assert_eq!(call.disposition(), Disposition::Failed);
    }

    #[test]
    fn test_disposition_wire_names() {
        assert_eq!(Disposition::NoAnswer.to_string(), "NOANSWER");
        assert_eq!("answered".parse::<Disposition>(), Ok(Disposition::Answered));
        assert!("MAYBE"
            .parse::<Disposition>()
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_serializes() {
        let mut call = call();
        call.set_account_code("acme");
        call.ringing();
        advance(Duration::from_millis(30)).await;

        let snapshot = call.snapshot();
        assert_eq!(snapshot.trunk, "Trunk-channel");
        assert_eq!(snapshot.age_ms, 30);
        assert!(snapshot.ringing);
        assert!(!snapshot.answered);

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["unique_id"], "uniqueId");
        assert_eq!(json["account_code"], "acme");
    }
}
