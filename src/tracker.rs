//! Call tracking: turns channel events into call state and measurements

use crate::{
    call::Call,
    connection::AmiClient,
    error::AmiResult,
    event::{AmiEvent, AmiEventType, ChannelState},
    headers::AmiHeader,
    metrics::{Measure, MetricsEmitter},
    registry::CallRegistry,
};
use std::sync::Arc;
use tracing::{debug, error};

const DEFAULT_SOURCE: &str = "anonymous";
const DEFAULT_DESTINATION: &str = "s";
const NOT_SET: &str = "not_set";

/// Tag value for aggregates across trunks.
const ALL_TRUNKS: &str = "All";
/// Tag value standing in for an empty cause.
const EMPTY_TAG: &str = "-";

const METRIC_CONCURRENT: &str = "concurrent";
const METRIC_CALLS: &str = "calls";
const METRIC_ACTIVE_DURATION: &str = "active_duration";
const METRIC_TOTAL_DURATION: &str = "total_duration";

/// Events the tracker subscribes to.
pub const TRACKED_EVENTS: [AmiEventType; 5] = [
    AmiEventType::Newchannel,
    AmiEventType::Newstate,
    AmiEventType::NewAccountCode,
    AmiEventType::SoftHangupRequest,
    AmiEventType::Hangup,
];

fn tag_or_dash(value: &str) -> &str {
    if value.is_empty() {
        EMPTY_TAG
    } else {
        value
    }
}

/// Keeps one [`Call`] per `Uniqueid` and reports call metrics.
///
/// Only `Newchannel` starts tracking; other events for unknown ids are
/// ignored. A call is dropped from the registry right after its `Hangup`.
#[derive(Debug, Clone)]
pub struct CallTracker {
    registry: Arc<CallRegistry>,
    metrics: Arc<MetricsEmitter>,
}

impl CallTracker {
    pub fn new(registry: Arc<CallRegistry>, metrics: Arc<MetricsEmitter>) -> Self {
        Self { registry, metrics }
    }

    pub fn registry(&self) -> &Arc<CallRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<MetricsEmitter> {
        &self.metrics
    }

    /// Register a handler on `client` for each of [`TRACKED_EVENTS`].
    pub fn install(&self, client: &AmiClient) -> AmiResult<()> {
        for event_type in TRACKED_EVENTS {
            let tracker = self.clone();
            client.register_handler(event_type.as_str(), move |event: &AmiEvent| {
                tracker.handle_event(event)
            })?;
        }
        Ok(())
    }

    /// Apply one event. Events outside [`TRACKED_EVENTS`] are ignored.
    pub fn handle_event(&self, event: &AmiEvent) {
        let Some(event_type) = event
            .event_type()
            .filter(|t| TRACKED_EVENTS.contains(t))
        else {
            return;
        };

        let unique_id = match event.unique_id() {
            Some(id) if !id.is_empty() => id,
            _ => {
                error!("no Uniqueid found in {} event", event.name());
                return;
            }
        };

        if !self
            .registry
            .contains(unique_id)
        {
            if event_type != AmiEventType::Newchannel {
                return;
            }
            let call = Call::new(
                event.param_or(AmiHeader::CallerIdNum, DEFAULT_SOURCE),
                event.param_or(AmiHeader::Exten, DEFAULT_DESTINATION),
                unique_id,
                event.param_or(AmiHeader::Channel, NOT_SET),
                event.param_or(AmiHeader::Context, NOT_SET),
            );
            debug!("tracking call {} on {}", unique_id, call.channel());
            self.registry
                .watch(call);
        }

        let Some(call) = self
            .registry
            .update(unique_id, |call| {
                apply(event_type, call, event);
                call.clone()
            })
        else {
            return;
        };

        self.report(event_type, &call);

        if event_type == AmiEventType::Hangup {
            self.registry
                .unwatch(unique_id);
            debug!(
                "call {} finished: {} ({}ms)",
                unique_id,
                call.disposition(),
                call.total_duration_ms()
            );
        }
    }

    fn report(&self, event_type: AmiEventType, call: &Call) {
        let trunk = call.trunk_name();
        match event_type {
            AmiEventType::Newchannel => {
                for trunk in [trunk, ALL_TRUNKS] {
                    self.metrics
                        .increment_gauge(&Measure::new(METRIC_CONCURRENT).tag("trunk", trunk));
                    self.metrics
                        .increment_counter(&Measure::new(METRIC_CALLS).tag("trunk", trunk));
                }
            }
            AmiEventType::Hangup => {
                for trunk in [trunk, ALL_TRUNKS] {
                    self.metrics
                        .decrement_gauge(&Measure::new(METRIC_CONCURRENT).tag("trunk", trunk));
                }

                let disposition = call.disposition();
                for (name, millis) in [
                    (METRIC_ACTIVE_DURATION, call.active_duration_ms()),
                    (METRIC_TOTAL_DURATION, call.total_duration_ms()),
                ] {
                    let measure = Measure::new(name)
                        .tag("cause", tag_or_dash(call.hangup_cause()))
                        .tag("cause_txt", tag_or_dash(call.hangup_cause_txt()))
                        .tag("disposition", disposition.as_str());
                    self.metrics
                        .timing(&measure.clone().tag("trunk", trunk), millis);
                    self.metrics
                        .timing(&measure.tag("trunk", ALL_TRUNKS), millis);
                }
            }
            _ => {}
        }
    }
}

fn apply(event_type: AmiEventType, call: &mut Call, event: &AmiEvent) {
    match event_type {
        AmiEventType::Newstate => match event.channel_state() {
            Some(ChannelState::Ring | ChannelState::Ringing) => call.ringing(),
            Some(ChannelState::Up) => call.answered(),
            _ => error!(
                "unknown state {:?} for call {}",
                event
                    .param(AmiHeader::ChannelStateDesc)
                    .unwrap_or_default(),
                call.unique_id()
            ),
        },
        AmiEventType::NewAccountCode => {
            call.set_account_code(
                event
                    .account_code()
                    .unwrap_or_default(),
            );
        }
        AmiEventType::SoftHangupRequest => {
            call.hanging_up(
                event
                    .hangup_cause()
                    .unwrap_or_default(),
            );
        }
        AmiEventType::Hangup => {
            call.hangup(
                event
                    .hangup_cause()
                    .unwrap_or_default(),
                event
                    .hangup_cause_txt()
                    .unwrap_or_default(),
            );
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MetricsError;
    use crate::metrics::MetricsSink;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::advance;

    #[derive(Default)]
    struct RecordingSink {
        lines: Mutex<Vec<String>>,
    }

    impl RecordingSink {
        fn lines(&self) -> Vec<String> {
            self.lines
                .lock()
                .unwrap()
                .clone()
        }

        fn push(&self, line: String) -> Result<(), MetricsError> {
            self.lines
                .lock()
                .unwrap()
                .push(line);
            Ok(())
        }
    }

    impl MetricsSink for RecordingSink {
        fn gauge(&self, id: &str, value: u64) -> Result<(), MetricsError> {
            self.push(format!("{}:{}|g", id, value))
        }

        fn gauge_delta(&self, id: &str, delta: i64) -> Result<(), MetricsError> {
            self.push(format!("{}:{:+}|g", id, delta))
        }

        fn incr(&self, id: &str, count: u64) -> Result<(), MetricsError> {
            self.push(format!("{}:{}|c", id, count))
        }

        fn timing(&self, id: &str, millis: u64) -> Result<(), MetricsError> {
            self.push(format!("{}:{}|ms", id, millis))
        }
    }

    fn tracker() -> (Arc<RecordingSink>, CallTracker) {
        let sink = Arc::new(RecordingSink::default());
        let tracker = CallTracker::new(
            Arc::new(CallRegistry::new()),
            Arc::new(MetricsEmitter::new(sink.clone())),
        );
        (sink, tracker)
    }

    fn newchannel(id: &str) -> AmiEvent {
        AmiEvent::new("Newchannel")
            .with_param("Uniqueid", id)
            .with_param("Channel", "SIP/provider-0000001f")
            .with_param("CallerIDNum", "0612345678")
            .with_param("Exten", "100")
            .with_param("Context", "from-trunk")
    }

    fn newstate(id: &str, state: &str) -> AmiEvent {
        AmiEvent::new("Newstate")
            .with_param("Uniqueid", id)
            .with_param("ChannelStateDesc", state)
    }

    fn hangup(id: &str, cause: &str, txt: &str) -> AmiEvent {
        AmiEvent::new("Hangup")
            .with_param("Uniqueid", id)
            .with_param("Cause", cause)
            .with_param("Cause-txt", txt)
    }

    #[tokio::test(start_paused = true)]
    async fn test_newchannel_creates_call_and_counts() {
        let (sink, tracker) = tracker();
        tracker.handle_event(&newchannel("1.1"));

        let call = tracker
            .registry()
            .lookup("1.1")
            .unwrap();
        assert_eq!(call.source(), "0612345678");
        assert_eq!(call.destination(), "100");
        assert_eq!(call.context(), "from-trunk");
        assert_eq!(call.trunk_name(), "provider");

        assert_eq!(
            sink.lines(),
            vec![
                "concurrent,trunk=provider:0|g",
                "concurrent,trunk=provider:+1|g",
                "calls,trunk=provider:1|c",
                "concurrent,trunk=All:0|g",
                "concurrent,trunk=All:+1|g",
                "calls,trunk=All:1|c",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_newchannel_defaults() {
        let (_sink, tracker) = tracker();
        tracker.handle_event(&AmiEvent::new("Newchannel").with_param("Uniqueid", "2.2"));

        let call = tracker
            .registry()
            .lookup("2.2")
            .unwrap();
        assert_eq!(call.source(), "anonymous");
        assert_eq!(call.destination(), "s");
        assert_eq!(call.channel(), "not_set");
        assert_eq!(call.context(), "not_set");
    }

    #[tokio::test(start_paused = true)]
    async fn test_newchannel_empty_header_kept_empty() {
        let (_sink, tracker) = tracker();
        tracker.handle_event(
            &AmiEvent::new("Newchannel")
                .with_param("Uniqueid", "3.3")
                .with_param("CallerIDNum", "")
                .with_param("Exten", "200"),
        );

        let call = tracker
            .registry()
            .lookup("3.3")
            .unwrap();
        assert_eq!(call.source(), "");
        assert_eq!(call.destination(), "200");
        assert_eq!(call.channel(), "not_set");
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_answered_call() {
        let (sink, tracker) = tracker();
        tracker.handle_event(&newchannel("1.1"));
        tracker.handle_event(&newstate("1.1", "Ringing"));
        advance(Duration::from_millis(10)).await;
        tracker.handle_event(&newstate("1.1", "Up"));
        advance(Duration::from_millis(50)).await;
        tracker.handle_event(
            &AmiEvent::new("SoftHangupRequest")
                .with_param("Uniqueid", "1.1")
                .with_param("Cause", "16"),
        );
        advance(Duration::from_millis(40)).await;
        tracker.handle_event(&hangup("1.1", "-1", "Normal Clearing"));

        assert!(tracker
            .registry()
            .is_empty());

        let lines = sink.lines();
        let tail: Vec<&str> = lines[6..]
            .iter()
            .map(String::as_str)
            .collect();
        assert_eq!(
            tail,
            vec![
                "concurrent,trunk=provider:-1|g",
                "concurrent,trunk=All:-1|g",
                "active_duration,cause=16,cause_txt=Normal Clearing,disposition=ANSWERED,trunk=provider:50|ms",
                "active_duration,cause=16,cause_txt=Normal Clearing,disposition=ANSWERED,trunk=All:50|ms",
                "total_duration,cause=16,cause_txt=Normal Clearing,disposition=ANSWERED,trunk=provider:100|ms",
                "total_duration,cause=16,cause_txt=Normal Clearing,disposition=ANSWERED,trunk=All:100|ms",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_cause_tags_use_dash() {
        let (sink, tracker) = tracker();
        tracker.handle_event(&newchannel("1.1"));
        tracker.handle_event(&AmiEvent::new("Hangup").with_param("Uniqueid", "1.1"));

        assert!(sink
            .lines()
            .iter()
            .any(|l| l.starts_with("total_duration,cause=-,cause_txt=-,disposition=FAILED,trunk=All:")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_call_ignored() {
        let (sink, tracker) = tracker();
        tracker.handle_event(&newstate("9.9", "Up"));
        tracker.handle_event(&hangup("9.9", "16", "Normal"));
        assert!(tracker
            .registry()
            .is_empty());
        assert!(sink
            .lines()
            .is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_unique_id_ignored() {
        let (sink, tracker) = tracker();
        tracker.handle_event(&AmiEvent::new("Newchannel").with_param("Channel", "SIP/a-1"));
        assert!(tracker
            .registry()
            .is_empty());
        assert!(sink
            .lines()
            .is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_state_leaves_call_untouched() {
        let (_sink, tracker) = tracker();
        tracker.handle_event(&newchannel("1.1"));
        tracker.handle_event(&newstate("1.1", "Dialing"));
        let call = tracker
            .registry()
            .lookup("1.1")
            .unwrap();
        assert!(call
            .ringing_at()
            .is_none());
        assert!(call
            .answered_at()
            .is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_account_code_updated() {
        let (_sink, tracker) = tracker();
        tracker.handle_event(&newchannel("1.1"));
        tracker.handle_event(
            &AmiEvent::new("NewAccountCode")
                .with_param("Uniqueid", "1.1")
                .with_param("AccountCode", "acme"),
        );
        assert_eq!(
            tracker
                .registry()
                .lookup("1.1")
                .unwrap()
                .account_code(),
            "acme"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_untracked_event_type_ignored() {
        let (sink, tracker) = tracker();
        tracker.handle_event(&AmiEvent::new("VarSet").with_param("Uniqueid", "1.1"));
        assert!(tracker
            .registry()
            .is_empty());
        assert!(sink
            .lines()
            .is_empty());
    }

    #[test]
    fn test_install_registers_handlers_once() {
        let client = AmiClient::new(
            "admin:secret@127.0.0.1"
                .parse()
                .unwrap(),
            Default::default(),
        );
        let (_sink, tracker) = tracker();
        tracker
            .install(&client)
            .unwrap();
        assert!(tracker
            .install(&client)
            .is_err());
    }
}
