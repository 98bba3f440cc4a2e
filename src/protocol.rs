//! AMI frame parsing and classification

use crate::{
    action::AmiResponse,
    buffer::FrameBuffer,
    error::{AmiError, AmiResult},
    event::AmiEvent,
    headers::AmiHeader,
};
use std::collections::HashMap;
use tracing::warn;

/// Header lines of one block, in wire order.
pub type HeaderList = Vec<(String, String)>;

/// A decoded AMI header block
#[derive(Debug, Clone, PartialEq)]
pub enum AmiFrame {
    /// Block carrying a `Response` header
    Response(AmiResponse),
    /// Block carrying an `Event` header and no `Response` header
    Event(AmiEvent),
    /// Anything else, headers kept for reporting
    Unrecognized(HeaderList),
}

/// First value of `name`, compared case-insensitively.
pub(crate) fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Collect headers into a map, skipping `excluded` names. First value wins.
fn collect_params(headers: HeaderList, excluded: &[AmiHeader]) -> HashMap<String, String> {
    let mut params = HashMap::with_capacity(headers.len());
    for (key, value) in headers {
        if excluded
            .iter()
            .any(|h| key.eq_ignore_ascii_case(h.as_str()))
        {
            continue;
        }
        params
            .entry(key)
            .or_insert(value);
    }
    params
}

/// Classify a header block.
///
/// `Response` takes precedence over `Event`; a block with neither is
/// [`AmiFrame::Unrecognized`].
pub fn decode(headers: HeaderList) -> AmiFrame {
    if let Some(status) = find_header(&headers, AmiHeader::Response.as_str()) {
        let status = status.to_string();
        let action_id = find_header(&headers, AmiHeader::ActionId.as_str())
            .unwrap_or_default()
            .to_string();
        let params = collect_params(headers, &[AmiHeader::Response]);
        return AmiFrame::Response(AmiResponse::new(action_id, status, params));
    }

    if let Some(name) = find_header(&headers, AmiHeader::Event.as_str()) {
        let name = name.to_string();
        let privilege = find_header(&headers, AmiHeader::Privilege.as_str())
            .filter(|p| !p.is_empty())
            .map(|p| {
                p.split(',')
                    .map(|s| s.trim().to_string())
                    .collect()
            })
            .unwrap_or_default();
        let params = collect_params(headers, &[AmiHeader::Event, AmiHeader::Privilege]);
        return AmiFrame::Event(AmiEvent::from_parts(name, privilege, params));
    }

    AmiFrame::Unrecognized(headers)
}

/// Parse `Name: value` lines. Values are trimmed and otherwise taken as-is.
pub fn parse_headers(block: &str) -> AmiResult<HeaderList> {
    let mut headers = Vec::new();

    for line in block.lines() {
        let line = line.trim_end_matches('\r');
        if line
            .trim()
            .is_empty()
        {
            continue;
        }

        match line.split_once(':') {
            Some((key, value)) if !key
                .trim()
                .is_empty() =>
            {
                headers.push((
                    key.trim()
                        .to_string(),
                    value
                        .trim()
                        .to_string(),
                ));
            }
            _ => {
                return Err(AmiError::InvalidHeader {
                    header: line.to_string(),
                })
            }
        }
    }

    Ok(headers)
}

/// Incremental AMI stream parser
#[derive(Debug, Default)]
pub struct AmiParser {
    buffer: FrameBuffer,
}

impl AmiParser {
    /// Create new parser
    pub fn new() -> Self {
        Self {
            buffer: FrameBuffer::new(),
        }
    }

    /// Add received bytes
    pub fn add_data(&mut self, data: &[u8]) -> AmiResult<()> {
        self.buffer
            .extend_from_slice(data);
        self.buffer
            .check_size_limits()
    }

    /// Take the greeting line, if a full line is buffered.
    pub fn take_banner(&mut self) -> Option<String> {
        let line = self
            .buffer
            .take_line()?;
        self.buffer
            .compact();
        Some(
            String::from_utf8_lossy(&line)
                .trim()
                .to_string(),
        )
    }

    /// Try to decode the next complete frame from the buffer
    pub fn parse_frame(&mut self) -> AmiResult<Option<AmiFrame>> {
        let Some(block) = self
            .buffer
            .take_block()
        else {
            return Ok(None);
        };
        self.buffer
            .compact();

        // Asterisk passes caller names through as raw bytes (often Latin-1)
        let text = match String::from_utf8(block) {
            Ok(text) => text,
            Err(e) => {
                let text = String::from_utf8_lossy(e.as_bytes()).into_owned();
                warn!("[RECV] Non UTF-8 bytes in header block, replaced: {:?}", text);
                text
            }
        };
        let headers = parse_headers(&text)?;
        Ok(Some(decode(headers)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_one(data: &[u8]) -> AmiFrame {
        let mut parser = AmiParser::new();
        parser
            .add_data(data)
            .unwrap();
        parser
            .parse_frame()
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_parse_headers() {
        let headers = parse_headers("Response: Success\r\nMessage: Authentication accepted\r\n").unwrap();
        assert_eq!(
            headers,
            vec![
                ("Response".to_string(), "Success".to_string()),
                ("Message".to_string(), "Authentication accepted".to_string()),
            ]
        );
    }

    #[test]
    fn test_parse_headers_value_with_colon() {
        let headers = parse_headers("Channel: SIP/trunk-00000001\nAppData: a:b:c").unwrap();
        assert_eq!(find_header(&headers, "AppData"), Some("a:b:c"));
    }

    #[test]
    fn test_parse_headers_rejects_line_without_colon() {
        let err = parse_headers("Response: Success\nGARBAGE").unwrap_err();
        assert!(matches!(err, AmiError::InvalidHeader { header } if header == "GARBAGE"));
    }

    #[test]
    fn test_decode_response() {
        let frame = parse_one(b"Response: Success\r\nActionID: ami_statsd:1\r\nMessage: Pong\r\n\r\n");
        let AmiFrame::Response(response) = frame else {
            panic!("expected response, got {frame:?}");
        };
        assert_eq!(response.action_id(), "ami_statsd:1");
        assert_eq!(response.status(), "Success");
        assert_eq!(response.message(), Some("Pong"));
        assert!(response
            .param("Response")
            .is_none());
        assert_eq!(response.param("ActionID"), Some("ami_statsd:1"));
    }

    #[test]
    fn test_decode_response_action_id_case_insensitive() {
        let frame = parse_one(b"Response: Error\nActionid: abc\nMessage: Permission denied\n\n");
        let AmiFrame::Response(response) = frame else {
            panic!("expected response");
        };
        assert_eq!(response.action_id(), "abc");
        assert!(response.is_error());
    }

    #[test]
    fn test_response_wins_over_event() {
        let frame = parse_one(b"Event: Hangup\r\nResponse: Success\r\nActionID: x\r\n\r\n");
        assert!(matches!(frame, AmiFrame::Response(_)));
    }

    #[test]
    fn test_decode_event() {
        let frame = parse_one(
            b"Event: Newchannel\r\nPrivilege: call,all\r\nChannel: SIP/trunk-0001\r\nUniqueid: 1700000000.1\r\n\r\n",
        );
        let AmiFrame::Event(event) = frame else {
            panic!("expected event");
        };
        assert_eq!(event.name(), "Newchannel");
        assert_eq!(event.privilege(), ["call", "all"]);
        assert_eq!(event.unique_id(), Some("1700000000.1"));
        assert!(event
            .param("Event")
            .is_none());
        assert!(event
            .param("Privilege")
            .is_none());
    }

    #[test]
    fn test_decode_event_without_privilege() {
        let frame = parse_one(b"Event: FullyBooted\r\nStatus: Fully Booted\r\n\r\n");
        let AmiFrame::Event(event) = frame else {
            panic!("expected event");
        };
        assert!(event
            .privilege()
            .is_empty());
    }

    #[test]
    fn test_duplicate_header_first_value_wins() {
        let frame = parse_one(b"Event: VarSet\nVariable: A\nVariable: B\n\n");
        let AmiFrame::Event(event) = frame else {
            panic!("expected event");
        };
        assert_eq!(event.param("Variable"), Some("A"));
    }

    #[test]
    fn test_unrecognized_block() {
        let frame = parse_one(b"Foo: bar\r\n\r\n");
        assert_eq!(
            frame,
            AmiFrame::Unrecognized(vec![("Foo".to_string(), "bar".to_string())])
        );
    }

    #[test]
    fn test_banner_then_frames() {
        let mut parser = AmiParser::new();
        parser
            .add_data(b"Asterisk Call Manager/5.0.1\r\nResponse: Success\r\n")
            .unwrap();
        assert_eq!(
            parser
                .take_banner()
                .as_deref(),
            Some("Asterisk Call Manager/5.0.1")
        );
        assert!(parser
            .parse_frame()
            .unwrap()
            .is_none());

        parser
            .add_data(b"ActionID: 7\r\n\r\n")
            .unwrap();
        assert!(matches!(
            parser.parse_frame(),
            Ok(Some(AmiFrame::Response(r))) if r.action_id() == "7"
        ));
    }

    #[test]
    fn test_frames_split_across_reads() {
        let mut parser = AmiParser::new();
        let wire = b"Event: Hangup\r\nUniqueid: 1.2\r\nCause: 16\r\n\r\n";
        for chunk in wire.chunks(5) {
            assert!(parser
                .parse_frame()
                .unwrap()
                .is_none());
            parser
                .add_data(chunk)
                .unwrap();
        }
        let frame = parser
            .parse_frame()
            .unwrap()
            .unwrap();
        assert!(matches!(frame, AmiFrame::Event(e) if e.hangup_cause() == Some("16")));
    }

    #[test]
    fn test_latin1_value_decoded_lossily() {
        let mut parser = AmiParser::new();
        parser
            .add_data(b"Event: Newchannel\r\nUniqueid: 1.1\r\nCallerIDName: Ren\xe9\r\n\r\nEvent: FullyBooted\r\n\r\n")
            .unwrap();

        let frame = parser
            .parse_frame()
            .unwrap()
            .unwrap();
        let AmiFrame::Event(event) = frame else {
            panic!("expected event");
        };
        assert_eq!(event.unique_id(), Some("1.1"));
        assert_eq!(event.param("CallerIDName"), Some("Ren\u{fffd}"));

        assert!(matches!(
            parser.parse_frame(),
            Ok(Some(AmiFrame::Event(e))) if e.name() == "FullyBooted"
        ));
    }
}
