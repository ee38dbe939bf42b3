//! Channel router: classifies raw model text into ordered channel messages
//!
//! Recognized markers (case-insensitive):
//!
//! | Marker | Channel |
//! |--------|---------|
//! | `[ANALYSIS]...[/ANALYSIS]`, `<thinking>...</thinking>` | Analysis |
//! | `[COMMENTARY]...[/COMMENTARY]`, `<tool_call>...</tool_call>` | Commentary |
//! | `[FINAL]...[/FINAL]` | Final |
//!
//! Resolution is deterministic: the earliest opener claims everything up to
//! its matching closer of the same tag, so nested or overlapping markers of
//! other tags end up as literal content. Unmarked text is split around fenced
//! tool-call payloads, tagged Analysis when it asks to continue, and otherwise
//! lands on Final with any signal object cut out. Nothing here ever fails;
//! text the router cannot make sense of is Final.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use regex::Regex;
use serde_json::{Map, Value};
use tracing::debug;

use crate::continuation;
use crate::types::{Channel, ChannelMessage, MessageMetadata};

static MARKER_RE: OnceLock<Regex> = OnceLock::new();
static FENCE_RE: OnceLock<Regex> = OnceLock::new();

fn marker_regex() -> &'static Regex {
    MARKER_RE.get_or_init(|| {
        Regex::new(r"(?i)\[(/?)(analysis|commentary|final)\]|<(/?)(thinking|tool_call)>")
            .expect("marker pattern is valid")
    })
}

fn fence_regex() -> &'static Regex {
    FENCE_RE.get_or_init(|| {
        Regex::new(r"(?s)```[A-Za-z_]*[ \t]*\r?\n?(.*?)```").expect("fence pattern is valid")
    })
}

/// One marker occurrence in the raw text
#[derive(Debug)]
struct Marker {
    start: usize,
    end: usize,
    tag: String,
    closing: bool,
    channel: Channel,
}

/// A classified slice before sequence numbers are assigned
#[derive(Debug)]
struct Segment {
    channel: Channel,
    content: String,
    tool_calls: Vec<Value>,
    contains_continuation: bool,
}

impl Segment {
    fn plain(channel: Channel, content: &str) -> Self {
        Self {
            channel,
            content: content.trim().to_string(),
            tool_calls: Vec::new(),
            contains_continuation: false,
        }
    }
}

/// Routes model output for one agent. Holds the only mutable state: a
/// sequence counter that advances on every call.
#[derive(Debug)]
pub struct ChannelRouter {
    agent_id: String,
    counter: AtomicU64,
}

impl ChannelRouter {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            counter: AtomicU64::new(0),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Highest sequence number handed out so far (0 before the first call)
    pub fn last_sequence(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }

    /// Classify `raw_text` into ordered channel messages.
    ///
    /// `is_partial` marks streaming snapshots; an unclosed opener then
    /// streams its remainder into the opened channel.
    pub fn route_response(&self, raw_text: &str, is_partial: bool) -> Vec<ChannelMessage> {
        let segments = classify(raw_text, is_partial);

        let reserve = segments.len().max(1) as u64;
        let base = self.counter.fetch_add(reserve, Ordering::SeqCst);
        let timestamp = Utc::now();

        segments
            .into_iter()
            .enumerate()
            .map(|(i, segment)| {
                let mut custom = Map::new();
                if segment.contains_continuation {
                    custom.insert("contains_continuation".to_string(), Value::Bool(true));
                }
                ChannelMessage {
                    channel: segment.channel,
                    content: segment.content,
                    metadata: MessageMetadata {
                        sequence: base + i as u64 + 1,
                        agent_id: self.agent_id.clone(),
                        timestamp,
                        is_partial,
                        tool_calls: segment.tool_calls,
                        custom,
                    },
                }
            })
            .collect()
    }
}

fn classify(text: &str, is_partial: bool) -> Vec<Segment> {
    if text.trim().is_empty() {
        return Vec::new();
    }
    let markers = scan_markers(text);
    match split_marked(text, &markers, is_partial) {
        Some(segments) => segments,
        None => classify_unmarked(text),
    }
}

fn scan_markers(text: &str) -> Vec<Marker> {
    marker_regex()
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let (slash, name) = match (caps.get(2), caps.get(4)) {
                (Some(name), _) => (caps.get(1), name),
                (None, Some(name)) => (caps.get(3), name),
                (None, None) => return None,
            };
            let tag = name.as_str().to_lowercase();
            let channel = Channel::from_string(&tag)?;
            Some(Marker {
                start: whole.start(),
                end: whole.end(),
                tag,
                closing: slash.is_some_and(|s| !s.as_str().is_empty()),
                channel,
            })
        })
        .collect()
}

/// Outermost-wins resolution. Returns `None` when no block could be matched,
/// so the caller falls back to unmarked classification.
fn split_marked(text: &str, markers: &[Marker], is_partial: bool) -> Option<Vec<Segment>> {
    let mut segments = Vec::new();
    let mut cursor = 0;
    let mut matched_any = false;
    let mut i = 0;

    while i < markers.len() {
        let opener = &markers[i];
        if opener.closing || opener.start < cursor {
            if opener.closing && opener.start >= cursor {
                debug!("Stray closing marker [/{}] kept as text", opener.tag);
            }
            i += 1;
            continue;
        }

        match find_closer(markers, i) {
            Some(j) => {
                segments.extend(classify_unmarked(&text[cursor..opener.start]));
                if let Some(segment) = marked_segment(opener.channel, &text[opener.end..markers[j].start]) {
                    segments.push(segment);
                }
                cursor = markers[j].end;
                matched_any = true;
                i = j + 1;
            }
            None if is_partial => {
                segments.extend(classify_unmarked(&text[cursor..opener.start]));
                if let Some(segment) = marked_segment(opener.channel, &text[opener.end..]) {
                    segments.push(segment);
                }
                cursor = text.len();
                matched_any = true;
                break;
            }
            None => {
                debug!("Unclosed marker [{}] at byte {} kept as text", opener.tag, opener.start);
                i += 1;
            }
        }
    }

    if !matched_any {
        return None;
    }
    segments.extend(classify_unmarked(&text[cursor..]));
    Some(segments)
}

fn find_closer(markers: &[Marker], opener_idx: usize) -> Option<usize> {
    let tag = &markers[opener_idx].tag;
    let mut depth = 0usize;
    for (j, marker) in markers.iter().enumerate().skip(opener_idx + 1) {
        if &marker.tag != tag {
            continue;
        }
        if !marker.closing {
            depth += 1;
        } else if depth == 0 {
            return Some(j);
        } else {
            depth -= 1;
        }
    }
    None
}

fn marked_segment(channel: Channel, body: &str) -> Option<Segment> {
    let mut segment = Segment::plain(channel, body);
    if segment.content.is_empty() {
        return None;
    }
    match channel {
        Channel::Commentary => {
            if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(&segment.content) {
                segment.tool_calls.push(value);
            }
        }
        Channel::Analysis => {
            segment.contains_continuation = continuation::contains_continuation_hint(&segment.content);
        }
        Channel::Final => return final_segment(&segment.content),
    }
    Some(segment)
}

/// Final text minus signal objects; `None` if nothing visible remains
fn final_segment(text: &str) -> Option<Segment> {
    let visible = continuation::strip_signal_objects(text);
    let segment = Segment::plain(Channel::Final, &visible);
    (!segment.content.is_empty()).then_some(segment)
}

/// Classify text outside any marker
fn classify_unmarked(text: &str) -> Vec<Segment> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    if let Some(segments) = split_tool_payloads(text) {
        return segments;
    }

    if continuation::contains_continuation_hint(text) {
        let mut segment = Segment::plain(Channel::Analysis, text);
        segment.contains_continuation = true;
        return vec![segment];
    }

    final_segment(text).into_iter().collect()
}

/// Split prose around fenced (or bare) JSON objects carrying a `tool` key
fn split_tool_payloads(text: &str) -> Option<Vec<Segment>> {
    if let Some(payload) = tool_payload(text.trim()) {
        let mut segment = Segment::plain(Channel::Commentary, text);
        segment.tool_calls.push(payload);
        return Some(vec![segment]);
    }

    let mut segments = Vec::new();
    let mut cursor = 0;
    for caps in fence_regex().captures_iter(text) {
        let (Some(whole), Some(body)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let Some(payload) = tool_payload(body.as_str().trim()) else {
            continue;
        };
        push_prose(&mut segments, &text[cursor..whole.start()]);
        let mut segment = Segment::plain(Channel::Commentary, body.as_str());
        segment.tool_calls.push(payload);
        segments.push(segment);
        cursor = whole.end();
    }

    if segments.is_empty() {
        return None;
    }
    push_prose(&mut segments, &text[cursor..]);
    Some(segments)
}

fn push_prose(segments: &mut Vec<Segment>, prose: &str) {
    segments.extend(final_segment(prose));
}

fn tool_payload(body: &str) -> Option<Value> {
    match serde_json::from_str::<Value>(body) {
        Ok(value @ Value::Object(_)) if value.get("tool").is_some_and(Value::is_string) => Some(value),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape(messages: &[ChannelMessage]) -> Vec<(Channel, &str)> {
        messages.iter().map(|m| (m.channel, m.content.as_str())).collect()
    }

    #[test]
    fn test_analysis_then_final() {
        let router = ChannelRouter::new("a");
        let out = router.route_response("[ANALYSIS]x[/ANALYSIS][FINAL]y[/FINAL]", false);
        assert_eq!(shape(&out), vec![(Channel::Analysis, "x"), (Channel::Final, "y")]);
        assert!(!out[0].is_user_visible());
        assert!(out[1].is_user_visible());
        assert_eq!(out[0].metadata.agent_id, "a");
    }

    #[test]
    fn test_sequence_strictly_increases_across_partial_and_final() {
        let router = ChannelRouter::new("a");
        let calls = [
            ("[ANALYSIS]th", true),
            ("[ANALYSIS]thinking[/ANALYSIS]", true),
            ("[ANALYSIS]thinking[/ANALYSIS][FINAL]4[/FINAL]", false),
            ("", true),
            ("next answer", false),
        ];
        let mut last = 0;
        for (text, partial) in calls {
            let before = router.last_sequence();
            let out = router.route_response(text, partial);
            assert!(router.last_sequence() > before, "counter must advance on every call");
            for message in out {
                assert!(message.metadata.sequence > last);
                assert_eq!(message.metadata.is_partial, partial);
                last = message.metadata.sequence;
            }
        }
    }

    #[test]
    fn test_alternate_tags() {
        let router = ChannelRouter::new("a");
        let out = router.route_response(
            r#"<thinking>plan</thinking><tool_call>{"tool": "search", "args": {"q": "rust"}}</tool_call>"#,
            false,
        );
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].channel, Channel::Analysis);
        assert_eq!(out[1].channel, Channel::Commentary);
        assert_eq!(out[1].metadata.tool_calls[0]["tool"], "search");
    }

    #[test]
    fn test_markers_case_insensitive() {
        let router = ChannelRouter::new("a");
        let out = router.route_response("[analysis]x[/Analysis]", false);
        assert_eq!(shape(&out), vec![(Channel::Analysis, "x")]);
    }

    #[test]
    fn test_fenced_tool_payload_split() {
        let router = ChannelRouter::new("a");
        let text = "Let me search.\n```json\n{\"tool\": \"search\", \"args\": {\"q\": \"rust\"}}\n```\nBack soon.";
        let out = router.route_response(text, false);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].channel, Channel::Final);
        assert_eq!(out[0].content, "Let me search.");
        assert_eq!(out[1].channel, Channel::Commentary);
        assert_eq!(out[1].metadata.tool_calls[0]["args"]["q"], "rust");
        assert_eq!(out[2].channel, Channel::Final);
        assert_eq!(out[2].content, "Back soon.");
    }

    #[test]
    fn test_fenced_json_without_tool_is_final() {
        let router = ChannelRouter::new("a");
        let text = "Here:\n```json\n{\"name\": \"value\"}\n```";
        let out = router.route_response(text, false);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].channel, Channel::Final);
        assert_eq!(out[0].content, text);
    }

    #[test]
    fn test_bare_tool_payload() {
        let router = ChannelRouter::new("a");
        let out = router.route_response(r#"{"tool": "read_file", "args": {"path": "a.rs"}}"#, false);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].channel, Channel::Commentary);
        assert_eq!(out[0].metadata.tool_calls.len(), 1);
    }

    #[test]
    fn test_continuation_hint_is_analysis() {
        let router = ChannelRouter::new("a");
        let out = router.route_response("Still working on it [CONTINUE]", false);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].channel, Channel::Analysis);
        assert!(out[0].contains_continuation());
    }

    #[test]
    fn test_terminate_signal_answer_is_final() {
        let router = ChannelRouter::new("a");
        let out = router.route_response(
            r#"The answer is 4. {"continuation": {"status": "terminate", "reason": "answered"}}"#,
            false,
        );
        assert_eq!(shape(&out), vec![(Channel::Final, "The answer is 4.")]);
        assert!(!out[0].contains_continuation());

        let out = router.route_response(r#"[FINAL]4 {"continuation": "stop"}[/FINAL]"#, false);
        assert_eq!(shape(&out), vec![(Channel::Final, "4")]);

        // A bare signal leaves nothing to show
        assert!(router.route_response(r#"{"continuation": "terminate"}"#, false).is_empty());
    }

    #[test]
    fn test_plain_text_is_final_in_full() {
        let router = ChannelRouter::new("a");
        let out = router.route_response("The answer is 4.", false);
        assert_eq!(shape(&out), vec![(Channel::Final, "The answer is 4.")]);
        assert!(!out[0].contains_continuation());
    }

    #[test]
    fn test_outermost_marker_wins_when_nested() {
        let router = ChannelRouter::new("a");
        let out = router.route_response("[ANALYSIS]a [FINAL]b[/FINAL] c[/ANALYSIS]", false);
        assert_eq!(shape(&out), vec![(Channel::Analysis, "a [FINAL]b[/FINAL] c")]);
    }

    #[test]
    fn test_overlapping_markers_resolve_deterministically() {
        let router = ChannelRouter::new("a");
        let out = router.route_response("[ANALYSIS]a[FINAL]b[/ANALYSIS]c[/FINAL]", false);
        assert_eq!(
            shape(&out),
            vec![(Channel::Analysis, "a[FINAL]b"), (Channel::Final, "c[/FINAL]")]
        );
    }

    #[test]
    fn test_same_tag_nesting_is_depth_counted() {
        let router = ChannelRouter::new("a");
        let out = router.route_response("[ANALYSIS]x [ANALYSIS]y[/ANALYSIS] z[/ANALYSIS]", false);
        assert_eq!(shape(&out), vec![(Channel::Analysis, "x [ANALYSIS]y[/ANALYSIS] z")]);
    }

    #[test]
    fn test_unclosed_marker_streams_when_partial() {
        let router = ChannelRouter::new("a");
        let out = router.route_response("[ANALYSIS]thinking so fa", true);
        assert_eq!(shape(&out), vec![(Channel::Analysis, "thinking so fa")]);
        assert!(out[0].metadata.is_partial);
    }

    #[test]
    fn test_unclosed_marker_is_literal_when_complete() {
        let router = ChannelRouter::new("a");
        let out = router.route_response("[ANALYSIS]oops", false);
        assert_eq!(shape(&out), vec![(Channel::Final, "[ANALYSIS]oops")]);

        let out = router.route_response("[ANALYSIS]a [FINAL]b[/FINAL]", false);
        assert_eq!(shape(&out), vec![(Channel::Final, "[ANALYSIS]a"), (Channel::Final, "b")]);
    }

    #[test]
    fn test_stray_closer_is_literal() {
        let router = ChannelRouter::new("a");
        let out = router.route_response("hello[/FINAL]", false);
        assert_eq!(shape(&out), vec![(Channel::Final, "hello[/FINAL]")]);
    }

    #[test]
    fn test_prose_between_blocks() {
        let router = ChannelRouter::new("a");
        let out = router.route_response("intro [FINAL]y[/FINAL] outro", false);
        assert_eq!(
            shape(&out),
            vec![(Channel::Final, "intro"), (Channel::Final, "y"), (Channel::Final, "outro")]
        );
    }

    #[test]
    fn test_whitespace_input_advances_counter() {
        let router = ChannelRouter::new("a");
        let out = router.route_response("  \n ", false);
        assert!(out.is_empty());
        assert_eq!(router.last_sequence(), 1);
    }

    #[test]
    fn test_same_input_same_counter_same_output() {
        let first = ChannelRouter::new("a");
        let second = ChannelRouter::new("a");
        let text = "[ANALYSIS]x[/ANALYSIS] tail [CONTINUE]";
        let a = first.route_response(text, false);
        let b = second.route_response(text, false);
        assert_eq!(shape(&a), shape(&b));
        let seq_a: Vec<u64> = a.iter().map(|m| m.metadata.sequence).collect();
        let seq_b: Vec<u64> = b.iter().map(|m| m.metadata.sequence).collect();
        assert_eq!(seq_a, seq_b);
    }

    #[test]
    fn test_empty_blocks_dropped() {
        let router = ChannelRouter::new("a");
        let out = router.route_response("[ANALYSIS]  [/ANALYSIS][FINAL]ok[/FINAL]", false);
        assert_eq!(shape(&out), vec![(Channel::Final, "ok")]);
    }
}
