//! Server-sent event framing for streamed answers.
//!
//! Each [`ChatFrame`] becomes one `data: <payload>\n\n` event:
//!
//! | Frame | Payload |
//! |-------|---------|
//! | `Delta(text)` | the text, with `\n` escaped as `\\n` |
//! | `Sources(refs)` | `[SOURCES] <json array>`, followed by a `[DONE]` event |
//! | `Error(message)` | `[ERROR] <message>`; no `[DONE]` follows |

use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};
use std::convert::Infallible;

use crate::chat::{AnswerStream, ChatFrame};
use crate::models::SourceRef;

pub const DONE: &str = "[DONE]";
pub const SOURCES_PREFIX: &str = "[SOURCES] ";
pub const ERROR_PREFIX: &str = "[ERROR] ";

fn escape(text: &str) -> String {
    text.replace('\n', "\\n")
}

fn unescape(text: &str) -> String {
    text.replace("\\n", "\n")
}

fn event(payload: &str) -> Bytes {
    Bytes::from(format!("data: {}\n\n", payload))
}

/// Encode one frame as its wire events.
pub fn encode(frame: &ChatFrame) -> Vec<Bytes> {
    match frame {
        ChatFrame::Delta(text) => vec![event(&escape(text))],
        ChatFrame::Sources(sources) => {
            let json = serde_json::to_string(sources).unwrap_or_else(|_| "[]".to_string());
            vec![event(&format!("{}{}", SOURCES_PREFIX, json)), event(DONE)]
        }
        ChatFrame::Error(message) => vec![event(&format!("{}{}", ERROR_PREFIX, escape(message)))],
    }
}

/// Byte stream suitable for `axum::body::Body::from_stream`.
pub fn frame_stream(answer: AnswerStream) -> impl Stream<Item = Result<Bytes, Infallible>> + Send {
    answer.flat_map(|frame| stream::iter(encode(&frame).into_iter().map(Ok)))
}

/// A decoded event, as seen by a client.
#[derive(Debug, Clone, PartialEq)]
pub enum SseEvent {
    Delta(String),
    Sources(Vec<SourceRef>),
    Done,
    Error(String),
}

/// Decode a complete event-stream body. Unparseable source payloads are
/// reported as errors.
pub fn parse_events(body: &str) -> Vec<SseEvent> {
    body.split("\n\n")
        .filter_map(|raw| raw.strip_prefix("data: "))
        .map(|payload| {
            if payload == DONE {
                SseEvent::Done
            } else if let Some(json) = payload.strip_prefix(SOURCES_PREFIX) {
                serde_json::from_str(json)
                    .map(SseEvent::Sources)
                    .unwrap_or_else(|e| SseEvent::Error(format!("bad sources payload: {}", e)))
            } else if let Some(message) = payload.strip_prefix(ERROR_PREFIX) {
                SseEvent::Error(unescape(message))
            } else {
                SseEvent::Delta(unescape(payload))
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DocumentType;

    fn text(frames: Vec<ChatFrame>) -> String {
        frames
            .iter()
            .flat_map(encode)
            .map(|b| String::from_utf8(b.to_vec()).unwrap())
            .collect()
    }

    #[test]
    fn deltas_escape_newlines() {
        let wire = text(vec![ChatFrame::Delta("line one\nline two".into())]);
        assert_eq!(wire, "data: line one\\nline two\n\n");
        assert_eq!(
            parse_events(&wire),
            vec![SseEvent::Delta("line one\nline two".into())]
        );
    }

    #[test]
    fn sources_are_followed_by_done() {
        let source = SourceRef {
            document_id: 2,
            title: "Ming Naval Tech".into(),
            author: "Unknown".into(),
            year: Some(1420),
            doc_type: DocumentType::Article,
            similarity: Some(0.75),
        };
        let wire = text(vec![
            ChatFrame::Delta("Hi".into()),
            ChatFrame::Sources(vec![source.clone()]),
        ]);
        assert!(wire.ends_with("data: [DONE]\n\n"));
        assert_eq!(
            parse_events(&wire),
            vec![
                SseEvent::Delta("Hi".into()),
                SseEvent::Sources(vec![source]),
                SseEvent::Done
            ]
        );
    }

    #[test]
    fn errors_do_not_emit_done() {
        let wire = text(vec![ChatFrame::Error("model unavailable".into())]);
        assert_eq!(wire, "data: [ERROR] model unavailable\n\n");
        assert!(!wire.contains(DONE));
    }

    #[tokio::test]
    async fn frame_stream_flattens_events() {
        let answer: AnswerStream = Box::pin(stream::iter(vec![
            ChatFrame::Delta("a".into()),
            ChatFrame::Sources(vec![]),
        ]));
        let chunks: Vec<Bytes> = frame_stream(answer).map(|r| r.unwrap()).collect().await;
        assert_eq!(chunks.len(), 3);
        assert_eq!(&chunks[1][..], b"data: [SOURCES] []\n\n");
    }
}
