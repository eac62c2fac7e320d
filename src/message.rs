//! DAP message envelopes.
//!
//! Every frame is decoded once, at the codec boundary, into the [`Message`]
//! sum type; downstream logic matches on the tag instead of re-checking the
//! `type` field. Unknown envelope fields are preserved in a flattened map so
//! messages survive a decode/encode round trip unchanged.

use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::path::Path;
use std::sync::mpsc::{Receiver, Sender, channel};

/// A single DAP protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Message {
    Request(Request),
    Response(Response),
    Event(Event),
}

/// DAP request envelope.
///
/// Fields beyond the envelope are opaque payload the proxy does not
/// interpret except for a small allow-list of commands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub seq: i64,
    #[serde(default)]
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// DAP response envelope.
///
/// The protocol allows responses with no `body` field at all, so the
/// body stays an optional `serde_json::Value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub seq: i64,
    #[serde(default)]
    pub request_seq: i64,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// DAP event envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(default)]
    pub seq: i64,
    #[serde(default)]
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Message {
    /// Short description for log lines.
    pub fn describe(&self) -> String {
        match self {
            Message::Request(req) => format!("request `{}` (seq {})", req.command, req.seq),
            Message::Response(resp) => {
                format!("response `{}` (request_seq {})", resp.command, resp.request_seq)
            }
            Message::Event(ev) => format!("event `{}` (seq {})", ev.event, ev.seq),
        }
    }

    /// Synthesize a failure response for a request the proxy cannot serve.
    pub fn error_response(request: &Request, message: impl Into<String>) -> Message {
        Message::Response(Response {
            seq: 0,
            request_seq: request.seq,
            success: false,
            command: request.command.clone(),
            message: Some(message.into()),
            body: None,
            extra: Map::new(),
        })
    }

    /// Synthesize a success response for a request answered locally instead
    /// of being forwarded to the backend.
    pub fn local_success(request: &Request) -> Message {
        Message::Response(Response {
            seq: 0,
            request_seq: request.seq,
            success: true,
            command: request.command.clone(),
            message: None,
            body: None,
            extra: Map::new(),
        })
    }

    /// Synthesize an `output` event carrying diagnostic text.
    pub fn output(category: &str, output: impl Into<String>) -> Message {
        Message::Event(Event {
            seq: 0,
            event: "output".to_string(),
            body: Some(json!({ "category": category, "output": output.into() })),
            extra: Map::new(),
        })
    }

    /// Synthesize a `terminated` event.
    pub fn terminated() -> Message {
        Message::Event(Event {
            seq: 0,
            event: "terminated".to_string(),
            body: None,
            extra: Map::new(),
        })
    }

    /// Synthesize a `continued` event for backends that omit it after a
    /// `continue` response.
    pub fn continued(thread_id: i64) -> Message {
        Message::Event(Event {
            seq: 0,
            event: "continued".to_string(),
            body: Some(json!({ "threadId": thread_id, "allThreadsContinued": false })),
            extra: Map::new(),
        })
    }

    /// Synthesize a `runInTerminal` reverse request asking the editor to run
    /// the backend command line inside a terminal.
    pub fn run_in_terminal(
        kind: &str,
        title: &str,
        cwd: Option<&Path>,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> Message {
        Message::Request(Request {
            seq: 0,
            command: "runInTerminal".to_string(),
            arguments: Some(json!({
                "kind": kind,
                "title": title,
                "cwd": cwd.map(|p| p.display().to_string()).unwrap_or_default(),
                "args": args,
                "env": env,
            })),
            extra: Map::new(),
        })
    }
}

/// Editor-facing message channel.
///
/// The relay, the supervisor and its scanner threads all emit through
/// clones of one sink; the consumer receives from the paired
/// [`Receiver`]. Sending after the consumer went away only drops the
/// message.
#[derive(Clone)]
pub struct EventSink {
    tx: Sender<Message>,
}

impl EventSink {
    pub fn new() -> (EventSink, Receiver<Message>) {
        let (tx, rx) = channel();
        (EventSink { tx }, rx)
    }

    pub fn send(&self, message: Message) {
        if self.tx.send(message).is_err() {
            debug!(target: "proxy", "editor channel closed; dropping outbound message");
        }
    }

    /// Shortcut for diagnostic `output` events.
    pub fn output(&self, category: &str, text: impl Into<String>) {
        self.send(Message::output(category, text));
    }
}
