//! Dispatch table mapping reply event names to completion strategies.
//!
//! A reply event's `response_to` identifies the channel; the pattern is
//! selected dynamically by matching the reply's `name` against each
//! registered pattern's `accepts`, not declared ahead of time by the caller.

use crate::error::Error;
use crate::event::{Event, ERR, OK, STREAM, STREAM_DONE};

/// One item produced while driving a call through its pattern.
pub enum PatternOutcome {
    /// The call is complete; `Reply` carries the final event's args.
    Done(Vec<rmpv::Value>),
    /// One item of a stream; more may follow.
    Item(Vec<rmpv::Value>),
    /// The stream has ended (`STREAM_DONE`); no more items will arrive.
    End,
    /// An `ERR` event was received; reconstructed into a `RemoteError`.
    Error(Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternKind {
    Reply,
    Stream,
}

impl PatternKind {
    /// Picks the pattern that accepts a reply event of this name, or
    /// `None` if no known pattern does (the caller's `NameError` case).
    pub fn for_reply_name(name: &str) -> Option<Self> {
        match name {
            OK | ERR => Some(PatternKind::Reply),
            STREAM | STREAM_DONE => Some(PatternKind::Stream),
            _ => None,
        }
    }

    /// Turns a server handler's result into the wire event(s) its pattern
    /// produces. Reply results in one event; Stream in one event per item
    /// plus a terminal `STREAM_DONE`.
    pub fn reply_event_name(self, is_error: bool) -> &'static str {
        match (self, is_error) {
            (_, true) => ERR,
            (PatternKind::Reply, false) => OK,
            (PatternKind::Stream, false) => STREAM,
        }
    }

    /// Interprets one inbound reply event under this pattern.
    pub fn interpret(self, event: &Event) -> PatternOutcome {
        match (self, event.name.as_str()) {
            (_, ERR) => PatternOutcome::Error(remote_error_from_event(event)),
            (PatternKind::Reply, OK) => PatternOutcome::Done(event.args.clone()),
            (PatternKind::Stream, STREAM) => PatternOutcome::Item(event.args.clone()),
            (PatternKind::Stream, STREAM_DONE) => PatternOutcome::End,
            (pattern, name) => PatternOutcome::Error(Error::NameError(format!(
                "unexpected reply {name:?} for a {pattern:?} call"
            ))),
        }
    }
}

/// Reconstructs a `RemoteError` from an `ERR` event, per protocol version:
/// `v >= 2` carries `(name, message, traceback)`; `v < 2` carries a single
/// message string.
pub fn remote_error_from_event(event: &Event) -> Error {
    if event.header.v >= 2 {
        let name = event.args.first().and_then(|v| v.as_str()).unwrap_or("RemoteError").to_string();
        let message = event.args.get(1).and_then(|v| v.as_str()).unwrap_or_default().to_string();
        let traceback = event.args.get(2).and_then(|v| v.as_str()).map(str::to_string);
        Error::RemoteError { name, message, traceback }
    } else {
        let message = event.args.first().and_then(|v| v.as_str()).unwrap_or_default().to_string();
        Error::RemoteError {
            name: "RemoteError".to_string(),
            message,
            traceback: None,
        }
    }
}

/// Builds the args for an outbound `ERR` event from an `Error`, matching
/// the same version split on the way out.
pub fn error_to_args(error: &Error, v: i64) -> Vec<rmpv::Value> {
    if v >= 2 {
        let traceback = match error {
            Error::RemoteError { traceback, .. } => traceback.clone(),
            _ => None,
        };
        vec![
            rmpv::Value::from(error.remote_name()),
            rmpv::Value::from(error.to_string()),
            traceback.map(rmpv::Value::from).unwrap_or(rmpv::Value::Nil),
        ]
    } else {
        vec![rmpv::Value::from(error.to_string())]
    }
}
