//! Core of a lightweight RPC framework layered atop a message-queue
//! transport: event multiplexing, per-call channels, heartbeat-based
//! liveness detection, and credit-based flow control for streamed replies.
//!
//! Binding/connecting sockets, wire serialization, and command-line
//! driver programs are left to the embedding application; this crate
//! depends only on the [`transport::EventSource`] contract.

pub mod buffered;
pub mod client;
pub mod context;
pub mod error;
pub mod event;
pub mod heartbeat;
pub mod multiplexer;
pub mod oneway;
pub mod pattern;
pub mod registry;
pub mod server;
pub mod transport;
mod utils;

pub use client::{Client, ClientOptions, Reply};
pub use context::{fork_task_context, Context, Middleware};
pub use error::{Error, Result};
pub use event::{Event, Header, Identity, MessageId, Value};
pub use multiplexer::{Channel, ChannelMultiplexer};
pub use oneway::{OneWayReceiver, OneWaySender};
pub use registry::{ArgSpec, Method, MethodOutcome, ReplyFn, Registry, StreamFn};
pub use server::{Server, ServerHandle, ServerOptions};
pub use transport::EventSource;
