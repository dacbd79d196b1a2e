//! Transport boundary: the `EventSource` trait that adapts a raw
//! bidirectional framed-message socket (DEALER/ROUTER, PUB/SUB, PUSH/PULL)
//! into a source/sink of [`Event`](crate::event::Event)s.
//!
//! Binding, connecting, and wire serialization are left to the embedding
//! application; this crate only depends on the `EventSource` contract.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::context::Context;
use crate::error::Result;
use crate::event::{Event, Value};

pub mod pair;

/// Adapts one transport socket into a producer/consumer of [`Event`]s.
///
/// `recv` is called from a single dedicated task (the
/// [`ChannelMultiplexer`](crate::multiplexer::ChannelMultiplexer)'s
/// dispatcher); implementations do not need to support concurrent `recv`
/// calls. `emit` may be called concurrently from many tasks (one per
/// in-flight `Channel`) and implementations must serialize writes to the
/// underlying socket themselves if it is not itself task-safe.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Blocks until the next inbound frame is available. Has no built-in
    /// timeout; callers (the multiplexer, a `Channel`) apply their own via
    /// `tokio::time::timeout`.
    async fn recv(&self) -> Result<Event>;

    /// Sends one event. On a ROUTER-style socket the implementation should
    /// use `event.identity` as the destination address frame.
    async fn emit(&self, event: Event) -> Result<()>;

    /// Whether this source can produce inbound events at all (false for a
    /// write-only PUSH/PUB-style sender).
    fn recv_is_supported(&self) -> bool;

    /// Whether this source can emit events at all (false for a read-only
    /// PULL/SUB-style receiver).
    fn emit_is_supported(&self) -> bool;

    /// The `Context` that owns this source, used for its protocol version
    /// and registered middleware.
    fn context(&self) -> &Arc<Context>;

    /// Builds a fresh initiating event stamped with this source's protocol
    /// version.
    fn new_event(&self, name: &str, args: Vec<Value>, xheader: BTreeMap<String, Value>) -> Event {
        Event::new(name, args, self.context().version(), xheader)
    }
}
