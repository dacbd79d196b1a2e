//! An in-memory `EventSource` pair, standing in for a connected
//! DEALER/ROUTER (or PUSH/PULL) socket pair in tests and examples.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};

use crate::context::Context;
use crate::error::Error;
use crate::event::Event;

use super::EventSource;

/// Default capacity of each direction's queue. Mirrors a typical
/// `Hub` broadcast capacity, not anything prescribed by the protocol.
const DEFAULT_CAPACITY: usize = 64;

pub struct PairEventSource {
    context: Arc<Context>,
    identity: Bytes,
    tx: Mutex<mpsc::Sender<Event>>,
    rx: Mutex<mpsc::Receiver<Event>>,
}

/// Builds two `EventSource`s wired to each other, each stamping outbound
/// events with its own identity so the peer can see who sent what.
pub fn pair(context: Arc<Context>) -> (Arc<PairEventSource>, Arc<PairEventSource>) {
    pair_with_capacity(context, DEFAULT_CAPACITY)
}

pub fn pair_with_capacity(context: Arc<Context>, capacity: usize) -> (Arc<PairEventSource>, Arc<PairEventSource>) {
    let (tx_a, rx_b) = mpsc::channel(capacity);
    let (tx_b, rx_a) = mpsc::channel(capacity);
    let a = Arc::new(PairEventSource {
        context: context.clone(),
        identity: Bytes::from_static(b"a"),
        tx: Mutex::new(tx_a),
        rx: Mutex::new(rx_a),
    });
    let b = Arc::new(PairEventSource {
        context,
        identity: Bytes::from_static(b"b"),
        tx: Mutex::new(tx_b),
        rx: Mutex::new(rx_b),
    });
    (a, b)
}

#[async_trait]
impl EventSource for PairEventSource {
    async fn recv(&self) -> crate::error::Result<Event> {
        let mut rx = self.rx.lock().await;
        rx.recv().await.ok_or(Error::TransportClosed)
    }

    async fn emit(&self, mut event: Event) -> crate::error::Result<()> {
        event.identity = Some(self.identity.clone());
        let tx = self.tx.lock().await;
        tx.send(event).await.map_err(|_| Error::TransportClosed)
    }

    fn recv_is_supported(&self) -> bool {
        true
    }

    fn emit_is_supported(&self) -> bool {
        true
    }

    fn context(&self) -> &Arc<Context> {
        &self.context
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn round_trips_an_event() {
        let context = Arc::new(Context::new());
        let (a, b) = pair(context);

        let event = a.new_event("hello", vec![], Default::default());
        let sent_id = event.header.message_id;
        a.emit(event).await.unwrap();

        let received = b.recv().await.unwrap();
        assert_eq!(received.header.message_id, sent_id);
        assert_eq!(received.identity.as_deref(), Some(&b"a"[..]));
    }
}
