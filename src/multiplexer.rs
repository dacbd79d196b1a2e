//! Single-reader fan-out from one [`EventSource`] to many [`Channel`]s,
//! routed by the inbound event's `response_to` header.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tokio::time::{timeout, Duration};
use uuid::Uuid;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::event::{Event, Identity, MessageId, Value};
use crate::transport::EventSource;
use crate::utils::drop_join_handle::DropJoinHandle;

/// Capacity of a Channel's inbound queue and of the multiplexer's broadcast
/// fallback queue.
const CHANNEL_QUEUE_CAPACITY: usize = 1;
const BROADCAST_QUEUE_CAPACITY: usize = 1;

struct Shared {
    source: Arc<dyn EventSource>,
    active: Mutex<HashMap<MessageId, mpsc::Sender<Event>>>,
    broadcast_tx: Option<mpsc::Sender<Event>>,
    closed: Notify,
}

/// Owns one `EventSource` and demultiplexes its inbound events to the
/// Channel that is waiting for each `response_to`, falling back to a
/// single-slot broadcast queue for unsolicited events.
pub struct ChannelMultiplexer {
    shared: Arc<Shared>,
    broadcast_rx: Option<AsyncMutex<mpsc::Receiver<Event>>>,
    _dispatcher: Option<DropJoinHandle<()>>,
}

impl ChannelMultiplexer {
    /// `ignore_broadcast` disables the fallback queue entirely: unrouted
    /// events are dropped with a warning instead of being held for `recv`.
    pub fn new(source: Arc<dyn EventSource>, ignore_broadcast: bool) -> Arc<Self> {
        let (broadcast_tx, broadcast_rx) = if !ignore_broadcast && source.recv_is_supported() {
            let (tx, rx) = mpsc::channel(BROADCAST_QUEUE_CAPACITY);
            (Some(tx), Some(AsyncMutex::new(rx)))
        } else {
            (None, None)
        };

        let shared = Arc::new(Shared {
            source: source.clone(),
            active: Mutex::new(HashMap::new()),
            broadcast_tx,
            closed: Notify::new(),
        });

        let dispatcher = if source.recv_is_supported() {
            let shared = shared.clone();
            Some(DropJoinHandle::new(tokio::spawn(Self::dispatch_loop(shared))))
        } else {
            None
        };

        Arc::new(ChannelMultiplexer {
            shared,
            broadcast_rx,
            _dispatcher: dispatcher,
        })
    }

    async fn dispatch_loop(shared: Arc<Shared>) {
        loop {
            let event = match shared.source.recv().await {
                Ok(event) => event,
                Err(err) => {
                    log::warn!("multiplexer dispatcher: recv error, dropping and continuing: {err}");
                    continue;
                }
            };

            let response_to = event.header.response_to;
            let routed = if let Some(id) = response_to {
                let channel_tx = shared.active.lock().unwrap().get(&id).cloned();
                match channel_tx {
                    Some(tx) => tx.send(event).await.is_ok(),
                    None => false,
                }
            } else {
                false
            };

            if routed {
                continue;
            }

            if response_to.is_some() {
                log::warn!("multiplexer: dropping event with unknown response_to {response_to:?}");
                continue;
            }

            if let Some(broadcast_tx) = &shared.broadcast_tx {
                if broadcast_tx.send(event).await.is_err() {
                    break;
                }
            } else {
                log::warn!("multiplexer: dropping unsolicited event, broadcast disabled");
            }
        }
    }

    /// Returns the next unrouted (broadcast) event, or `TimeoutExpired` if
    /// none arrives within `timeout_dur`.
    pub async fn recv(&self, timeout_dur: Duration) -> Result<Event> {
        let rx = self
            .broadcast_rx
            .as_ref()
            .ok_or_else(|| Error::Transport("broadcast queue disabled".to_string()))?;
        let mut rx = rx.lock().await;
        match timeout(timeout_dur, rx.recv()).await {
            Ok(Some(event)) => Ok(event),
            Ok(None) => Err(Error::TransportClosed),
            Err(_) => Err(Error::TimeoutExpired(Some(timeout_dur), String::new())),
        }
    }

    pub async fn emit_event(&self, event: Event, timeout_dur: Duration) -> Result<()> {
        match timeout(timeout_dur, self.shared.source.emit(event)).await {
            Ok(result) => result,
            Err(_) => Err(Error::TimeoutExpired(Some(timeout_dur), String::new())),
        }
    }

    pub fn new_event(&self, name: &str, args: Vec<Value>, xheader: std::collections::BTreeMap<String, Value>) -> Event {
        self.shared.source.new_event(name, args, xheader)
    }

    pub fn context(&self) -> &Arc<Context> {
        self.shared.source.context()
    }

    /// Creates a Channel. When `from_event` is given, the channel is bound
    /// immediately to that event's `message_id` and `identity`, and the
    /// event is pre-seeded into its queue.
    pub fn channel(self: &Arc<Self>, from_event: Option<Event>) -> Arc<Channel> {
        let (tx, rx) = mpsc::channel(CHANNEL_QUEUE_CAPACITY);

        let (channel_id, peer_identity) = match &from_event {
            Some(event) => (Some(event.header.message_id), event.identity.clone()),
            None => (None, None),
        };

        if let Some(id) = channel_id {
            self.shared.active.lock().unwrap().insert(id, tx.clone());
        }

        let channel = Arc::new(Channel {
            multiplexer: self.clone(),
            channel_id: Mutex::new(channel_id),
            peer_identity: Mutex::new(peer_identity),
            tx,
            rx: AsyncMutex::new(rx),
            closed: std::sync::atomic::AtomicBool::new(false),
        });

        if let Some(event) = from_event {
            // bypass the bounded `try_send` to guarantee the seed event is
            // never lost to a race with the dispatcher.
            let sender = channel.tx.clone();
            tokio::spawn(async move {
                let _ = sender.send(event).await;
            });
        }

        channel
    }

    fn register(&self, id: MessageId, tx: mpsc::Sender<Event>) {
        self.shared.active.lock().unwrap().insert(id, tx);
    }

    fn unregister(&self, id: &MessageId) {
        self.shared.active.lock().unwrap().remove(id);
    }

    pub fn close(&self) {
        self.shared.closed.notify_waiters();
        self.shared.active.lock().unwrap().clear();
    }
}

/// The endpoint of one logical call.
pub struct Channel {
    multiplexer: Arc<ChannelMultiplexer>,
    channel_id: Mutex<Option<MessageId>>,
    peer_identity: Mutex<Option<Identity>>,
    tx: mpsc::Sender<Event>,
    rx: AsyncMutex<mpsc::Receiver<Event>>,
    closed: std::sync::atomic::AtomicBool,
}

impl Channel {
    pub fn channel_id(&self) -> Option<Uuid> {
        *self.channel_id.lock().unwrap()
    }

    /// Builds the next event for this call. The first call binds the
    /// channel's id to the new event's `message_id`; subsequent calls stamp
    /// `response_to` with that id.
    pub fn new_event(&self, name: &str, args: Vec<Value>, xheader: std::collections::BTreeMap<String, Value>) -> Event {
        let mut event = self.multiplexer.new_event(name, args, xheader);
        event.identity = self.peer_identity.lock().unwrap().clone();

        let mut channel_id = self.channel_id.lock().unwrap();
        match *channel_id {
            None => {
                *channel_id = Some(event.header.message_id);
                self.multiplexer.register(event.header.message_id, self.tx.clone());
            }
            Some(id) => {
                event.header.response_to = Some(id);
            }
        }
        event
    }

    /// Binds `identity` as the destination of outbound events on this
    /// channel, for use on a routing transport where the peer's address is
    /// only known from a previously received event.
    pub fn set_peer_identity(&self, identity: Option<Identity>) {
        *self.peer_identity.lock().unwrap() = identity;
    }

    pub async fn emit_event(&self, event: Event, timeout_dur: Duration) -> Result<()> {
        self.multiplexer.emit_event(event, timeout_dur).await
    }

    pub async fn recv(&self, timeout_dur: Duration) -> Result<Event> {
        let mut rx = self.rx.lock().await;
        match timeout(timeout_dur, rx.recv()).await {
            Ok(Some(event)) => Ok(event),
            Ok(None) => Err(Error::TransportClosed),
            Err(_) => Err(Error::TimeoutExpired(Some(timeout_dur), String::new())),
        }
    }

    pub fn close(&self) {
        if self
            .closed
            .compare_exchange(
                false,
                true,
                std::sync::atomic::Ordering::SeqCst,
                std::sync::atomic::Ordering::SeqCst,
            )
            .is_ok()
        {
            if let Some(id) = self.channel_id() {
                self.multiplexer.unregister(&id);
            }
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::transport::pair;

    #[tokio::test]
    async fn routes_reply_to_channel_not_broadcast() {
        let context = Arc::new(Context::new());
        let (client_source, server_source) = pair::pair(context);

        let client_mux = ChannelMultiplexer::new(client_source, false);
        let server_mux = ChannelMultiplexer::new(server_source, false);

        let client_channel = client_mux.channel(None);
        let request = client_channel.new_event("echo", vec![], Default::default());
        let request_id = request.header.message_id;
        client_channel.emit_event(request, Duration::from_secs(1)).await.unwrap();

        let inbound = server_mux.recv(Duration::from_secs(1)).await.unwrap();
        assert_eq!(inbound.header.message_id, request_id);

        let server_channel = server_mux.channel(Some(inbound));
        let reply = server_channel.new_event("OK", vec![], Default::default());
        server_channel.emit_event(reply, Duration::from_secs(1)).await.unwrap();

        let got = client_channel.recv(Duration::from_secs(1)).await.unwrap();
        assert_eq!(got.header.response_to, Some(request_id));

        // Nothing pending on the broadcast queue: the reply was routed.
        let res = client_mux.recv(Duration::from_millis(50)).await;
        assert!(matches!(res, Err(Error::TimeoutExpired(..))));
    }
}
