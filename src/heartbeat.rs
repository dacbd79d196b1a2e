//! Wraps a [`Channel`] with a liveness sub-protocol: periodic `_zpc_hb`
//! events out, a deadline on inbound traffic, transparent to the events the
//! upper layer actually cares about.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use crate::error::{Error, Result};
use crate::event::{Event, Value, HEARTBEAT};
use crate::multiplexer::Channel;
use crate::utils::drop_join_handle::DropJoinHandle;

pub const DEFAULT_FREQUENCY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Alive,
    Lost,
    Closed,
}

struct Shared {
    channel: Arc<Channel>,
    freq: Duration,
    passive: bool,
    last_recv: AtomicU64,
    started: Instant,
    state: std::sync::Mutex<State>,
    lost_notify: Notify,
}

/// Wraps a Channel, transparently emitting and consuming `_zpc_hb` events.
///
/// In `passive` mode (used for legacy protocol `v < 2` peers), the overlay
/// neither emits heartbeats nor enforces the inbound deadline: liveness
/// tracking is delegated entirely to the peer.
pub struct HeartbeatOverlay {
    shared: Arc<Shared>,
    _timer: Option<DropJoinHandle<()>>,
}

impl HeartbeatOverlay {
    pub fn new(channel: Arc<Channel>, passive: bool) -> Arc<Self> {
        Self::with_frequency(channel, passive, DEFAULT_FREQUENCY)
    }

    pub fn with_frequency(channel: Arc<Channel>, passive: bool, freq: Duration) -> Arc<Self> {
        let shared = Arc::new(Shared {
            channel,
            freq,
            passive,
            last_recv: AtomicU64::new(0),
            started: Instant::now(),
            state: std::sync::Mutex::new(State::Alive),
            lost_notify: Notify::new(),
        });

        let timer = if !passive {
            let shared = shared.clone();
            Some(DropJoinHandle::new(tokio::spawn(Self::timer_loop(shared))))
        } else {
            None
        };

        Arc::new(HeartbeatOverlay { shared, _timer: timer })
    }

    fn now_millis(shared: &Shared) -> u64 {
        shared.started.elapsed().as_millis() as u64
    }

    fn touch(shared: &Shared) {
        shared.last_recv.store(Self::now_millis(shared), Ordering::SeqCst);
    }

    fn idle_for(shared: &Shared) -> Duration {
        let last = shared.last_recv.load(Ordering::SeqCst);
        Duration::from_millis(Self::now_millis(shared).saturating_sub(last))
    }

    async fn timer_loop(shared: Arc<Shared>) {
        Self::touch(&shared);
        let deadline = shared.freq * 2;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(shared.freq) => {}
                _ = shared.lost_notify.notified() => return,
            }

            if *shared.state.lock().unwrap() != State::Alive {
                return;
            }

            if Self::idle_for(&shared) > deadline {
                *shared.state.lock().unwrap() = State::Lost;
                shared.lost_notify.notify_waiters();
                log::warn!("heartbeat: no inbound traffic for {deadline:?}, declaring peer lost");
                return;
            }

            let event = shared.channel.new_event(HEARTBEAT, Vec::new(), Default::default());
            if shared.channel.emit_event(event, shared.freq).await.is_err() {
                log::warn!("heartbeat: failed to emit _zpc_hb");
            }
        }
    }

    /// The same liveness check `emit_event`/`recv` perform up front, exposed
    /// for callers blocked on something else (credit, a queue slot) that
    /// want to translate "no longer alive" into the right error once
    /// `closed_or_lost` wakes them.
    pub fn state_error(&self) -> Result<()> {
        self.check_state()
    }

    fn check_state(&self) -> Result<()> {
        match *self.shared.state.lock().unwrap() {
            State::Alive => Ok(()),
            State::Lost => Err(Error::LostRemote),
            State::Closed => Err(Error::TransportClosed),
        }
    }

    pub async fn emit_event(&self, event: Event, timeout_dur: Duration) -> Result<()> {
        self.check_state()?;
        self.shared.channel.emit_event(event, timeout_dur).await
    }

    pub fn new_event(&self, name: &str, args: Vec<Value>, xheader: std::collections::BTreeMap<String, Value>) -> Event {
        self.shared.channel.new_event(name, args, xheader)
    }

    /// Receives the next non-heartbeat event, consuming and refreshing
    /// liveness on any `_zpc_hb` events seen along the way.
    pub async fn recv(&self, timeout_dur: Duration) -> Result<Event> {
        self.check_state()?;

        let deadline = Instant::now() + timeout_dur;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let recv_fut = self.shared.channel.recv(remaining);

            let event = if self.shared.passive {
                recv_fut.await?
            } else {
                tokio::select! {
                    result = recv_fut => result?,
                    _ = self.shared.lost_notify.notified() => {
                        self.check_state()?;
                        continue;
                    }
                }
            };

            if !self.shared.passive {
                Self::touch(&self.shared);
            }

            if event.name == HEARTBEAT {
                continue;
            }
            return Ok(event);
        }
    }

    /// Resolves as soon as this overlay is no longer `Alive` (peer declared
    /// lost, or the overlay closed), for callers blocked on something else
    /// entirely (e.g. a credit wait) that need to abort promptly instead of
    /// riding out their own timeout. Polls rather than subscribing to
    /// `lost_notify` directly, since a waiter that starts after the
    /// transition would otherwise miss a one-shot wakeup.
    pub async fn closed_or_lost(&self) {
        loop {
            if *self.shared.state.lock().unwrap() != State::Alive {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50).min(self.shared.freq / 2)).await;
        }
    }

    pub fn close(&self) {
        let mut state = self.shared.state.lock().unwrap();
        if *state != State::Closed {
            *state = State::Closed;
            self.shared.lost_notify.notify_waiters();
            self.shared.channel.close();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::context::Context;
    use crate::multiplexer::ChannelMultiplexer;
    use crate::transport::pair;

    #[tokio::test]
    async fn filters_out_heartbeat_events() {
        let context = Arc::new(Context::new());
        let (a_source, b_source) = pair::pair(context);
        let a_mux = ChannelMultiplexer::new(a_source, false);
        let b_mux = ChannelMultiplexer::new(b_source, false);

        let a_channel = a_mux.channel(None);
        let hb = HeartbeatOverlay::with_frequency(a_channel.clone(), false, Duration::from_secs(60));

        let first = hb.new_event("ping", vec![], Default::default());
        let request_id = first.header.message_id;
        hb.emit_event(first, Duration::from_secs(1)).await.unwrap();

        let inbound = b_mux.recv(Duration::from_secs(1)).await.unwrap();
        let b_channel = b_mux.channel(Some(inbound));
        let b_hb = HeartbeatOverlay::with_frequency(b_channel.clone(), false, Duration::from_secs(60));

        let heartbeat = b_hb.new_event(HEARTBEAT, vec![], Default::default());
        b_hb.emit_event(heartbeat, Duration::from_secs(1)).await.unwrap();
        let reply = b_hb.new_event("pong", vec![], Default::default());
        b_hb.emit_event(reply, Duration::from_secs(1)).await.unwrap();

        let got = hb.recv(Duration::from_secs(1)).await.unwrap();
        assert_eq!(got.name, "pong");
        assert_eq!(got.header.response_to, Some(request_id));
    }

    #[tokio::test]
    async fn declares_peer_lost_after_deadline_with_no_traffic() {
        let context = Arc::new(Context::new());
        let (a_source, _b_source) = pair::pair(context);
        let a_mux = ChannelMultiplexer::new(a_source, false);
        let a_channel = a_mux.channel(None);

        // nobody on the other end ever answers, so the deadline (2x freq)
        // elapses with no inbound traffic at all.
        let hb = HeartbeatOverlay::with_frequency(a_channel, false, Duration::from_millis(20));

        let err = hb.recv(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, Error::LostRemote));

        // once Lost, stays Lost: further calls fail the same way without
        // waiting out another deadline.
        let err = hb.recv(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, Error::LostRemote));
    }
}
