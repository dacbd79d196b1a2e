//! Fire-and-forget delivery over a write-only or read-only `EventSource`
//! (PUSH/PULL, PUB/SUB): no reply, no channel, no flow control — just a
//! bare event in or out.

use std::sync::Arc;

use crate::context::Context;
use crate::error::Result;
use crate::event::Value;
use crate::registry::{name_error, Method, MethodOutcome, Registry};
use crate::transport::EventSource;
use crate::utils::drop_join_handle::DropJoinHandle;

/// Emits events with no expectation of a reply. Backs both PUSH (point to
/// point) and PUB (broadcast) sockets; the distinction lives entirely in
/// which `EventSource` it is constructed over.
pub struct OneWaySender {
    source: Arc<dyn EventSource>,
    context: Arc<Context>,
}

impl OneWaySender {
    pub fn new(source: Arc<dyn EventSource>) -> Self {
        let context = source.context().clone();
        OneWaySender { source, context }
    }

    pub async fn send(&self, method: &str, args: Vec<Value>) -> Result<()> {
        let xheader = self.context.hook_get_task_context();
        let event = self.source.new_event(method, args, xheader);
        self.source.emit(event).await
    }
}

/// Dispatches inbound events to registered handlers with no reply sent
/// back, mirroring `Pusher`/`Puller` and `Publisher`/`Subscriber`.
pub struct OneWayReceiver {
    source: Arc<dyn EventSource>,
    context: Arc<Context>,
    registry: Registry,
}

impl OneWayReceiver {
    pub fn new(source: Arc<dyn EventSource>, registry: Registry) -> Arc<Self> {
        let context = source.context().clone();
        Arc::new(OneWayReceiver { source, context, registry })
    }

    /// Runs the receive loop until the transport closes. Unlike the
    /// request/reply server, there is exactly one reader task and no
    /// per-call concurrency: handlers run sequentially, in arrival order.
    pub fn run(self: Arc<Self>) -> DropJoinHandle<()> {
        DropJoinHandle::new(tokio::spawn(async move { self.receive_loop().await }))
    }

    async fn receive_loop(&self) {
        loop {
            let event = match self.source.recv().await {
                Ok(event) => event,
                Err(_) => break,
            };

            let method = match self.registry.get(&event.name) {
                Some(method) => method,
                None => {
                    log::warn!("one-way receiver: {}", name_error(&event.name));
                    continue;
                }
            };

            self.context.hook_load_task_context(&event.header);
            self.context.hook_server_before_exec(&event);

            if let Err(err) = self.invoke(&method, event.args.clone()).await {
                self.context.hook_server_inspect_exception(&event, None, &err);
                continue;
            }

            self.context.hook_server_after_exec(&event, None);
        }
    }

    async fn invoke(&self, method: &Arc<dyn Method>, args: Vec<Value>) -> Result<()> {
        match method.invoke(args).await? {
            MethodOutcome::Value(_) | MethodOutcome::Stream(_) => Ok(()),
        }
    }
}
