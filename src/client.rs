//! Per-call driver: builds a Channel, wraps it in a heartbeat overlay and a
//! buffered channel, sends the request, then dispatches the reply through
//! whichever pattern its first event names.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use futures::Stream;

use crate::buffered::{BufferedChannel, DEFAULT_INPUT_QUEUE_SIZE};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::event::Value;
use crate::heartbeat::HeartbeatOverlay;
use crate::multiplexer::ChannelMultiplexer;
use crate::pattern::{PatternKind, PatternOutcome};
use crate::transport::EventSource;

type NextItem = Option<Result<Vec<Value>>>;
type InFlight = Pin<Box<dyn Future<Output = NextItem> + Send>>;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct ClientOptions {
    pub heartbeat_freq: Duration,
    pub input_queue_size: i64,
    pub passive_heartbeat: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            heartbeat_freq: crate::heartbeat::DEFAULT_FREQUENCY,
            input_queue_size: DEFAULT_INPUT_QUEUE_SIZE,
            passive_heartbeat: false,
        }
    }
}

/// The result of a call, shaped by which pattern its first reply selected.
pub enum Reply {
    Single(Vec<Value>),
    Stream(ClientStream),
}

impl Reply {
    pub fn into_single(self) -> Result<Vec<Value>> {
        match self {
            Reply::Single(values) => Ok(values),
            Reply::Stream(_) => Err(Error::NameError("call returned a stream, not a single reply".to_string())),
        }
    }
}

/// A lazy iterator over `STREAM` events, backed by `BufferedChannel::recv`.
/// Ends on `STREAM_DONE`; a mid-stream `ERR` is raised once then the stream
/// is considered ended (property 6: idempotent termination).
pub struct ClientStream {
    bufchan: Arc<BufferedChannel>,
    context: Arc<Context>,
    timeout: Duration,
    pending_first: Option<Vec<Value>>,
    done: bool,
    in_flight: Option<InFlight>,
}

impl ClientStream {
    /// Convenience wrapper over `StreamExt::next` so callers don't need the
    /// trait in scope for a simple `while let Some(item) = stream.next()`.
    pub async fn next(&mut self) -> Option<Result<Vec<Value>>> {
        futures::StreamExt::next(self).await
    }

    async fn fetch(bufchan: Arc<BufferedChannel>, context: Arc<Context>, timeout: Duration) -> NextItem {
        let event = match bufchan.recv(timeout).await {
            Ok(event) => event,
            Err(err) => return Some(Err(err)),
        };

        match PatternKind::Stream.interpret(&event) {
            PatternOutcome::Item(values) => Some(Ok(values)),
            PatternOutcome::End => {
                bufchan.close();
                None
            }
            PatternOutcome::Error(err) => {
                bufchan.close();
                let err = context.hook_client_handle_remote_error(&event).unwrap_or(err);
                Some(Err(err))
            }
            PatternOutcome::Done(_) => {
                bufchan.close();
                Some(Err(Error::NameError("reply pattern mismatch in stream".to_string())))
            }
        }
    }
}

impl Stream for ClientStream {
    type Item = Result<Vec<Value>>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if let Some(first) = this.pending_first.take() {
            return Poll::Ready(Some(Ok(first)));
        }
        if this.done {
            return Poll::Ready(None);
        }

        let fut = this.in_flight.get_or_insert_with(|| {
            Box::pin(ClientStream::fetch(this.bufchan.clone(), this.context.clone(), this.timeout))
        });

        match fut.as_mut().poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(item) => {
                this.in_flight = None;
                if !matches!(item, Some(Ok(_))) {
                    this.done = true;
                }
                Poll::Ready(item)
            }
        }
    }
}

pub struct Client {
    multiplexer: Arc<ChannelMultiplexer>,
    context: Arc<Context>,
    options: ClientOptions,
}

impl Client {
    pub fn new(source: Arc<dyn EventSource>, options: ClientOptions) -> Arc<Self> {
        let context = source.context().clone();
        let multiplexer = ChannelMultiplexer::new(source, false);
        Arc::new(Client { multiplexer, context, options })
    }

    /// Dispatches `method(args)`, blocking for at most `timeout` on the
    /// first reply. A Stream-pattern reply returns immediately with its
    /// first item already queued on the returned `ClientStream`.
    pub async fn call(&self, method: &str, args: Vec<Value>, timeout: Duration) -> Result<Reply> {
        let channel = self.multiplexer.channel(None);
        let heartbeat = HeartbeatOverlay::with_frequency(channel, self.options.passive_heartbeat, self.options.heartbeat_freq);
        let bufchan = BufferedChannel::new(heartbeat, self.options.input_queue_size);

        let xheader = self.context.hook_get_task_context();
        let mut request = bufchan.new_event(method, args, xheader);
        self.context.hook_client_before_request(&mut request);

        let outcome = self.drive_call(&bufchan, request.clone(), timeout).await;

        let reply_event = outcome.as_ref().ok().map(|(event, _)| event.clone());
        let call_error = outcome.as_ref().err();
        self.context.hook_client_after_request(&request, reply_event.as_ref(), call_error);

        let (event, pattern) = match outcome {
            Ok(pair) => pair,
            Err(err) => {
                bufchan.close();
                return Err(err);
            }
        };

        match pattern {
            PatternKind::Reply => match PatternKind::Reply.interpret(&event) {
                PatternOutcome::Done(values) => {
                    bufchan.close();
                    Ok(Reply::Single(values))
                }
                PatternOutcome::Error(err) => {
                    bufchan.close();
                    Err(self.context.hook_client_handle_remote_error(&event).unwrap_or(err))
                }
                _ => {
                    bufchan.close();
                    Err(Error::NameError("reply pattern mismatch".to_string()))
                }
            },
            PatternKind::Stream => match PatternKind::Stream.interpret(&event) {
                PatternOutcome::Item(values) => Ok(Reply::Stream(ClientStream {
                    bufchan,
                    context: self.context.clone(),
                    timeout,
                    pending_first: Some(values),
                    done: false,
                    in_flight: None,
                })),
                PatternOutcome::End => {
                    bufchan.close();
                    Ok(Reply::Stream(ClientStream {
                        bufchan,
                        context: self.context.clone(),
                        timeout,
                        pending_first: None,
                        done: true,
                        in_flight: None,
                    }))
                }
                PatternOutcome::Error(err) => {
                    bufchan.close();
                    Err(self.context.hook_client_handle_remote_error(&event).unwrap_or(err))
                }
                _ => {
                    bufchan.close();
                    Err(Error::NameError("reply pattern mismatch".to_string()))
                }
            },
        }
    }

    async fn drive_call(
        &self,
        bufchan: &Arc<BufferedChannel>,
        request: crate::event::Event,
        timeout: Duration,
    ) -> Result<(crate::event::Event, PatternKind)> {
        bufchan.emit_event(request, timeout).await?;
        let reply = bufchan.recv(timeout).await?;
        let pattern = PatternKind::for_reply_name(&reply.name)
            .ok_or_else(|| Error::NameError(format!("no pattern accepts reply {:?}", reply.name)))?;
        Ok((reply, pattern))
    }
}
