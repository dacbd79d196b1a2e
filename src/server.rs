//! Accept loop and per-call worker, composing multiplexer, heartbeat
//! overlay, buffered channel, and pattern dispatch into one RPC endpoint.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::buffered::{BufferedChannel, DEFAULT_INPUT_QUEUE_SIZE};
use crate::context::{fork_task_context, Context};
use crate::error::{Error, Result};
use crate::event::{Event, Value};
use crate::heartbeat::HeartbeatOverlay;
use crate::multiplexer::ChannelMultiplexer;
use crate::pattern::{error_to_args, PatternKind};
use crate::registry::{name_error, ArgSpec, MethodOutcome, Registry};
use crate::transport::EventSource;

const DEFAULT_HEARTBEAT_FREQ: Duration = Duration::from_secs(5);

pub struct ServerOptions {
    pub name: String,
    pub heartbeat_freq: Duration,
    pub input_queue_size: i64,
    /// `None` means unbounded, matching the default worker pool.
    pub max_concurrent_calls: Option<usize>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        ServerOptions {
            name: "Server".to_string(),
            heartbeat_freq: DEFAULT_HEARTBEAT_FREQ,
            input_queue_size: DEFAULT_INPUT_QUEUE_SIZE,
            max_concurrent_calls: None,
        }
    }
}

/// Owns the accept loop and the registry of user methods. Built once,
/// `run` drives it until `stop` is called or the transport closes.
pub struct Server {
    multiplexer: Arc<ChannelMultiplexer>,
    context: Arc<Context>,
    registry: Registry,
    options: ServerOptions,
}

impl Server {
    pub fn new(source: Arc<dyn EventSource>, registry: Registry, options: ServerOptions) -> Arc<Self> {
        let context = source.context().clone();
        let multiplexer = ChannelMultiplexer::new(source, false);
        Arc::new(Server { multiplexer, context, registry, options })
    }

    /// Runs the accept loop until the returned handle is stopped. Each
    /// inbound call is dispatched into its own task, drawn from a bounded
    /// pool when `max_concurrent_calls` is set.
    pub fn run(self: Arc<Self>) -> ServerHandle {
        let semaphore = self.options.max_concurrent_calls.map(Semaphore::new).map(Arc::new);
        let workers = Arc::new(tokio::sync::Mutex::new(JoinSet::new()));

        let acceptor = {
            let server = self.clone();
            let semaphore = semaphore.clone();
            let workers = workers.clone();
            tokio::spawn(async move {
                loop {
                    let initial = match server.multiplexer.recv(Duration::from_secs(3600 * 24)).await {
                        Ok(event) => event,
                        Err(Error::TransportClosed) => break,
                        Err(_) => continue,
                    };

                    let permit = if let Some(sem) = &semaphore {
                        match sem.clone().acquire_owned().await {
                            Ok(permit) => Some(permit),
                            Err(_) => break,
                        }
                    } else {
                        None
                    };

                    let server = server.clone();
                    workers.lock().await.spawn(async move {
                        server.handle_call(initial).await;
                        drop(permit);
                    });
                }
            })
        };

        ServerHandle {
            acceptor: crate::utils::drop_join_handle::DropJoinHandle::new(acceptor),
            workers,
        }
    }

    async fn handle_call(&self, initial: Event) {
        let channel = self.multiplexer.channel(Some(initial));
        let passive = self.context.version() < 2;
        let heartbeat = HeartbeatOverlay::with_frequency(channel, passive, self.options.heartbeat_freq);
        let bufchan = BufferedChannel::new(heartbeat, self.options.input_queue_size);

        let result = self.dispatch(&bufchan).await;
        if let Err(Error::LostRemote) = result {
            log::info!("server call abandoned: peer lost");
        }
        bufchan.close();
    }

    async fn dispatch(&self, bufchan: &BufferedChannel) -> Result<()> {
        let request = bufchan.recv(Duration::from_secs(3600 * 24)).await?;
        self.context.hook_load_task_context(&request.header);
        self.context.hook_server_before_exec(&request);

        let outcome = fork_task_context(self.context.clone(), || self.invoke(&request.name, request.args.clone())).await;

        match outcome {
            Ok(MethodOutcome::Value(args)) => {
                let reply = bufchan.new_event(PatternKind::Reply.reply_event_name(false), args, BTreeMap::new());
                self.context.hook_server_after_exec(&request, Some(&reply));
                bufchan.emit_event(reply, Duration::from_secs(30)).await
            }
            Ok(MethodOutcome::Stream(items)) => {
                for args in items {
                    let event = bufchan.new_event(PatternKind::Stream.reply_event_name(false), args, BTreeMap::new());
                    bufchan.emit_event(event, Duration::from_secs(30)).await?;
                }
                let done = bufchan.new_event(crate::event::STREAM_DONE, Vec::new(), BTreeMap::new());
                self.context.hook_server_after_exec(&request, Some(&done));
                bufchan.emit_event(done, Duration::from_secs(30)).await
            }
            Err(Error::LostRemote) => Err(Error::LostRemote),
            Err(err) => {
                let v = self.context.version();
                let reply = bufchan.new_event(PatternKind::Reply.reply_event_name(true), error_to_args(&err, v), BTreeMap::new());
                self.context.hook_server_inspect_exception(&request, Some(&reply), &err);
                bufchan.emit_event(reply, Duration::from_secs(30)).await
            }
        }
    }

    async fn invoke(&self, name: &str, args: Vec<Value>) -> Result<MethodOutcome> {
        if let Some(outcome) = self.invoke_builtin(name, &args) {
            return outcome;
        }
        let method = self.registry.get(name).ok_or_else(|| name_error(name))?;
        method.invoke(args).await
    }

    fn invoke_builtin(&self, name: &str, args: &[Value]) -> Option<Result<MethodOutcome>> {
        match name {
            "_zerorpc_list" => Some(Ok(MethodOutcome::Value(vec![Value::Array(
                self.registry.names().into_iter().map(Value::from).collect(),
            )]))),
            "_zerorpc_name" => Some(Ok(MethodOutcome::Value(vec![Value::from(self.options.name.clone())]))),
            "_zerorpc_ping" => Some(Ok(MethodOutcome::Value(vec![Value::from("pong"), Value::from(self.options.name.clone())]))),
            "_zerorpc_help" => Some(self.zerorpc_help(args)),
            "_zerorpc_args" => Some(self.zerorpc_args(args)),
            "_zerorpc_inspect" => Some(Ok(MethodOutcome::Value(vec![self.zerorpc_inspect()]))),
            _ => None,
        }
    }

    fn zerorpc_help(&self, args: &[Value]) -> Result<MethodOutcome> {
        let name = args.first().and_then(|v| v.as_str()).ok_or_else(|| name_error("_zerorpc_help"))?;
        let method = self.registry.get(name).ok_or_else(|| name_error(name))?;
        Ok(MethodOutcome::Value(vec![Value::from(method.doc())]))
    }

    fn zerorpc_args(&self, args: &[Value]) -> Result<MethodOutcome> {
        let name = args.first().and_then(|v| v.as_str()).ok_or_else(|| name_error("_zerorpc_args"))?;
        let method = self.registry.get(name).ok_or_else(|| name_error(name))?;
        Ok(MethodOutcome::Value(vec![Value::Array(method.args().iter().map(arg_spec_to_value).collect())]))
    }

    fn zerorpc_inspect(&self) -> Value {
        let methods: Vec<(Value, Value)> = self
            .registry
            .iter()
            .map(|(name, method)| {
                let mut entry = BTreeMap::new();
                entry.insert("args".to_string(), Value::Array(method.args().iter().map(arg_spec_to_value).collect()));
                entry.insert("doc".to_string(), Value::from(method.doc()));
                (Value::from(name.as_str()), btreemap_to_value(entry))
            })
            .collect();

        let mut top = BTreeMap::new();
        top.insert("name".to_string(), Value::from(self.options.name.clone()));
        top.insert("methods".to_string(), Value::Map(methods));
        btreemap_to_value(top)
    }
}

fn arg_spec_to_value(spec: &ArgSpec) -> Value {
    let mut entry = BTreeMap::new();
    entry.insert("name".to_string(), Value::from(spec.name.clone()));
    if let Some(default) = &spec.default {
        entry.insert("default".to_string(), default.clone());
    }
    btreemap_to_value(entry)
}

fn btreemap_to_value(map: BTreeMap<String, Value>) -> Value {
    Value::Map(map.into_iter().map(|(k, v)| (Value::from(k), v)).collect())
}

/// Handle returned by `Server::run`; dropping it aborts the acceptor.
/// `stop` additionally awaits all in-flight call tasks to completion.
pub struct ServerHandle {
    acceptor: crate::utils::drop_join_handle::DropJoinHandle<()>,
    workers: Arc<tokio::sync::Mutex<JoinSet<()>>>,
}

impl ServerHandle {
    pub async fn stop(self) {
        self.acceptor.abort();
        let mut workers = self.workers.lock().await;
        while workers.join_next().await.is_some() {}
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::client::{Client, Reply};
    use crate::registry::ReplyFn;
    use crate::transport::pair;

    #[tokio::test]
    async fn hello_roundtrip() {
        let context = Arc::new(Context::new());
        let (client_source, server_source) = pair::pair(context);

        let mut registry = Registry::new();
        registry.register(
            "hello",
            Arc::new(
                ReplyFn::new(|args: Vec<Value>| async move {
                    let name = args.first().and_then(|v| v.as_str()).unwrap_or_default();
                    Ok(vec![Value::from(format!("Hello, {name}"))])
                })
                .with_args(vec![ArgSpec::required("name")])
                .with_doc("a test"),
            ),
        );

        let server = Server::new(server_source, registry, ServerOptions::default());
        let _handle = server.run();

        let client = Client::new(client_source, Default::default());
        let reply = client.call("hello", vec![Value::from("RPC")], Duration::from_secs(1)).await.unwrap();
        let values = reply.into_single().unwrap();
        assert_eq!(values[0].as_str(), Some("Hello, RPC"));
    }

    #[tokio::test]
    async fn unknown_method_raises_name_error() {
        let context = Arc::new(Context::new());
        let (client_source, server_source) = pair::pair(context);

        let server = Server::new(server_source, Registry::new(), ServerOptions::default());
        let _handle = server.run();

        let client = Client::new(client_source, Default::default());
        let err = client.call("missing", vec![], Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, Error::RemoteError { .. }));
    }

    #[tokio::test]
    async fn crash_raises_remote_error_with_message() {
        let context = Arc::new(Context::new());
        let (client_source, server_source) = pair::pair(context);

        let mut registry = Registry::new();
        registry.register(
            "crash",
            Arc::new(ReplyFn::new(|_args: Vec<Value>| async move {
                Err(Error::RemoteError { name: "RuntimeError".to_string(), message: "boom".to_string(), traceback: None })
            })),
        );

        let server = Server::new(server_source, registry, ServerOptions::default());
        let _handle = server.run();

        let client = Client::new(client_source, Default::default());
        let err = client.call("crash", vec![], Duration::from_secs(1)).await.unwrap_err();
        match err {
            Error::RemoteError { name, message, .. } => {
                assert_eq!(name, "RuntimeError");
                assert_eq!(message, "boom");
            }
            other => panic!("expected RemoteError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stream_n_yields_items_then_ends() {
        use crate::registry::StreamFn;
        use futures::StreamExt;

        let context = Arc::new(Context::new());
        let (client_source, server_source) = pair::pair(context);

        let mut registry = Registry::new();
        registry.register(
            "stream_n",
            Arc::new(StreamFn::new(|args: Vec<Value>| async move {
                let n = args.first().and_then(|v| v.as_i64()).unwrap_or(0);
                Ok((1..=n).map(|i| vec![Value::from(i)]).collect())
            })),
        );

        let server = Server::new(server_source, registry, ServerOptions::default());
        let _handle = server.run();

        let client = Client::new(client_source, Default::default());
        let reply = client.call("stream_n", vec![Value::from(3)], Duration::from_secs(1)).await.unwrap();
        let mut stream = match reply {
            Reply::Stream(stream) => stream,
            Reply::Single(_) => panic!("expected a stream reply"),
        };

        let mut items = Vec::new();
        while let Some(item) = stream.next().await {
            items.push(item.unwrap()[0].as_i64().unwrap());
        }
        assert_eq!(items, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn zerorpc_inspect_reports_registered_methods() {
        let context = Arc::new(Context::new());
        let (client_source, server_source) = pair::pair(context);

        let mut registry = Registry::new();
        registry.register(
            "hello",
            Arc::new(
                ReplyFn::new(|args: Vec<Value>| async move {
                    let name = args.first().and_then(|v| v.as_str()).unwrap_or_default();
                    Ok(vec![Value::from(format!("Hello, {name}"))])
                })
                .with_args(vec![ArgSpec::required("name")])
                .with_doc("a test"),
            ),
        );

        let options = ServerOptions { name: "HelloRPC".to_string(), ..ServerOptions::default() };
        let server = Server::new(server_source, registry, options);
        let _handle = server.run();

        let client = Client::new(client_source, Default::default());
        let reply = client.call("_zerorpc_inspect", vec![], Duration::from_secs(1)).await.unwrap();
        let values = reply.into_single().unwrap();

        let top = values[0].as_map().expect("inspect reply is a map");
        let get = |key: &str| top.iter().find(|(k, _)| k.as_str() == Some(key)).map(|(_, v)| v);
        assert_eq!(get("name").and_then(|v| v.as_str()), Some("HelloRPC"));

        let methods = get("methods").and_then(|v| v.as_map()).expect("methods is a map");
        let hello = methods.iter().find(|(k, _)| k.as_str() == Some("hello")).map(|(_, v)| v).unwrap();
        let hello = hello.as_map().unwrap();
        let doc = hello.iter().find(|(k, _)| k.as_str() == Some("doc")).map(|(_, v)| v).unwrap();
        assert_eq!(doc.as_str(), Some("a test"));

        let args = hello.iter().find(|(k, _)| k.as_str() == Some("args")).map(|(_, v)| v).unwrap();
        let args = args.as_array().unwrap();
        let first_arg = args[0].as_map().unwrap();
        let arg_name = first_arg.iter().find(|(k, _)| k.as_str() == Some("name")).map(|(_, v)| v).unwrap();
        assert_eq!(arg_name.as_str(), Some("name"));
    }

    #[tokio::test]
    async fn abandons_call_when_client_vanishes() {
        use crate::registry::StreamFn;

        let context = Arc::new(Context::new());
        let (client_source, server_source) = pair::pair(context);

        let mut registry = Registry::new();
        registry.register(
            "stream_n",
            Arc::new(StreamFn::new(|args: Vec<Value>| async move {
                let n = args.first().and_then(|v| v.as_i64()).unwrap_or(0);
                Ok((1..=n).map(|i| vec![Value::from(i)]).collect())
            })),
        );

        let options = ServerOptions { heartbeat_freq: Duration::from_millis(20), ..ServerOptions::default() };
        let server = Server::new(server_source, registry, options);
        let handle = server.run();

        // the client sends one request, receives nothing back, and vanishes
        // before granting any credit beyond the implicit first slot: the
        // second STREAM item the server tries to emit has nothing to
        // consume and blocks on credit indefinitely unless liveness kicks in.
        let request = client_source.new_event("stream_n", vec![Value::from(5)], Default::default());
        client_source.emit(request).await.unwrap();
        drop(client_source);

        // the server's heartbeat overlay declares the peer lost once the
        // deadline (2x heartbeat_freq) elapses with no inbound traffic, and
        // the worker task exits instead of blocking on credit forever.
        tokio::time::timeout(Duration::from_secs(1), handle.stop()).await.unwrap();
    }

    #[derive(Default)]
    struct HookOrderRecorder {
        log: std::sync::Mutex<Vec<&'static str>>,
    }

    impl crate::context::Middleware for HookOrderRecorder {
        fn client_before_request(&self, _event: &mut Event) {
            self.log.lock().unwrap().push("client_before_request");
        }

        fn load_task_context(&self, _header: &crate::event::Header) {
            self.log.lock().unwrap().push("load_task_context");
        }

        fn server_before_exec(&self, _event: &Event) {
            self.log.lock().unwrap().push("server_before_exec");
        }

        fn server_after_exec(&self, _event: &Event, _reply: Option<&Event>) {
            self.log.lock().unwrap().push("server_after_exec");
        }

        fn client_after_request(&self, _request: &Event, _reply: Option<&Event>, _error: Option<&Error>) {
            self.log.lock().unwrap().push("client_after_request");
        }
    }

    #[tokio::test]
    async fn hooks_fire_in_order_around_the_call() {
        let context = Arc::new(Context::new());
        let recorder = Arc::new(HookOrderRecorder::default());
        context.register_middleware(recorder.clone());

        let (client_source, server_source) = pair::pair(context);

        let mut registry = Registry::new();
        let recorder_for_method = recorder.clone();
        registry.register(
            "traced",
            Arc::new(ReplyFn::new(move |_args: Vec<Value>| {
                let recorder = recorder_for_method.clone();
                async move {
                    recorder.log.lock().unwrap().push("method");
                    Ok(vec![])
                }
            })),
        );

        let server = Server::new(server_source, registry, ServerOptions::default());
        let _handle = server.run();

        let client = Client::new(client_source, Default::default());
        client.call("traced", vec![], Duration::from_secs(1)).await.unwrap();

        let log = recorder.log.lock().unwrap().clone();
        assert_eq!(
            log,
            vec![
                "client_before_request",
                "load_task_context",
                "server_before_exec",
                "method",
                "server_after_exec",
                "client_after_request",
            ]
        );
    }
}
