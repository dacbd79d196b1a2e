//! Registry of hook callbacks invoked at well-defined points, and the
//! free-form task-context header that gets threaded across calls.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use crate::error::Error;
use crate::event::{Event, Header, Value, PROTOCOL_VERSION};

/// A middleware may implement any subset of these hooks; every method has a
/// no-op default so a middleware only needs to override what it cares about.
///
/// Hooks with a return value (`resolve_endpoint`, `client_handle_remote_error`,
/// `get_task_context`) are aggregated first-non-null across the registered
/// middleware, in registration order. The rest are invoked for side effect,
/// in registration order.
pub trait Middleware: Send + Sync {
    fn resolve_endpoint(&self, _endpoint: &str) -> Option<String> {
        None
    }

    fn client_before_request(&self, _event: &mut Event) {}

    fn client_after_request(&self, _request: &Event, _reply: Option<&Event>, _error: Option<&Error>) {}

    fn client_handle_remote_error(&self, _event: &Event) -> Option<Error> {
        None
    }

    fn server_before_exec(&self, _event: &Event) {}

    fn server_after_exec(&self, _event: &Event, _reply: Option<&Event>) {}

    fn server_inspect_exception(&self, _event: &Event, _reply: Option<&Event>, _error: &Error) {}

    fn get_task_context(&self) -> Option<BTreeMap<String, Value>> {
        None
    }

    fn load_task_context(&self, _header: &Header) {}
}

/// Process-wide context: the protocol version new events are stamped with,
/// plus the ordered list of registered middleware.
pub struct Context {
    version: i64,
    middleware: std::sync::RwLock<Vec<Arc<dyn Middleware>>>,
}

impl Context {
    pub fn new() -> Self {
        Self::with_version(PROTOCOL_VERSION)
    }

    /// Build a context pinned to a specific protocol version. Mainly useful
    /// for exercising the legacy (`v < 2`) error encoding and passive
    /// heartbeat behavior in tests.
    pub fn with_version(version: i64) -> Self {
        Context {
            version,
            middleware: std::sync::RwLock::new(Vec::new()),
        }
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn register_middleware(&self, middleware: Arc<dyn Middleware>) {
        self.middleware.write().unwrap().push(middleware);
    }

    pub fn hook_resolve_endpoint(&self, endpoint: &str) -> String {
        for mw in self.middleware.read().unwrap().iter() {
            if let Some(resolved) = mw.resolve_endpoint(endpoint) {
                return resolved;
            }
        }
        endpoint.to_string()
    }

    pub fn hook_client_before_request(&self, event: &mut Event) {
        for mw in self.middleware.read().unwrap().iter() {
            mw.client_before_request(event);
        }
    }

    pub fn hook_client_after_request(&self, request: &Event, reply: Option<&Event>, error: Option<&Error>) {
        for mw in self.middleware.read().unwrap().iter() {
            mw.client_after_request(request, reply, error);
        }
    }

    pub fn hook_client_handle_remote_error(&self, event: &Event) -> Option<Error> {
        for mw in self.middleware.read().unwrap().iter() {
            if let Some(err) = mw.client_handle_remote_error(event) {
                return Some(err);
            }
        }
        None
    }

    pub fn hook_server_before_exec(&self, event: &Event) {
        for mw in self.middleware.read().unwrap().iter() {
            mw.server_before_exec(event);
        }
    }

    pub fn hook_server_after_exec(&self, event: &Event, reply: Option<&Event>) {
        for mw in self.middleware.read().unwrap().iter() {
            mw.server_after_exec(event, reply);
        }
    }

    pub fn hook_server_inspect_exception(&self, event: &Event, reply: Option<&Event>, error: &Error) {
        for mw in self.middleware.read().unwrap().iter() {
            mw.server_inspect_exception(event, reply, error);
        }
    }

    pub fn hook_get_task_context(&self) -> BTreeMap<String, Value> {
        for mw in self.middleware.read().unwrap().iter() {
            if let Some(xheader) = mw.get_task_context() {
                return xheader;
            }
        }
        BTreeMap::new()
    }

    pub fn hook_load_task_context(&self, header: &Header) {
        for mw in self.middleware.read().unwrap().iter() {
            mw.load_task_context(header);
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

/// Wraps a functor to transfer the current task context to a newly spawned
/// task, the equivalent of `zerorpc.fork_task_context` in the Python
/// implementation.
///
/// A `zerorpc::Server` call loads the request's task context into `context`
/// via `hook_load_task_context` before dispatching to the user method; a
/// plain `tokio::spawn`'d subtask has no way to see that context again. Wrap
/// the subtask's future with `fork_task_context` to replay it:
///
/// ```ignore
/// tokio::spawn(fork_task_context(context.clone(), || async move {
///     // `context.hook_get_task_context()` here returns the same xheader
///     // as it did in the caller, even though this is a fresh task.
/// }));
/// ```
pub fn fork_task_context<F, Fut>(context: Arc<Context>, f: F) -> impl Future<Output = Fut::Output>
where
    F: FnOnce() -> Fut,
    Fut: Future,
{
    let xheader = context.hook_get_task_context();
    async move {
        let header = Header {
            message_id: uuid::Uuid::new_v4(),
            v: context.version(),
            response_to: None,
            xheader,
        };
        context.hook_load_task_context(&header);
        f().await
    }
}
