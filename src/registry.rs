//! Registry mapping a method name to a descriptor: how to invoke it, its
//! declared argument names, its docstring, and which pattern (reply vs.
//! stream) its results are dispatched through.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::event::Value;
use crate::pattern::PatternKind;

/// One declared positional argument, for introspection (`_zerorpc_args`,
/// `_zerorpc_inspect`).
#[derive(Debug, Clone)]
pub struct ArgSpec {
    pub name: String,
    pub default: Option<Value>,
}

impl ArgSpec {
    pub fn required(name: impl Into<String>) -> Self {
        ArgSpec { name: name.into(), default: None }
    }

    pub fn with_default(name: impl Into<String>, default: Value) -> Self {
        ArgSpec { name: name.into(), default: Some(default) }
    }
}

/// Result of invoking a registered method, before it's been split into
/// wire events by its pattern.
pub enum MethodOutcome {
    /// A Reply-pattern method's single return value.
    Value(Vec<Value>),
    /// A Stream-pattern method's items, already fully materialized.
    ///
    /// The core's concern is flow control on the wire, not on the
    /// producer side; a handler that wants to honor backpressure while
    /// generating items can do so internally before returning here.
    Stream(Vec<Vec<Value>>),
}

/// A user-registered RPC method. Implementors receive the call's
/// positional args and return either a single value or a stream of items,
/// matching their declared `pattern()`.
#[async_trait]
pub trait Method: Send + Sync {
    async fn invoke(&self, args: Vec<Value>) -> Result<MethodOutcome>;

    fn pattern(&self) -> PatternKind;

    fn args(&self) -> Vec<ArgSpec> {
        Vec::new()
    }

    fn doc(&self) -> &str {
        ""
    }
}

/// Adapts a plain async closure returning one value into a Reply-pattern
/// [`Method`].
pub struct ReplyFn<F> {
    func: F,
    args: Vec<ArgSpec>,
    doc: String,
}

impl<F, Fut> ReplyFn<F>
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Vec<Value>>> + Send,
{
    pub fn new(func: F) -> Self {
        ReplyFn { func, args: Vec::new(), doc: String::new() }
    }

    pub fn with_args(mut self, args: Vec<ArgSpec>) -> Self {
        self.args = args;
        self
    }

    pub fn with_doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = doc.into();
        self
    }
}

#[async_trait]
impl<F, Fut> Method for ReplyFn<F>
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Vec<Value>>> + Send,
{
    async fn invoke(&self, args: Vec<Value>) -> Result<MethodOutcome> {
        Ok(MethodOutcome::Value((self.func)(args).await?))
    }

    fn pattern(&self) -> PatternKind {
        PatternKind::Reply
    }

    fn args(&self) -> Vec<ArgSpec> {
        self.args.clone()
    }

    fn doc(&self) -> &str {
        &self.doc
    }
}

/// Adapts a plain async closure returning a stream of items into a
/// Stream-pattern [`Method`].
pub struct StreamFn<F> {
    func: F,
    args: Vec<ArgSpec>,
    doc: String,
}

impl<F, Fut> StreamFn<F>
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Vec<Vec<Value>>>> + Send,
{
    pub fn new(func: F) -> Self {
        StreamFn { func, args: Vec::new(), doc: String::new() }
    }

    pub fn with_args(mut self, args: Vec<ArgSpec>) -> Self {
        self.args = args;
        self
    }

    pub fn with_doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = doc.into();
        self
    }
}

#[async_trait]
impl<F, Fut> Method for StreamFn<F>
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Vec<Vec<Value>>>> + Send,
{
    async fn invoke(&self, args: Vec<Value>) -> Result<MethodOutcome> {
        Ok(MethodOutcome::Stream((self.func)(args).await?))
    }

    fn pattern(&self) -> PatternKind {
        PatternKind::Stream
    }

    fn args(&self) -> Vec<ArgSpec> {
        self.args.clone()
    }

    fn doc(&self) -> &str {
        &self.doc
    }
}

/// Name-keyed table of registered methods, built once at server
/// construction and then read-only for the life of the server.
#[derive(Default)]
pub struct Registry {
    methods: BTreeMap<String, Arc<dyn Method>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry { methods: BTreeMap::new() }
    }

    pub fn register(&mut self, name: impl Into<String>, method: Arc<dyn Method>) {
        self.methods.insert(name.into(), method);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Method>> {
        self.methods.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.methods.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Arc<dyn Method>)> {
        self.methods.iter()
    }
}

pub(crate) fn name_error(name: &str) -> Error {
    Error::NameError(format!("unknown method {name:?}"))
}
