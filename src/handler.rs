//! Handler name canonicalization and the `HandlerModule` contract user code
//! implements against. The actual loading of user code from a file, source
//! string or in-memory value is the out-of-scope "handler module loader";
//! [`MapHandlerModule`] is an in-crate stand-in used by the test suite and
//! the demo, built the way the teacher's `Handler<T>`/`Callback` builder is,
//! generalized from compile-time indices to runtime name lookup since BPMN
//! names here are only known once a definition is parsed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{Error, Result, RuntimeError};

/// Replaces every character in the set ``:!`~^@*#¢¬ç?¦|&;%"<>(){}[]+, \t\n``
/// with `_`, then prefixes with `_` if the result starts with a digit.
pub fn canonicalize(name: &str) -> String {
    const REPLACE: &str = ":!`~^@*#¢¬ç?¦|&;%\"<>(){}[]+, \t\n";
    let mut out = String::with_capacity(name.len());
    for ch in name.chars() {
        if REPLACE.contains(ch) {
            out.push('_');
        } else {
            out.push(ch);
        }
    }
    if out.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

/// User-supplied handler implementations for one process definition.
///
/// Every lookup applies [`canonicalize`] first, matching the mapping the
/// engine applies when resolving `N`, `NDone`, `N$getTimeout` and
/// `N$<outName>`.
#[async_trait]
pub trait HandlerModule: Send + Sync {
    /// `N(data, done)` — token arrival handler. Returns the `done` result data.
    async fn on_arrive(&self, name: &str, data: Value) -> Result<Value>;

    /// `NDone(data, done)` — wait-task completion handler.
    async fn on_task_done(&self, name: &str, data: Value) -> Result<Value>;

    /// `N$getTimeout()` — must return a finite number of milliseconds.
    async fn get_timeout(&self, name: &str) -> Result<f64>;

    /// `N$<outName>(data)` — exclusive-gateway branch predicate.
    async fn exclusive_branch(&self, gateway_name: &str, out_name: &str, data: Value) -> Result<bool>;

    /// Routing sink for non-fatal runtime errors.
    async fn default_event_handler(&self, _event_type: &str, _flow_name: &str, _reason: &str) {
        log::warn!(
            "unhandled event {_event_type} at {_flow_name}: {_reason} (no defaultEventHandler installed)"
        );
    }

    /// Sink for unhandled handler panics/errors.
    async fn default_error_handler(&self, error: &Error) {
        log::error!("unhandled process error: {error}");
    }

    async fn on_begin(&self, _name: &str, _data: &Value) {}
    async fn on_end(&self, _name: &str, _data: &Value) {}
    async fn done_loading(&self) {}
    async fn done_saving(&self) {}
}

type ArriveFn = Box<dyn Fn(Value) -> Result<Value> + Send + Sync>;
type TimeoutFn = Box<dyn Fn() -> Result<f64> + Send + Sync>;
type ExclusiveFn = Box<dyn Fn(Value) -> Result<bool> + Send + Sync>;

/// An in-crate [`HandlerModule`] built from named closures, in the shape of
/// the teacher's `Process::task`/`exclusive` builder methods.
#[derive(Default)]
pub struct MapHandlerModule {
    arrive: Mutex<HashMap<String, ArriveFn>>,
    task_done: Mutex<HashMap<String, ArriveFn>>,
    timeout: Mutex<HashMap<String, TimeoutFn>>,
    exclusive: Mutex<HashMap<String, ExclusiveFn>>,
}

impl MapHandlerModule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_arrive(self, name: impl Into<String>, f: impl Fn(Value) -> Result<Value> + Send + Sync + 'static) -> Self {
        self.arrive
            .lock()
            .unwrap()
            .insert(canonicalize(&name.into()), Box::new(f));
        self
    }

    pub fn on_task_done(self, name: impl Into<String>, f: impl Fn(Value) -> Result<Value> + Send + Sync + 'static) -> Self {
        self.task_done
            .lock()
            .unwrap()
            .insert(canonicalize(&name.into()), Box::new(f));
        self
    }

    pub fn get_timeout(self, name: impl Into<String>, f: impl Fn() -> Result<f64> + Send + Sync + 'static) -> Self {
        self.timeout
            .lock()
            .unwrap()
            .insert(canonicalize(&name.into()), Box::new(f));
        self
    }

    pub fn exclusive(
        self,
        gateway_name: impl Into<String>,
        out_name: impl Into<String>,
        f: impl Fn(Value) -> Result<bool> + Send + Sync + 'static,
    ) -> Self {
        let key = format!(
            "{}${}",
            canonicalize(&gateway_name.into()),
            canonicalize(&out_name.into())
        );
        self.exclusive.lock().unwrap().insert(key, Box::new(f));
        self
    }
}

#[async_trait]
impl HandlerModule for MapHandlerModule {
    async fn on_arrive(&self, name: &str, data: Value) -> Result<Value> {
        let key = canonicalize(name);
        match self.arrive.lock().unwrap().get(&key) {
            Some(f) => f(data),
            None => Ok(data),
        }
    }

    async fn on_task_done(&self, name: &str, data: Value) -> Result<Value> {
        let key = canonicalize(name);
        match self.task_done.lock().unwrap().get(&key) {
            Some(f) => f(data),
            None => Ok(data),
        }
    }

    async fn get_timeout(&self, name: &str) -> Result<f64> {
        let key = canonicalize(name);
        match self.timeout.lock().unwrap().get(&key) {
            Some(f) => f(),
            None => Err(RuntimeError::BadTimeout(name.to_string()).into()),
        }
    }

    async fn exclusive_branch(&self, gateway_name: &str, out_name: &str, data: Value) -> Result<bool> {
        let key = format!("{}${}", canonicalize(gateway_name), canonicalize(out_name));
        match self.exclusive.lock().unwrap().get(&key) {
            Some(f) => f(data),
            None => Ok(false),
        }
    }
}

/// Registry of handler modules keyed by process definition name, owned by
/// the [`crate::manager::ProcessManager`].
pub type HandlerRegistry = HashMap<String, Arc<dyn HandlerModule>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalize_replaces_punctuation_and_whitespace() {
        assert_eq!(canonicalize("Check: stock?"), "Check__stock_");
    }

    #[test]
    fn canonicalize_prefixes_leading_digit() {
        assert_eq!(canonicalize("1task"), "_1task");
    }

    #[tokio::test]
    async fn map_handler_module_dispatches_by_canonicalized_name() {
        let module = MapHandlerModule::new()
            .on_arrive("Count 1", |v| Ok(v))
            .exclusive("gw", "toA", |_| Ok(true));
        assert!(module.exclusive_branch("gw", "toA", Value::Null).await.unwrap());
        assert!(!module.exclusive_branch("gw", "toB", Value::Null).await.unwrap());
    }
}
