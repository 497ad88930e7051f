//! Per-request variable context.
//!
//! Every request gets a [`RequestContext`] in its extensions before any
//! plugin middleware runs. Policies read and write it; `jsProtect`
//! expressions see each key as a variable. The gateway pre-binds `req`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use axum::{body::Body, http::Request, middleware::Next, response::Response};
use parking_lot::Mutex;
use protect_expr::{EvalError, Expression, Scope, Value};

/// Extensible per-request map of variables. Cloning shares the map.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    vars: Arc<Mutex<HashMap<String, Value>>>,
}

impl RequestContext {
    /// Create an empty context
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a context with `req` bound to a description of `request`.
    #[must_use]
    pub fn for_request<B>(request: &Request<B>) -> Self {
        let ctx = Self::new();
        ctx.set("req", describe_request(request));
        ctx
    }

    /// Bind `name` to `value`, replacing any previous binding.
    pub fn set(&self, name: impl Into<String>, value: Value) {
        self.vars.lock().insert(name.into(), value);
    }

    /// Current binding of `name`
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Value> {
        self.vars.lock().get(name).cloned()
    }

    /// Evaluate `expression` with the current bindings.
    pub fn run(&self, expression: &Expression) -> Result<Value, EvalError> {
        expression.evaluate(self)
    }
}

impl Scope for RequestContext {
    fn lookup(&self, name: &str) -> Option<Value> {
        self.get(name)
    }
}

/// `{ method, url, path, query, headers }` with lower-cased header names.
fn describe_request<B>(request: &Request<B>) -> Value {
    let uri = request.uri();

    let query: BTreeMap<String, Value> = uri
        .query()
        .map(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .map(|(k, v)| (k.into_owned(), Value::String(v.into_owned())))
                .collect()
        })
        .unwrap_or_default();

    let headers: BTreeMap<String, Value> = request
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), Value::from(v)))
        })
        .collect();

    let url = uri
        .path_and_query()
        .map_or_else(|| uri.path().to_string(), ToString::to_string);

    let mut req = BTreeMap::new();
    req.insert("method".to_string(), Value::from(request.method().as_str()));
    req.insert("url".to_string(), Value::String(url));
    req.insert("path".to_string(), Value::from(uri.path()));
    req.insert("query".to_string(), Value::Object(query));
    req.insert("headers".to_string(), Value::Object(headers));
    Value::Object(req)
}

/// Middleware that creates the request context
pub async fn context_middleware(mut request: Request<Body>, next: Next) -> Response {
    let ctx = RequestContext::for_request(&request);
    request.extensions_mut().insert(ctx);
    next.run(request).await
}
