//! Method registry, invocation context and completion tracking.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, error};

use crate::error::DdpError;
use crate::protocol::ServerMessage;

// ==================== MethodHandler Trait ====================

/// Server-side implementation of a named method.
#[async_trait]
pub trait MethodHandler: Send + Sync + 'static {
    async fn call(&self, invocation: MethodInvocation) -> Result<Value, DdpError>;
}

#[async_trait]
impl<F, Fut> MethodHandler for F
where
    F: Fn(MethodInvocation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, DdpError>> + Send + 'static,
{
    async fn call(&self, invocation: MethodInvocation) -> Result<Value, DdpError> {
        (self)(invocation).await
    }
}

// ==================== Invocation ====================

/// The connection's user id, shared by every invocation on that connection.
#[derive(Debug, Clone, Default)]
pub struct UserIdCell(Arc<Mutex<Option<String>>>);

impl UserIdCell {
    pub fn get(&self) -> Option<String> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn set(&self, user_id: Option<String>) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = user_id;
    }
}

/// What a method handler sees of one `method` envelope.
#[derive(Debug, Clone)]
pub struct MethodInvocation {
    pub id: String,
    pub method: String,
    pub params: Vec<Value>,
    /// Client-provided seed for stub/server id agreement, passed through.
    pub random_seed: Option<Value>,
    session_id: String,
    user: UserIdCell,
}

impl MethodInvocation {
    pub fn new(
        id: String,
        method: String,
        params: Vec<Value>,
        random_seed: Option<Value>,
        session_id: String,
        user: UserIdCell,
    ) -> Self {
        Self {
            id,
            method,
            params,
            random_seed,
            session_id,
            user,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn user_id(&self) -> Option<String> {
        self.user.get()
    }

    /// Change the connection's user id. Later methods and subscriptions on
    /// the same connection see the new value.
    pub fn set_user_id(&self, user_id: Option<String>) {
        self.user.set(user_id);
    }

    pub fn param(&self, index: usize) -> Option<&Value> {
        self.params.get(index)
    }
}

// ==================== Dispatcher ====================

/// Method name to handler table, fixed once the server is built.
#[derive(Clone, Default)]
pub struct MethodDispatcher {
    handlers: HashMap<String, Arc<dyn MethodHandler>>,
}

impl MethodDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, handler: Arc<dyn MethodHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Look up and run a method.
    ///
    /// Unknown names fail with `unknown-method` without running anything.
    /// A panicking handler is reported as `internal-server-error`.
    pub async fn invoke(&self, invocation: MethodInvocation) -> Result<Value, DdpError> {
        let Some(handler) = self.handlers.get(&invocation.method).cloned() else {
            debug!(method = %invocation.method, "unknown method");
            return Err(DdpError::unknown_method(&invocation.method));
        };
        let method = invocation.method.clone();
        match AssertUnwindSafe(handler.call(invocation))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                error!(method = %method, "method handler panicked");
                Err(DdpError::internal())
            }
        }
    }
}

// ==================== Completion ====================

/// Tracks the two envelopes every method call ends with: one `result`,
/// then one `updated`.
#[derive(Debug)]
pub struct MethodCompletion {
    id: String,
    result_sent: bool,
    updates_sent: bool,
}

impl MethodCompletion {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            result_sent: false,
            updates_sent: false,
        }
    }

    /// The `result` envelope; `None` if it was already produced.
    pub fn result(&mut self, outcome: Result<Value, DdpError>) -> Option<ServerMessage> {
        if self.result_sent {
            return None;
        }
        self.result_sent = true;
        let id = self.id.clone();
        Some(match outcome {
            Ok(value) => ServerMessage::MethodResult {
                id,
                result: Some(value),
                error: None,
            },
            Err(error) => ServerMessage::MethodResult {
                id,
                result: None,
                error: Some(error),
            },
        })
    }

    /// The `updated` envelope; `None` before the result or if already produced.
    pub fn updated(&mut self) -> Option<ServerMessage> {
        if !self.result_sent || self.updates_sent {
            return None;
        }
        self.updates_sent = true;
        Some(ServerMessage::Updated {
            methods: vec![self.id.clone()],
        })
    }

    pub fn is_complete(&self) -> bool {
        self.result_sent && self.updates_sent
    }
}
