//! The process-wide server value.
//!
//! Holds the method and publication tables (fixed at build time), the
//! options, and the connection registry. Passed as `Arc<Server>` to every
//! connection; there is no global state.

use std::sync::Arc;

use tracing::debug;

use crate::config::{ConnectionConfig, ServerOptions};
use crate::method::{MethodDispatcher, MethodHandler};
use crate::publication::{PublicationHandler, Publications};
use crate::registry::Registry;

pub struct Server {
    options: ServerOptions,
    methods: MethodDispatcher,
    publications: Publications,
    registry: Registry,
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::default()
    }

    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    pub fn methods(&self) -> &MethodDispatcher {
        &self.methods
    }

    pub fn publications(&self) -> &Publications {
        &self.publications
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Start the registry admission loop. Connections start it lazily too;
    /// calling this at startup just moves the spawn out of the first accept.
    pub fn start(&self) {
        self.registry.start();
    }

    pub async fn connection_count(&self) -> usize {
        self.registry.connection_count().await
    }

    pub async fn session_ids(&self) -> Vec<String> {
        self.registry.session_ids().await
    }

    /// Close every live connection and stop admitting new ones.
    pub async fn shutdown(&self) -> usize {
        self.registry.shutdown().await
    }
}

#[derive(Default)]
pub struct ServerBuilder {
    options: ServerOptions,
    methods: MethodDispatcher,
    publications: Publications,
}

impl ServerBuilder {
    pub fn options(mut self, options: ServerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn server_id(mut self, server_id: impl Into<String>) -> Self {
        self.options.server_id = server_id.into();
        self
    }

    pub fn connection_config(mut self, config: ConnectionConfig) -> Self {
        self.options.connection = config;
        self
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.options.max_connections = Some(max);
        self
    }

    /// Register a method. A later registration under the same name replaces
    /// the earlier one.
    pub fn method(mut self, name: impl Into<String>, handler: impl MethodHandler) -> Self {
        self.methods.insert(name, Arc::new(handler));
        self
    }

    /// Register a publication.
    pub fn publish(mut self, name: impl Into<String>, handler: impl PublicationHandler) -> Self {
        self.publications.insert(name, Arc::new(handler));
        self
    }

    pub fn build(self) -> Arc<Server> {
        debug!(
            methods = ?self.methods.names(),
            publications = ?self.publications.names(),
            "server built"
        );
        Arc::new(Server {
            registry: Registry::new(self.options.max_connections),
            options: self.options,
            methods: self.methods,
            publications: self.publications,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DdpError;
    use crate::method::MethodInvocation;
    use crate::publication::Subscription;
    use serde_json::Value;

    async fn noop_method(_inv: MethodInvocation) -> Result<Value, DdpError> {
        Ok(Value::Null)
    }

    async fn noop_publication(sub: Subscription) -> Result<(), DdpError> {
        sub.ready()?;
        Ok(())
    }

    #[tokio::test]
    async fn test_builder_registers_handlers() {
        let server = Server::builder()
            .server_id("7")
            .max_connections(10)
            .method("noop", noop_method)
            .publish("things", noop_publication)
            .build();

        assert_eq!(server.options().server_id, "7");
        assert_eq!(server.options().max_connections, Some(10));
        assert_eq!(server.methods().names(), vec!["noop"]);
        assert!(server.publications().contains("things"));
        assert_eq!(server.connection_count().await, 0);
    }
}
