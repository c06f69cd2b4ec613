// Auxiliary request handlers keyed by the first path segment.

pub mod playlist;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::HeaderMap;
use axum::response::Response;
use tracing::debug;

use crate::error::GatewayResult;

/// A request routed to a plugin.
#[derive(Debug, Clone)]
pub struct PluginRequest {
    /// Path segments after the handler token.
    pub segments: Vec<String>,
    pub headers: HeaderMap,
}

#[async_trait]
pub trait Plugin: Send + Sync {
    /// Path tokens this plugin answers for.
    fn handlers(&self) -> &'static [&'static str];

    async fn handle(&self, request: PluginRequest) -> GatewayResult<Response>;
}

#[derive(Default)]
pub struct PluginRegistry {
    plugins: HashMap<String, Arc<dyn Plugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin: Arc<dyn Plugin>) {
        for token in plugin.handlers() {
            debug!("registering plugin handler {}", token);
            self.plugins
                .insert(token.to_ascii_lowercase(), Arc::clone(&plugin));
        }
    }

    /// Look up a handler; tokens match case-insensitively.
    pub fn get(&self, token: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins.get(&token.to_ascii_lowercase()).cloned()
    }

    pub fn contains(&self, token: &str) -> bool {
        self.plugins.contains_key(&token.to_ascii_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    struct Echo;

    #[async_trait]
    impl Plugin for Echo {
        fn handlers(&self) -> &'static [&'static str] {
            &["echo", "Say"]
        }

        async fn handle(&self, request: PluginRequest) -> GatewayResult<Response> {
            Ok(Response::new(Body::from(request.segments.join("/"))))
        }
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let mut registry = PluginRegistry::new();
        registry.register(Arc::new(Echo));
        assert!(registry.contains("ECHO"));
        assert!(registry.contains("say"));
        assert!(registry.get("pid").is_none());
    }
}
