//! Recipient-based routing between agents.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::envelope::Envelope;

/// An agent that can receive envelopes.
#[async_trait]
pub trait AgentEndpoint: Send + Sync {
    /// Identifier matched against `Envelope::recipient`.
    fn name(&self) -> &str;

    /// Handle one envelope and produce the reply.
    async fn handle(&self, envelope: Envelope) -> Envelope;
}

/// Registry of endpoints keyed by agent name.
pub struct MessageRouter {
    endpoints: RwLock<HashMap<String, Arc<dyn AgentEndpoint>>>,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self {
            endpoints: RwLock::new(HashMap::new()),
        }
    }

    /// Register an endpoint under its own name, replacing any previous one.
    pub async fn register(&self, endpoint: Arc<dyn AgentEndpoint>) {
        let name = endpoint.name().to_string();
        if self
            .endpoints
            .write()
            .await
            .insert(name.clone(), endpoint)
            .is_some()
        {
            tracing::debug!(agent = %name, "Replaced existing endpoint registration");
        } else {
            tracing::debug!(agent = %name, "Registered endpoint");
        }
    }

    /// Remove an endpoint.
    pub async fn unregister(&self, name: &str) -> bool {
        self.endpoints.write().await.remove(name).is_some()
    }

    pub async fn has(&self, name: &str) -> bool {
        self.endpoints.read().await.contains_key(name)
    }

    /// Registered agent names, sorted.
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.endpoints.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Drop every registration.
    pub async fn clear(&self) {
        self.endpoints.write().await.clear();
    }

    /// Deliver an envelope to its recipient and return the reply.
    ///
    /// Unknown recipients yield `None`.
    pub async fn route(&self, envelope: Envelope) -> Option<Envelope> {
        // Clone the handle out so the lock is not held across the handler.
        let endpoint = self.endpoints.read().await.get(envelope.recipient()).cloned();
        match endpoint {
            Some(endpoint) => {
                tracing::debug!(
                    kind = %envelope.kind(),
                    from = %envelope.sender(),
                    to = %envelope.recipient(),
                    "Routing envelope"
                );
                Some(endpoint.handle(envelope).await)
            }
            None => {
                tracing::warn!(
                    kind = %envelope.kind(),
                    recipient = %envelope.recipient(),
                    "No endpoint registered for recipient, dropping envelope"
                );
                None
            }
        }
    }
}

impl Default for MessageRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::envelope::{MessageKind, meta};

    struct Echo;

    #[async_trait]
    impl AgentEndpoint for Echo {
        fn name(&self) -> &str {
            "Echo"
        }

        async fn handle(&self, envelope: Envelope) -> Envelope {
            match envelope.kind() {
                MessageKind::RequestPlanSummary => {
                    envelope.reply(MessageKind::PlanSummaryResult, envelope.content().to_string())
                }
                _ => envelope.unhandled(self.name()),
            }
        }
    }

    #[tokio::test]
    async fn routes_to_registered_endpoint() {
        let router = MessageRouter::new();
        router.register(Arc::new(Echo)).await;

        let reply = router
            .route(Envelope::new(MessageKind::RequestPlanSummary, "A", "Echo", "ping"))
            .await
            .unwrap();
        assert_eq!(reply.kind(), MessageKind::PlanSummaryResult);
        assert_eq!(reply.content(), "ping");
        assert_eq!(reply.recipient(), "A");
    }

    #[tokio::test]
    async fn unknown_recipient_yields_none() {
        let router = MessageRouter::new();
        router.register(Arc::new(Echo)).await;
        let reply = router
            .route(Envelope::new(MessageKind::UserInput, "A", "Nobody", "hello"))
            .await;
        assert!(reply.is_none());
    }

    #[tokio::test]
    async fn unhandled_kind_returns_error_envelope() {
        let router = MessageRouter::new();
        router.register(Arc::new(Echo)).await;
        let reply = router
            .route(Envelope::new(MessageKind::VoiceInput, "A", "Echo", "hello"))
            .await
            .unwrap();
        assert_eq!(reply.kind(), MessageKind::Error);
        assert_eq!(reply.meta(meta::PROCESSED), Some("false"));
    }

    #[tokio::test]
    async fn clear_removes_everything() {
        let router = MessageRouter::new();
        router.register(Arc::new(Echo)).await;
        assert_eq!(router.names().await, vec!["Echo".to_string()]);
        router.clear().await;
        assert!(!router.has("Echo").await);
        assert!(!router.unregister("Echo").await);
    }
}
